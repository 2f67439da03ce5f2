use anyhow::Result;
use colored::*;
use events::Identity;
use serde_json::Value;
use std::time::{Duration, Instant};
use sync::{BindOptions, Manager, SessionStatus};

use crate::output::{print_push, TestResult};

const PUSH_TIMEOUT: Duration = Duration::from_secs(5);

pub async fn wait_for_open(manager: &Manager, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if manager.session_status() == SessionStatus::Open {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    manager.session_status() == SessionStatus::Open
}

pub async fn test_connection(manager: &Manager) -> Result<TestResult> {
    let start = Instant::now();

    println!("\n{}", "=== TEST: Connection ===".bright_cyan().bold());
    println!("{} Waiting for the session to open...", "→".blue());

    if wait_for_open(manager, PUSH_TIMEOUT).await {
        println!("{} Session open", "✓".green());
        Ok(TestResult::pass("connection", start.elapsed()))
    } else {
        println!("{} Session did not open", "✗".red());
        Ok(TestResult::fail(
            "connection",
            format!("Session status is {:?}", manager.session_status()),
            start.elapsed(),
        ))
    }
}

pub async fn test_state_list(manager: &Manager) -> Result<TestResult> {
    let start = Instant::now();
    let identity = Identity::state_list();

    println!("\n{}", "=== TEST: State List ===".bright_cyan().bold());
    println!("{} Client A subscribing to {}...", "→".blue(), identity);

    let mut client = manager.bind(identity.clone(), BindOptions::default()).await?;

    let payload = match client.value().cloned() {
        Some(payload) => payload,
        None => match tokio::time::timeout(PUSH_TIMEOUT, client.changed()).await {
            Ok(Ok(payload)) => payload.clone(),
            Ok(Err(e)) => {
                return Ok(TestResult::fail("state_list", e.to_string(), start.elapsed()))
            }
            Err(_) => {
                println!("{} Timeout waiting for {}", "✗".red(), identity);
                return Ok(TestResult::fail(
                    "state_list",
                    format!("No push within {PUSH_TIMEOUT:?}"),
                    start.elapsed(),
                ));
            }
        },
    };
    print_push("Client A", &identity, &payload);

    let nodes = events::StateNode::list_from(&payload);
    if payload.is_array() {
        println!("{} Received {} states", "✓".green(), nodes.len());
        Ok(TestResult::pass("state_list", start.elapsed()))
    } else {
        Ok(TestResult::fail(
            "state_list",
            format!("Expected an array payload, got {payload}"),
            start.elapsed(),
        ))
    }
}

pub async fn test_shared_subscription(manager: &Manager, state_id: i64) -> Result<TestResult> {
    let start = Instant::now();
    let identity = Identity::state(state_id);

    println!("\n{}", "=== TEST: Shared Subscription ===".bright_cyan().bold());
    println!("{} Client A subscribing to {}...", "→".blue(), identity);

    let mut a = manager.bind(identity.clone(), BindOptions::default()).await?;
    if a.value().is_none() {
        if let Err(e) = tokio::time::timeout(PUSH_TIMEOUT, a.changed()).await {
            return Ok(TestResult::fail(
                "shared_subscription",
                format!("Client A got no value: {e}"),
                start.elapsed(),
            ));
        }
    }
    let expected = a.value().cloned();

    println!("{} Client B subscribing to {}...", "→".blue(), identity);
    let mut b = manager.bind(identity.clone(), BindOptions::default()).await?;
    let observed = b.value().cloned();

    if let Some(payload) = &observed {
        print_push("Client B", &identity, payload);
    }

    let ref_count = manager.ref_count(&identity);
    if observed == expected && ref_count == 2 {
        println!("{} Client B saw the cached value immediately", "✓".green());
        Ok(TestResult::pass("shared_subscription", start.elapsed()))
    } else {
        Ok(TestResult::fail(
            "shared_subscription",
            format!("Expected {expected:?} with 2 consumers, got {observed:?} with {ref_count}"),
            start.elapsed(),
        ))
    }
}

pub async fn test_write_round_trip(
    manager: &Manager,
    state_id: i64,
    value: Value,
) -> Result<TestResult> {
    let start = Instant::now();
    let identity = Identity::state(state_id);

    println!("\n{}", "=== TEST: Write Round Trip ===".bright_cyan().bold());

    let mut client = manager.bind(identity.clone(), BindOptions::default()).await?;

    println!("{} Writing {} to {}...", "→".blue(), value, identity);
    client.write(value.clone()).await?;

    println!("{} Waiting for the confirming push...", "→".blue());
    let deadline = Instant::now() + PUSH_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            println!("{} Timeout waiting for confirmation", "✗".red());
            return Ok(TestResult::fail(
                "write_round_trip",
                format!("No push carrying {value} within {PUSH_TIMEOUT:?}"),
                start.elapsed(),
            ));
        }

        let next = tokio::time::timeout(remaining, client.changed())
            .await
            .map(|changed| changed.map(|_| ()));
        match next {
            Ok(Ok(())) => {
                let confirmed = client.scalar().cloned();
                if let Some(payload) = client.value() {
                    print_push("Client A", &identity, payload);
                }
                if confirmed.as_ref() == Some(&value) {
                    println!("{} Backend confirmed the write", "✓".green());
                    return Ok(TestResult::pass("write_round_trip", start.elapsed()));
                }
            }
            Ok(Err(e)) => {
                return Ok(TestResult::fail(
                    "write_round_trip",
                    e.to_string(),
                    start.elapsed(),
                ))
            }
            Err(_) => continue,
        }
    }
}

pub async fn test_fetch(manager: &Manager, state_id: i64) -> Result<TestResult> {
    let start = Instant::now();
    let identity = Identity::state(state_id);

    println!("\n{}", "=== TEST: One-shot Fetch ===".bright_cyan().bold());

    let mut client = manager
        .bind(identity.clone(), BindOptions { auto: false })
        .await?;

    match client.fetch().await {
        Ok(payload) => {
            print_push("Client A", &identity, &payload);
            manager.flush().await?;
            let lingering = manager.ref_count(&identity);
            if lingering == 0 {
                println!("{} Fetched without leaving a subscription", "✓".green());
                Ok(TestResult::pass("fetch", start.elapsed()))
            } else {
                Ok(TestResult::fail(
                    "fetch",
                    format!("{lingering} consumer(s) still registered after fetch"),
                    start.elapsed(),
                ))
            }
        }
        Err(e) => {
            println!("{} Fetch failed: {}", "✗".red(), e);
            Ok(TestResult::fail("fetch", e.to_string(), start.elapsed()))
        }
    }
}
