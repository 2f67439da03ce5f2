use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::time::Duration;
use sync::{Backoff, ConnectionOptions, Manager, Options};
use testing_tools::output::print_test_summary;
use testing_tools::scenarios;

#[derive(Parser)]
#[command(name = "sync-test-client")]
#[command(about = "HomeCon sync integration testing tool")]
struct Cli {
    /// Websocket URL of the backend (e.g., ws://localhost:9099)
    #[arg(long)]
    backend_url: String,

    /// Test scenario to run
    #[arg(long, value_enum)]
    scenario: ScenarioChoice,

    /// State id used by the per-state scenarios
    #[arg(long, default_value_t = 1)]
    state_id: i64,

    /// JSON value written by the write scenario
    #[arg(long, default_value = "1")]
    value: String,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,
}

#[derive(clap::ValueEnum, Clone)]
enum ScenarioChoice {
    /// Test that a session opens
    ConnectionTest,
    /// Subscribe to the full state list
    StateList,
    /// Two clients on one state share a subscription and its cached value
    SharedSubscription,
    /// Write a value and wait for the backend to push it back
    WriteRoundTrip,
    /// One-shot read that leaves no subscription behind
    Fetch,
    /// Run every scenario
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    }

    println!("{}", "=== SETUP PHASE ===".bright_white().bold());

    let value: serde_json::Value = serde_json::from_str(&cli.value)
        .with_context(|| format!("--value is not valid JSON: {}", cli.value))?;

    println!("{} Connecting to {}...", "→".blue(), cli.backend_url);
    let manager = Manager::init(Options {
        connection: ConnectionOptions {
            url: cli.backend_url.clone(),
            backoff: Backoff::new(Duration::from_millis(250), Duration::from_secs(2)),
            keepalive_interval: Some(Duration::from_secs(15)),
            pong_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            max_frame_bytes: 4 * 1024 * 1024,
        },
        fetch_timeout: Duration::from_secs(5),
        optimistic_writes: false,
    });

    if !scenarios::wait_for_open(&manager, Duration::from_secs(10)).await {
        manager.shutdown().await;
        anyhow::bail!("Could not connect to {}", cli.backend_url);
    }
    println!("{} Connected", "✓".green());

    println!("\n{}", "=== TEST PHASE ===".bright_white().bold());

    let mut results = Vec::new();

    match cli.scenario {
        ScenarioChoice::ConnectionTest => {
            results.push(scenarios::test_connection(&manager).await?);
        }
        ScenarioChoice::StateList => {
            results.push(scenarios::test_state_list(&manager).await?);
        }
        ScenarioChoice::SharedSubscription => {
            results.push(scenarios::test_shared_subscription(&manager, cli.state_id).await?);
        }
        ScenarioChoice::WriteRoundTrip => {
            results.push(scenarios::test_write_round_trip(&manager, cli.state_id, value).await?);
        }
        ScenarioChoice::Fetch => {
            results.push(scenarios::test_fetch(&manager, cli.state_id).await?);
        }
        ScenarioChoice::All => {
            results.push(scenarios::test_connection(&manager).await?);
            results.push(scenarios::test_state_list(&manager).await?);
            results.push(scenarios::test_shared_subscription(&manager, cli.state_id).await?);
            results.push(scenarios::test_fetch(&manager, cli.state_id).await?);
            results.push(scenarios::test_write_round_trip(&manager, cli.state_id, value).await?);
        }
    }

    manager.shutdown().await;

    println!("\n{}", "=== RESULTS ===".bright_white().bold());
    print_test_summary(&results);

    let all_passed = results.iter().all(|r| r.passed);

    if all_passed {
        println!("\n{}", "All tests passed! ✓".bright_green().bold());
    } else {
        println!("\n{}", "Some tests failed! ✗".bright_red().bold());
    }

    std::process::exit(if all_passed { 0 } else { 1 });
}
