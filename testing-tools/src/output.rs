use colored::*;
use events::Identity;
use serde_json::Value;
use std::time::Duration;

#[derive(Debug)]
pub struct TestResult {
    pub scenario: String,
    pub passed: bool,
    pub message: Option<String>,
    pub duration: Duration,
}

impl TestResult {
    pub fn pass(scenario: &str, duration: Duration) -> Self {
        Self {
            scenario: scenario.to_string(),
            passed: true,
            message: None,
            duration,
        }
    }

    pub fn fail(scenario: &str, message: String, duration: Duration) -> Self {
        Self {
            scenario: scenario.to_string(),
            passed: false,
            message: Some(message),
            duration,
        }
    }
}

/// Client A is blue, every other client magenta.
fn label_color(client_label: &str) -> Color {
    match client_label {
        "Client A" => Color::BrightBlue,
        _ => Color::BrightMagenta,
    }
}

pub fn print_push(client_label: &str, identity: &Identity, payload: &Value) {
    let label_colored = client_label.color(label_color(client_label));

    println!(
        "\n[{}] {} push received",
        label_colored.bold(),
        identity.to_string().yellow()
    );

    if let Ok(pretty) = serde_json::to_string_pretty(payload) {
        println!("   {}", pretty.dimmed());
    }
}

pub fn print_test_summary(results: &[TestResult]) {
    println!("\n{}", "=== TEST SUMMARY ===".bright_white().bold());

    let total = results.len();
    let passed = results.iter().filter(|r| r.passed).count();
    let failed = total - passed;

    for result in results {
        let status = if result.passed {
            "PASS".green().bold()
        } else {
            "FAIL".red().bold()
        };

        println!("[{}] {} ({:?})", status, result.scenario, result.duration);

        if let Some(msg) = &result.message {
            println!("      {}", msg.dimmed());
        }
    }

    println!(
        "\n{}: {} passed, {} failed",
        "Results".bold(),
        passed.to_string().green(),
        failed.to_string().red()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_color_matches_whole_label() {
        assert_eq!(label_color("Client A"), Color::BrightBlue);
        assert_eq!(label_color("Client B"), Color::BrightMagenta);
        assert_eq!(label_color("Backend Agent"), Color::BrightMagenta);
    }
}
