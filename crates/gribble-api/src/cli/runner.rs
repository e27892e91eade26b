//! Runner CLI commands: create, show, tag, touch, retire.

use std::time::Duration;

use anyhow::Result;
use console::style;

use gribble_core::repository::runner::RunnerRepository;
use gribble_types::runner::{parse_tags, Runner};

use crate::state::AppState;

/// Options for `gribblesv runner create`.
pub struct CreateRunnerArgs {
    pub token: String,
    pub description: String,
    pub tags: String,
    pub run_untagged: bool,
    pub locked: bool,
    pub active: bool,
    pub max_timeout: Option<u64>,
}

/// Register a new runner with its tags.
///
/// # Examples
///
/// ```bash
/// gribblesv runner create --token s3cret --description "CI box" --tags docker,linux --active
/// ```
pub async fn create_runner(state: &AppState, args: CreateRunnerArgs, json: bool) -> Result<()> {
    let mut runner = Runner {
        description: args.description,
        tags: parse_tags(&args.tags),
        run_untagged: args.run_untagged,
        locked: args.locked,
        active: args.active,
        max_timeout: args.max_timeout.map(Duration::from_secs),
        ..Runner::new(args.token)
    };

    state.runners.create_runner(&state.cancel, &mut runner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runner)?);
        return Ok(());
    }

    println!();
    println!("  {} Runner created", style("✓").green().bold());
    print_runner(&runner);
    Ok(())
}

/// Show a runner and its tags.
pub async fn show_runner(state: &AppState, token: &str, deleted: bool, json: bool) -> Result<()> {
    let mut runner = state
        .runners
        .get_runner_by_token(&state.cancel, token, deleted)
        .await?;
    state.runners.get_runner_tags(&state.cancel, &mut runner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runner)?);
        return Ok(());
    }

    print_runner(&runner);
    Ok(())
}

/// Replace a runner's tag set.
pub async fn tag_runner(state: &AppState, token: &str, tags: Vec<String>, json: bool) -> Result<()> {
    let mut runner = state
        .runners
        .get_runner_by_token(&state.cancel, token, false)
        .await?;

    // Accept both `tag a b` and `tag a,b`.
    let tags: Vec<String> = tags.iter().flat_map(|t| parse_tags(t)).collect();
    state
        .runners
        .tag_runner(&state.cancel, &mut runner, &tags)
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runner.tags)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Tags for '{}': {}",
        style("✓").green().bold(),
        style(token).cyan(),
        format_tags(&runner.tags)
    );
    println!();
    Ok(())
}

/// Set a runner's updated time to now.
pub async fn touch_runner(state: &AppState, token: &str, json: bool) -> Result<()> {
    let mut runner = state
        .runners
        .get_runner_by_token(&state.cancel, token, false)
        .await?;
    state
        .runners
        .set_runner_updated_time(&state.cancel, &mut runner, chrono::Utc::now())
        .await?;

    if json {
        println!("{}", serde_json::json!({ "token": token, "updated": runner.updated }));
        return Ok(());
    }

    println!();
    println!(
        "  {} Runner '{}' touched",
        style("✓").green().bold(),
        style(token).cyan()
    );
    println!();
    Ok(())
}

/// Retire a runner.
pub async fn retire_runner(state: &AppState, token: &str, json: bool) -> Result<()> {
    let mut runner = state
        .runners
        .get_runner_by_token(&state.cancel, token, false)
        .await?;
    state.runners.retire_runner(&state.cancel, &mut runner).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runner)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Runner '{}' retired",
        style("✓").green().bold(),
        style(token).cyan()
    );
    println!();
    Ok(())
}

fn print_runner(runner: &Runner) {
    let id = runner
        .id
        .map(|id| id.to_string())
        .unwrap_or_else(|| "-".to_string());
    let time = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "-".to_string())
    };
    let timeout = runner
        .max_timeout
        .map(|d| format!("{}s", d.as_secs()))
        .unwrap_or_else(|| "none".to_string());

    println!();
    println!("  {}  {}", style("ID:").bold(), style(id).dim());
    println!("  {}  {}", style("Token:").bold(), style(&runner.token).cyan());
    println!("  {}  {}", style("Description:").bold(), &runner.description);
    println!("  {}  {}", style("Tags:").bold(), format_tags(&runner.tags));
    println!("  {}  {}", style("Run untagged:").bold(), runner.run_untagged);
    println!("  {}  {}", style("Locked:").bold(), runner.locked);
    println!("  {}  {}", style("Active:").bold(), runner.active);
    println!("  {}  {}", style("Max timeout:").bold(), timeout);
    if runner.deleted {
        println!("  {}  {}", style("Status:").bold(), style("retired").red());
    }
    println!("  {}  {}", style("Created:").bold(), time(runner.created));
    println!("  {}  {}", style("Updated:").bold(), time(runner.updated));
    println!();
}

fn format_tags(tags: &[String]) -> String {
    if tags.is_empty() {
        style("(none)").dim().to_string()
    } else {
        tags.join(", ")
    }
}
