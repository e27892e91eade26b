//! `gribblesv migrate`: report the schema versions after startup migration.

use anyhow::Result;
use console::style;

use crate::state::AppState;

/// Print recorded component versions. Patches were already applied by
/// [`AppState::init`].
pub async fn migrate(state: &AppState, json: bool) -> Result<()> {
    let versions = state.pool.versions(&state.cancel).await?;

    if json {
        let rows: Vec<_> = versions
            .iter()
            .map(|v| serde_json::json!({ "component": v.component, "version": v.version }))
            .collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    println!();
    println!("  {} Schema is up to date", style("✓").green().bold());
    println!();
    for v in &versions {
        println!(
            "  {}  {}",
            style(format!("{:<16}", v.component)).bold(),
            style(format!("v{}", v.version)).cyan()
        );
    }
    println!();

    Ok(())
}
