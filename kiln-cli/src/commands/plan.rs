//! Plan command implementation for kiln CLI.
//!
//! Validates a Dockerfile or preset and prints the resulting stages.

use super::plan_source;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_core::builder::load_plan;
use kiln_core::BuildOptions;
use std::path::PathBuf;

/// Prints the validated plan: one line per stage, then the rendered
/// Dockerfile.
pub fn plan(
    context_path: &str,
    dockerfile: &str,
    preset: Option<&str>,
    build_args: Vec<(String, String)>,
) -> Result<()> {
    let options = BuildOptions {
        context_path: PathBuf::from(context_path),
        source: plan_source(dockerfile, preset)?,
        build_args: build_args.into_iter().collect(),
        ..BuildOptions::default()
    };

    let plan = load_plan(&options).context("Invalid build plan")?;

    println!("{} {} stages", "Plan:".bold().blue(), plan.len().to_string().yellow());
    for (idx, stage) in plan.stages.iter().enumerate() {
        println!(
            "  {:>2}. {:<28} {}",
            idx + 1,
            stage.kind().to_string().green(),
            stage.describe()
        );
    }

    println!();
    println!("{}", "Dockerfile:".bold().blue());
    print!("{}", plan.render());

    Ok(())
}
