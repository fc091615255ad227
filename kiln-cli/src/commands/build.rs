//! Build command implementation for kiln CLI.
//!
//! Builds images from Dockerfiles or presets with per-step progress.

use super::{format_duration, format_image_id, format_size, plan_source};
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_core::builder::StepEvent;
use kiln_core::{BuildOptions, Config, ImageBuilder};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;

/// Builds an image and publishes it to the local store.
///
/// # Arguments
/// * `context_path` - Path to build context directory
/// * `tag` - Optional tag for the image (e.g., "myapp:latest")
/// * `dockerfile` - Path to Dockerfile (relative to context)
/// * `preset` - Built-in plan to use instead of a Dockerfile
/// * `build_args` - Build arguments as key-value pairs
/// * `no_cache` - Skip cached layers
pub async fn build(
    config: &Config,
    context_path: &str,
    tag: Option<&str>,
    dockerfile: &str,
    preset: Option<&str>,
    build_args: Vec<(String, String)>,
    no_cache: bool,
) -> Result<()> {
    let context_dir = PathBuf::from(context_path);
    if !context_dir.exists() {
        anyhow::bail!("Build context not found: {}", context_path);
    }

    // Use the directory name if no tag was given
    let default_name = context_dir
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_lowercase()))
        .unwrap_or_else(|| "image".to_string());
    let (name, image_tag) = parse_tag(tag, &default_name)?;

    let options = BuildOptions {
        context_path: context_dir,
        source: plan_source(dockerfile, preset)?,
        name: name.clone(),
        tag: image_tag.clone(),
        build_args: build_args.into_iter().collect(),
        no_cache,
    };

    println!("{} Building image {}:{}", "»".bold().blue(), name.green(), image_tag.cyan());
    if no_cache {
        println!("  {}", "Cache disabled".yellow());
    }

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("Invalid progress template")?
            .progress_chars("=>-"),
    );

    let bar = pb.clone();
    let progress = Arc::new(move |event: &StepEvent| match event {
        StepEvent::Started { step, total, description } => {
            bar.set_length(*total as u64);
            bar.println(format!(
                "{} {}",
                format!("Step {}/{}", step, total).bold().blue(),
                description
            ));
            bar.set_message(description.clone());
        }
        StepEvent::Finished { cached, duration_secs, .. } => {
            if *cached {
                bar.println(format!("  {}", "Using cache".green()));
            } else if *duration_secs >= 1.0 {
                bar.println(format!("  done in {}", format_duration(*duration_secs)));
            }
            bar.inc(1);
        }
    });

    let builder = ImageBuilder::from_config(config).with_progress(progress);
    let result = match builder.build(&options).await {
        Ok(result) => result,
        Err(e) => {
            pb.abandon_with_message("Build failed");
            if let Some(step) = e.failed_step() {
                eprintln!("{} step {} failed", "Build aborted:".red().bold(), step);
            }
            return Err(anyhow::Error::new(e).context("Build failed"));
        }
    };
    pb.finish_with_message("Build complete");

    let stats = &result.stats;
    println!();
    println!("{}", "Build completed successfully!".green().bold());
    println!();
    println!("  Image ID:    {}", format_image_id(&result.image_id).cyan());
    println!("  Name:        {}:{}", name.green(), image_tag.cyan());
    println!("  Layers:      {}", stats.layer_count);
    println!("  Steps:       {} ({} cached)", stats.total_steps, stats.cached_steps);
    println!("  Total size:  {}", format_size(stats.total_size));
    println!("  Duration:    {}", format_duration(stats.duration_secs).yellow());

    if let Some(launch) = result.manifest.config.launch_spec() {
        println!("  Command:     {}", launch.argv.join(" ").cyan());
    }

    Ok(())
}

/// Parses an image tag into (name, tag) components.
///
/// Examples:
/// - None -> ("myimage", "latest")
/// - "myapp" -> ("myapp", "latest")
/// - "myapp:v1.0" -> ("myapp", "v1.0")
fn parse_tag(tag: Option<&str>, default_name: &str) -> Result<(String, String)> {
    let Some(t) = tag else {
        return Ok((default_name.to_string(), "latest".to_string()));
    };

    let slash = t.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (name, tag) = match t[slash..].rfind(':') {
        Some(i) => (&t[..slash + i], &t[slash + i + 1..]),
        None => (t, "latest"),
    };
    if name.is_empty() || tag.is_empty() {
        anyhow::bail!("Invalid tag format: {}", t);
    }
    Ok((name.to_string(), tag.to_string()))
}
