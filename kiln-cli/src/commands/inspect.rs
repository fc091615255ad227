//! Inspect command implementation for kiln CLI.

use super::{format_image_id, format_size};
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_core::builder::ImageStore;
use kiln_core::{paths, Config};

/// Prints an image's config, history and launch spec.
pub fn inspect(config: &Config, reference: &str) -> Result<()> {
    let store = ImageStore::new(paths::images_dir_in(&config.data_path()));
    let id = store.resolve(reference).with_context(|| format!("No such image: {}", reference))?;
    let manifest = store.load(&id).with_context(|| format!("Failed to load image {}", id))?;
    let image_config = &manifest.config;

    println!("{}", "Image".bold().blue());
    println!("  ID:            {}", id.cyan());
    println!("  Reference:     {}", manifest.reference().green());
    println!("  Created:       {}", manifest.created.to_rfc3339());
    println!("  Platform:      {}/{}", manifest.os, manifest.architecture);
    println!("  Size:          {}", format_size(manifest.total_size()));

    println!();
    println!("{}", "Config".bold().blue());
    println!("  Working dir:   {}", image_config.working_dir);
    if let Some(user) = &image_config.user {
        println!("  User:          {}", user);
    }
    if !image_config.exposed_ports.is_empty() {
        let ports: Vec<&str> = image_config.exposed_ports.iter().map(String::as_str).collect();
        println!("  Exposed ports: {}", ports.join(", "));
    }
    for (key, value) in &image_config.env {
        println!("  Env:           {}={}", key, value);
    }
    for (key, value) in &image_config.labels {
        println!("  Label:         {}={}", key, value);
    }

    println!();
    println!("{}", "Launch".bold().blue());
    match image_config.launch_spec() {
        Some(launch) => {
            let argv = serde_json::to_string(&launch.argv).context("Failed to encode argv")?;
            println!("  Argv:          {}", argv.cyan());
            println!("  Working dir:   {}", launch.working_dir);
        }
        None => println!("  {}", "No command declared".yellow()),
    }

    println!();
    println!("{}", "History".bold().blue());
    let mut layers = manifest.layers.iter();
    for entry in &manifest.history {
        let layer = if entry.empty_layer {
            "<metadata>".dimmed().to_string()
        } else {
            layers
                .next()
                .map(|l| format!("{} {}", format_image_id(&l.digest), format_size(l.size)))
                .unwrap_or_default()
        };
        println!("  {:>2}. {:<26} {}", entry.step, layer, entry.created_by);
    }

    Ok(())
}
