//! Cache command implementation for kiln CLI.

use super::format_size;
use anyhow::{Context, Result};
use colored::Colorize;
use kiln_core::builder::CacheManager;
use kiln_core::{paths, Config};

fn open(config: &Config) -> Result<CacheManager> {
    let dir = paths::cache_dir_in(&config.data_path());
    CacheManager::with_config(dir, config.cache_size_limit_bytes)
        .context("Failed to open layer cache")
}

/// Prints layer cache usage.
pub fn stats(config: &Config) -> Result<()> {
    let cache = open(config)?;
    let stats = cache.stats().context("Failed to read cache statistics")?;

    let used_pct = if stats.size_limit > 0 {
        stats.total_bytes as f64 / stats.size_limit as f64 * 100.0
    } else {
        0.0
    };

    println!("{}", "Layer cache".bold().blue());
    println!("  Location:  {}", cache.cache_dir().display());
    println!("  Layers:    {}", stats.layers.to_string().yellow());
    println!(
        "  Size:      {} of {} ({:.1}%)",
        format_size(stats.total_bytes),
        format_size(stats.size_limit),
        used_pct
    );
    Ok(())
}

/// Removes every cached layer.
pub fn clear(config: &Config) -> Result<()> {
    let cache = open(config)?;
    let layers = cache.layer_count().context("Failed to read cache")?;
    cache.clear().context("Failed to clear cache")?;
    println!("Removed {} cached layers", layers.to_string().yellow());
    Ok(())
}
