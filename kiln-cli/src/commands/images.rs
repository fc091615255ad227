//! Images command implementation for kiln CLI.
//!
//! Lists and removes images in the local image store.

use super::{format_image_id, format_size};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use colored::Colorize;
use kiln_core::builder::ImageStore;
use kiln_core::{paths, Config};
use tabled::{Table, Tabled};

fn store(config: &Config) -> ImageStore {
    ImageStore::new(paths::images_dir_in(&config.data_path()))
}

/// Lists all images in the local store.
pub fn images(config: &Config) -> Result<()> {
    let images = store(config).list().context("Failed to list images")?;

    if images.is_empty() {
        println!("No images found.");
        println!();
        println!("Build your first image with: {}", "kiln build --preset python-web".cyan());
        return Ok(());
    }

    #[derive(Tabled)]
    struct ImageRow {
        #[tabled(rename = "REPOSITORY")]
        repository: String,
        #[tabled(rename = "TAG")]
        tag: String,
        #[tabled(rename = "IMAGE ID")]
        image_id: String,
        #[tabled(rename = "SIZE")]
        size: String,
        #[tabled(rename = "CREATED")]
        created: String,
    }

    let now = Utc::now();
    let rows: Vec<ImageRow> = images
        .iter()
        .map(|img| ImageRow {
            repository: img.name.clone(),
            tag: img.tag.clone(),
            image_id: format_image_id(&img.id),
            size: format_size(img.size_bytes),
            created: format_created(img.created, now),
        })
        .collect();

    println!("{}", Table::new(rows));
    Ok(())
}

/// Removes a tag, and the image once nothing refers to it.
pub fn remove(config: &Config, reference: &str) -> Result<()> {
    let id = store(config)
        .remove(reference)
        .with_context(|| format!("Failed to remove image {}", reference))?;
    println!("Untagged: {} ({})", reference.green(), format_image_id(&id));
    Ok(())
}

/// Formats creation time relative to `now`.
fn format_created(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - created).num_seconds().max(0);
    if secs < 60 {
        format!("{} seconds ago", secs)
    } else if secs < 3600 {
        format!("{} minutes ago", secs / 60)
    } else if secs < 86400 {
        format!("{} hours ago", secs / 3600)
    } else if secs < 604800 {
        format!("{} days ago", secs / 86400)
    } else {
        format!("{} weeks ago", secs / 604800)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_format_created() {
        let now = Utc::now();
        assert_eq!(format_created(now - Duration::seconds(5), now), "5 seconds ago");
        assert_eq!(format_created(now - Duration::minutes(3), now), "3 minutes ago");
        assert_eq!(format_created(now - Duration::hours(2), now), "2 hours ago");
        assert_eq!(format_created(now - Duration::days(3), now), "3 days ago");
        assert_eq!(format_created(now - Duration::days(21), now), "3 weeks ago");
        assert_eq!(format_created(now + Duration::seconds(5), now), "0 seconds ago");
    }
}
