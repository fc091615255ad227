//! CLI command implementations

pub mod build;
pub mod cache;
pub mod images;
pub mod inspect;
pub mod plan;

use anyhow::Result;
use kiln_core::{KilnError, PlanSource, Preset};
use std::path::PathBuf;

/// Picks the plan source from `--preset` / `--file`.
pub fn plan_source(file: &str, preset: Option<&str>) -> Result<PlanSource> {
    match preset {
        Some(name) => {
            let preset = Preset::from_name(name).ok_or_else(|| KilnError::UnknownPreset {
                name: name.to_string(),
                available: Preset::available(),
            })?;
            Ok(PlanSource::Preset(preset))
        }
        None => Ok(PlanSource::Dockerfile(PathBuf::from(file))),
    }
}

/// Formats an image ID to short form (first 12 characters).
pub fn format_image_id(id: &str) -> String {
    let id = id.trim_start_matches("sha256:");
    id.chars().take(12).collect()
}

/// Formats size in bytes to human-readable form.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1}MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1}KB", bytes as f64 / KB as f64)
    } else {
        format!("{}B", bytes)
    }
}

/// Formats a duration in seconds to a human-readable string.
pub fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else {
        let mins = (secs / 60.0).floor();
        let remaining_secs = secs - (mins * 60.0);
        format!("{:.0}m{:.0}s", mins, remaining_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_source() {
        assert_eq!(
            plan_source("Dockerfile", Some("python-web")).unwrap(),
            PlanSource::Preset(Preset::PythonWeb)
        );
        assert_eq!(
            plan_source("build/Dockerfile", None).unwrap(),
            PlanSource::Dockerfile(PathBuf::from("build/Dockerfile"))
        );
        let err = plan_source("Dockerfile", Some("rails")).unwrap_err();
        assert!(err.to_string().contains("python-web"));
    }

    #[test]
    fn test_format_image_id() {
        assert_eq!(format_image_id("sha256:abcdef1234567890abcdef"), "abcdef123456");
        assert_eq!(format_image_id("abc123"), "abc123");
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(500), "500B");
        assert_eq!(format_size(5 * 1024), "5.0KB");
        assert_eq!(format_size(50 * 1024 * 1024), "50.0MB");
        assert_eq!(format_size(2 * 1024 * 1024 * 1024), "2.00GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.123), "123ms");
        assert_eq!(format_duration(5.7), "5.7s");
        assert_eq!(format_duration(125.0), "2m5s");
    }
}
