//! CLI output formatting.
//!
//! # Output Format
//!
//! ## Optimize
//!
//! ```text
//! photo.jpg → 3f2a…c9e1
//!     Original: JPEG 2000x1500, 1.19 MB
//!     Optimized: WEBP 2000x1500, 412.50 KB (65.42% saved)
//!         /storage/images/optimized/3f/2a/…/photo.webp
//!     320w: 320x240 q80, 9.64 KB
//!     640w: 640x480 q85, 31.20 KB
//!     Placeholder: 118 bytes
//!
//! Optimized 3 images, 1 failed
//! ```
//!
//! ## Cleanup
//!
//! ```text
//! 3f2a…c9e1  2026-08-01  1.62 MB
//! Would remove 1 image, 1.62 MB
//! ```
//!
//! # Architecture
//!
//! Each command has a `format_*` function (returns `Vec<String>`) for
//! testability and a `print_*` wrapper that writes to stdout. Format
//! functions are pure: no I/O, no side effects.

use crate::imaging::ProcessorInfo;
use crate::metadata::ImageMetadata;
use crate::optimize::{CleanupReport, OptimizerStats};
use std::collections::BTreeMap;

// ============================================================================
// Shared helpers
// ============================================================================

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Human-readable byte count in powers of 1024.
///
/// ```text
/// 512        → 512 B
/// 1536       → 1.50 KB
/// 5_242_880  → 5.00 MB
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut value = bytes as f64 / 1024.0;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2} {}", UNITS[unit])
}

fn plural(n: usize, word: &str) -> String {
    if n == 1 {
        format!("{n} {word}")
    } else {
        format!("{n} {word}s")
    }
}

// ============================================================================
// Records
// ============================================================================

/// Describe one metadata record, headed by `label`.
pub fn format_metadata(label: &str, meta: &ImageMetadata) -> Vec<String> {
    let mut lines = vec![format!("{label} → {}", meta.hash)];
    let o = &meta.original;
    lines.push(format!(
        "{}Original: {} {}x{}, {}",
        indent(1),
        o.format,
        o.width,
        o.height,
        format_bytes(o.size)
    ));
    let p = &meta.optimized;
    lines.push(format!(
        "{}Optimized: {} {}x{}, {} ({:.2}% saved)",
        indent(1),
        p.format,
        p.width,
        p.height,
        format_bytes(p.size),
        p.compression_ratio
    ));
    lines.push(format!("{}{}", indent(2), p.url));
    for (descriptor, v) in &meta.variants {
        lines.push(format!(
            "{}{descriptor}: {}x{} q{}, {}",
            indent(1),
            v.width,
            v.height,
            v.quality,
            format_bytes(v.size)
        ));
    }
    if let Some(uri) = &meta.blur_placeholder {
        lines.push(format!("{}Placeholder: {} bytes", indent(1), uri.len()));
    }
    if meta.is_lcp {
        lines.push(format!("{}LCP: yes", indent(1)));
    }
    lines
}

pub fn print_metadata(label: &str, meta: &ImageMetadata) {
    for line in format_metadata(label, meta) {
        println!("{line}");
    }
}

/// One line for a file that could not be optimized.
pub fn format_failure(label: &str, error: &str) -> String {
    format!("{label} ✗ {error}")
}

/// Closing line of a batch run.
pub fn format_batch_summary(succeeded: usize, failed: usize) -> String {
    if failed == 0 {
        format!("Optimized {}", plural(succeeded, "image"))
    } else {
        format!("Optimized {}, {failed} failed", plural(succeeded, "image"))
    }
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Processor registry and running configuration.
///
/// ```text
/// Processors
///     imagemagick: unavailable
///     rust: active (jpeg, png, webp)
///
/// Output: webp, quality 85
/// Sizes: 320, 640, 1024, 1920
/// ```
pub fn format_info(processors: &BTreeMap<String, ProcessorInfo>, stats: &OptimizerStats) -> Vec<String> {
    let mut lines = vec!["Processors".to_string()];
    for (name, info) in processors {
        let status = match (info.available, info.active) {
            (false, _) => "unavailable".to_string(),
            (true, active) => {
                let formats: Vec<_> = info
                    .supported_formats
                    .iter()
                    .map(|f| f.name().to_ascii_lowercase())
                    .collect();
                let state = if active { "active" } else { "available" };
                format!("{state} ({})", formats.join(", "))
            }
        };
        lines.push(format!("{}{name}: {status}", indent(1)));
    }
    lines.push(String::new());
    lines.push(format!(
        "Output: {}, quality {}",
        stats.output_format.name().to_ascii_lowercase(),
        stats.default_quality
    ));
    let sizes: Vec<_> = stats.sizes.iter().map(u32::to_string).collect();
    lines.push(format!("Sizes: {}", sizes.join(", ")));
    lines
}

pub fn print_info(processors: &BTreeMap<String, ProcessorInfo>, stats: &OptimizerStats) {
    for line in format_info(processors, stats) {
        println!("{line}");
    }
}

// ============================================================================
// Cleanup
// ============================================================================

pub fn format_cleanup(report: &CleanupReport) -> Vec<String> {
    let mut lines: Vec<String> = report
        .entries
        .iter()
        .map(|e| {
            format!(
                "{}  {}  {}",
                e.hash,
                e.modified.format("%Y-%m-%d"),
                format_bytes(e.bytes)
            )
        })
        .collect();
    let count = plural(report.entries.len(), "image");
    let total = format_bytes(report.total_bytes());
    lines.push(if report.dry_run {
        format!("Would remove {count}, {total}")
    } else {
        format!("Removed {count}, freed {total}")
    });
    lines
}

pub fn print_cleanup(report: &CleanupReport) {
    for line in format_cleanup(report) {
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStats;
    use crate::imaging::Format;
    use crate::optimize::CleanupEntry;
    use crate::test_helpers::sample_metadata;
    use chrono::{TimeZone, Utc};

    // =========================================================================
    // format_bytes
    // =========================================================================

    #[test]
    fn bytes_below_one_kilobyte() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
    }

    #[test]
    fn bytes_scaled_units() {
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    // =========================================================================
    // Records
    // =========================================================================

    #[test]
    fn metadata_lines() {
        let meta = sample_metadata();
        let lines = format_metadata("sunset.jpg", &meta);

        assert_eq!(lines[0], format!("sunset.jpg → {}", meta.hash));
        assert_eq!(lines[1], "    Original: JPEG 1200x800, 122.07 KB");
        assert_eq!(lines[2], "    Optimized: WEBP 1200x800, 47.07 KB (61.44% saved)");
        assert_eq!(lines[3], format!("        {}", meta.optimized.url));
        assert_eq!(lines[4], "    320w: 320x213 q80, 9.64 KB");
        assert!(lines[5].starts_with("    Placeholder: "));
        assert_eq!(lines.len(), 6);
    }

    #[test]
    fn lcp_is_shown() {
        let mut meta = sample_metadata();
        meta.is_lcp = true;
        assert!(format_metadata("x", &meta).contains(&"    LCP: yes".to_string()));
    }

    #[test]
    fn batch_summary() {
        assert_eq!(format_batch_summary(1, 0), "Optimized 1 image");
        assert_eq!(format_batch_summary(3, 2), "Optimized 3 images, 2 failed");
    }

    #[test]
    fn failure_line() {
        assert_eq!(format_failure("a.gif", "bad"), "a.gif ✗ bad");
    }

    // =========================================================================
    // Diagnostics
    // =========================================================================

    #[test]
    fn info_lists_processors_and_settings() {
        let processors = BTreeMap::from([
            (
                "imagemagick".to_string(),
                ProcessorInfo {
                    available: false,
                    active: false,
                    supported_formats: vec![],
                },
            ),
            (
                "rust".to_string(),
                ProcessorInfo {
                    available: true,
                    active: true,
                    supported_formats: vec![Format::Jpeg, Format::Png, Format::WebP],
                },
            ),
        ]);
        let stats = OptimizerStats {
            active_processor: "rust".into(),
            supported_formats: vec![Format::Jpeg, Format::Png, Format::WebP],
            default_quality: 85,
            sizes: vec![320, 640],
            output_format: Format::WebP,
            cache: CacheStats::default(),
        };

        assert_eq!(
            format_info(&processors, &stats),
            vec![
                "Processors",
                "    imagemagick: unavailable",
                "    rust: active (jpeg, png, webp)",
                "",
                "Output: webp, quality 85",
                "Sizes: 320, 640",
            ]
        );
    }

    // =========================================================================
    // Cleanup
    // =========================================================================

    fn report(dry_run: bool) -> CleanupReport {
        let meta = sample_metadata();
        CleanupReport {
            entries: vec![CleanupEntry {
                hash: meta.hash,
                modified: Utc.with_ymd_and_hms(2026, 8, 1, 12, 0, 0).unwrap(),
                bytes: 2048,
            }],
            dry_run,
        }
    }

    #[test]
    fn cleanup_dry_run_wording() {
        let lines = format_cleanup(&report(true));
        assert!(lines[0].ends_with("  2026-08-01  2.00 KB"));
        assert_eq!(lines[1], "Would remove 1 image, 2.00 KB");
    }

    #[test]
    fn cleanup_wording() {
        let lines = format_cleanup(&report(false));
        assert_eq!(lines[1], "Removed 1 image, freed 2.00 KB");
    }

    #[test]
    fn cleanup_nothing() {
        let empty = CleanupReport::default();
        assert_eq!(format_cleanup(&empty), vec!["Removed 0 images, freed 0 B"]);
    }
}
