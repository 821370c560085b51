//! Optimizer configuration.
//!
//! Handles loading, validating, and merging `imgopt.toml`. Stock defaults are
//! the base layer; a user file overrides only the keys it names. The
//! resulting [`OptimizerConfig`] is immutable and handed to the optimizer at
//! construction.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All options are optional - defaults shown below
//!
//! [storage]
//! root = "storage"          # Local directory blobs are written under
//! base_url = "/storage"     # Public URL prefix for stored keys
//! base_path = "images"
//! hash_distribution = true  # ab/cd/rest-of-hash directory fan-out
//! hash_depth = 2
//!
//! [storage.paths]
//! originals = "originals"
//! optimized = "optimized"
//!
//! [processing]
//! processor = "imagemagick" # Preferred backend: "imagemagick" or "rust"
//! fallback = true
//! default_quality = 85
//! sizes = [320, 640, 1024, 1920]
//! max_width = 2560
//! max_height = 2560
//!
//! [[processing.qualities]]  # Per-width variant quality
//! width = 320
//! quality = 80
//!
//! [formats]
//! output = "webp"
//!
//! [cache]
//! enabled = true
//! ttl = 3600                # Seconds
//!
//! [presets.avatar]
//! sizes = [64, 128, 256]
//! quality = 85
//!
//! [lighthouse.sizes_presets]
//! half = "(min-width: 1024px) 50vw, 100vw"
//! ```
//!
//! Unknown keys are rejected to catch typos early.

use crate::imaging::{EncodeSettings, Format, Quality};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Name of the config file looked up in the working root.
pub const CONFIG_FILENAME: &str = "imgopt.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// Optimizer configuration loaded from `imgopt.toml`.
///
/// All fields have working defaults. Unknown keys are rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OptimizerConfig {
    pub storage: StorageConfig,
    pub processing: ProcessingConfig,
    pub formats: FormatsConfig,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub validation: ValidationConfig,
    /// Named option bundles, e.g. `avatar` or `hero`.
    pub presets: BTreeMap<String, Preset>,
    pub lighthouse: LighthouseConfig,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            processing: ProcessingConfig::default(),
            formats: FormatsConfig::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            validation: ValidationConfig::default(),
            presets: stock_presets(),
            lighthouse: LighthouseConfig::default(),
        }
    }
}

impl OptimizerConfig {
    /// Validate config values are within acceptable ranges.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.processing;
        check_quality("processing.default_quality", p.default_quality)?;
        for q in &p.qualities {
            check_quality(&format!("processing.qualities[{}]", q.width), q.quality)?;
        }
        check_quality("processing.blur_placeholder.quality", p.blur_placeholder.quality)?;
        if p.blur_placeholder.width == 0 {
            return Err(ConfigError::Validation(
                "processing.blur_placeholder.width must be non-zero".into(),
            ));
        }
        if p.sizes.contains(&0) {
            return Err(ConfigError::Validation(
                "processing.sizes must not contain 0".into(),
            ));
        }
        if p.max_width == 0 || p.max_height == 0 {
            return Err(ConfigError::Validation(
                "processing.max_width and max_height must be non-zero".into(),
            ));
        }
        if self.storage.hash_depth > MAX_HASH_DEPTH {
            return Err(ConfigError::Validation(format!(
                "storage.hash_depth must be at most {MAX_HASH_DEPTH}"
            )));
        }
        if self.storage.paths.originals == self.storage.paths.optimized {
            return Err(ConfigError::Validation(
                "storage.paths.originals and storage.paths.optimized must differ".into(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Validation(
                "cache.max_entries must be non-zero".into(),
            ));
        }
        if self.queue.tries == 0 {
            return Err(ConfigError::Validation("queue.tries must be at least 1".into()));
        }
        if self.queue.timeout == 0 {
            return Err(ConfigError::Validation("queue.timeout must be non-zero".into()));
        }
        for (name, preset) in &self.presets {
            if let Some(q) = preset.quality {
                check_quality(&format!("presets.{name}.quality"), q)?;
            }
            if preset.max_width == Some(0) || preset.max_height == Some(0) {
                return Err(ConfigError::Validation(format!(
                    "presets.{name} max dimensions must be non-zero"
                )));
            }
        }
        Ok(())
    }

    /// Encoder switches with the configured default quality.
    pub fn encode_settings(&self) -> EncodeSettings {
        EncodeSettings {
            quality: Quality::new(self.processing.default_quality),
            strip_metadata: self.processing.strip_metadata,
            auto_orient: self.processing.auto_orient,
            progressive: self.processing.progressive,
        }
    }

    /// Per-width variant qualities as a lookup table.
    pub fn quality_table(&self) -> BTreeMap<u32, Quality> {
        self.processing
            .qualities
            .iter()
            .map(|q| (q.width, Quality::new(q.quality)))
            .collect()
    }
}

fn check_quality(key: &str, value: u32) -> Result<(), ConfigError> {
    if (1..=100).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Validation(format!("{key} must be 1-100")))
    }
}

/// Two hex characters per level; deeper than this leaves too little hash
/// for the leaf directory.
const MAX_HASH_DEPTH: usize = 8;

/// Where and how blobs are laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Local directory the filesystem blob store writes under.
    pub root: String,
    /// Public URL prefix joined with a key to form its URL.
    pub base_url: String,
    /// First key segment for everything this optimizer writes.
    pub base_path: String,
    pub paths: StoragePaths,
    /// Fan hashes out into `ab/cd/…` directories.
    pub hash_distribution: bool,
    /// Number of two-character levels when distribution is on.
    pub hash_depth: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "storage".to_string(),
            base_url: "/storage".to_string(),
            base_path: "images".to_string(),
            paths: StoragePaths::default(),
            hash_distribution: true,
            hash_depth: 2,
        }
    }
}

impl StorageConfig {
    /// Depth actually applied: zero when distribution is off.
    pub fn effective_depth(&self) -> usize {
        if self.hash_distribution {
            self.hash_depth
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoragePaths {
    pub originals: String,
    pub optimized: String,
}

impl Default for StoragePaths {
    fn default() -> Self {
        Self {
            originals: "originals".to_string(),
            optimized: "optimized".to_string(),
        }
    }
}

/// Image processing settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessingConfig {
    /// Preferred processor name.
    pub processor: String,
    /// Fall back to the first available processor when the preferred one
    /// is missing.
    pub fallback: bool,
    /// Quality for the primary and for variant widths without an override.
    pub default_quality: u32,
    /// Per-width variant quality overrides.
    pub qualities: Vec<WidthQuality>,
    /// Responsive breakpoints (pixel widths).
    pub sizes: Vec<u32>,
    pub max_width: u32,
    pub max_height: u32,
    pub strip_metadata: bool,
    pub auto_orient: bool,
    pub progressive: bool,
    pub blur_placeholder: BlurConfig,
    /// Maximum parallel workers for batch runs.
    /// When absent, defaults to the number of CPU cores.
    /// Values larger than the core count are clamped down.
    pub max_processes: Option<usize>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            processor: "imagemagick".to_string(),
            fallback: true,
            default_quality: 85,
            qualities: vec![
                WidthQuality::new(320, 80),
                WidthQuality::new(640, 85),
                WidthQuality::new(1024, 85),
                WidthQuality::new(1920, 88),
                WidthQuality::new(2560, 90),
            ],
            sizes: vec![320, 640, 1024, 1920],
            max_width: 2560,
            max_height: 2560,
            strip_metadata: true,
            auto_orient: true,
            progressive: true,
            blur_placeholder: BlurConfig::default(),
            max_processes: None,
        }
    }
}

/// One `[[processing.qualities]]` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WidthQuality {
    pub width: u32,
    pub quality: u32,
}

impl WidthQuality {
    pub fn new(width: u32, quality: u32) -> Self {
        Self { width, quality }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BlurConfig {
    pub enabled: bool,
    pub width: u32,
    pub quality: u32,
}

impl Default for BlurConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            width: 20,
            quality: 30,
        }
    }
}

/// Resolve the effective thread count from config.
///
/// - `None` → use all available cores
/// - `Some(n)` → use `min(n, cores)` (user can constrain down, not up)
pub fn effective_threads(config: &ProcessingConfig) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    config.max_processes.map(|n| n.min(cores)).unwrap_or(cores)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FormatsConfig {
    /// Format of the primary asset and every variant.
    pub output: Format,
}

impl Default for FormatsConfig {
    fn default() -> Self {
        Self {
            output: Format::WebP,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Entry lifetime in seconds.
    pub ttl: u64,
    /// Prepended to every cache key.
    pub prefix: String,
    /// Upper bound on cached entries.
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl: 3600,
            prefix: "imgopt_".to_string(),
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl)
    }
}

/// Deferred job settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct QueueConfig {
    /// Total attempts per job, first run included.
    pub tries: u32,
    /// Per-attempt limit in seconds.
    pub timeout: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            tries: 3,
            timeout: 300,
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Upload acceptance rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ValidationConfig {
    /// Maximum upload size in KiB.
    pub max_file_size: u64,
    pub min_width: u32,
    pub min_height: u32,
    pub allowed_mimes: Vec<String>,
    pub allowed_extensions: Vec<String>,
    /// Decode the header and check real format and dimensions.
    pub verify_image_type: bool,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_file_size: 10_240,
            min_width: 10,
            min_height: 10,
            allowed_mimes: ["image/jpeg", "image/jpg", "image/png", "image/webp"]
                .map(String::from)
                .to_vec(),
            allowed_extensions: ["jpg", "jpeg", "png", "webp"].map(String::from).to_vec(),
            verify_image_type: true,
        }
    }
}

/// A named bundle of option defaults. Explicit options override these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Preset {
    pub sizes: Option<Vec<u32>>,
    pub quality: Option<u32>,
    pub format: Option<Format>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub is_lcp: Option<bool>,
    pub sizes_preset: Option<String>,
}

fn stock_presets() -> BTreeMap<String, Preset> {
    BTreeMap::from([
        (
            "avatar".to_string(),
            Preset {
                sizes: Some(vec![64, 128, 256]),
                quality: Some(85),
                max_width: Some(512),
                max_height: Some(512),
                ..Preset::default()
            },
        ),
        (
            "thumbnail".to_string(),
            Preset {
                sizes: Some(vec![150, 300]),
                quality: Some(80),
                max_width: Some(600),
                max_height: Some(600),
                ..Preset::default()
            },
        ),
        (
            "gallery".to_string(),
            Preset {
                sizes: Some(vec![640, 1024, 1920]),
                quality: Some(85),
                ..Preset::default()
            },
        ),
        (
            "hero".to_string(),
            Preset {
                sizes: Some(vec![768, 1024, 1920, 2560]),
                quality: Some(88),
                is_lcp: Some(true),
                ..Preset::default()
            },
        ),
    ])
}

/// `sizes` attribute settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LighthouseConfig {
    /// Used when neither an explicit attribute nor a named preset is given.
    pub default_sizes: String,
    pub sizes_presets: BTreeMap<String, String>,
}

impl Default for LighthouseConfig {
    fn default() -> Self {
        Self {
            default_sizes: "100vw".to_string(),
            sizes_presets: BTreeMap::from([
                ("full".to_string(), "100vw".to_string()),
                (
                    "half".to_string(),
                    "(min-width: 1024px) 50vw, 100vw".to_string(),
                ),
                (
                    "third".to_string(),
                    "(min-width: 1024px) 33vw, (min-width: 768px) 50vw, 100vw".to_string(),
                ),
                (
                    "content".to_string(),
                    "(min-width: 1024px) 800px, 100vw".to_string(),
                ),
            ]),
        }
    }
}

// =============================================================================
// Config loading, merging, and validation
// =============================================================================

/// Returns the stock default config as a `toml::Value::Table`.
///
/// This is the canonical representation of all default values, used as the
/// base layer for merging user overrides on top.
pub fn stock_defaults_value() -> Result<toml::Value, ConfigError> {
    Ok(toml::Value::try_from(OptimizerConfig::default())?)
}

/// Recursively merge `overlay` on top of `base`.
///
/// - Tables are merged key-by-key (overlay keys override base keys).
/// - Non-table values in overlay replace base values entirely, arrays included.
/// - Keys in base that are not in overlay are preserved.
pub fn merge_toml(base: toml::Value, overlay: toml::Value) -> toml::Value {
    match (base, overlay) {
        (toml::Value::Table(mut base_table), toml::Value::Table(overlay_table)) => {
            for (key, overlay_val) in overlay_table {
                let merged = match base_table.remove(&key) {
                    Some(base_val) => merge_toml(base_val, overlay_val),
                    None => overlay_val,
                };
                base_table.insert(key, merged);
            }
            toml::Value::Table(base_table)
        }
        (_, overlay) => overlay,
    }
}

/// Read a TOML file as a raw value. `Ok(None)` when it does not exist.
pub fn load_raw_config(path: &Path) -> Result<Option<toml::Value>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)?;
    let value: toml::Value = toml::from_str(&content)?;
    Ok(Some(value))
}

/// Merge an optional overlay onto a base value, then deserialize and validate.
pub fn resolve_config(
    base: toml::Value,
    overlay: Option<toml::Value>,
) -> Result<OptimizerConfig, ConfigError> {
    let merged = match overlay {
        Some(ov) => merge_toml(base, ov),
        None => base,
    };
    let config: OptimizerConfig = merged.try_into()?;
    config.validate()?;
    Ok(config)
}

/// Load `imgopt.toml` from the given directory.
///
/// Merges user values on top of stock defaults, rejects unknown keys,
/// and validates the result. A missing file yields the defaults.
pub fn load_config(root: &Path) -> Result<OptimizerConfig, ConfigError> {
    load_config_file(&root.join(CONFIG_FILENAME))
}

/// Like [`load_config`] for an explicit file path.
pub fn load_config_file(path: &Path) -> Result<OptimizerConfig, ConfigError> {
    resolve_config(stock_defaults_value()?, load_raw_config(path)?)
}

/// Returns a fully-commented stock `imgopt.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# imgopt configuration
# ====================
# All settings are optional. Remove or comment out any you don't need.
# Values shown below are the defaults. Unknown keys will cause an error.

# ---------------------------------------------------------------------------
# Storage layout
# ---------------------------------------------------------------------------
[storage]
# Local directory blobs are written under (relative to the working root).
root = "storage"

# Public URL prefix; a stored key's URL is "<base_url>/<key>".
base_url = "/storage"

# First segment of every key.
base_path = "images"

# Fan hashes out into two-character directories: ab/cd/<rest of hash>.
hash_distribution = true
hash_depth = 2

[storage.paths]
originals = "originals"
optimized = "optimized"

# ---------------------------------------------------------------------------
# Processing
# ---------------------------------------------------------------------------
[processing]
# Preferred processor: "imagemagick" (needs the `magick` program) or "rust".
processor = "imagemagick"

# Use the first available processor when the preferred one is missing.
fallback = true

# Quality (1-100) for the primary image and variants without an override.
default_quality = 85

# Responsive breakpoints. Widths at or above the primary's width are skipped.
sizes = [320, 640, 1024, 1920]

# Images larger than this are scaled down, preserving aspect ratio.
max_width = 2560
max_height = 2560

strip_metadata = true
auto_orient = true
progressive = true

# Maximum parallel workers for batch runs.
# Omit or comment out to auto-detect (= number of CPU cores).
# max_processes = 4

# Per-width variant quality.
[[processing.qualities]]
width = 320
quality = 80

[[processing.qualities]]
width = 640
quality = 85

[[processing.qualities]]
width = 1024
quality = 85

[[processing.qualities]]
width = 1920
quality = 88

[[processing.qualities]]
width = 2560
quality = 90

# Tiny blurred WebP preview inlined as a data URI.
[processing.blur_placeholder]
enabled = true
width = 20
quality = 30

# ---------------------------------------------------------------------------
# Output format: "webp", "avif", "jpeg" or "png"
# ---------------------------------------------------------------------------
[formats]
output = "webp"

# ---------------------------------------------------------------------------
# Result cache
# ---------------------------------------------------------------------------
[cache]
enabled = true
ttl = 3600          # Seconds
prefix = "imgopt_"
max_entries = 10000

# ---------------------------------------------------------------------------
# Deferred jobs
# ---------------------------------------------------------------------------
[queue]
tries = 3           # Attempts per job, first run included
timeout = 300       # Seconds per attempt

# ---------------------------------------------------------------------------
# Upload validation
# ---------------------------------------------------------------------------
[validation]
max_file_size = 10240   # KiB
min_width = 10
min_height = 10
allowed_mimes = ["image/jpeg", "image/jpg", "image/png", "image/webp"]
allowed_extensions = ["jpg", "jpeg", "png", "webp"]
verify_image_type = true

# ---------------------------------------------------------------------------
# Presets: option defaults selected by name. Explicit options still win.
# Keys: sizes, quality, format, max_width, max_height, is_lcp, sizes_preset
# ---------------------------------------------------------------------------
[presets.avatar]
sizes = [64, 128, 256]
quality = 85
max_width = 512
max_height = 512

[presets.gallery]
sizes = [640, 1024, 1920]
quality = 85

[presets.hero]
sizes = [768, 1024, 1920, 2560]
quality = 88
is_lcp = true

[presets.thumbnail]
sizes = [150, 300]
quality = 80
max_width = 600
max_height = 600

# ---------------------------------------------------------------------------
# `sizes` attribute
# ---------------------------------------------------------------------------
[lighthouse]
default_sizes = "100vw"

[lighthouse.sizes_presets]
full = "100vw"
half = "(min-width: 1024px) 50vw, 100vw"
third = "(min-width: 1024px) 33vw, (min-width: 768px) 50vw, 100vw"
content = "(min-width: 1024px) 800px, 100vw"
"##
}
