//! High-level image operations.
//!
//! These functions combine calculations with backend execution. They decide
//! which primitives to run and with what parameters; the optimizer decides
//! where the files live.

use super::backend::{AssetInfo, BackendError, ImageBackend};
use super::calculations::{fit_within, plan_variant_widths, variant_height};
use super::format::Format;
use super::params::{ConvertParams, EncodeSettings, PlaceholderParams, Quality, ResizeParams};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Result type for image operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// What it takes to turn a stored original into the primary asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryPlan {
    /// Derived dimensions when the source exceeds the bounds.
    pub resize_to: Option<(u32, u32)>,
    pub source_format: Format,
    pub target_format: Format,
    pub settings: EncodeSettings,
}

impl PrimaryPlan {
    pub fn needs_conversion(&self) -> bool {
        self.source_format != self.target_format
    }

    /// Dimensions the primary ends up with.
    pub fn dimensions(&self, source: &AssetInfo) -> (u32, u32) {
        self.resize_to
            .unwrap_or_else(|| source.dimensions(self.settings.auto_orient))
    }
}

/// Plan the primary without touching any file.
///
/// Bounds apply to the image as decoded, so an EXIF quarter turn swaps the
/// source dimensions first when `settings.auto_orient` is set.
pub fn plan_primary(
    source: &AssetInfo,
    max: (u32, u32),
    target_format: Format,
    settings: EncodeSettings,
) -> PrimaryPlan {
    PrimaryPlan {
        resize_to: fit_within(source.dimensions(settings.auto_orient), max),
        source_format: source.format,
        target_format,
        settings,
    }
}

/// Produce the primary asset at `output`.
///
/// Resizes (keeping the source encoding) or copies bytes verbatim, then, only
/// if the target format differs, converts the result in place. The two passes
/// stay separate so the copy-only case is bit-identical to the upload.
pub fn produce_primary(
    backend: &impl ImageBackend,
    source: &Path,
    output: &Path,
    plan: &PrimaryPlan,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match plan.resize_to {
        Some((width, height)) => backend.resize(&ResizeParams {
            source: source.to_path_buf(),
            output: output.to_path_buf(),
            width,
            height,
            format: plan.source_format,
            settings: plan.settings,
        })?,
        None => {
            std::fs::copy(source, output)?;
        }
    }

    if plan.needs_conversion() {
        backend.convert(&ConvertParams {
            source: output.to_path_buf(),
            output: output.to_path_buf(),
            format: plan.target_format,
            settings: plan.settings,
        })?;
    }

    Ok(())
}

/// Configuration for responsive variant generation.
#[derive(Debug, Clone)]
pub struct VariantConfig {
    pub breakpoints: Vec<u32>,
    /// Per-width quality overrides.
    pub qualities: BTreeMap<u32, Quality>,
    pub default_quality: Quality,
    pub format: Format,
    pub settings: EncodeSettings,
}

impl VariantConfig {
    pub fn quality_for(&self, width: u32) -> Quality {
        self.qualities
            .get(&width)
            .copied()
            .unwrap_or(self.default_quality)
    }
}

/// A variant written to disk.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedVariant {
    pub width: u32,
    pub height: u32,
    pub quality: Quality,
    pub path: PathBuf,
}

/// Variants together with the primary they were cut from.
#[derive(Debug, Clone, PartialEq)]
pub struct VariantSet {
    /// The primary as inspected after it was written.
    pub primary: AssetInfo,
    pub variants: Vec<GeneratedVariant>,
}

/// Create responsive variants from the primary asset.
///
/// The primary is re-inspected so widths are measured from the real file,
/// not from the plan. Breakpoints at or above its width are skipped.
/// `output_for` maps a width to the file path the variant is written to.
pub fn create_variants(
    backend: &impl ImageBackend,
    primary: &Path,
    output_for: impl Fn(u32) -> PathBuf,
    config: &VariantConfig,
) -> Result<VariantSet> {
    let info = backend.inspect(primary)?;
    let dims = info.dimensions(config.settings.auto_orient);
    let mut variants = Vec::new();

    for width in plan_variant_widths(dims.0, &config.breakpoints) {
        let height = variant_height(dims, width);
        let quality = config.quality_for(width);
        let path = output_for(width);

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        backend.resize(&ResizeParams {
            source: primary.to_path_buf(),
            output: path.clone(),
            width,
            height,
            format: config.format,
            settings: config.settings.with_quality(quality),
        })?;

        variants.push(GeneratedVariant {
            width,
            height,
            quality,
            path,
        });
    }

    Ok(VariantSet {
        primary: info,
        variants,
    })
}

/// Prefix of every placeholder data URI.
pub const PLACEHOLDER_URI_PREFIX: &str = "data:image/webp;base64,";

/// Encode a blurred WebP preview of `source` as a data URI.
pub fn create_placeholder(
    backend: &impl ImageBackend,
    source: &Path,
    width: u32,
    quality: Quality,
) -> Result<String> {
    let bytes = backend.blur_placeholder(&PlaceholderParams {
        source: source.to_path_buf(),
        width,
        quality,
    })?;
    Ok(format!("{PLACEHOLDER_URI_PREFIX}{}", STANDARD.encode(bytes)))
}
