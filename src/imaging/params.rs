//! Parameter types for image operations.
//!
//! These structs describe *what* to do, not *how* to do it. They are the
//! interface between the [`operations`](super::operations) module (which
//! decides what to derive) and the [`backend`](super::backend) (which does the
//! pixel work). This separation lets the pipeline run against a mock backend
//! without changing operation logic.
//!
//! ## Types
//!
//! - [`Quality`]: Lossy encoding quality (1–100, default 85). Clamped on construction.
//! - [`EncodeSettings`]: Quality plus the strip/orient/progressive switches every re-encode honours.
//! - [`ResizeParams`]: Source, output, exact target dimensions, output format, settings.
//! - [`ConvertParams`]: Re-encode a file into another format (in place allowed).
//! - [`PlaceholderParams`]: Tiny blurred preview: source, width, quality.

use super::format::Format;
use std::path::PathBuf;

/// Quality setting for lossy image encoding (1-100).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quality(pub u32);

impl Quality {
    pub fn new(value: u32) -> Self {
        Self(value.clamp(1, 100))
    }

    pub fn value(self) -> u32 {
        self.0
    }
}

impl Default for Quality {
    fn default() -> Self {
        Self(85)
    }
}

/// Encoder switches applied whenever a backend writes pixels.
///
/// A straight byte copy never goes through these, which is what keeps the
/// no-resize, no-conversion primary bit-identical to the upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeSettings {
    pub quality: Quality,
    /// Drop EXIF/ICC/XMP from the output.
    pub strip_metadata: bool,
    /// Rotate pixels according to EXIF orientation before encoding.
    pub auto_orient: bool,
    /// Interlaced/progressive output where the format supports it.
    pub progressive: bool,
}

impl EncodeSettings {
    pub fn with_quality(self, quality: Quality) -> Self {
        Self { quality, ..self }
    }
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            strip_metadata: true,
            auto_orient: true,
            progressive: true,
        }
    }
}

/// Parameters for a resize to exact dimensions.
#[derive(Debug, Clone, PartialEq)]
pub struct ResizeParams {
    pub source: PathBuf,
    pub output: PathBuf,
    pub width: u32,
    pub height: u32,
    /// Encoding of the output, independent of the output path's extension.
    pub format: Format,
    pub settings: EncodeSettings,
}

/// Parameters for a format conversion. `source == output` converts in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertParams {
    pub source: PathBuf,
    pub output: PathBuf,
    pub format: Format,
    pub settings: EncodeSettings,
}

/// Parameters for a blur placeholder. The result is always WebP.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaceholderParams {
    pub source: PathBuf,
    pub width: u32,
    pub quality: Quality,
}
