//! Image processing backend trait and shared types.
//!
//! The [`ImageBackend`] trait defines the primitives every backend must
//! support: inspect, resize, convert and blur placeholder generation.
//! Metadata stripping, auto-orientation and progressive output are not
//! separate passes; they ride along in [`EncodeSettings`](super::EncodeSettings)
//! on every call that re-encodes pixels.
//!
//! | Primitive | [`RustBackend`](super::RustBackend) | [`MagickBackend`](super::MagickBackend) |
//! |---|---|---|
//! | inspect | `image` header decode | `magick identify -format` |
//! | resize | Lanczos3 `resize_exact` | `-resize WxH!` |
//! | convert | decode + re-encode | `magick in FMT:out` |
//! | blur placeholder | `thumbnail` + `blur` + lossy WebP | `-thumbnail -blur WEBP:-` |
//!
//! Backends are `Send + Sync`: one instance is shared by every request.

use super::format::Format;
use super::params::{ConvertParams, PlaceholderParams, ResizeParams};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Processing failed: {0}")]
    ProcessingFailed(String),
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
}

/// Result of an inspect operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AssetInfo {
    pub width: u32,
    pub height: u32,
    pub format: Format,
    /// Size of the file on disk in bytes.
    pub size: u64,
    pub has_alpha: bool,
    /// EXIF orientation 5-8: the stored pixels are a quarter turn off upright,
    /// so `width` and `height` are swapped relative to the displayed image.
    pub quarter_turn: bool,
}

impl AssetInfo {
    /// Dimensions as the pixels come out of a decode: upright when
    /// `auto_orient` is set, as stored otherwise.
    pub fn dimensions(&self, auto_orient: bool) -> (u32, u32) {
        if auto_orient && self.quarter_turn {
            (self.height, self.width)
        } else {
            (self.width, self.height)
        }
    }
}

/// Trait for image processing backends.
///
/// Every backend implements all primitives so the pipeline is
/// backend-agnostic. `name`, `is_available` and `supported_formats` feed the
/// [`selector`](super::selector).
pub trait ImageBackend: Send + Sync {
    /// Registry name, lowercase (`"rust"`, `"imagemagick"`).
    fn name(&self) -> &'static str;

    /// Whether this backend can run in the current environment.
    fn is_available(&self) -> bool;

    /// Output formats this backend can encode.
    fn supported_formats(&self) -> Vec<Format>;

    /// Read dimensions, format and alpha flag of an image file.
    fn inspect(&self, path: &Path) -> Result<AssetInfo, BackendError>;

    /// Resize to exact dimensions, encoding the output as `params.format`.
    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError>;

    /// Re-encode into `params.format`. Same-format conversion recompresses.
    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError>;

    /// Encode a tiny blurred WebP preview and return its bytes.
    fn blur_placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError>;
}
