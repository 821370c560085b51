//! Image processing.
//!
//! | Operation | Rust backend | ImageMagick backend |
//! |---|---|---|
//! | **Inspect** | `image` header decode | `magick identify` |
//! | **Resize** | Lanczos3 `resize_exact` | `-resize WxH!` |
//! | **Convert** | decode + re-encode (`webp` for lossy WebP) | `magick in FMT:out` |
//! | **Blur placeholder** | `thumbnail_exact` + `blur` | `-thumbnail -blur` |
//!
//! The module is split into:
//! - **Format**: the closed set of formats and their names
//! - **Calculations**: Pure functions for dimension math (unit testable)
//! - **Parameters**: Data structures describing image operations
//! - **Backend**: [`ImageBackend`] trait + [`RustBackend`] + [`MagickBackend`]
//! - **Selector**: picks the backend the optimizer runs with
//! - **Operations**: High-level functions combining calculations + backend

pub mod backend;
mod calculations;
mod format;
pub mod magick_backend;
pub mod operations;
mod params;
pub mod rust_backend;
pub mod selector;

pub use backend::{AssetInfo, BackendError, ImageBackend};
pub use calculations::{compression_ratio, fit_within, plan_variant_widths, variant_height};
pub use format::Format;
pub use magick_backend::MagickBackend;
pub use operations::{
    GeneratedVariant, PLACEHOLDER_URI_PREFIX, PrimaryPlan, VariantConfig, VariantSet,
    create_placeholder, create_variants, plan_primary, produce_primary,
};
pub use params::{ConvertParams, EncodeSettings, PlaceholderParams, Quality, ResizeParams};
pub use rust_backend::RustBackend;
pub use selector::{Processor, ProcessorInfo, ProcessorSelector, SelectError, Selection};
