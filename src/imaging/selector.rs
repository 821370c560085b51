//! Processor selection.
//!
//! The set of backends is closed and registered in a fixed order:
//! `imagemagick` first, `rust` last. `rust` is always available, so with
//! fallback enabled selection cannot fail in practice.

use super::backend::{AssetInfo, BackendError, ImageBackend};
use super::format::Format;
use super::magick_backend::MagickBackend;
use super::params::{ConvertParams, PlaceholderParams, ResizeParams};
use super::rust_backend::RustBackend;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SelectError {
    #[error("Processor {0:?} is not available and fallback is disabled")]
    PreferredUnavailable(String),
    #[error("No image processor is available")]
    NoneAvailable,
}

/// One of the registered backends.
pub enum Processor {
    Magick(MagickBackend),
    Rust(RustBackend),
}

impl Processor {
    fn backend(&self) -> &dyn ImageBackend {
        match self {
            Processor::Magick(b) => b,
            Processor::Rust(b) => b,
        }
    }
}

impl ImageBackend for Processor {
    fn name(&self) -> &'static str {
        self.backend().name()
    }

    fn is_available(&self) -> bool {
        self.backend().is_available()
    }

    fn supported_formats(&self) -> Vec<Format> {
        self.backend().supported_formats()
    }

    fn inspect(&self, path: &Path) -> Result<AssetInfo, BackendError> {
        self.backend().inspect(path)
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        self.backend().resize(params)
    }

    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError> {
        self.backend().convert(params)
    }

    fn blur_placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError> {
        self.backend().blur_placeholder(params)
    }
}

/// Diagnostic view of one processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessorInfo {
    pub available: bool,
    pub active: bool,
    /// Empty when the processor is unavailable.
    pub supported_formats: Vec<Format>,
}

/// Outcome of a selection: the processor to run with and a snapshot of the
/// registry taken at selection time.
pub struct Selection {
    pub processor: Processor,
    pub registry: BTreeMap<String, ProcessorInfo>,
}

pub struct ProcessorSelector {
    processors: Vec<Processor>,
}

impl ProcessorSelector {
    /// The stock registry: ImageMagick, then pure Rust.
    pub fn new() -> Self {
        Self::with_processors(vec![
            Processor::Magick(MagickBackend::new()),
            Processor::Rust(RustBackend::new()),
        ])
    }

    /// A registry in the given order.
    pub fn with_processors(processors: Vec<Processor>) -> Self {
        Self { processors }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.processors
            .iter()
            .position(|p| p.name().eq_ignore_ascii_case(name))
    }

    /// Whether a processor by that name is registered and usable.
    pub fn is_available(&self, name: &str) -> bool {
        self.find(name)
            .is_some_and(|i| self.processors[i].is_available())
    }

    /// Take the preferred processor if usable; otherwise, with `fallback`,
    /// the first usable one in registration order.
    ///
    /// Consumes the registry: the optimizer owns the processor it runs with.
    pub fn select(self, preferred: &str, fallback: bool) -> Result<Selection, SelectError> {
        let index = match self.find(preferred) {
            Some(i) if self.processors[i].is_available() => i,
            _ if !fallback => return Err(SelectError::PreferredUnavailable(preferred.into())),
            _ => self
                .processors
                .iter()
                .position(|p| p.is_available())
                .ok_or(SelectError::NoneAvailable)?,
        };
        let registry = self.describe(self.processors[index].name());
        let mut processors = self.processors;
        Ok(Selection {
            processor: processors.swap_remove(index),
            registry,
        })
    }

    /// Availability, activity and formats of every registered processor.
    pub fn describe(&self, active: &str) -> BTreeMap<String, ProcessorInfo> {
        self.processors
            .iter()
            .map(|p| {
                let available = p.is_available();
                let info = ProcessorInfo {
                    available,
                    active: available && p.name() == active,
                    supported_formats: if available {
                        p.supported_formats()
                    } else {
                        Vec::new()
                    },
                };
                (p.name().to_string(), info)
            })
            .collect()
    }
}

impl Default for ProcessorSelector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn without_magick() -> ProcessorSelector {
        ProcessorSelector::with_processors(vec![
            Processor::Magick(MagickBackend::with_program("/nonexistent/bin/magick")),
            Processor::Rust(RustBackend::new()),
        ])
    }

    #[test]
    fn availability_is_case_insensitive() {
        let selector = without_magick();
        assert!(selector.is_available("rust"));
        assert!(selector.is_available("RUST"));
        assert!(!selector.is_available("imagemagick"));
        assert!(!selector.is_available("gd"));
    }

    #[test]
    fn selects_preferred_when_available() {
        let selection = without_magick().select("rust", false).unwrap();
        assert_eq!(selection.processor.name(), "rust");
        assert!(selection.registry["rust"].active);
    }

    #[test]
    fn falls_back_in_registration_order() {
        let selection = without_magick().select("imagemagick", true).unwrap();
        assert_eq!(selection.processor.name(), "rust");
        assert!(!selection.registry["imagemagick"].active);
    }

    #[test]
    fn unknown_preferred_falls_back() {
        let selection = without_magick().select("gd", true).unwrap();
        assert_eq!(selection.processor.name(), "rust");
    }

    #[test]
    fn no_fallback_fails() {
        let result = without_magick().select("imagemagick", false);
        assert!(matches!(result, Err(SelectError::PreferredUnavailable(name)) if name == "imagemagick"));
    }

    #[test]
    fn nothing_available_fails() {
        let selector = ProcessorSelector::with_processors(vec![Processor::Magick(
            MagickBackend::with_program("/nonexistent/bin/magick"),
        )]);
        assert_eq!(
            selector.select("rust", true).err(),
            Some(SelectError::NoneAvailable)
        );
    }

    #[test]
    fn describe_reports_every_processor() {
        let info = without_magick().describe("rust");
        assert_eq!(info.len(), 2);

        let magick = &info["imagemagick"];
        assert!(!magick.available);
        assert!(!magick.active);
        assert!(magick.supported_formats.is_empty());

        let rust = &info["rust"];
        assert!(rust.available && rust.active);
        assert!(rust.supported_formats.contains(&Format::WebP));
    }
}
