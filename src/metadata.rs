//! The persisted metadata record.
//!
//! One [`ImageMetadata`] is written per content hash, as pretty JSON at
//! `<optimized>/<hashpath>/meta.json`. Its presence is what makes an image
//! "exist"; it is written once, after every derived file is in place, and
//! never edited afterwards.
//!
//! Field names are camelCase on disk:
//!
//! ```text
//! {
//!   "hash": "ab12…",
//!   "original":  { "filename", "path", "size", "format", "width", "height", "uploadedAt" },
//!   "optimized": { "format", "path", "url", "size", "width", "height", "compressionRatio" },
//!   "variants":  { "320w": { "path", "url", "size", "width", "height", "quality" }, … },
//!   "srcset", "sizes", "blurPlaceholder"?, "isLcp", "alt",
//!   "processing": { "processor", "timestamp" }
//! }
//! ```
//!
//! `variants` is keyed by [`WidthDescriptor`] and ordered by numeric width, so
//! the srcset built from it lists candidates narrowest first.

use crate::imaging::Format;
use crate::store::ContentHash;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A responsive width such as `640w`.
///
/// Ordered numerically (`320w` < `1024w`), unlike its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct WidthDescriptor(pub u32);

impl WidthDescriptor {
    pub fn width(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WidthDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}w", self.0)
    }
}

impl FromStr for WidthDescriptor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.strip_suffix('w')
            .and_then(|n| n.parse().ok())
            .map(WidthDescriptor)
            .ok_or_else(|| format!("invalid width descriptor: {s:?}"))
    }
}

impl From<WidthDescriptor> for String {
    fn from(w: WidthDescriptor) -> String {
        w.to_string()
    }
}

impl TryFrom<String> for WidthDescriptor {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OriginalInfo {
    /// Name as uploaded, before sanitation.
    pub filename: String,
    pub path: String,
    pub size: u64,
    pub format: Format,
    /// Source pixel dimensions, before any bounding resize.
    pub width: u32,
    pub height: u32,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedInfo {
    pub format: Format,
    pub path: String,
    pub url: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// Percent saved against the original, two decimals.
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variant {
    pub path: String,
    pub url: String,
    pub size: u64,
    pub width: u32,
    pub height: u32,
    pub quality: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingInfo {
    pub processor: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    pub hash: ContentHash,
    pub original: OriginalInfo,
    pub optimized: OptimizedInfo,
    pub variants: BTreeMap<WidthDescriptor, Variant>,
    pub srcset: String,
    pub sizes: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur_placeholder: Option<String>,
    pub is_lcp: bool,
    pub alt: String,
    pub processing: ProcessingInfo,
}

impl ImageMetadata {
    /// URL of the primary asset.
    pub fn src(&self) -> &str {
        &self.optimized.url
    }

    /// Variant by descriptor string, e.g. `"640w"`.
    pub fn variant(&self, descriptor: &str) -> Option<&Variant> {
        let key: WidthDescriptor = descriptor.parse().ok()?;
        self.variants.get(&key)
    }

    /// Descriptor → URL for every variant, narrowest first.
    pub fn variant_urls(&self) -> Vec<(WidthDescriptor, &str)> {
        self.variants
            .iter()
            .map(|(w, v)| (*w, v.url.as_str()))
            .collect()
    }

    /// URL of the named variant, or of the primary when no variant is asked
    /// for or the named one does not exist.
    pub fn url(&self, descriptor: Option<&str>) -> &str {
        descriptor
            .and_then(|d| self.variant(d))
            .map(|v| v.url.as_str())
            .unwrap_or_else(|| self.src())
    }
}

/// `"url 320w, url 640w, primary_url"`.
///
/// The primary URL closes the list only when there is at least one variant;
/// with none the srcset is empty.
pub fn build_srcset(variants: &BTreeMap<WidthDescriptor, Variant>, primary_url: &str) -> String {
    if variants.is_empty() {
        return String::new();
    }
    variants
        .iter()
        .map(|(w, v)| format!("{} {w}", v.url))
        .chain(std::iter::once(primary_url.to_string()))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::sample_metadata;

    fn variant(width: u32) -> Variant {
        Variant {
            path: format!("images/optimized/p-{width}w.webp"),
            url: format!("/storage/p-{width}w.webp"),
            size: 100,
            width,
            height: width / 2,
            quality: 85,
        }
    }

    // =========================================================================
    // WidthDescriptor
    // =========================================================================

    #[test]
    fn descriptor_display_and_parse() {
        assert_eq!(WidthDescriptor(640).to_string(), "640w");
        assert_eq!("1024w".parse::<WidthDescriptor>(), Ok(WidthDescriptor(1024)));
        assert!("1024".parse::<WidthDescriptor>().is_err());
        assert!("w".parse::<WidthDescriptor>().is_err());
    }

    #[test]
    fn descriptors_order_numerically() {
        let mut keys = vec![WidthDescriptor(1024), WidthDescriptor(320), WidthDescriptor(640)];
        keys.sort();
        assert_eq!(keys, vec![WidthDescriptor(320), WidthDescriptor(640), WidthDescriptor(1024)]);
    }

    #[test]
    fn variants_map_serializes_with_descriptor_keys_in_width_order() {
        let variants = BTreeMap::from([
            (WidthDescriptor(1024), variant(1024)),
            (WidthDescriptor(320), variant(320)),
        ]);
        let json = serde_json::to_string(&variants).unwrap();
        let i320 = json.find("\"320w\"").unwrap();
        let i1024 = json.find("\"1024w\"").unwrap();
        assert!(i320 < i1024);

        let back: BTreeMap<WidthDescriptor, Variant> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, variants);
    }

    // =========================================================================
    // srcset
    // =========================================================================

    #[test]
    fn srcset_lists_variants_then_primary() {
        let variants = BTreeMap::from([
            (WidthDescriptor(640), variant(640)),
            (WidthDescriptor(320), variant(320)),
        ]);
        assert_eq!(
            build_srcset(&variants, "/storage/p.webp"),
            "/storage/p-320w.webp 320w, /storage/p-640w.webp 640w, /storage/p.webp"
        );
    }

    #[test]
    fn srcset_empty_without_variants() {
        assert_eq!(build_srcset(&BTreeMap::new(), "/storage/p.webp"), "");
    }

    // =========================================================================
    // Record
    // =========================================================================

    #[test]
    fn record_uses_camel_case_and_omits_missing_placeholder() {
        let mut meta = sample_metadata();
        meta.blur_placeholder = None;
        let json = serde_json::to_value(&meta).unwrap();

        assert!(json.get("isLcp").is_some());
        assert!(json["original"].get("uploadedAt").is_some());
        assert!(json["optimized"].get("compressionRatio").is_some());
        assert!(json.get("blurPlaceholder").is_none());
        assert_eq!(json["optimized"]["format"], "webp");
    }

    #[test]
    fn record_round_trips() {
        let meta = sample_metadata();
        let json = serde_json::to_string_pretty(&meta).unwrap();
        let back: ImageMetadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn url_prefers_named_variant() {
        let meta = sample_metadata();
        assert_eq!(meta.url(None), meta.optimized.url);
        assert_eq!(meta.url(Some("320w")), meta.variants[&WidthDescriptor(320)].url);
        assert_eq!(meta.url(Some("9999w")), meta.optimized.url);
        assert_eq!(meta.variant_urls().len(), meta.variants.len());
    }
}
