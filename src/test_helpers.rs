//! Shared test utilities for the imgopt test suite.
//!
//! Synthetic images are generated in memory with the `image` encoders, so no
//! binary fixtures are checked in.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let config = test_config(tmp.path());
//! let upload = jpeg_bytes(200, 150);
//! ```

use chrono::{TimeZone, Utc};
use image::{ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use crate::config::OptimizerConfig;
use crate::imaging::Format;
use crate::metadata::{
    ImageMetadata, OptimizedInfo, OriginalInfo, ProcessingInfo, Variant, WidthDescriptor,
};
use crate::store::{BlobStore, ContentHash, FsBlobStore};

// =========================================================================
// Synthetic images
// =========================================================================

/// A gradient JPEG (RGB, no alpha) of the given dimensions.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x % 256) as u8, (y % 256) as u8, 128])
    });
    let mut out = Vec::new();
    image::codecs::jpeg::JpegEncoder::new_with_quality(&mut out, 90)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgb8)
        .unwrap();
    out
}

/// A gradient PNG with an alpha channel.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_fn(width, height, |x, y| {
        image::Rgba([(x % 256) as u8, 64, (y % 256) as u8, 200])
    });
    let mut out = Vec::new();
    image::codecs::png::PngEncoder::new(&mut out)
        .write_image(img.as_raw(), width, height, ExtendedColorType::Rgba8)
        .unwrap();
    out
}

/// Splice an EXIF APP1 segment carrying `orientation` in after the SOI marker.
///
/// Big-endian TIFF with a single IFD0 entry: tag 0x0112, SHORT, count 1.
pub fn with_exif_orientation(jpeg: &[u8], orientation: u16) -> Vec<u8> {
    let mut tiff = b"MM\x00\x2a\x00\x00\x00\x08".to_vec();
    tiff.extend_from_slice(&1u16.to_be_bytes());
    tiff.extend_from_slice(&[0x01, 0x12, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01]);
    tiff.extend_from_slice(&orientation.to_be_bytes());
    tiff.extend_from_slice(&[0, 0, 0, 0, 0, 0]);

    let mut payload = b"Exif\x00\x00".to_vec();
    payload.extend_from_slice(&tiff);
    let len = (payload.len() + 2) as u16;

    let mut out = jpeg[..2].to_vec();
    out.extend_from_slice(&[0xFF, 0xE1]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload);
    out.extend_from_slice(&jpeg[2..]);
    out
}

pub fn write_jpeg(path: &Path, width: u32, height: u32) {
    std::fs::write(path, jpeg_bytes(width, height)).unwrap();
}

pub fn write_png(path: &Path, width: u32, height: u32) {
    std::fs::write(path, png_bytes(width, height)).unwrap();
}

// =========================================================================
// Config and records
// =========================================================================

/// Stock config with storage rooted in `root`.
pub fn test_config(root: &Path) -> OptimizerConfig {
    let mut config = OptimizerConfig::default();
    config.storage.root = root.join("storage").to_string_lossy().into_owned();
    config
}

/// A complete record with one 320w variant and a placeholder.
pub fn sample_metadata() -> ImageMetadata {
    let hash = ContentHash::of(b"sample");
    let dir = format!("images/optimized/{}", crate::store::hash_path(&hash, 2));
    let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();

    let variants = BTreeMap::from([(
        WidthDescriptor(320),
        Variant {
            path: format!("{dir}/sunset-320w.webp"),
            url: format!("/storage/{dir}/sunset-320w.webp"),
            size: 9_870,
            width: 320,
            height: 213,
            quality: 80,
        },
    )]);
    let optimized = OptimizedInfo {
        format: Format::WebP,
        path: format!("{dir}/sunset.webp"),
        url: format!("/storage/{dir}/sunset.webp"),
        size: 48_200,
        width: 1200,
        height: 800,
        compression_ratio: 61.44,
    };

    ImageMetadata {
        original: OriginalInfo {
            filename: "sunset.jpg".into(),
            path: format!(
                "images/originals/{}/sunset.jpg",
                crate::store::hash_path(&hash, 2)
            ),
            size: 125_000,
            format: Format::Jpeg,
            width: 1200,
            height: 800,
            uploaded_at: at,
        },
        srcset: crate::metadata::build_srcset(&variants, &optimized.url),
        optimized,
        variants,
        sizes: "100vw".into(),
        blur_placeholder: Some("data:image/webp;base64,UklGRg==".into()),
        is_lcp: false,
        alt: "Sunset over the bay".into(),
        processing: ProcessingInfo {
            processor: "rust".into(),
            timestamp: at,
        },
        hash,
    }
}

// =========================================================================
// Blob store wrapper
// =========================================================================

/// Filesystem blobs that count writes and can refuse chosen deletes.
pub struct CountingBlobStore {
    pub inner: FsBlobStore,
    pub puts: AtomicUsize,
    /// Deletes of keys this returns `true` for fail with an IO error.
    pub fail_delete: fn(&str) -> bool,
}

impl CountingBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            inner: FsBlobStore::new(root, "/storage"),
            puts: AtomicUsize::new(0),
            fail_delete: |_| false,
        }
    }

    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }
}

impl BlobStore for CountingBlobStore {
    fn put(&self, key: &str, bytes: &[u8]) -> io::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        self.inner.put(key, bytes)
    }
    fn get(&self, key: &str) -> io::Result<Option<Vec<u8>>> {
        self.inner.get(key)
    }
    fn exists(&self, key: &str) -> bool {
        self.inner.exists(key)
    }
    fn delete(&self, key: &str) -> io::Result<()> {
        if (self.fail_delete)(key) {
            return Err(io::Error::other(format!("refusing to delete {key}")));
        }
        self.inner.delete(key)
    }
    fn size(&self, key: &str) -> io::Result<u64> {
        self.inner.size(key)
    }
    fn modified(&self, key: &str) -> io::Result<SystemTime> {
        self.inner.modified(key)
    }
    fn list(&self, prefix: &str) -> io::Result<Vec<String>> {
        self.inner.list(prefix)
    }
    fn path(&self, key: &str) -> PathBuf {
        self.inner.path(key)
    }
    fn url(&self, key: &str) -> String {
        self.inner.url(key)
    }
}
