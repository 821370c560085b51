//! Pure Rust image processing backend.
//!
//! Everything is statically linked into the binary, so this backend is always
//! available and is the selector's last resort.
//!
//! ## Crate mapping
//!
//! | Operation | Crate / function |
//! |---|---|
//! | Decode (JPEG, PNG, WebP) | `image` crate (pure Rust decoders) |
//! | EXIF orientation | `ImageDecoder::orientation` + `DynamicImage::apply_orientation` |
//! | Resize | `DynamicImage::resize_exact` with `Lanczos3` |
//! | Encode → JPEG / PNG | `image::codecs::{jpeg, png}` |
//! | Encode → WebP (lossy) | `webp` crate (libwebp) |
//! | Blur placeholder | `thumbnail_exact` + `blur` + lossy WebP |
//!
//! The `image` encoders never copy EXIF, ICC or XMP into their output, so
//! every re-encode is already stripped; `strip_metadata` needs no extra work
//! here. They also have no progressive/interlaced mode, so `progressive` is
//! accepted and ignored. AVIF is neither read nor written: the pure Rust
//! stack has no AV1 decoder, and variants are always cut from the primary.

use super::backend::{AssetInfo, BackendError, ImageBackend};
use super::calculations::variant_height;
use super::format::Format;
use super::params::{ConvertParams, EncodeSettings, PlaceholderParams, Quality, ResizeParams};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::imageops::FilterType;
use image::metadata::Orientation;
use image::{DynamicImage, ImageDecoder, ImageReader};
use std::path::Path;

/// Formats this backend decodes and encodes.
const SUPPORTED: [Format; 3] = [Format::Jpeg, Format::Png, Format::WebP];

/// Gaussian sigma applied to placeholder thumbnails.
const PLACEHOLDER_SIGMA: f32 = 2.0;

/// Pure Rust backend using the `image` crate ecosystem.
///
/// See the [module docs](self) for the crate-to-operation mapping.
pub struct RustBackend;

impl RustBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RustBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn decode_error(path: &Path) -> impl FnOnce(image::ImageError) -> BackendError + '_ {
    move |e| BackendError::ProcessingFailed(format!("Failed to decode {}: {}", path.display(), e))
}

fn open_reader(
    path: &Path,
) -> Result<(ImageReader<std::io::BufReader<std::fs::File>>, Format), BackendError> {
    let reader = ImageReader::open(path)?.with_guessed_format()?;
    let format = reader
        .format()
        .and_then(Format::from_image_format)
        .ok_or_else(|| {
            BackendError::UnsupportedFormat(format!("{}: unrecognised image", path.display()))
        })?;
    if !SUPPORTED.contains(&format) {
        return Err(BackendError::UnsupportedFormat(format!(
            "{}: {format} input needs the imagemagick processor",
            path.display()
        )));
    }
    Ok((reader, format))
}

/// Load and decode an image, rotating it upright when asked to.
fn load_image(path: &Path, auto_orient: bool) -> Result<DynamicImage, BackendError> {
    let (reader, _) = open_reader(path)?;
    let mut decoder = reader.into_decoder().map_err(decode_error(path))?;
    let orientation = decoder.orientation().map_err(decode_error(path))?;
    let mut img = DynamicImage::from_decoder(decoder).map_err(decode_error(path))?;
    if auto_orient {
        img.apply_orientation(orientation);
    }
    Ok(img)
}

/// Collapse to 8-bit RGB or RGBA, the only layouts every encoder here accepts.
fn to_8bit(img: &DynamicImage) -> DynamicImage {
    if img.color().has_alpha() {
        DynamicImage::ImageRgba8(img.to_rgba8())
    } else {
        DynamicImage::ImageRgb8(img.to_rgb8())
    }
}

fn encode_webp(img: &DynamicImage, quality: Quality) -> Result<Vec<u8>, BackendError> {
    let img = to_8bit(img);
    let encoder = webp::Encoder::from_image(&img)
        .map_err(|e| BackendError::ProcessingFailed(format!("WebP encode failed: {e}")))?;
    Ok(encoder.encode(quality.value() as f32).to_vec())
}

/// Encode `img` as `format` into memory.
fn encode(
    img: &DynamicImage,
    format: Format,
    settings: &EncodeSettings,
) -> Result<Vec<u8>, BackendError> {
    let mut buf = Vec::new();
    match format {
        Format::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, settings.quality.value() as u8);
            DynamicImage::ImageRgb8(img.to_rgb8())
                .write_with_encoder(encoder)
                .map_err(|e| BackendError::ProcessingFailed(format!("JPEG encode failed: {e}")))?;
        }
        Format::Png => {
            to_8bit(img)
                .write_with_encoder(PngEncoder::new(&mut buf))
                .map_err(|e| BackendError::ProcessingFailed(format!("PNG encode failed: {e}")))?;
        }
        Format::WebP => buf = encode_webp(img, settings.quality)?,
        Format::Avif => {
            return Err(BackendError::UnsupportedFormat(
                "avif output needs the imagemagick processor".into(),
            ));
        }
    }
    Ok(buf)
}

/// Encode then write. Encoding happens fully in memory first, so converting a
/// file onto itself never truncates the source before it has been read.
fn save_image(
    img: &DynamicImage,
    path: &Path,
    format: Format,
    settings: &EncodeSettings,
) -> Result<(), BackendError> {
    let bytes = encode(img, format, settings)?;
    std::fs::write(path, bytes)?;
    Ok(())
}

impl ImageBackend for RustBackend {
    fn name(&self) -> &'static str {
        "rust"
    }

    fn is_available(&self) -> bool {
        true
    }

    fn supported_formats(&self) -> Vec<Format> {
        SUPPORTED.to_vec()
    }

    fn inspect(&self, path: &Path) -> Result<AssetInfo, BackendError> {
        let (reader, format) = open_reader(path)?;
        let mut decoder = reader.into_decoder().map_err(decode_error(path))?;
        let (width, height) = decoder.dimensions();
        let has_alpha = decoder.color_type().has_alpha();
        let orientation = decoder.orientation().map_err(decode_error(path))?;
        let size = std::fs::metadata(path)?.len();
        Ok(AssetInfo {
            width,
            height,
            format,
            size,
            has_alpha,
            quarter_turn: matches!(
                orientation,
                Orientation::Rotate90
                    | Orientation::Rotate270
                    | Orientation::Rotate90FlipH
                    | Orientation::Rotate270FlipH
            ),
        })
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        let img = load_image(&params.source, params.settings.auto_orient)?;
        let resized = img.resize_exact(params.width, params.height, FilterType::Lanczos3);
        save_image(&resized, &params.output, params.format, &params.settings)
    }

    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError> {
        let img = load_image(&params.source, params.settings.auto_orient)?;
        save_image(&img, &params.output, params.format, &params.settings)
    }

    fn blur_placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError> {
        let img = load_image(&params.source, true)?;
        let width = params.width.max(1);
        let height = variant_height((img.width(), img.height()), width);
        let tiny = img.thumbnail_exact(width, height).blur(PLACEHOLDER_SIGMA);
        encode_webp(&tiny, params.quality)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{jpeg_bytes, with_exif_orientation, write_jpeg, write_png};

    #[test]
    fn reports_name_and_formats() {
        let backend = RustBackend::new();
        assert_eq!(backend.name(), "rust");
        assert!(backend.is_available());
        assert_eq!(
            backend.supported_formats(),
            vec![Format::Jpeg, Format::Png, Format::WebP]
        );
    }

    #[test]
    fn inspect_synthetic_jpeg() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("test.jpg");
        write_jpeg(&path, 200, 150);

        let info = RustBackend::new().inspect(&path).unwrap();
        assert_eq!((info.width, info.height), (200, 150));
        assert_eq!(info.format, Format::Jpeg);
        assert!(!info.has_alpha);
        assert_eq!(info.size, std::fs::metadata(&path).unwrap().len());
    }

    #[test]
    fn inspect_flags_quarter_turn_orientation() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("portrait.jpg");
        std::fs::write(&path, with_exif_orientation(&jpeg_bytes(400, 200), 6)).unwrap();

        let info = RustBackend::new().inspect(&path).unwrap();
        assert_eq!((info.width, info.height), (400, 200));
        assert!(info.quarter_turn);
        assert_eq!(info.dimensions(true), (200, 400));
        assert_eq!(info.dimensions(false), (400, 200));
    }

    #[test]
    fn upside_down_is_not_a_quarter_turn() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("flipped.jpg");
        std::fs::write(&path, with_exif_orientation(&jpeg_bytes(400, 200), 3)).unwrap();

        assert!(!RustBackend::new().inspect(&path).unwrap().quarter_turn);
    }

    #[test]
    fn resize_to_upright_dimensions_keeps_portrait() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("portrait.jpg");
        std::fs::write(&source, with_exif_orientation(&jpeg_bytes(400, 200), 6)).unwrap();
        let backend = RustBackend::new();
        let (width, height) = backend.inspect(&source).unwrap().dimensions(true);

        let output = tmp.path().join("small.webp");
        backend
            .resize(&ResizeParams {
                source,
                output: output.clone(),
                width: width / 2,
                height: height / 2,
                format: Format::WebP,
                settings: EncodeSettings::default(),
            })
            .unwrap();

        let img = image::open(&output).unwrap();
        assert_eq!((img.width(), img.height()), (100, 200));
    }

    #[test]
    fn inspect_ignores_misleading_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("actually-png.jpg");
        write_png(&path, 40, 30);

        let info = RustBackend::new().inspect(&path).unwrap();
        assert_eq!(info.format, Format::Png);
        assert!(info.has_alpha);
    }

    #[test]
    fn inspect_nonexistent_file_errors() {
        let result = RustBackend::new().inspect(Path::new("/nonexistent/image.jpg"));
        assert!(matches!(result, Err(BackendError::Io(_))));
    }

    #[test]
    fn inspect_garbage_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("junk.jpg");
        std::fs::write(&path, b"definitely not pixels").unwrap();

        assert!(RustBackend::new().inspect(&path).is_err());
    }

    #[test]
    fn resize_jpeg_to_webp_exact_dimensions() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.jpg");
        write_jpeg(&source, 400, 300);

        let output = tmp.path().join("resized.webp");
        let backend = RustBackend::new();
        backend
            .resize(&ResizeParams {
                source,
                output: output.clone(),
                width: 200,
                height: 150,
                format: Format::WebP,
                settings: EncodeSettings::default(),
            })
            .unwrap();

        let info = backend.inspect(&output).unwrap();
        assert_eq!((info.width, info.height), (200, 150));
        assert_eq!(info.format, Format::WebP);
    }

    #[test]
    fn resize_keeps_source_encoding_regardless_of_extension() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.jpg");
        write_jpeg(&source, 300, 300);

        let output = tmp.path().join("primary.webp");
        let backend = RustBackend::new();
        backend
            .resize(&ResizeParams {
                source,
                output: output.clone(),
                width: 100,
                height: 100,
                format: Format::Jpeg,
                settings: EncodeSettings::default(),
            })
            .unwrap();

        assert_eq!(backend.inspect(&output).unwrap().format, Format::Jpeg);
    }

    #[test]
    fn convert_in_place() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("photo.webp");
        write_png(&path, 64, 48);

        let backend = RustBackend::new();
        backend
            .convert(&ConvertParams {
                source: path.clone(),
                output: path.clone(),
                format: Format::WebP,
                settings: EncodeSettings::default(),
            })
            .unwrap();

        let info = backend.inspect(&path).unwrap();
        assert_eq!(info.format, Format::WebP);
        assert_eq!((info.width, info.height), (64, 48));
    }

    #[test]
    fn avif_output_is_unsupported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.png");
        write_png(&source, 32, 32);

        let result = RustBackend::new().convert(&ConvertParams {
            source,
            output: tmp.path().join("out.avif"),
            format: Format::Avif,
            settings: EncodeSettings::default(),
        });
        assert!(matches!(result, Err(BackendError::UnsupportedFormat(_))));
    }

    #[test]
    fn blur_placeholder_is_tiny_webp() {
        let tmp = tempfile::TempDir::new().unwrap();
        let source = tmp.path().join("source.jpg");
        write_jpeg(&source, 400, 300);

        let bytes = RustBackend::new()
            .blur_placeholder(&PlaceholderParams {
                source,
                width: 20,
                quality: Quality::new(30),
            })
            .unwrap();

        assert_eq!(&bytes[0..4], b"RIFF");
        assert_eq!(&bytes[8..12], b"WEBP");
        let decoded = image::load_from_memory(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (20, 15));
    }
}
