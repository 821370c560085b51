//! ImageMagick backend: shells out to the ImageMagick 7 `magick` program.
//!
//! Preferred when installed because it reads and writes AVIF, honours
//! progressive output and strips metadata explicitly. Availability is checked
//! with `magick -version` once per instance and memoised.
//!
//! | Primitive | Invocation |
//! |---|---|
//! | inspect | `magick identify -format "%w %h %m %A %[orientation]" FILE[0]` |
//! | resize | `magick SRC [-auto-orient] -resize WxH! [-strip] [-interlace Plane] -quality Q FMT:OUT` |
//! | convert | same without `-resize` |
//! | blur placeholder | `magick SRC -auto-orient -thumbnail Wx -blur 0x2 -strip -quality Q WEBP:-` |
//!
//! The output coder is always named explicitly (`WEBP:out`), so the bytes
//! written never depend on the output path's extension.

use super::backend::{AssetInfo, BackendError, ImageBackend};
use super::format::Format;
use super::params::{ConvertParams, EncodeSettings, PlaceholderParams, ResizeParams};
use std::ffi::{OsStr, OsString};
use std::path::Path;
use std::process::Command;
use std::sync::OnceLock;
use tracing::debug;

pub struct MagickBackend {
    program: OsString,
    available: OnceLock<bool>,
    formats: OnceLock<Vec<Format>>,
}

impl MagickBackend {
    pub fn new() -> Self {
        Self::with_program("magick")
    }

    /// Use a specific executable instead of `magick` from `PATH`.
    pub fn with_program(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            available: OnceLock::new(),
            formats: OnceLock::new(),
        }
    }

    /// Run the program and return its stdout, failing on a non-zero exit.
    fn run(&self, args: &[OsString]) -> Result<Vec<u8>, BackendError> {
        debug!(program = ?self.program, ?args, "running imagemagick");
        let output = Command::new(&self.program).args(args).output()?;
        if !output.status.success() {
            return Err(BackendError::ProcessingFailed(format!(
                "magick exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(output.stdout)
    }

    fn detect(&self) -> bool {
        Command::new(&self.program)
            .arg("-version")
            .output()
            .map(|out| {
                out.status.success() && String::from_utf8_lossy(&out.stdout).contains("ImageMagick")
            })
            .unwrap_or(false)
    }

    fn check_writable(&self, format: Format) -> Result<(), BackendError> {
        if self.supported_formats().contains(&format) {
            Ok(())
        } else {
            Err(BackendError::UnsupportedFormat(format!(
                "this ImageMagick build cannot write {format}"
            )))
        }
    }
}

impl Default for MagickBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn arg(s: impl AsRef<OsStr>) -> OsString {
    s.as_ref().to_os_string()
}

/// `WEBP:/path/out.webp`
fn coder_target(format: Format, path: &Path) -> OsString {
    let mut target = OsString::from(format!("{}:", format.magick_coder()));
    target.push(path.as_os_str());
    target
}

fn push_encode_args(args: &mut Vec<OsString>, settings: &EncodeSettings) {
    if settings.strip_metadata {
        args.push(arg("-strip"));
    }
    if settings.progressive {
        args.extend([arg("-interlace"), arg("Plane")]);
    }
    args.extend([arg("-quality"), arg(settings.quality.value().to_string())]);
}

fn push_output_args(args: &mut Vec<OsString>, format: Format, output: &Path) {
    if format == Format::Avif {
        args.extend([arg("-define"), arg("heic:speed=6")]);
    }
    args.push(coder_target(format, output));
}

/// Writable formats out of `magick -list format`.
///
/// Rows look like `     WEBP* WEBP      rw+   WebP Image Format`; the mode
/// column's second character is `w` when the coder can write.
pub(crate) fn parse_format_list(listing: &str) -> Vec<Format> {
    let mut formats: Vec<Format> = listing
        .lines()
        .filter_map(|line| {
            let mut cols = line.split_whitespace();
            let name = cols.next()?.trim_end_matches('*');
            let _module = cols.next()?;
            let mode = cols.next()?;
            if mode.as_bytes().get(1) != Some(&b'w') {
                return None;
            }
            match name {
                "JPEG" => Some(Format::Jpeg),
                "PNG" => Some(Format::Png),
                "WEBP" => Some(Format::WebP),
                "AVIF" => Some(Format::Avif),
                _ => None,
            }
        })
        .collect();
    formats.sort();
    formats.dedup();
    formats
}

/// Parse `"%w %h %m %A %[orientation]"` identify output into an
/// [`AssetInfo`] with a zero size.
pub(crate) fn parse_identify(line: &str) -> Result<AssetInfo, BackendError> {
    let malformed = || BackendError::ProcessingFailed(format!("unexpected identify output: {line:?}"));
    let mut cols = line.split_whitespace();
    let width = cols.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    let height = cols.next().and_then(|s| s.parse().ok()).ok_or_else(malformed)?;
    let coder = cols.next().ok_or_else(malformed)?;
    let format = match coder {
        "JPEG" => Format::Jpeg,
        "PNG" => Format::Png,
        "WEBP" => Format::WebP,
        "AVIF" | "HEIC" => Format::Avif,
        other => return Err(BackendError::UnsupportedFormat(other.to_string())),
    };
    let has_alpha = matches!(
        cols.next().map(str::to_ascii_lowercase).as_deref(),
        Some("true" | "blend")
    );
    // EXIF 5-8; "Undefined" and the upright/flipped names are not turned
    let quarter_turn = matches!(
        cols.next(),
        Some("LeftTop" | "RightTop" | "RightBottom" | "LeftBottom")
    );
    Ok(AssetInfo {
        width,
        height,
        format,
        size: 0,
        has_alpha,
        quarter_turn,
    })
}

impl ImageBackend for MagickBackend {
    fn name(&self) -> &'static str {
        "imagemagick"
    }

    fn is_available(&self) -> bool {
        *self.available.get_or_init(|| self.detect())
    }

    fn supported_formats(&self) -> Vec<Format> {
        if !self.is_available() {
            return Vec::new();
        }
        self.formats
            .get_or_init(|| {
                self.run(&[arg("-list"), arg("format")])
                    .map(|out| parse_format_list(&String::from_utf8_lossy(&out)))
                    .unwrap_or_default()
            })
            .clone()
    }

    fn inspect(&self, path: &Path) -> Result<AssetInfo, BackendError> {
        let mut first_frame = path.as_os_str().to_os_string();
        first_frame.push("[0]");
        let out = self.run(&[
            arg("identify"),
            arg("-format"),
            arg("%w %h %m %A %[orientation]"),
            first_frame,
        ])?;
        let info = parse_identify(&String::from_utf8_lossy(&out))?;
        Ok(AssetInfo {
            size: std::fs::metadata(path)?.len(),
            ..info
        })
    }

    fn resize(&self, params: &ResizeParams) -> Result<(), BackendError> {
        self.check_writable(params.format)?;
        let mut args = vec![arg(&params.source)];
        if params.settings.auto_orient {
            args.push(arg("-auto-orient"));
        }
        args.extend([
            arg("-resize"),
            arg(format!("{}x{}!", params.width, params.height)),
        ]);
        push_encode_args(&mut args, &params.settings);
        push_output_args(&mut args, params.format, &params.output);
        self.run(&args).map(|_| ())
    }

    fn convert(&self, params: &ConvertParams) -> Result<(), BackendError> {
        self.check_writable(params.format)?;
        let mut args = vec![arg(&params.source)];
        if params.settings.auto_orient {
            args.push(arg("-auto-orient"));
        }
        push_encode_args(&mut args, &params.settings);
        push_output_args(&mut args, params.format, &params.output);
        self.run(&args).map(|_| ())
    }

    fn blur_placeholder(&self, params: &PlaceholderParams) -> Result<Vec<u8>, BackendError> {
        let bytes = self.run(&[
            arg(&params.source),
            arg("-auto-orient"),
            arg("-thumbnail"),
            arg(format!("{}x", params.width.max(1))),
            arg("-blur"),
            arg("0x2"),
            arg("-strip"),
            arg("-quality"),
            arg(params.quality.value().to_string()),
            arg("WEBP:-"),
        ])?;
        if bytes.is_empty() {
            return Err(BackendError::ProcessingFailed(
                "magick produced an empty placeholder".into(),
            ));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imaging::Quality;

    const LIST_FORMAT: &str = "\
   Format  Module    Mode  Description
-------------------------------------------------------------------------------
     AVIF  HEIC      rw+   AV1 Image File Format (1.17.6)
      GIF* GIF       rw+   CompuServe graphics interchange format
     JPEG* JPEG      rw-   Joint Photographic Experts Group JFIF format (libjpeg-turbo 2.1.5)
      PNG* PNG       rw-   Portable Network Graphics (libpng 1.6.43)
     WEBP* WEBP      r--   WebP Image Format (libwebp 1.3.2 [020F])
";

    #[test]
    fn parses_writable_formats() {
        assert_eq!(
            parse_format_list(LIST_FORMAT),
            vec![Format::Jpeg, Format::Png, Format::Avif]
        );
    }

    #[test]
    fn parses_empty_listing() {
        assert!(parse_format_list("").is_empty());
    }

    #[test]
    fn parses_identify_line() {
        let info = parse_identify("2000 1500 JPEG False TopLeft").unwrap();
        assert_eq!((info.width, info.height), (2000, 1500));
        assert_eq!(info.format, Format::Jpeg);
        assert!(!info.has_alpha);
        assert!(!info.quarter_turn);

        let info = parse_identify("64 64 PNG True Undefined").unwrap();
        assert_eq!(info.format, Format::Png);
        assert!(info.has_alpha);
    }

    #[test]
    fn identify_orientation_quarter_turns() {
        for name in ["LeftTop", "RightTop", "RightBottom", "LeftBottom"] {
            let info = parse_identify(&format!("4000 3000 JPEG False {name}")).unwrap();
            assert!(info.quarter_turn, "{name}");
            assert_eq!(info.dimensions(true), (3000, 4000));
        }
        assert!(!parse_identify("4000 3000 JPEG False BottomRight").unwrap().quarter_turn);
        assert!(!parse_identify("4000 3000 JPEG False").unwrap().quarter_turn);
    }

    #[test]
    fn identify_rejects_unknown_coder() {
        assert!(matches!(
            parse_identify("10 10 GIF False"),
            Err(BackendError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            parse_identify("garbage"),
            Err(BackendError::ProcessingFailed(_))
        ));
    }

    #[test]
    fn coder_target_prefixes_path() {
        let target = coder_target(Format::WebP, Path::new("/out/a.webp"));
        assert_eq!(target, OsString::from("WEBP:/out/a.webp"));
    }

    #[test]
    fn encode_args_follow_settings() {
        let mut args = Vec::new();
        push_encode_args(
            &mut args,
            &EncodeSettings {
                quality: Quality::new(72),
                strip_metadata: true,
                auto_orient: true,
                progressive: false,
            },
        );
        assert_eq!(args, vec![arg("-strip"), arg("-quality"), arg("72")]);
    }

    #[test]
    fn missing_program_is_unavailable() {
        let backend = MagickBackend::with_program("/nonexistent/bin/magick");
        assert!(!backend.is_available());
        assert!(backend.supported_formats().is_empty());
        assert!(matches!(
            backend.inspect(Path::new("/nonexistent/a.jpg")),
            Err(BackendError::Io(_))
        ));
    }
}
