//! Filename handling for stored assets.
//!
//! Uploaded names are untrusted. Everything that ends up in a storage key
//! goes through [`sanitize_filename`] first:
//!
//! - `"My Photo (1).JPG"` → `"MyPhoto1.JPG"`
//! - `"../../etc/passwd"` → `"etcpasswd"`
//! - `"café..jpg"` → `"caf.jpg"`
//! - `"???"` → `"image.jpg"`
//!
//! Derived files keep the sanitized stem and swap the extension:
//! `photo.jpg` → `photo.webp`, `photo-640w.webp`.

use crate::imaging::Format;
use crate::metadata::WidthDescriptor;

/// Name used when nothing survives sanitation.
pub const FALLBACK_FILENAME: &str = "image.jpg";

/// Keep `[A-Za-z0-9._-]`, collapse runs of dots, trim `.`/`-`/`_` from both
/// ends. Falls back to [`FALLBACK_FILENAME`] when nothing is left.
pub fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        if !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')) {
            continue;
        }
        if c == '.' && out.ends_with('.') {
            continue;
        }
        out.push(c);
    }

    let trimmed = out.trim_matches(|c| matches!(c, '.' | '-' | '_'));
    if trimmed.is_empty() {
        FALLBACK_FILENAME.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Stem of a sanitized name: everything before the last dot.
///
/// - `"photo.jpg"` → `"photo"`
/// - `"archive.tar.gz"` → `"archive.tar"`
/// - `"README"` → `"README"`
pub fn file_stem(name: &str) -> &str {
    match name.rfind('.') {
        Some(0) | None => name,
        Some(pos) => &name[..pos],
    }
}

/// Lowercased extension of a name, if any.
pub fn extension(name: &str) -> Option<String> {
    match name.rfind('.') {
        Some(pos) if pos + 1 < name.len() => Some(name[pos + 1..].to_ascii_lowercase()),
        _ => None,
    }
}

/// File name of a derived asset: `<stem>[-<640w>].<ext>`.
pub fn derived_filename(
    original_name: &str,
    variant: Option<WidthDescriptor>,
    format: Format,
) -> String {
    let sanitized = sanitize_filename(original_name);
    let stem = file_stem(&sanitized);
    match variant {
        Some(w) => format!("{stem}-{w}.{}", format.extension()),
        None => format!("{stem}.{}", format.extension()),
    }
}
