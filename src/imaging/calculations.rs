//! Pure calculation functions for image dimensions.
//!
//! All functions here are pure and testable without any I/O or images.
//! Scaling uses integer arithmetic so results are exact floors rather than
//! whatever a float product happens to round to.

/// Scale `source` down to fit inside `max`, preserving aspect ratio.
///
/// Returns `None` when the source already fits (no resize needed). Otherwise
/// both sides are scaled by `r = min(max_w / w, max_h / h)` and floored.
///
/// # Examples
/// ```
/// # use imgopt::imaging::fit_within;
/// assert_eq!(fit_within((4000, 3000), (2560, 2560)), Some((2560, 1920)));
/// assert_eq!(fit_within((800, 600), (2560, 2560)), None);
/// ```
pub fn fit_within(source: (u32, u32), max: (u32, u32)) -> Option<(u32, u32)> {
    let (w, h) = (source.0 as u64, source.1 as u64);
    let (max_w, max_h) = (max.0 as u64, max.1 as u64);

    if w == 0 || h == 0 || (w <= max_w && h <= max_h) {
        return None;
    }

    // Compare max_w / w against max_h / h without dividing.
    let (new_w, new_h) = if max_w * h <= max_h * w {
        (max_w, h * max_w / w)
    } else {
        (w * max_h / h, max_h)
    };

    Some((new_w.max(1) as u32, new_h.max(1) as u32))
}

/// Height of a variant `width` pixels wide cut from a `primary` image.
///
/// `floor(primary_h * width / primary_w)`, never less than 1.
pub fn variant_height(primary: (u32, u32), width: u32) -> u32 {
    let (pw, ph) = primary;
    if pw == 0 {
        return 1;
    }
    ((ph as u64 * width as u64) / pw as u64).max(1) as u32
}

/// Breakpoints strictly narrower than the primary, ascending, deduplicated.
pub fn plan_variant_widths(primary_width: u32, breakpoints: &[u32]) -> Vec<u32> {
    let mut widths: Vec<u32> = breakpoints
        .iter()
        .copied()
        .filter(|&w| w > 0 && w < primary_width)
        .collect();
    widths.sort_unstable();
    widths.dedup();
    widths
}

/// Percentage saved relative to the original, rounded to two decimals.
///
/// Negative when the output grew. Zero for an empty original.
pub fn compression_ratio(original_size: u64, optimized_size: u64) -> f64 {
    if original_size == 0 {
        return 0.0;
    }
    let ratio = (1.0 - optimized_size as f64 / original_size as f64) * 100.0;
    (ratio * 100.0).round() / 100.0
}
