//! # imgopt
//!
//! A content-addressed image optimizer. Uploads are keyed by the SHA-256 of
//! their bytes; each is stored once, converted to a web format, resized into
//! responsive width variants and described by a JSON record that front ends
//! use to build `srcset`/`sizes` markup.
//!
//! # Pipeline
//!
//! ```text
//! upload bytes
//!   → validate        (size, mime, extension, decodable, min dimensions)
//!   → hash            (SHA-256, lowercase hex)
//!   → dedupe          (cache, then meta.json on disk)
//!   → store original  (byte for byte)
//!   → primary         (bounded to max dimensions, converted to output format)
//!   → variants        (one per configured width narrower than the original)
//!   → placeholder     (tiny blurred data URI)
//!   → meta.json + cache
//! ```
//!
//! The same bytes always yield the same record. A second upload of an image
//! already stored returns the existing record without touching the backend.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`optimize`] | The pipeline: [`optimize::Optimizer`] and its lookup, delete, cleanup and stats operations |
//! | [`imaging`] | Backend trait, the ImageMagick and pure-Rust backends, processor selection |
//! | [`store`] | Content hashes, hash-sharded paths and the blob store behind them |
//! | [`cache`] | In-memory result cache with per-entry TTL |
//! | [`job`] | Deferred optimization on tokio with retries and a per-attempt timeout |
//! | [`metadata`] | The persisted record and `srcset` assembly |
//! | [`config`] | `imgopt.toml` loading, merging over stock defaults, validation |
//! | [`naming`] | Filename sanitizing and derived variant names |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Two Backends, One Trait
//!
//! ImageMagick is preferred when its `magick` binary is on `PATH`: it writes
//! AVIF and handles exotic inputs. The pure-Rust backend (`image` + `webp`)
//! needs nothing installed and covers JPEG, PNG and WebP. Both implement
//! [`imaging::ImageBackend`]; the optimizer is generic over it, so tests run
//! the full pipeline against a recording mock.
//!
//! ## The Record Is the Existence Marker
//!
//! `meta.json` is written last. A crash mid-pipeline leaves files but no
//! record, and the next upload of the same bytes simply redoes the work.
//! Every blob is written to a temp name and renamed into place.
//!
//! ## Cache as Accelerator Only
//!
//! The cache never holds anything the store does not. Misses fall through to
//! disk and re-warm the cache; disabling it changes latency, not results.

pub mod cache;
pub mod config;
pub mod imaging;
pub mod job;
pub mod metadata;
pub mod naming;
pub mod optimize;
pub mod output;
pub mod store;

#[cfg(test)]
pub(crate) mod test_helpers;
