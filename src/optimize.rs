//! The optimization pipeline.
//!
//! [`Optimizer::optimize`] turns one upload into a persisted
//! [`ImageMetadata`] record:
//!
//! ```text
//! validate → dedupe check → store original → derive dimensions
//!          → primary → variants → placeholder → metadata → persist → cache
//! ```
//!
//! Everything before `persist` may fail and abort the run. Files already
//! written stay behind, but they sit at deterministic paths and are simply
//! overwritten by the next attempt; without `meta.json` the hash does not
//! exist. The placeholder is the one step allowed to fail softly.
//!
//! ## Option resolution
//!
//! For every setting the first value found wins:
//!
//! 1. the explicit [`OptimizationOptions`] field
//! 2. the named preset's field
//! 3. the config value
//!
//! ## Duplicates
//!
//! The same bytes always map to the same hash and the same paths. A hash
//! that already has a record is answered from the cache or the store without
//! touching the processor. Concurrent uploads of identical bytes serialize on
//! a per-hash lock and re-check after acquiring it, so only the first one
//! does the work.

use crate::cache::{CacheStats, ResultCache, metadata_key};
use crate::config::OptimizerConfig;
use crate::imaging::{
    AssetInfo, BackendError, Format, ImageBackend, Processor, ProcessorInfo, ProcessorSelector,
    Quality, SelectError, VariantConfig, compression_ratio, create_placeholder, create_variants,
    plan_primary, produce_primary,
};
use crate::metadata::{
    ImageMetadata, OptimizedInfo, OriginalInfo, ProcessingInfo, Variant, WidthDescriptor,
    build_srcset,
};
use crate::naming;
use crate::store::{BlobKind, BlobStore, ContentHash, ContentStore, FsBlobStore, StoreError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Cursor;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum OptimizeError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Processor unavailable: {0}")]
    ProcessorUnavailable(String),
    #[error("Image processing failed: {0}")]
    Processing(#[from] BackendError),
    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),
}

impl OptimizeError {
    /// Whether running the same job again could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OptimizeError::Processing(_) | OptimizeError::Storage(_))
    }
}

impl From<SelectError> for OptimizeError {
    fn from(e: SelectError) -> Self {
        OptimizeError::ProcessorUnavailable(e.to_string())
    }
}

impl From<std::io::Error> for OptimizeError {
    fn from(e: std::io::Error) -> Self {
        OptimizeError::Storage(StoreError::Io(e))
    }
}

pub type Result<T> = std::result::Result<T, OptimizeError>;

/// An upload: raw bytes plus what the client said about them.
#[derive(Debug, Clone)]
pub struct SourceAsset {
    pub bytes: Vec<u8>,
    /// Client-supplied name. Untrusted; sanitized before use in any path.
    pub filename: String,
    /// Declared mime type.
    pub mime: String,
}

impl SourceAsset {
    pub fn new(bytes: Vec<u8>, filename: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            bytes,
            filename: filename.into(),
            mime: mime.into(),
        }
    }

    /// Read a local file. The mime type is sniffed from the bytes, falling
    /// back to the extension.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let bytes = std::fs::read(path)?;
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mime = Format::sniff(&bytes)
            .or_else(|| naming::extension(&filename).and_then(|e| Format::from_extension(&e)))
            .map(|f| f.mime().to_string())
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Ok(Self::new(bytes, filename, mime))
    }
}

/// Per-call overrides. Unset fields come from the preset, then the config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationOptions {
    pub quality: Option<u32>,
    pub format: Option<Format>,
    pub preset: Option<String>,
    pub sizes: Option<Vec<u32>>,
    pub max_width: Option<u32>,
    pub max_height: Option<u32>,
    pub is_lcp: Option<bool>,
    pub alt: Option<String>,
    /// Literal `sizes` attribute.
    pub sizes_attr: Option<String>,
    /// Name of a `lighthouse.sizes_presets` entry.
    pub sizes_preset: Option<String>,
    /// Force the blur placeholder on or off.
    pub blur: Option<bool>,
}

/// Options after preset and config fallback.
#[derive(Debug, Clone, PartialEq)]
struct ResolvedOptions {
    quality: Quality,
    format: Format,
    sizes: Vec<u32>,
    max: (u32, u32),
    is_lcp: bool,
    alt: String,
    sizes_attr: String,
    blur: bool,
}

/// Snapshot of the running configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizerStats {
    pub active_processor: String,
    pub supported_formats: Vec<Format>,
    pub default_quality: u32,
    pub sizes: Vec<u32>,
    pub output_format: Format,
    #[serde(skip)]
    pub cache: CacheStats,
}

/// One record selected by [`Optimizer::cleanup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupEntry {
    pub hash: ContentHash,
    pub modified: DateTime<Utc>,
    /// Bytes held across both subtrees.
    pub bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub entries: Vec<CleanupEntry>,
    /// Nothing was deleted.
    pub dry_run: bool,
}

impl CleanupReport {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}

/// One mutex per hash currently being processed.
#[derive(Default)]
struct HashLocks {
    inner: Mutex<HashMap<ContentHash, Arc<Mutex<()>>>>,
}

impl HashLocks {
    fn acquire(&self, hash: &ContentHash) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(hash.clone()).or_default().clone()
    }

    /// Drop the entry once nobody else holds it.
    fn release(&self, hash: &ContentHash) {
        let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if map.get(hash).is_some_and(|l| Arc::strong_count(l) == 1) {
            map.remove(hash);
        }
    }
}

/// Content-addressed image optimizer.
///
/// Owns its processor, store and cache. `Send + Sync`; share it by
/// reference or behind an `Arc`.
pub struct Optimizer<B: ImageBackend = Processor, S: BlobStore = FsBlobStore> {
    backend: B,
    store: ContentStore<S>,
    cache: ResultCache,
    config: OptimizerConfig,
    registry: BTreeMap<String, ProcessorInfo>,
    locks: HashLocks,
}

impl Optimizer {
    /// Select a processor and open the filesystem store.
    pub fn new(config: OptimizerConfig) -> Result<Self> {
        let selection = ProcessorSelector::new()
            .select(&config.processing.processor, config.processing.fallback)?;
        if selection.processor.name() != config.processing.processor.to_ascii_lowercase() {
            warn!(
                preferred = %config.processing.processor,
                using = selection.processor.name(),
                "preferred processor unavailable, falling back"
            );
        }
        let store = ContentStore::open(config.storage.clone());
        let mut optimizer = Self::with_parts(selection.processor, store, config);
        optimizer.registry = selection.registry;
        Ok(optimizer)
    }
}

impl<B: ImageBackend, S: BlobStore> Optimizer<B, S> {
    /// Assemble from explicit parts.
    pub fn with_parts(backend: B, store: ContentStore<S>, config: OptimizerConfig) -> Self {
        let registry = BTreeMap::from([(
            backend.name().to_string(),
            ProcessorInfo {
                available: backend.is_available(),
                active: true,
                supported_formats: backend.supported_formats(),
            },
        )]);
        Self {
            cache: ResultCache::new(&config.cache),
            backend,
            store,
            config,
            registry,
            locks: HashLocks::default(),
        }
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn store(&self) -> &ContentStore<S> {
        &self.store
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn processor_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Optimize an upload, or return the existing record for its bytes.
    pub fn optimize(
        &self,
        source: &SourceAsset,
        options: &OptimizationOptions,
    ) -> Result<ImageMetadata> {
        self.validate(source)?;

        let hash = self.store.hash(&source.bytes);
        if let Some(existing) = self.lookup(&hash)? {
            debug!(%hash, "duplicate upload, returning existing record");
            return Ok(existing);
        }

        self.with_hash_lock(&hash, || match self.lookup(&hash)? {
            Some(existing) => {
                debug!(%hash, "processed concurrently, returning winner's record");
                Ok(existing)
            }
            None => self.process(&hash, source, options),
        })
    }

    /// Run `f` holding the hash's lock, so processing and deletion of the
    /// same hash never interleave.
    fn with_hash_lock<T>(&self, hash: &ContentHash, f: impl FnOnce() -> T) -> T {
        let lock = self.locks.acquire(hash);
        let result = {
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f()
        };
        drop(lock);
        self.locks.release(hash);
        result
    }

    /// Record for a hash given as text. Malformed hashes are invalid input.
    pub fn get(&self, hash: &str) -> Result<Option<ImageMetadata>> {
        self.lookup(&parse_hash(hash)?)
    }

    /// Remove every file of a hash and its cache entry. Always `true`.
    pub fn delete(&self, hash: &str) -> Result<bool> {
        self.delete_hash(&parse_hash(hash)?)
    }

    fn delete_hash(&self, hash: &ContentHash) -> Result<bool> {
        self.with_hash_lock(hash, || -> Result<bool> {
            let deleted = self.store.delete(hash)?;
            self.cache.forget(&metadata_key(hash));
            debug!(%hash, "deleted");
            Ok(deleted)
        })
    }

    /// Availability of every processor known at construction.
    pub fn list_processors(&self) -> BTreeMap<String, ProcessorInfo> {
        self.registry.clone()
    }

    pub fn stats(&self) -> OptimizerStats {
        OptimizerStats {
            active_processor: self.backend.name().to_string(),
            supported_formats: self.backend.supported_formats(),
            default_quality: self.config.processing.default_quality,
            sizes: self.config.processing.sizes.clone(),
            output_format: self.config.formats.output,
            cache: self.cache.stats(),
        }
    }

    /// Delete records whose `meta.json` is older than `max_age`.
    ///
    /// With `dry_run` the report lists what would go and nothing is touched.
    pub fn cleanup(&self, max_age: chrono::Duration, dry_run: bool) -> Result<CleanupReport> {
        let cutoff = Utc::now() - max_age;
        let mut report = CleanupReport {
            entries: Vec::new(),
            dry_run,
        };
        for record in self.store.list()? {
            if record.modified > cutoff {
                continue;
            }
            let bytes = self.store.subtree_size(&record.hash)?;
            if !dry_run {
                self.delete_hash(&record.hash)?;
            }
            report.entries.push(CleanupEntry {
                hash: record.hash,
                modified: record.modified,
                bytes,
            });
        }
        info!(
            count = report.entries.len(),
            bytes = report.total_bytes(),
            dry_run,
            "cleanup finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Pipeline stages
    // =========================================================================

    /// Size, mime, extension and (optionally) decoded header checks.
    fn validate(&self, source: &SourceAsset) -> Result<()> {
        let rules = &self.config.validation;

        if source.bytes.is_empty() {
            return Err(OptimizeError::InvalidInput("file is empty".into()));
        }
        let limit = rules.max_file_size.saturating_mul(1024);
        if source.bytes.len() as u64 > limit {
            return Err(OptimizeError::InvalidInput(format!(
                "file is {} bytes, limit is {} KiB",
                source.bytes.len(),
                rules.max_file_size
            )));
        }
        if !rules
            .allowed_mimes
            .iter()
            .any(|m| m.eq_ignore_ascii_case(&source.mime))
        {
            return Err(OptimizeError::InvalidInput(format!(
                "mime type {:?} is not allowed",
                source.mime
            )));
        }
        let ext = naming::extension(&source.filename).unwrap_or_default();
        if !rules
            .allowed_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(&ext))
        {
            return Err(OptimizeError::InvalidInput(format!(
                "extension of {:?} is not allowed",
                source.filename
            )));
        }

        if rules.verify_image_type {
            let reader = image::ImageReader::new(Cursor::new(&source.bytes))
                .with_guessed_format()
                .map_err(|e| OptimizeError::InvalidInput(e.to_string()))?;
            let detected = reader
                .format()
                .and_then(Format::from_image_format)
                .ok_or_else(|| OptimizeError::InvalidInput("not a recognised image".into()))?;
            if !self.backend.supported_formats().contains(&detected) {
                return Err(OptimizeError::InvalidInput(format!(
                    "{detected} input is not readable by the {} processor",
                    self.backend.name()
                )));
            }
            let (width, height) = reader
                .into_dimensions()
                .map_err(|e| OptimizeError::InvalidInput(format!("unreadable image: {e}")))?;
            if width < rules.min_width || height < rules.min_height {
                return Err(OptimizeError::InvalidInput(format!(
                    "image is {width}x{height}, minimum is {}x{}",
                    rules.min_width, rules.min_height
                )));
            }
        }
        Ok(())
    }

    /// Cache first, then the store. A store hit re-warms the cache.
    ///
    /// An undecodable `meta.json` counts as a miss; reprocessing overwrites it.
    fn lookup(&self, hash: &ContentHash) -> Result<Option<ImageMetadata>> {
        let key = metadata_key(hash);
        if let Some(cached) = self.cache.get(&key) {
            match serde_json::from_str(&cached) {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(e) => debug!(%hash, error = %e, "undecodable cache entry, ignoring"),
            }
        }
        let metadata = match self.store.read_metadata(hash) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return Ok(None),
            Err(StoreError::Json(e)) => {
                warn!(%hash, error = %e, "undecodable meta.json, treating as absent");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        self.cache_write(hash, &metadata);
        Ok(Some(metadata))
    }

    fn cache_write(&self, hash: &ContentHash, metadata: &ImageMetadata) {
        match serde_json::to_string(metadata) {
            Ok(json) => self.cache.put(&metadata_key(hash), json, None),
            Err(e) => warn!(%hash, error = %e, "metadata not cached"),
        }
    }

    fn resolve(&self, options: &OptimizationOptions) -> ResolvedOptions {
        let config = &self.config;
        let preset = options.preset.as_deref().and_then(|name| {
            let found = config.presets.get(name);
            if found.is_none() {
                warn!(preset = name, "unknown preset, ignoring");
            }
            found
        });

        let quality = options
            .quality
            .or(preset.and_then(|p| p.quality))
            .unwrap_or(config.processing.default_quality);
        let sizes = options
            .sizes
            .clone()
            .or_else(|| preset.and_then(|p| p.sizes.clone()))
            .unwrap_or_else(|| config.processing.sizes.clone());
        let max_width = options
            .max_width
            .or(preset.and_then(|p| p.max_width))
            .unwrap_or(config.processing.max_width);
        let max_height = options
            .max_height
            .or(preset.and_then(|p| p.max_height))
            .unwrap_or(config.processing.max_height);

        let sizes_preset = options
            .sizes_preset
            .as_deref()
            .or(preset.and_then(|p| p.sizes_preset.as_deref()));
        let sizes_attr = match (&options.sizes_attr, sizes_preset) {
            (Some(attr), _) => attr.clone(),
            (None, Some(name)) => config
                .lighthouse
                .sizes_presets
                .get(name)
                .cloned()
                .unwrap_or_else(|| "100vw".to_string()),
            (None, None) => config.lighthouse.default_sizes.clone(),
        };

        ResolvedOptions {
            quality: Quality::new(quality),
            format: options
                .format
                .or(preset.and_then(|p| p.format))
                .unwrap_or(config.formats.output),
            sizes,
            max: (max_width.max(1), max_height.max(1)),
            is_lcp: options
                .is_lcp
                .or(preset.and_then(|p| p.is_lcp))
                .unwrap_or(false),
            alt: options.alt.clone().unwrap_or_default(),
            sizes_attr,
            blur: options
                .blur
                .unwrap_or(config.processing.blur_placeholder.enabled),
        }
    }

    fn process(
        &self,
        hash: &ContentHash,
        source: &SourceAsset,
        options: &OptimizationOptions,
    ) -> Result<ImageMetadata> {
        let resolved = self.resolve(options);
        if !self.backend.supported_formats().contains(&resolved.format) {
            return Err(OptimizeError::ProcessorUnavailable(format!(
                "the {} processor cannot write {}",
                self.backend.name(),
                resolved.format
            )));
        }
        let blobs = self.store.blobs();
        let settings = self.config.encode_settings().with_quality(resolved.quality);

        let original_key = self
            .store
            .put(BlobKind::Original, hash, &source.filename, &source.bytes)?;
        let original_path = blobs.path(&original_key);
        debug!(%hash, key = %original_key, "stored original");

        let original: AssetInfo = match self.backend.inspect(&original_path) {
            Ok(info) => info,
            Err(e @ (BackendError::ProcessingFailed(_) | BackendError::UnsupportedFormat(_))) => {
                if let Err(cleanup) = self.store.delete(hash) {
                    warn!(%hash, error = %cleanup, "could not remove rejected original");
                }
                return Err(OptimizeError::InvalidInput(format!("unreadable image: {e}")));
            }
            Err(e) => return Err(e.into()),
        };
        let (original_width, original_height) = original.dimensions(settings.auto_orient);
        let plan = plan_primary(&original, resolved.max, resolved.format, settings);
        debug!(
            %hash,
            width = original_width,
            height = original_height,
            resize_to = ?plan.resize_to,
            "derived dimensions"
        );

        let primary_key = self
            .store
            .optimized_key(hash, &source.filename, None, resolved.format);
        let primary_path = blobs.path(&primary_key);
        produce_primary(&self.backend, &original_path, &primary_path, &plan)?;
        debug!(%hash, key = %primary_key, "produced primary");

        let variant_key = |width: u32| {
            self.store.optimized_key(
                hash,
                &source.filename,
                Some(WidthDescriptor(width)),
                resolved.format,
            )
        };
        let variant_config = VariantConfig {
            breakpoints: resolved.sizes.clone(),
            qualities: self.config.quality_table(),
            default_quality: Quality::new(self.config.processing.default_quality),
            format: resolved.format,
            settings,
        };
        let set = create_variants(
            &self.backend,
            &primary_path,
            |width| blobs.path(&variant_key(width)),
            &variant_config,
        )?;
        debug!(%hash, count = set.variants.len(), "produced variants");

        let blur_placeholder = if resolved.blur {
            let blur = &self.config.processing.blur_placeholder;
            match create_placeholder(
                &self.backend,
                &primary_path,
                blur.width,
                Quality::new(blur.quality),
            ) {
                Ok(uri) => Some(uri),
                Err(e) => {
                    warn!(%hash, error = %e, "blur placeholder failed, continuing without");
                    None
                }
            }
        } else {
            None
        };

        let mut variants = BTreeMap::new();
        for generated in &set.variants {
            let key = variant_key(generated.width);
            variants.insert(
                WidthDescriptor(generated.width),
                Variant {
                    size: blobs.size(&key)?,
                    url: blobs.url(&key),
                    path: key,
                    width: generated.width,
                    height: generated.height,
                    quality: generated.quality.value(),
                },
            );
        }

        let now = Utc::now();
        let original_size = source.bytes.len() as u64;
        let (primary_width, primary_height) = set.primary.dimensions(settings.auto_orient);
        let optimized = OptimizedInfo {
            format: resolved.format,
            url: blobs.url(&primary_key),
            path: primary_key,
            size: set.primary.size,
            width: primary_width,
            height: primary_height,
            compression_ratio: compression_ratio(original_size, set.primary.size),
        };
        let metadata = ImageMetadata {
            hash: hash.clone(),
            original: OriginalInfo {
                filename: source.filename.clone(),
                path: original_key,
                size: original_size,
                format: original.format,
                width: original_width,
                height: original_height,
                uploaded_at: now,
            },
            srcset: build_srcset(&variants, &optimized.url),
            optimized,
            variants,
            sizes: resolved.sizes_attr,
            blur_placeholder,
            is_lcp: resolved.is_lcp,
            alt: resolved.alt,
            processing: ProcessingInfo {
                processor: self.backend.name().to_string(),
                timestamp: now,
            },
        };

        self.store.write_metadata(hash, &metadata)?;
        self.cache_write(hash, &metadata);
        info!(
            %hash,
            file = %source.filename,
            variants = metadata.variants.len(),
            ratio = metadata.optimized.compression_ratio,
            "optimized"
        );
        Ok(metadata)
    }
}

fn parse_hash(hash: &str) -> Result<ContentHash> {
    ContentHash::parse(hash)
        .ok_or_else(|| OptimizeError::InvalidInput(format!("malformed hash: {hash:?}")))
}
