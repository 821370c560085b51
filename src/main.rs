use clap::{Parser, Subcommand};
use imgopt::config::{self, OptimizerConfig};
use imgopt::imaging::{Format, ProcessorInfo};
use imgopt::job::{self, Job};
use imgopt::metadata::ImageMetadata;
use imgopt::optimize::{OptimizationOptions, Optimizer, OptimizerStats, SourceAsset};
use imgopt::output;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgopt")]
#[command(about = "Content-addressed image optimizer")]
#[command(long_about = "\
Content-addressed image optimizer

Every upload is keyed by the SHA-256 of its bytes. Optimizing the same file
twice returns the first result without reprocessing.

Storage layout (under storage.root):

  images/
  ├── originals/ab/cd/<hash>/photo.jpg       # Upload, byte for byte
  └── optimized/ab/cd/<hash>/
      ├── photo.webp                         # Primary, bounded to max size
      ├── photo-320w.webp                    # Responsive variants
      ├── photo-640w.webp
      └── meta.json                          # Record; its presence = exists

Set RUST_LOG=debug to trace each pipeline stage.

Run 'imgopt gen-config' to generate a documented imgopt.toml.")]
#[command(version)]
struct Cli {
    /// Working root: imgopt.toml is read from here and a relative
    /// storage.root is resolved against it
    #[arg(long, default_value = ".", global = true)]
    root: PathBuf,

    /// Explicit config file instead of <root>/imgopt.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Per-call overrides; anything omitted comes from the preset or config.
#[derive(clap::Args, Clone, Default)]
struct OptimizeArgs {
    /// Named preset from [presets]
    #[arg(long)]
    preset: Option<String>,
    /// Quality of the primary image (1-100)
    #[arg(long)]
    quality: Option<u32>,
    /// Output format: webp, avif, jpeg, png
    #[arg(long)]
    format: Option<Format>,
    /// Comma-separated variant widths, e.g. 320,640,1024
    #[arg(long, value_delimiter = ',')]
    sizes: Option<Vec<u32>>,
    #[arg(long)]
    max_width: Option<u32>,
    #[arg(long)]
    max_height: Option<u32>,
    /// Mark as the largest-contentful-paint image
    #[arg(long)]
    lcp: bool,
    /// Alt text stored with the record
    #[arg(long)]
    alt: Option<String>,
    /// Literal `sizes` attribute
    #[arg(long)]
    sizes_attr: Option<String>,
    /// Named entry from [lighthouse.sizes_presets]
    #[arg(long)]
    sizes_preset: Option<String>,
    /// Skip the blur placeholder
    #[arg(long)]
    no_blur: bool,
}

impl OptimizeArgs {
    fn to_options(&self) -> OptimizationOptions {
        OptimizationOptions {
            quality: self.quality,
            format: self.format,
            preset: self.preset.clone(),
            sizes: self.sizes.clone(),
            max_width: self.max_width,
            max_height: self.max_height,
            is_lcp: self.lcp.then_some(true),
            alt: self.alt.clone(),
            sizes_attr: self.sizes_attr.clone(),
            sizes_preset: self.sizes_preset.clone(),
            blur: self.no_blur.then_some(false),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Optimize one or more image files
    Optimize {
        #[arg(required = true)]
        files: Vec<PathBuf>,
        #[command(flatten)]
        args: OptimizeArgs,
        /// Run through the job runner (retries, timeout) instead of inline
        #[arg(long)]
        queue: bool,
        /// Print records as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the record for a hash
    Get {
        hash: String,
        /// Print only this variant's URL, e.g. 640w (primary URL if absent)
        #[arg(long)]
        variant: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Delete every file stored for a hash
    Delete { hash: String },
    /// Show processors and the running configuration
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Delete records older than a number of days
    Cleanup {
        #[arg(long, default_value_t = 30)]
        days: u32,
        /// List what would be deleted without deleting
        #[arg(long)]
        dry_run: bool,
    },
    /// Print a stock imgopt.toml with all options documented
    GenConfig,
}

#[derive(Serialize)]
struct InfoReport<'a> {
    processors: &'a BTreeMap<String, ProcessorInfo>,
    stats: &'a OptimizerStats,
}

/// Source path paired with its record or the error that stopped it.
type BatchResult = Vec<(PathBuf, Result<ImageMetadata, String>)>;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing();

    if let Command::GenConfig = cli.command {
        print!("{}", config::stock_config_toml());
        return Ok(());
    }

    let config = load_config(&cli)?;
    init_thread_pool(&config.processing);
    let optimizer = Optimizer::new(config)?;

    match cli.command {
        Command::Optimize {
            files,
            args,
            queue,
            json,
        } => {
            let options = args.to_options();
            let results: BatchResult = if queue {
                run_queued(optimizer, &files, &options)?
            } else {
                files
                    .par_iter()
                    .map(|path| {
                        let result = SourceAsset::from_path(path)
                            .map_err(|e| e.to_string())
                            .and_then(|s| optimizer.optimize(&s, &options).map_err(|e| e.to_string()));
                        (path.clone(), result)
                    })
                    .collect()
            };

            let mut failed = 0;
            for (path, result) in &results {
                let label = path.display().to_string();
                match result {
                    Ok(meta) if json => println!("{}", serde_json::to_string_pretty(meta)?),
                    Ok(meta) => output::print_metadata(&label, meta),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{}", output::format_failure(&label, e));
                    }
                }
            }
            if !json {
                println!();
                println!("{}", output::format_batch_summary(results.len() - failed, failed));
            }
            if failed > 0 {
                return Err(format!("{failed} of {} files failed", results.len()).into());
            }
        }
        Command::Get {
            hash,
            variant,
            json,
        } => {
            let meta = optimizer
                .get(&hash)?
                .ok_or_else(|| format!("no image stored for {hash}"))?;
            if let Some(descriptor) = variant {
                println!("{}", meta.url(Some(descriptor.as_str())));
            } else if json {
                println!("{}", serde_json::to_string_pretty(&meta)?);
            } else {
                output::print_metadata(&meta.original.filename, &meta);
            }
        }
        Command::Delete { hash } => {
            optimizer.delete(&hash)?;
            println!("Deleted {hash}");
        }
        Command::Info { json } => {
            let processors = optimizer.list_processors();
            let stats = optimizer.stats();
            if json {
                let report = InfoReport {
                    processors: &processors,
                    stats: &stats,
                };
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                output::print_info(&processors, &stats);
            }
        }
        Command::Cleanup { days, dry_run } => {
            let report = optimizer.cleanup(chrono::Duration::days(i64::from(days)), dry_run)?;
            output::print_cleanup(&report);
        }
        Command::GenConfig => unreachable!("handled before the optimizer is built"),
    }

    Ok(())
}

/// Log to stderr; `RUST_LOG` overrides the default `info` level.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Load the config and anchor a relative storage root at `--root`.
fn load_config(cli: &Cli) -> Result<OptimizerConfig, config::ConfigError> {
    let mut config = match &cli.config {
        Some(path) => config::load_config_file(path)?,
        None => config::load_config(&cli.root)?,
    };
    let storage_root = Path::new(&config.storage.root);
    if storage_root.is_relative() {
        config.storage.root = cli.root.join(storage_root).to_string_lossy().into_owned();
    }
    Ok(config)
}

/// Initialize the rayon thread pool based on processing config.
///
/// Caps at the number of available CPU cores: user can constrain down, not up.
fn init_thread_pool(processing: &config::ProcessingConfig) {
    let threads = config::effective_threads(processing);
    rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build_global()
        .ok();
}

/// Copy each file to a temp upload and run it through the job runner.
fn run_queued(
    optimizer: Optimizer,
    files: &[PathBuf],
    options: &OptimizationOptions,
) -> Result<BatchResult, Box<dyn std::error::Error>> {
    let spool = Path::new(&optimizer.config().storage.root).join(".uploads");
    std::fs::create_dir_all(&spool)?;
    let optimizer = Arc::new(optimizer);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_time()
        .build()?;

    runtime.block_on(async {
        let mut handles = Vec::with_capacity(files.len());
        for (i, path) in files.iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let temp_path = spool.join(format!("{}-{i}.upload", std::process::id()));
            if let Err(e) = std::fs::copy(path, &temp_path) {
                handles.push((path.clone(), Err(e.to_string())));
                continue;
            }
            let job = Job {
                temp_path,
                original_name: name,
                mime: None,
                options: options.clone(),
            };
            handles.push((path.clone(), Ok(job::dispatch(Arc::clone(&optimizer), job))));
        }

        let mut results = Vec::with_capacity(handles.len());
        for (path, handle) in handles {
            let result = match handle {
                Ok(handle) => match handle.await {
                    Ok(outcome) => outcome.map_err(|f| f.to_string()),
                    Err(join) => Err(join.to_string()),
                },
                Err(e) => Err(e),
            };
            results.push((path, result));
        }
        Ok(results)
    })
}
