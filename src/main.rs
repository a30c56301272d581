use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use simfind::core::config::DEFAULT_HASH_SIZE;
use simfind::{
    FinderConfig, FinderError, ImageFinder, LoadOutcome, SearchResult, SyncError, SyncPhase,
    SyncProgress, SyncReport,
};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "simfind", version, about = "Find visually similar images in your library")]
struct Cli {
    /// Cache file (default: `~/.image_finder_cache.json`)
    #[arg(long, global = true, value_name = "FILE")]
    cache: Option<PathBuf>,

    /// Per-channel hash grid size; fingerprints have 3 * N * N bits
    #[arg(long, global = true, value_name = "N", default_value_t = DEFAULT_HASH_SIZE)]
    hash_size: u32,

    /// Worker threads used for hashing (default: number of CPUs)
    #[arg(long, global = true, value_name = "N")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the cache in line with the files under the search paths
    Sync {
        /// Directories to sync (default: the saved search paths)
        #[arg(short, long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,
    },

    /// List cached images similar to a reference image
    Query {
        /// Reference image
        #[arg(short, long, value_name = "FILE")]
        image: PathBuf,
        /// Minimum similarity in percent
        #[arg(short, long, default_value_t = 90.0)]
        threshold: f64,
        /// Maximum number of results to show
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show cache size and last sync time
    Status,

    /// Manage the saved search paths
    Roots {
        #[command(subcommand)]
        command: RootsCmd,
    },
}

#[derive(Subcommand, Debug)]
enum RootsCmd {
    /// List the saved search paths
    List,

    /// Add a search path
    Add {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },

    /// Remove a search path (its entries are pruned on the next sync)
    Remove {
        #[arg(short, long, value_name = "DIR")]
        path: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let mut config = FinderConfig::new(FinderConfig::default().search_paths, cli.hash_size)?;
    if let Some(cache) = cli.cache {
        config = config.with_cache_path(cache);
    }
    if let Some(workers) = cli.workers {
        config = config.with_workers(workers)?;
    }

    let finder = ImageFinder::open(config.clone())
        .with_context(|| format!("Failed to open cache {:?}", config.cache_path))?;
    match finder.load_outcome() {
        LoadOutcome::Corrupt { reason } => {
            eprintln!("⚠️  Cache was unreadable ({}); it will be rebuilt on sync", reason)
        }
        LoadOutcome::HashSizeMismatch { found, expected } => eprintln!(
            "⚠️  Cache was built with hash size {}, now {}; it will be rebuilt on sync",
            found, expected
        ),
        LoadOutcome::Missing | LoadOutcome::Loaded { .. } => {}
    }

    match cli.command {
        Commands::Sync { roots } => {
            let roots = if roots.is_empty() {
                finder.search_paths()?
            } else {
                roots
            };
            println!("▶ Syncing cache over {} search path(s):", roots.len());
            for root in &roots {
                println!("   ▶ {}", root.display());
            }

            match run_sync(&finder, &roots)? {
                Ok(report) => {
                    print_report(&report);
                    println!("\n✅ Cache saved to {}", config.cache_path.display());
                }
                Err(FinderError::Sync(SyncError::Persistence { report, source })) => {
                    print_report(&report);
                    anyhow::bail!(
                        "Sync finished but the cache could not be saved to {}: {}",
                        config.cache_path.display(),
                        source
                    );
                }
                Err(e) => return Err(e).context("Sync failed"),
            }
        }

        Commands::Query {
            image,
            threshold,
            limit,
            json,
        } => {
            let status = finder.cache_status()?;
            if status.entry_count == 0 && !json {
                println!("⚠️  The cache is empty. Run `simfind sync` first.");
            }

            let results = benchmark("searching", || finder.query(&image, threshold, Some(limit)))
                .with_context(|| format!("Failed to search for {:?}", image))?;

            write_results(&mut io::stdout().lock(), &results, threshold, limit, json)?;
        }

        Commands::Status => {
            let status = finder.cache_status()?;
            println!("🗂️  Cache: {}", config.cache_path.display());
            println!("   images:     {}", status.entry_count);
            println!("   hash size:  {} ({} bits)", status.hash_size, config.fingerprint_bits());
            match status.last_synced_at {
                Some(at) => println!("   last sync:  {}", at.to_rfc3339()),
                None => println!("   last sync:  never"),
            }
            println!("   search paths:");
            for path in &status.search_paths {
                println!("     ▶ {}", path.display());
            }
        }

        Commands::Roots { command } => match command {
            RootsCmd::List => {
                for path in finder.search_paths()? {
                    println!("▶ {}", path.display());
                }
            }
            RootsCmd::Add { path } => {
                let path = path
                    .canonicalize()
                    .with_context(|| format!("Search path {:?} does not exist", path))?;
                if finder.add_search_path(path.clone())? {
                    println!("✅ Added {}", path.display());
                } else {
                    println!("⚠️  {} is already a search path", path.display());
                }
            }
            RootsCmd::Remove { path } => {
                let resolved = path.canonicalize().unwrap_or(path);
                if finder.remove_search_path(&resolved)? {
                    println!("✅ Removed {}", resolved.display());
                } else {
                    println!("⚠️  {} is not a search path", resolved.display());
                }
            }
        },
    }

    Ok(())
}

/// Run a sync while a background thread turns progress events into a bar.
fn run_sync(
    finder: &ImageFinder,
    roots: &[PathBuf],
) -> Result<std::result::Result<SyncReport, FinderError>> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template(
        "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}",
    )?);
    bar.enable_steady_tick(Duration::from_millis(100));

    let (progress_tx, progress_rx) = mpsc::channel::<SyncProgress>();
    let ui_bar = bar.clone();
    let ui = thread::spawn(move || {
        for progress in progress_rx {
            match progress.phase {
                SyncPhase::Discovery => ui_bar.set_message("Scanning for images…"),
                SyncPhase::Hashing => {
                    ui_bar.set_length(progress.total_files as u64);
                    ui_bar.set_position(progress.files_processed as u64);
                    ui_bar.set_message("Hashing…");
                }
                SyncPhase::Pruning => ui_bar.set_message("Pruning removed files…"),
                SyncPhase::Saving => ui_bar.set_message("Saving cache…"),
                SyncPhase::Complete => ui_bar.set_message("Sync complete"),
            }
        }
    });

    let result = benchmark("syncing cache", || {
        finder.sync_with_progress(roots, Some(progress_tx))
    });
    let _ = ui.join();
    bar.finish_and_clear();
    Ok(result)
}

fn print_report(report: &SyncReport) {
    println!(
        "   ➕ {} added   🔄 {} updated   🗑️  {} removed   ✔ {} unchanged",
        report.added, report.updated, report.removed, report.unchanged
    );
    for root in &report.skipped_roots {
        eprintln!("⚠️  Skipped missing search path {}", root.display());
    }
    if !report.failed.is_empty() {
        eprintln!("⚠️  {} file(s) could not be hashed:", report.failed.len());
        for failed in &report.failed {
            eprintln!("   ▶ {}: {}", failed.path.display(), failed.reason);
        }
    }
}

/// Query output. In JSON mode nothing but the JSON array is written.
fn write_results<W: Write>(
    out: &mut W,
    results: &[SearchResult],
    threshold: f64,
    limit: usize,
    json: bool,
) -> Result<()> {
    if json {
        serde_json::to_writer_pretty(&mut *out, results)?;
        writeln!(out)?;
        return Ok(());
    }

    if results.is_empty() {
        writeln!(
            out,
            "No similar images found with ≥{}% similarity. Try lowering --threshold.",
            threshold
        )?;
        return Ok(());
    }

    writeln!(out, "Found {} similar image(s):", results.len())?;
    for (i, result) in results.iter().enumerate() {
        writeln!(
            out,
            " {:>3}. {:>6.2}%  {:>8.2} MB  {}",
            i + 1,
            result.similarity,
            result.byte_size as f64 / (1024.0 * 1024.0),
            result.path.display()
        )?;
    }
    if results.len() == limit {
        writeln!(out, "(showing top {}; raise --limit for more)", limit)?;
    }
    Ok(())
}

/// Run `f()`, report how long it took (with `label`) on stderr, and return
/// its result. Stdout stays free for command output.
fn benchmark<T, F: FnOnce() -> T>(label: &str, f: F) -> T {
    let start = Instant::now();
    let result = f();
    eprintln!("⏱ {} took {:.2?}", label, start.elapsed());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<SearchResult> {
        vec![
            SearchResult {
                path: PathBuf::from("/photos/a.jpg"),
                distance: 0,
                similarity: 100.0,
                byte_size: 2 * 1024 * 1024,
            },
            SearchResult {
                path: PathBuf::from("/photos/b.jpg"),
                distance: 12,
                similarity: 93.75,
                byte_size: 512,
            },
        ]
    }

    #[test]
    fn test_json_output_is_only_json() {
        let results = sample();
        let mut out = Vec::new();
        write_results(&mut out, &results, 90.0, 50, true).unwrap();

        let parsed: Vec<SearchResult> = serde_json::from_slice(&out).unwrap();
        assert_eq!(parsed, results);

        let mut out = Vec::new();
        write_results(&mut out, &[], 90.0, 50, true).unwrap();
        let parsed: Vec<SearchResult> = serde_json::from_slice(&out).unwrap();
        assert!(parsed.is_empty());
    }

    #[test]
    fn test_text_output_lists_results() {
        let mut out = Vec::new();
        write_results(&mut out, &sample(), 90.0, 2, false).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.starts_with("Found 2 similar image(s):"));
        assert!(text.contains("100.00%"));
        assert!(text.contains("2.00 MB"));
        assert!(text.contains("/photos/b.jpg"));
        assert!(text.contains("showing top 2"));
    }
}
