use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Parser;
use itertools::Itertools;
use log::{info, warn};

use packrat::{AssetManager, BlobLoader, DirectorySource, ManagerOptions, WorkerPool};

#[derive(Parser, Debug)]
#[command(name = "packrat-warm")]
#[command(about = "Walks a content directory and pre-warms the asset cache")]
struct CliArgs {
    #[arg(long, env = "PACKRAT_CONTENT_DIR", default_value_t = default_content_dir())]
    content_dir: String,

    /// Only warm files ending in this suffix (e.g. ".qoi"). Empty warms everything.
    #[arg(long, default_value = "")]
    suffix: String,

    #[arg(long, default_value_t = 4)]
    workers: usize,

    #[arg(long, default_value_t = 4)]
    scratch_arenas: usize,
}

fn default_content_dir() -> String {
    std::env::current_dir()
        .expect("Can't read current working directory!")
        .join("_data")
        .to_string_lossy()
        .to_string()
}

fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let args = CliArgs::parse();
    log::trace!("Starting with args: {:?}", args);

    let root = PathBuf::from(&args.content_dir);
    let files = collect_files(&root, &args.suffix)?;
    info!("Warming {} files from {}", files.len(), root.display());

    let pool = Arc::new(WorkerPool::new(args.workers));
    let source = Arc::new(DirectorySource::new(&root));
    let manager: AssetManager<BlobLoader> = AssetManager::with_parts(
        source,
        pool.clone(),
        ManagerOptions {
            content_root: args.content_dir.clone(),
            workers: args.workers,
            scratch_arenas: args.scratch_arenas,
            ..ManagerOptions::default()
        },
    );

    for file in &files {
        manager.schedule_load(BlobLoader::new(file));
    }

    // Drain the pool so every scheduled load ran before we report.
    pool.shutdown();

    let stats = manager.stats();
    info!(
        "Warmed {} cells: {} loads, {} failures, {} scheduled",
        stats.cells, stats.loads, stats.load_failures, stats.scheduled
    );

    let leaked = manager.shutdown();
    if leaked > 0 {
        warn!("{} cells still referenced after warming, this is a bug", leaked);
    }
    Ok(())
}

/// Recursively collects files below `root` as root-relative forward-slash paths.
fn collect_files(root: &Path, suffix: &str) -> Result<Vec<String>, anyhow::Error> {
    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out
        .into_iter()
        .filter(|path| suffix.is_empty() || path.ends_with(suffix))
        .sorted()
        .collect_vec())
}

fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<(), anyhow::Error> {
    for entry in fs::read_dir(dir)?.filter_map(|entry| entry.ok()) {
        let path = entry.path();
        if path.is_dir() {
            walk(root, &path, out)?;
        } else if path.is_file() {
            let relative = path
                .strip_prefix(root)
                .expect("walked file outside the root");
            out.push(relative.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(())
}
