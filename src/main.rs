mod args;

use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;

use hprof_retain::analysis::HeapAnalysis;
use hprof_retain::cache::CacheDirectory;
use hprof_retain::engine::ProgressListener;
use hprof_retain::errors::HprofRetainError;
use hprof_retain::heap::HeapSource;
use hprof_retain::report;
use hprof_retain::snapshot::SnapshotReader;

use crate::args::get_args;

struct ProgressBarListener {
    bar: ProgressBar,
}

impl ProgressListener for ProgressBarListener {
    fn progress(&self, done: u64, total: u64) {
        self.bar.set_length(total);
        self.bar.set_position(done);
    }
}

fn main() -> Result<(), HprofRetainError> {
    let args = get_args()?;
    env_logger::Builder::new()
        .filter_level(if args.debug {
            LevelFilter::Debug
        } else {
            LevelFilter::Warn
        })
        .init();

    let snapshot_path = PathBuf::from(&args.file_path);
    let snapshot = SnapshotReader::open(&snapshot_path)?;
    println!(
        "Analyzing {} heap-graph snapshot with {} objects.",
        report::format_bytes(snapshot.len()),
        snapshot.object_count()
    );

    let cache = if args.temporary {
        CacheDirectory::temporary()
    } else if let Some(dir) = &args.cache_dir {
        CacheDirectory::persistent(Path::new(dir))?
    } else {
        CacheDirectory::for_snapshot(&snapshot_path)?
    };

    let reusable = !cache.is_temporary()
        && !cache.is_dirty()
        && cache.aux_file().map(|aux| aux.is_file()).unwrap_or(false);

    let analysis = if reusable {
        match HeapAnalysis::open(snapshot, cache.clone()) {
            Ok(analysis) => {
                println!("Reusing the persisted analysis from the cache directory.");
                analysis
            }
            Err(e) => {
                // stale or incompatible cache: recompute from the snapshot
                log::warn!("could not reopen the persisted analysis: {e:?}");
                let snapshot = SnapshotReader::open(&snapshot_path)?;
                analyse_fresh(snapshot, cache)?
            }
        }
    } else {
        analyse_fresh(snapshot, cache)?
    };

    println!("{}", report::render_summary(&analysis.stats()));
    let rows = analysis.top_retainer_rows(args.top)?;
    println!("{}", report::render_top_retainers(&rows));
    Ok(())
}

fn analyse_fresh(
    snapshot: SnapshotReader,
    cache: CacheDirectory,
) -> Result<HeapAnalysis<SnapshotReader>, HprofRetainError> {
    let pb = ProgressBar::new(snapshot.object_count());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} (eta:{eta})")
            .progress_chars("#>-"),
    );
    let listener = ProgressBarListener { bar: pb.clone() };
    let analysis = HeapAnalysis::build(snapshot, cache, &listener)?;
    analysis.compute_retained_sizes(&listener)?;
    pb.finish_and_clear();
    analysis.persist()?;
    Ok(analysis)
}
