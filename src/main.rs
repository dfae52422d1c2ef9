//! Divisive: hierarchical clustering CLI
//!
//! Loads a numeric CSV dataset, builds the cluster tree and prints a summary
//! of the merged partition.

use anyhow::Result;
use clap::Parser;
use divisive::{load_dataset, Args, ClusterNode, DivisiveEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use tracing_subscriber::FmtSubscriber;

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level())
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let start_time = Instant::now();

    let data_start = Instant::now();
    let data = load_dataset(&args.input, !args.no_header)?;
    println!(
        "✓ Data loaded: {} observations, {} features ({:.2}s)",
        data.nrows(),
        data.ncols(),
        data_start.elapsed().as_secs_f64()
    );

    let mut pool = rayon::ThreadPoolBuilder::new();
    if let Some(threads) = args.threads {
        pool = pool.num_threads(threads);
    }
    let pool = Arc::new(pool.build()?);

    let config = args.config(data.ncols());
    let total = data.nrows();
    let consumed = AtomicUsize::new(0);
    let progress = |n: usize| {
        let done = consumed.fetch_add(n, Ordering::Relaxed) + n;
        info!(done, total, "{:.1}% of observations assigned", 100.0 * done as f64 / total as f64);
    };

    let fit_start = Instant::now();
    let tree = match DivisiveEngine::new(config)
        .with_pool(pool)
        .with_progress(&progress)
        .fit(data.view())
    {
        Ok(tree) => tree,
        Err(err) if err.is_recoverable() => {
            return Err(anyhow::Error::new(err)
                .context("Clustering failed, retry with --filter none or without --normalize-rows"));
        }
        Err(err) => return Err(err.into()),
    };
    let fit_time = fit_start.elapsed();

    match tree {
        Some(tree) => print_summary(&tree, args.levels),
        None => println!("Dataset has no observations"),
    }

    println!("\nTree built in {:.2}s", fit_time.as_secs_f64());
    println!("Total processing time: {:.2}s", start_time.elapsed().as_secs_f64());
    Ok(())
}

fn print_summary(tree: &ClusterNode, levels: Option<usize>) {
    println!("\n=== Cluster Tree ===");
    println!("Depth: {}", tree.depth());
    println!("Leaves: {}", tree.n_leaves());

    let partition = tree.merged_partition(levels);
    let mut sizes = vec![0usize; partition.n_clusters()];
    for &label in partition.labels.iter() {
        sizes[label] += 1;
    }
    let total = partition.labels.len();

    println!("\n=== Merged Clusters ===");
    for (label, path) in &partition.paths {
        let size = sizes[*label];
        let percentage = (size as f64 / total as f64) * 100.0;
        println!(
            "Cluster {label} {path:?}: {size} observations ({percentage:.1}%)"
        );
    }
}
