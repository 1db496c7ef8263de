//! Page-lock contention driver
//!
//! Hammers a handful of pages from many worker threads and prints the
//! collected metrics, giving a quick read on lock fairness and wait
//! latency on the current machine.

use anyhow::Result;
use clap::Parser;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arbordb::{logging, metrics, Engine, Settings};

#[derive(Parser, Debug)]
#[command(name = "lock_driver", about = "ArborDB page-lock contention driver")]
struct Args {
    /// Number of worker threads
    #[arg(short, long, default_value_t = 8)]
    workers: usize,

    /// Lock/unlock iterations per worker
    #[arg(short, long, default_value_t = 10_000)]
    iterations: u64,

    /// Number of distinct pages to contend on
    #[arg(short, long, default_value_t = 4)]
    pages: u32,

    /// Optional TOML settings file
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    logging::init_from_env();
    let args = Args::parse();

    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.max_workers = settings.max_workers.max(args.workers);
    let engine = Engine::new(settings)?;

    let counters: Arc<Vec<AtomicU64>> =
        Arc::new((0..args.pages).map(|_| AtomicU64::new(0)).collect());

    let start = std::time::Instant::now();
    let mut handles = Vec::new();
    for thread_id in 0..args.workers {
        let engine = Arc::clone(&engine);
        let counters = Arc::clone(&counters);
        let iterations = args.iterations;
        let pages = args.pages;
        handles.push(std::thread::spawn(move || {
            let mut worker = engine.register_worker().expect("worker slot");
            for i in 0..iterations {
                let blkno = ((thread_id as u64 + i) % pages as u64) as u32;
                worker.lock_page(blkno);
                worker.page_block_reads(blkno);
                counters[blkno as usize].fetch_add(1, Ordering::Relaxed);
                worker.unlock_page(blkno);
            }
        }));
    }
    for handle in handles {
        handle.join().expect("worker thread panicked");
    }
    let elapsed = start.elapsed();

    let total: u64 = counters.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    println!(
        "{} lock/unlock cycles across {} pages in {:.3}s ({:.0} cycles/s)",
        total,
        args.pages,
        elapsed.as_secs_f64(),
        total as f64 / elapsed.as_secs_f64()
    );
    println!("{}", metrics::encode_metrics());
    Ok(())
}
