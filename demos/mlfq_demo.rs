//! Demo of the two-level scheduler on a simulated host
//!
//! Runs a mix of CPU hogs and interactive tasks on virtual time while a
//! reporter thread prints demotions, exits and counters. Pass `-v` for
//! verbose diagnostics and debug logging.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use mlfq_pulse::{
    ManualClock, MlfqConfig, MlfqScheduler, ReporterConfig, ReporterThread, SchedOps, SimConfig, SimHost,
    SimTaskSpec, TaskId,
};
use tracing_subscriber::EnvFilter;

const MS: u64 = 1_000_000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let verbose = std::env::args().skip(1).any(|arg| arg == "-v");

    let default_level = if verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(io::stderr)
        .init();

    println!("MLFQ Demo\n");

    let clock = Arc::new(ManualClock::new(0));
    let config = MlfqConfig::builder().units(2).build()?;
    let scheduler = Arc::new(MlfqScheduler::with_clock(config, clock.clone())?);
    println!("Scheduler: {scheduler:?}\n");

    let mut reporter = ReporterThread::spawn(
        Arc::clone(&scheduler),
        ReporterConfig {
            interval: Duration::from_millis(50),
            verbose,
            ..ReporterConfig::default()
        },
        io::stdout(),
    )?;

    // Two hogs, three interactive tasks, one late short job
    let workload = [
        SimTaskSpec::cpu_bound(TaskId(100), 0, 300 * MS),
        SimTaskSpec::cpu_bound(TaskId(101), 5 * MS, 180 * MS),
        SimTaskSpec::interactive(TaskId(200), 0, 60 * MS, 4 * MS, 6 * MS),
        SimTaskSpec::interactive(TaskId(201), 2 * MS, 60 * MS, 3 * MS, 9 * MS),
        SimTaskSpec::interactive(TaskId(202), 4 * MS, 40 * MS, 8 * MS, 2 * MS),
        SimTaskSpec::cpu_bound(TaskId(300), 120 * MS, 20 * MS),
    ];

    let host = SimHost::new(
        SimConfig {
            units: 2,
            ..SimConfig::default()
        },
        scheduler.clone() as Arc<dyn SchedOps>,
    )
    .with_clock(clock);
    let report = host.run(&workload);

    std::thread::sleep(Duration::from_millis(120));
    reporter.shutdown()?;

    println!("\nSimulation results:");
    println!("{report}");
    if let Some(mean) = report.mean_turnaround_ns() {
        println!("mean turnaround: {:.3}ms", mean as f64 / MS as f64);
    }

    Ok(())
}
