//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Periodic text reporting of scheduler activity
//!
//! [`Reporter`] turns events and counters into the line format operators
//! watch:
//!
//! ```text
//! [0.000ms] DEMOTE pid=4242 -> LO
//! [312.118ms] DONE_LO pid=4242
//! enq_hi=130 enq_lo=7 demote=3
//! ```
//!
//! Event times are relative to the first event the reporter sees.
//! [`ReporterThread`] drives a reporter on a dedicated thread every
//! [`PRINT_INTERVAL`], draining events before each counter line and once
//! more on shutdown.

#![forbid(unsafe_code)]

use std::io::{self, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use crate::engine::{MlfqMetrics, MlfqScheduler};
use crate::events::{Event, EventFilter, EventStream};
use crate::slice::NS_PER_MS;
use crate::stats::StatsSnapshot;

#[cfg(feature = "tracing")]
use tracing::{debug, error, info};

/// Interval between counter lines.
pub const PRINT_INTERVAL: Duration = Duration::from_millis(50);

/// Errors that can occur while reporting
#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Writing a report line failed
    #[error("Failed to write report: {0}")]
    Io(#[from] io::Error),

    /// Reporter thread creation failed
    #[error("Failed to create reporter thread: {0}")]
    ThreadCreationFailed(String),

    /// Reporter thread panicked
    #[error("Reporter thread panicked")]
    ThreadPanicked,
}

/// Formats events and counters into report lines.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    t0_ns: Option<u64>,
    verbose: bool,
    unit_filter: EventFilter,
}

impl Reporter {
    /// Creates a reporter. Verbose mode adds a diagnostics line per report.
    #[must_use]
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            ..Self::default()
        }
    }

    /// Only reports events from units admitted by `filter`.
    #[must_use]
    pub fn with_unit_filter(mut self, filter: EventFilter) -> Self {
        self.unit_filter = filter;
        self
    }

    /// Whether verbose mode is on.
    pub fn verbose(&self) -> bool {
        self.verbose
    }

    /// Timestamp of the first event seen.
    pub fn t0_ns(&self) -> Option<u64> {
        self.t0_ns
    }

    /// Formats one event line. The first event fixes time zero.
    pub fn format_event(&mut self, event: &Event) -> String {
        let t0 = *self.t0_ns.get_or_insert(event.ts_ns);
        let elapsed_ms = event.ts_ns.saturating_sub(t0) as f64 / NS_PER_MS as f64;
        format!("[{elapsed_ms:.3}ms] {event}")
    }

    /// Formats the counter line.
    pub fn format_stats(&self, stats: &StatsSnapshot) -> String {
        stats.to_string()
    }

    /// Formats the verbose diagnostics line.
    pub fn format_diagnostics(&self, metrics: &MlfqMetrics) -> String {
        format!(
            "dispatch_hi={} dispatch_lo={} run_hi={} run_lo={} queued_hi={} queued_lo={} \
             tracked={} evicted={} ev_dropped={}",
            metrics.stats.dispatch_high_attempts(),
            metrics.stats.dispatch_low_attempts(),
            metrics.high_dispatched,
            metrics.low_dispatched,
            metrics.high_depth,
            metrics.low_depth,
            metrics.tracked_tasks,
            metrics.level_evictions,
            metrics.events_dropped,
        )
    }

    /// Writes a line per committed event. Returns lines written.
    ///
    /// # Errors
    ///
    /// Returns the first write error. The event whose line failed is lost;
    /// events behind it stay queued for the next report.
    pub fn drain_events<W: Write>(&mut self, events: &EventStream, out: &mut W) -> Result<usize, ReportError> {
        let mut written = 0;

        events.try_poll(|event| -> io::Result<()> {
            if !self.unit_filter.admits(event.cpu) {
                return Ok(());
            }
            let line = self.format_event(event);
            writeln!(out, "{line}")?;
            written += 1;
            Ok(())
        })?;

        Ok(written)
    }

    /// Drains events, then writes the counter line.
    ///
    /// # Errors
    ///
    /// Returns an error if writing or flushing fails.
    pub fn report<W: Write>(&mut self, scheduler: &MlfqScheduler, out: &mut W) -> Result<(), ReportError> {
        self.drain_events(scheduler.events(), out)?;

        let metrics = scheduler.metrics();
        writeln!(out, "{}", self.format_stats(&metrics.stats))?;
        if self.verbose {
            writeln!(out, "{}", self.format_diagnostics(&metrics))?;
        }

        #[cfg(feature = "metrics")]
        metrics.stats.publish();

        out.flush()?;
        Ok(())
    }
}

/// Configuration for the reporter thread
#[derive(Debug, Clone)]
pub struct ReporterConfig {
    /// Time between reports
    pub interval: Duration,
    /// Add the diagnostics line
    pub verbose: bool,
    /// Thread name
    pub thread_name: String,
}

impl Default for ReporterConfig {
    fn default() -> Self {
        Self {
            interval: PRINT_INTERVAL,
            verbose: false,
            thread_name: "mlfq-pulse-report".to_string(),
        }
    }
}

/// Background thread printing a report every interval.
#[derive(Debug)]
pub struct ReporterThread {
    shutdown_sender: Sender<()>,
    handle: Option<JoinHandle<Result<(), ReportError>>>,
}

impl ReporterThread {
    /// Starts reporting `scheduler` into `out`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<W>(scheduler: Arc<MlfqScheduler>, config: ReporterConfig, mut out: W) -> Result<Self, ReportError>
    where
        W: Write + Send + 'static,
    {
        let (shutdown_sender, shutdown_receiver) = channel::bounded::<()>(1);
        let interval = config.interval;
        let mut reporter = Reporter::new(config.verbose);

        #[cfg(feature = "tracing")]
        info!(interval_ms = interval.as_millis(), verbose = config.verbose, "Starting reporter thread");

        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || -> Result<(), ReportError> {
                loop {
                    reporter.report(&scheduler, &mut out)?;

                    match shutdown_receiver.recv_timeout(interval) {
                        Err(channel::RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(channel::RecvTimeoutError::Disconnected) => break,
                    }
                }

                // Final drain
                reporter.drain_events(scheduler.events(), &mut out)?;
                out.flush()?;

                #[cfg(feature = "tracing")]
                debug!("Reporter thread exiting");

                Ok(())
            })
            .map_err(|e| ReportError::ThreadCreationFailed(e.to_string()))?;

        Ok(Self {
            shutdown_sender,
            handle: Some(handle),
        })
    }

    /// Whether the thread is still running.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Stops the thread after a final drain.
    ///
    /// # Errors
    ///
    /// Returns the thread's write error, or [`ReportError::ThreadPanicked`].
    pub fn shutdown(&mut self) -> Result<(), ReportError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        #[cfg(feature = "tracing")]
        info!("Stopping reporter thread");

        let _ = self.shutdown_sender.try_send(());

        match handle.join() {
            Ok(result) => result,
            Err(_) => {
                #[cfg(feature = "tracing")]
                error!("Reporter thread panicked");

                Err(ReportError::ThreadPanicked)
            },
        }
    }
}

impl Drop for ReporterThread {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
