//! Fixed-rate cycle scheduler
//!
//! The control cycle runs on the calling thread. Trim flushes and telemetry
//! export each run on a worker thread behind a bounded channel, so storage
//! or logging stalls never delay a duty update.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::board::{Board, Clock, DutyOutput, PressureSource, TorqueSource};
use crate::controller::{BoostController, FlushSink};
use crate::diagnostics::{DiagnosticPublisher, DiagnosticRecord};
use crate::duty::DutyUpdate;
use crate::error::{BoostError, StorageError};
use crate::nvm::NonVolatileStorage;
use crate::trim_store::{FlushOutcome, TrimStore};
use crate::trim_table::TrimTable;

/// Depth of the flush request queue.
pub const FLUSH_QUEUE_DEPTH: usize = 1;

/// Depth of the telemetry queue.
pub const TELEMETRY_QUEUE_DEPTH: usize = 256;

/// Longest wait for pending trims at shutdown.
pub const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

pub struct FlushWorker<S> {
    requests: Option<SyncSender<TrimTable>>,
    outcomes: Receiver<FlushOutcome>,
    handle: Option<JoinHandle<TrimStore<S>>>,
}

impl<S> FlushWorker<S>
where
    S: NonVolatileStorage + 'static,
{
    pub fn spawn(mut store: TrimStore<S>) -> Result<Self, BoostError> {
        let (request_tx, request_rx) = mpsc::sync_channel::<TrimTable>(FLUSH_QUEUE_DEPTH);
        let (outcome_tx, outcome_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("trim-flush".into())
            .spawn(move || {
                for table in request_rx {
                    let result = store.flush(&table).map_err(|e| e.to_string());
                    let outcome = FlushOutcome {
                        version: table.version,
                        result,
                        health: store.health().clone(),
                    };
                    if outcome_tx.send(outcome).is_err() {
                        break;
                    }
                }
                store
            })
            .map_err(|e| StorageError::Device(format!("cannot start flush worker: {}", e)))?;

        Ok(FlushWorker {
            requests: Some(request_tx),
            outcomes: outcome_rx,
            handle: Some(handle),
        })
    }

    pub fn try_outcome(&self) -> Option<FlushOutcome> {
        self.outcomes.try_recv().ok()
    }

    pub fn wait_outcome(&self, timeout: Duration) -> Option<FlushOutcome> {
        match self.outcomes.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Stops the worker once queued requests are done and returns the store.
    pub fn join(mut self) -> Option<TrimStore<S>> {
        self.requests.take();
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl<S> FlushSink for FlushWorker<S> {
    fn try_submit(&mut self, table: TrimTable) -> bool {
        match self.requests.as_ref() {
            Some(tx) => match tx.try_send(table) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => false,
                Err(TrySendError::Disconnected(_)) => {
                    error!("flush worker stopped");
                    false
                }
            },
            None => false,
        }
    }
}

pub struct TelemetryExporter<P> {
    records: Option<SyncSender<DiagnosticRecord>>,
    handle: Option<JoinHandle<P>>,
    dropped: u64,
}

impl<P> TelemetryExporter<P>
where
    P: DiagnosticPublisher + Send + 'static,
{
    pub fn spawn(mut publisher: P, depth: usize) -> Result<Self, BoostError> {
        let (tx, rx) = mpsc::sync_channel::<DiagnosticRecord>(depth);

        let handle = thread::Builder::new()
            .name("telemetry".into())
            .spawn(move || {
                for record in rx {
                    if let Err(e) = publisher.publish_diagnostic_record(&record) {
                        warn!(error = %e, "diagnostic record not published");
                    }
                }
                publisher
            })
            .map_err(|e| BoostError::Telemetry(format!("cannot start exporter: {}", e)))?;

        Ok(TelemetryExporter {
            records: Some(tx),
            handle: Some(handle),
            dropped: 0,
        })
    }

    /// Queues `record`. Returns `false` if it was dropped.
    pub fn export(&mut self, record: DiagnosticRecord) -> bool {
        let queued = self
            .records
            .as_ref()
            .map_or(false, |tx| tx.try_send(record).is_ok());
        if !queued {
            self.dropped += 1;
        }
        queued
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Drains queued records and returns the publisher.
    pub fn join(mut self) -> Option<P> {
        self.records.take();
        self.handle.take().and_then(|h| h.join().ok())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStats {
    pub cycles: u64,
    pub overruns: u64,
    pub duty_output_errors: u64,
    pub telemetry_dropped: u64,
    pub flush_outcomes: u64,
}

pub struct RunOptions<'a> {
    pub max_cycles: Option<u64>,
    pub stop: Option<&'a AtomicBool>,
    /// Sleep until each deadline. Off for simulated clocks.
    pub real_time: bool,
}

impl<'a> Default for RunOptions<'a> {
    fn default() -> Self {
        RunOptions {
            max_cycles: None,
            stop: None,
            real_time: true,
        }
    }
}

/// Runs the control cycle at the configured period until stopped, then
/// flushes pending trims and leaves the solenoid at 0 %.
pub fn run<P, T, D, C, S, X>(
    controller: &mut BoostController,
    board: &mut Board<P, T, D, C>,
    flush: &mut FlushWorker<S>,
    mut telemetry: Option<&mut TelemetryExporter<X>>,
    options: RunOptions,
) -> RunStats
where
    P: PressureSource,
    T: TorqueSource,
    D: DutyOutput,
    C: Clock,
    S: NonVolatileStorage + 'static,
    X: DiagnosticPublisher + Send + 'static,
{
    let period = Duration::from_millis(u64::from(controller.config().cycle_period_ms));
    let mut stats = RunStats::default();
    let mut deadline = Instant::now();

    info!(period_ms = controller.config().cycle_period_ms, "control loop started");

    loop {
        if options.stop.map_or(false, |s| s.load(Ordering::Relaxed)) {
            break;
        }
        if options.max_cycles.map_or(false, |max| stats.cycles >= max) {
            break;
        }

        let inputs = board.sample_inputs();

        while let Some(outcome) = flush.try_outcome() {
            controller.on_flush_outcome(&outcome, inputs.now_ms);
            stats.flush_outcomes += 1;
        }

        let result = controller.run_cycle(&inputs);
        if let Err(e) = board.duty.apply(&result.duty) {
            stats.duty_output_errors += 1;
            error!(error = %e, "duty update not applied");
            if board.duty.apply(&DutyUpdate::FAIL_SAFE).is_err() {
                error!("fail-safe duty not applied");
            }
        }

        controller.commit(&result, flush);

        if let Some(exporter) = telemetry.as_mut() {
            if !exporter.export(DiagnosticRecord::from(&result)) {
                stats.telemetry_dropped += 1;
                controller.note_telemetry_dropped();
            }
        }

        stats.cycles += 1;

        if options.real_time {
            deadline += period;
            let now = Instant::now();
            if now < deadline {
                thread::sleep(deadline - now);
            } else {
                stats.overruns += 1;
                debug!(late_us = (now - deadline).as_micros() as u64, "cycle overrun");
                deadline = now;
            }
        }
    }

    if board.duty.apply(&DutyUpdate::FAIL_SAFE).is_err() {
        error!("fail-safe duty not applied at shutdown");
    }

    controller.request_shutdown();
    let give_up = Instant::now() + SHUTDOWN_FLUSH_TIMEOUT;
    while controller.has_pending_trims() && Instant::now() < give_up {
        let now_ms = board.clock.now_ms();
        controller.poll_flush(now_ms, flush);
        if let Some(outcome) = flush.wait_outcome(Duration::from_millis(50)) {
            controller.on_flush_outcome(&outcome, board.clock.now_ms());
            stats.flush_outcomes += 1;
        }
    }
    if controller.has_pending_trims() {
        warn!("shutdown with unflushed trims");
    }

    info!(
        cycles = stats.cycles,
        overruns = stats.overruns,
        telemetry_dropped = stats.telemetry_dropped,
        "control loop stopped"
    );

    stats
}
