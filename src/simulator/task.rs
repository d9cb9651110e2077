//! Cancellable worker thread bound to one region.

use super::CounterSource;
use crate::errors::TaskStopError;
use crate::region::Region;
use log::{debug, trace, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Parameters of a simulator task.
#[derive(Debug, Clone)]
pub struct TaskSettings {
    /// Name given to the worker thread.
    pub name: String,
    /// Pause between two writes.
    pub period: Duration,
    /// How long `stop` waits for the worker to exit.
    pub stop_timeout: Duration,
}

/// Handle to a background thread that keeps rewriting the live band of a region.
///
/// The thread holds its own reference to the region, so the region outlives every write the
/// thread makes. The thread is created parked and only starts writing after [`start`]. Dropping
/// the handle stops the thread as [`stop`] does, discarding the outcome.
///
/// [`start`]: CounterSimulatorTask::start
/// [`stop`]: CounterSimulatorTask::stop
#[derive(Debug)]
pub struct CounterSimulatorTask {
    /// Name of the worker thread.
    name: String,
    /// Worker thread, yields the number of writes performed.
    thread: Option<JoinHandle<u64>>,
    /// Sending releases a parked worker. Dropping it unstarted makes the worker exit.
    start: Option<Sender<()>>,
    /// Dropping it cancels the worker.
    cancel: Option<Sender<()>>,
    /// Disconnects once the worker has released the region and returned.
    exited: Receiver<()>,
    /// How long `stop` waits for the worker to exit.
    stop_timeout: Duration,
}

impl CounterSimulatorTask {
    /// Create a parked worker writing values from `source` into `region`.
    pub fn spawn(
        region: Arc<Region>,
        source: Box<dyn CounterSource>,
        settings: TaskSettings,
    ) -> std::io::Result<Self> {
        let (start_tx, start_rx) = mpsc::channel::<()>();
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();
        let (exit_tx, exit_rx) = mpsc::channel::<()>();
        let period = settings.period;
        let thread = thread::Builder::new()
            .name(settings.name.clone())
            .spawn(move || {
                let _exit = exit_tx;
                if start_rx.recv().is_err() {
                    return 0;
                }
                simulate(region, source, &cancel_rx, period)
            })?;
        Ok(CounterSimulatorTask {
            name: settings.name,
            thread: Some(thread),
            start: Some(start_tx),
            cancel: Some(cancel_tx),
            exited: exit_rx,
            stop_timeout: settings.stop_timeout,
        })
    }

    /// Name of the worker thread.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the worker has been released.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.start.is_none()
    }

    /// Release the worker. Has no effect on a started task.
    pub fn start(&mut self) {
        if let Some(start) = self.start.take() {
            let _ = start.send(());
            debug!(target: "kdriver::fops", "Started task {}", self.name);
        }
    }

    /// Cancel the worker and wait for it to exit.
    ///
    /// Returns the number of writes the worker performed. If the worker does not exit within the
    /// stop timeout it is left running detached and `TaskStopError::Timeout` is returned; the
    /// region stays allocated until the worker lets go of it.
    pub fn stop(mut self) -> Result<u64, TaskStopError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<u64, TaskStopError> {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return Ok(0),
        };
        // Unstarted workers see the start channel disconnect and return right away.
        self.start = None;
        self.cancel = None;
        match self.exited.recv_timeout(self.stop_timeout) {
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    target: "kdriver::fops",
                    "Task {} did not exit within {:?}, detaching it",
                    self.name,
                    self.stop_timeout
                );
                Err(TaskStopError::Timeout {
                    name: self.name.clone(),
                    timeout: self.stop_timeout,
                })
            }
            _ => thread
                .join()
                .map_err(|_| TaskStopError::Panicked(self.name.clone())),
        }
    }
}

impl Drop for CounterSimulatorTask {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(target: "kdriver::fops", "Dropped task without clean exit: {}", e);
        }
    }
}

/// Returns `true` once cancellation has been requested.
fn cancelled(cancel: &Receiver<()>) -> bool {
    match cancel.try_recv() {
        Err(TryRecvError::Empty) => false,
        _ => true,
    }
}

/// Worker loop. Returns the number of writes performed.
fn simulate(
    region: Arc<Region>,
    mut source: Box<dyn CounterSource>,
    cancel: &Receiver<()>,
    period: Duration,
) -> u64 {
    let band = region.live_band();
    let mut writes = 0u64;
    while !cancelled(cancel) {
        let (mut offset, value) = source.next_write(band.clone());
        if !band.contains(&offset) {
            // Reset to middle
            offset = band.start;
        }

        if region.lock().store(offset, value) {
            writes += 1;
        }
        trace!(target: "kdriver::fops", "Simulating Counter[{:#x}]: [{}]", offset, value);

        // Interruptible sleep
        match cancel.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => continue,
            _ => break,
        }
    }
    writes
}
