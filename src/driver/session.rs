//! Per-open resources: one region and the task writing into it.

use crate::config::DriverConfig;
use crate::errors::{ResourceError, TaskStopError};
use crate::region::{Region, RegionAllocator};
use crate::simulator::{CounterSimulatorTask, TaskSettings};
use derive_more::Display;
use log::debug;
use std::sync::Arc;

/// Opaque identifier of an open session, comparable to a file descriptor.
///
/// Handles are never reused by the driver that issued them.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[display(fmt = "session#{}", _0)]
pub struct SessionHandle(u64);

impl SessionHandle {
    pub(crate) fn new(id: u64) -> Self {
        SessionHandle(id)
    }

    /// Numeric value of the handle.
    #[inline]
    pub fn id(self) -> u64 {
        self.0
    }
}

/// Resources created by one open and destroyed by its matching close.
#[derive(Debug)]
pub(crate) struct Session {
    handle: SessionHandle,
    region: Arc<Region>,
    task: CounterSimulatorTask,
}

impl Session {
    /// Build the region and the simulator task of a new session.
    ///
    /// The task only starts once everything else is in place. On failure, whatever was already
    /// built is released in reverse order when it goes out of scope.
    pub(crate) fn open(
        handle: SessionHandle,
        allocator: &RegionAllocator,
        config: &DriverConfig,
    ) -> Result<Self, ResourceError> {
        let region = Arc::new(allocator.allocate().map_err(ResourceError::Region)?);
        let source = config.new_source().map_err(ResourceError::Source)?;
        let mut task = CounterSimulatorTask::spawn(
            Arc::clone(&region),
            source,
            TaskSettings {
                name: format!("rng-counter-{}", handle.id()),
                period: config.write_period(),
                stop_timeout: config.stop_timeout(),
            },
        )
        .map_err(ResourceError::Task)?;
        task.start();
        Ok(Session {
            handle,
            region,
            task,
        })
    }

    /// Stop the task, then release the region.
    ///
    /// The region is released even when the task fails to stop. Returns the number of writes
    /// the task performed.
    pub(crate) fn close(self, allocator: &RegionAllocator) -> Result<u64, TaskStopError> {
        let Session {
            handle,
            region,
            task,
        } = self;
        let stopped = task.stop();
        debug!(target: "kdriver::fops", "Stopped task of {}: {:?}", handle, stopped);
        allocator.free(region);
        stopped
    }

    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub(crate) fn mappings(&self) -> usize {
        self.region.mappings()
    }
}
