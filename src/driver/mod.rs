//! Session registry of the emulated counter device.
//!
//! [`DriverState`] plays the part of the device driver: every open creates a session with its
//! own region and simulator task, every close tears it down again, and a session's region can be
//! mapped into the caller's address space for zero-copy reads.

use crate::config::DriverConfig;
use crate::errors::{MapError, ResourceError};
use crate::region::{CounterMapping, MappingRef, RegionAllocator, PAGE_SIZE};
use crate::{Error, Result};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::convert::TryFrom;
use std::sync::{Mutex, MutexGuard, PoisonError};

mod opcode;
pub use opcode::{ControlOpcode, MapOpcode, MapRequest, MAP_OPC_COUNTER};

mod session;
use session::Session;
pub use session::SessionHandle;

/// State guarded by the global lock.
#[derive(Debug, Default)]
struct Registry {
    /// Number of live sessions. Always equal to `sessions.len()`.
    active_sessions: u8,
    /// Value of the next handle to hand out.
    next_handle: u64,
    /// Live sessions.
    sessions: HashMap<SessionHandle, Session>,
}

/// Owner of all sessions of one emulated device.
///
/// Opens and closes are serialised by a single global lock; each session's task runs
/// concurrently with everything else.
#[derive(Debug)]
pub struct DriverState {
    config: DriverConfig,
    allocator: RegionAllocator,
    registry: Mutex<Registry>,
}

impl DriverState {
    /// Validate `config` and create a driver without sessions.
    pub fn initialize(config: DriverConfig) -> Result<Self> {
        config.validate(*PAGE_SIZE)?;
        let allocator = RegionAllocator::new(config.region_size());
        // Make sure backing storage can be obtained before any session depends on it.
        allocator.allocate().map_err(|e| {
            error!(target: "kdriver::drv", "Unable to allocate counter memory. Reason: {}", e);
            Error::Allocation(e)
        })?;
        info!(
            target: "kdriver::drv",
            "Initialized driver region size: {:#x} write period: {:?}",
            config.region_size(),
            config.write_period()
        );
        Ok(DriverState {
            config,
            allocator,
            registry: Mutex::new(Registry::default()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configuration the driver was initialized with.
    #[inline]
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Size of every session's region.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.config.region_size()
    }

    /// Number of open sessions.
    pub fn active_sessions(&self) -> u8 {
        self.lock().active_sessions
    }

    /// Number of regions whose backing pages are still mapped.
    ///
    /// Equals `active_sessions()` unless a caller mapping or a detached task still holds a region
    /// of a closed session.
    pub fn live_regions(&self) -> usize {
        self.allocator.live_regions()
    }

    /// Whether `handle` refers to an open session.
    pub fn is_open(&self, handle: SessionHandle) -> bool {
        self.lock().sessions.contains_key(&handle)
    }

    /// Open a new session.
    ///
    /// The session's region is allocated and its simulator task is running when this returns.
    /// On failure nothing is left behind and the session count is unchanged.
    pub fn open_session(&self) -> Result<SessionHandle> {
        let mut registry = self.lock();
        let count = match registry.active_sessions.checked_add(1) {
            Some(count) if count <= self.config.max_sessions() => count,
            _ => {
                error!(
                    target: "kdriver::fops",
                    "Unable to open session, {} already active",
                    registry.active_sessions
                );
                return Err(ResourceError::SessionLimit(registry.active_sessions).into());
            }
        };

        let handle = SessionHandle::new(registry.next_handle);
        let session = Session::open(handle, &self.allocator, &self.config).map_err(|e| {
            error!(target: "kdriver::fops", "Unable to open {}. Reason: {}", handle, e);
            Error::Resource(e)
        })?;
        registry.next_handle += 1;

        info!(
            target: "kdriver::fops",
            "Opened {} active_sessions: {} region: {:#x}",
            handle,
            count,
            session.region().base_addr()
        );
        registry.sessions.insert(handle, session);
        registry.active_sessions = count;
        Ok(handle)
    }

    /// Close `handle`: stop its task, then free its region.
    ///
    /// Fails with `InvalidSession` for handles that are not open and with `SessionBusy` while
    /// mappings of the session are alive; the session is untouched in both cases. A
    /// `TaskStop` error means the session has been torn down but its task did not exit in time.
    pub fn close_session(&self, handle: SessionHandle) -> Result<()> {
        let mut registry = self.lock();
        let mappings = match registry.sessions.get(&handle) {
            Some(session) => session.mappings(),
            None => {
                warn!(target: "kdriver::fops", "Close of unknown {}", handle);
                return Err(Error::InvalidSession(handle));
            }
        };
        if mappings > 0 {
            warn!(
                target: "kdriver::fops",
                "Refusing to close {} with {} outstanding mapping(s)", handle, mappings
            );
            return Err(Error::SessionBusy { handle, mappings });
        }
        let session = match registry.sessions.remove(&handle) {
            Some(session) => session,
            None => return Err(Error::InvalidSession(handle)),
        };

        let stopped = session.close(&self.allocator);
        registry.active_sessions = registry.active_sessions.saturating_sub(1);
        info!(
            target: "kdriver::fops",
            "Closed {} active_sessions: {}",
            handle,
            registry.active_sessions
        );

        match stopped {
            Ok(writes) => {
                debug!(target: "kdriver::fops", "{} performed {} counter writes", handle, writes);
                Ok(())
            }
            Err(e) => {
                error!(
                    target: "kdriver::fops",
                    "Unable to stop task of {}. Reason: {}", handle, e
                );
                Err(e.into())
            }
        }
    }

    /// Map the resource selected by `opcode` into the caller's address space.
    ///
    /// `len` is the size of the destination range and must equal the region size.
    pub fn map(&self, handle: SessionHandle, opcode: u64, len: usize) -> Result<CounterMapping> {
        let request = MapRequest::decode(opcode, len).map_err(|e| {
            warn!(target: "kdriver::mmap", "Rejected map of {}: {}", handle, e);
            e
        })?;
        self.map_request(handle, request)
    }

    /// Map a decoded request into the caller's address space.
    pub fn map_request(&self, handle: SessionHandle, request: MapRequest) -> Result<CounterMapping> {
        match request.opcode {
            MapOpcode::Counter => self.map_counter(handle, request.len),
        }
    }

    fn map_counter(&self, handle: SessionHandle, len: usize) -> Result<CounterMapping> {
        if !self.is_open(handle) {
            return Err(Error::InvalidSession(handle));
        }
        let expected = self.region_size();
        if len != expected {
            return Err(MapError::Length {
                expected,
                requested: len,
            }
            .into());
        }

        // Counting the mapping while the global lock is held keeps a concurrent close out.
        let owner = {
            let registry = self.lock();
            let session = registry
                .sessions
                .get(&handle)
                .ok_or(Error::InvalidSession(handle))?;
            MappingRef::new(session.region())
        };

        let region = std::sync::Arc::clone(owner.region());
        let guard = region.lock();
        let mapping = CounterMapping::establish(owner, &guard, self.config.pin_policy())
            .map_err(|e| {
                error!(target: "kdriver::mmap", "Unable to map {}. Reason: {}", handle, e);
                Error::Map(e)
            })?;
        info!(
            target: "kdriver::mmap",
            "Mapped counters of {} at {:p}",
            handle,
            mapping.as_ptr()
        );
        Ok(mapping)
    }

    /// Issue a control operation on `handle`.
    ///
    /// The control channel is reserved: valid opcodes on open sessions are rejected with
    /// `Unsupported`.
    pub fn control(&self, handle: SessionHandle, opcode: u64, arg: &[u8]) -> Result<()> {
        let opcode = ControlOpcode::try_from(opcode)?;
        if !self.is_open(handle) {
            return Err(Error::InvalidSession(handle));
        }
        debug!(
            target: "kdriver::ioctl",
            "{:?} on {} with {} argument bytes is not implemented",
            opcode,
            handle,
            arg.len()
        );
        Err(Error::Unsupported(opcode))
    }

    /// Close every remaining session and release the driver.
    ///
    /// Returns the first error hit while closing left-over sessions.
    pub fn teardown(self) -> Result<()> {
        let result = self.close_all();
        info!(target: "kdriver::drv", "Driver torn down");
        result
    }

    fn close_all(&self) -> Result<()> {
        let mut registry = self.lock();
        if !registry.sessions.is_empty() {
            warn!(
                target: "kdriver::drv",
                "Tearing down with {} active session(s)",
                registry.active_sessions
            );
        }
        let mut result = Ok(());
        for (handle, session) in registry.sessions.drain() {
            if let Err(e) = session.close(&self.allocator) {
                error!(target: "kdriver::drv", "Unable to stop task of {}. Reason: {}", handle, e);
                if result.is_ok() {
                    result = Err(e.into());
                }
            }
        }
        registry.active_sessions = 0;
        result
    }
}

impl Drop for DriverState {
    fn drop(&mut self) {
        let _ = self.close_all();
    }
}
