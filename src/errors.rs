//! Utilities dealing with error handling in this crate.

use crate::driver::{ControlOpcode, SessionHandle};
use failure::Fail;

/// Errors produced by this crate.
#[derive(Debug, Fail)]
pub enum Error {
    /// Backing memory for a region or for the driver itself could not be obtained.
    #[fail(display = "Allocation Error - {}", _0)]
    Allocation(#[cause] nix::Error),
    /// A sub-step of opening a session failed. Partially built state has been rolled back.
    #[fail(display = "Resource Error - {}", _0)]
    Resource(#[cause] ResourceError),
    /// The background task of a session did not exit cleanly when the session was closed.
    ///
    /// The session has still been torn down.
    #[fail(display = "Task Stop Error - {}", _0)]
    TaskStop(#[cause] TaskStopError),
    /// The opcode does not name any mapping or control operation.
    #[fail(display = "Invalid opcode {:#x}", _0)]
    InvalidOpcode(u64),
    /// The handle does not refer to an open session.
    #[fail(display = "Invalid session {}", _0)]
    InvalidSession(SessionHandle),
    /// The session cannot be closed while caller mappings of its region are alive.
    #[fail(
        display = "Session {} still has {} outstanding mapping(s)",
        handle, mappings
    )]
    SessionBusy {
        /// Session that was asked to close.
        handle: SessionHandle,
        /// Number of mappings that are still alive.
        mappings: usize,
    },
    /// Establishing a mapping of a region failed.
    #[fail(display = "Map Error - {}", _0)]
    Map(#[cause] MapError),
    /// The control operation is reserved but not implemented.
    #[fail(display = "Control operation {:?} is not supported", _0)]
    Unsupported(ControlOpcode),
    /// The driver configuration cannot be used.
    #[fail(display = "Config Error - {}", _0)]
    InvalidConfig(String),
    /// Errors originating from calls to `std::env::*`.
    #[fail(display = "Env Error - {}", _0)]
    Env(#[cause] std::env::VarError),
    /// Errors caused by parsing integers from strings.
    #[fail(display = "Parse Error - {}", _0)]
    ParseInt(#[cause] std::num::ParseIntError),
    /// Errors originating from calls to `libc` or other system utilties.
    #[fail(display = "System Error - {}", _0)]
    System(#[cause] nix::Error),
}

impl Error {
    /// Returns `true` if this error only reports a background task that failed to stop.
    ///
    /// Such errors are returned by a close that otherwise completed its teardown.
    pub fn is_task_stop(&self) -> bool {
        match self {
            Error::TaskStop(_) => true,
            _ => false,
        }
    }
}

/// Sub-steps of opening a session that can fail.
#[derive(Debug, Fail)]
pub enum ResourceError {
    /// The counter region could not be allocated.
    #[fail(display = "unable to allocate counter region: {}", _0)]
    Region(#[cause] nix::Error),
    /// The counter source of the session could not be created.
    #[fail(display = "unable to create counter source: {}", _0)]
    Source(#[cause] std::io::Error),
    /// The counter simulator thread could not be created.
    #[fail(display = "unable to create simulator task: {}", _0)]
    Task(#[cause] std::io::Error),
    /// The session counter would overflow.
    #[fail(display = "session limit of {} reached", _0)]
    SessionLimit(u8),
}

/// Failures while exposing a region to the caller.
#[derive(Debug, Fail)]
pub enum MapError {
    /// The requested range does not cover exactly one region.
    #[fail(display = "requested {} bytes, region is {} bytes", requested, expected)]
    Length {
        /// Size of the region.
        expected: usize,
        /// Size of the requested range.
        requested: usize,
    },
    /// The OS refused to establish the new virtual range.
    #[fail(display = "remap failed: {}", _0)]
    Remap(#[cause] nix::Error),
    /// The new range could not be pinned in memory.
    #[fail(display = "pinning failed: {}", _0)]
    Pin(#[cause] nix::Error),
    /// The new range could not be excluded from copy-on-fork.
    #[fail(display = "fork exclusion failed: {}", _0)]
    Advise(#[cause] nix::Error),
    /// Tearing down a range failed.
    #[fail(display = "unmap failed: {}", _0)]
    Unmap(#[cause] nix::Error),
}

/// Ways a simulator task can fail to stop.
#[derive(Debug, Fail)]
pub enum TaskStopError {
    /// The task did not observe cancellation within the stop timeout.
    #[fail(display = "task {} did not exit within {:?}", name, timeout)]
    Timeout {
        /// Name of the task's thread.
        name: String,
        /// How long the caller waited.
        timeout: std::time::Duration,
    },
    /// The task panicked.
    #[fail(display = "task {} panicked", _0)]
    Panicked(String),
}

macro_rules! error_from {
    ($et: ty => $cet: expr) => {
        impl From<$et> for Error {
            #[inline]
            fn from(err: $et) -> Self {
                $cet(err)
            }
        }
    };
}

error_from!(std::env::VarError => Error::Env);
error_from!(std::num::ParseIntError => Error::ParseInt);
error_from!(nix::Error => Error::System);
error_from!(ResourceError => Error::Resource);
error_from!(MapError => Error::Map);
error_from!(TaskStopError => Error::TaskStop);

/// Result type used in this crate.
pub type Result<T> = std::result::Result<T, Error>;
