//! Emulation of a hardware performance-counter device.
//!
//! Each session opened on a [`DriverState`] owns a region of simulated counter memory and a
//! background task that keeps writing random values into its upper half. The region can be
//! mapped into the caller's address space to observe the counters without further calls.
//!
//! ```no_run
//! use kdriver::{DriverConfig, DriverState, MAP_OPC_COUNTER};
//!
//! let driver = DriverState::initialize(DriverConfig::default())?;
//! let session = driver.open_session()?;
//! let counters = driver.map(session, MAP_OPC_COUNTER, driver.region_size())?;
//! println!("{:?}", counters.get(driver.region_size() - 1));
//! drop(counters);
//! driver.close_session(session)?;
//! # Ok::<(), kdriver::Error>(())
//! ```

#![deny(missing_docs, missing_debug_implementations)]

mod errors;
pub use errors::{Error, MapError, ResourceError, Result, TaskStopError};

pub mod config;
pub use config::{DriverConfig, PinPolicy, COUNTER_REGION_SIZE};

pub mod region;
pub use region::{CounterMapping, Region, RegionAllocator};

pub mod simulator;
pub use simulator::{CounterSimulatorTask, CounterSource, RandomCounterSource};

pub mod driver;
pub use driver::{ControlOpcode, DriverState, MapOpcode, MapRequest, SessionHandle, MAP_OPC_COUNTER};

pub(crate) mod util;
