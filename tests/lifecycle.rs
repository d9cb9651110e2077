use kdriver::{CounterSource, DriverConfig, DriverState, Error, TaskStopError};
use rayon::prelude::*;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Counts every write it hands out.
struct Counting(Arc<AtomicU64>);

impl CounterSource for Counting {
    fn next_write(&mut self, band: Range<usize>) -> (usize, u8) {
        self.0.fetch_add(1, Ordering::SeqCst);
        (band.start, 1)
    }
}

/// Ignores cancellation until released.
struct Stuck(Arc<AtomicBool>);

impl CounterSource for Stuck {
    fn next_write(&mut self, band: Range<usize>) -> (usize, u8) {
        while !self.0.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
        }
        (band.start, 1)
    }
}

#[test]
fn test_repeated_open_close() -> kdriver::Result<()> {
    init_logging();
    let driver = DriverState::initialize(DriverConfig::default())?;
    for _ in 0..1000 {
        let session = driver.open_session()?;
        assert_eq!(driver.active_sessions(), 1);
        driver.close_session(session)?;
        assert_eq!(driver.active_sessions(), 0);
    }
    driver.teardown()
}

#[test]
fn test_concurrent_open_close() -> kdriver::Result<()> {
    init_logging();
    let driver = DriverState::initialize(DriverConfig::default())?;
    let results: Vec<kdriver::Result<()>> = (0..64)
        .into_par_iter()
        .map(|_| {
            let session = driver.open_session()?;
            thread::sleep(Duration::from_millis(1));
            driver.close_session(session)
        })
        .collect();
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(driver.active_sessions(), 0);
    driver.teardown()
}

#[test]
fn test_concurrent_sessions_are_counted() -> kdriver::Result<()> {
    init_logging();
    let driver = DriverState::initialize(DriverConfig::default())?;
    let handles: Vec<_> = (0..16)
        .into_par_iter()
        .map(|_| driver.open_session())
        .collect::<kdriver::Result<Vec<_>>>()?;
    assert_eq!(driver.active_sessions(), 16);
    handles
        .par_iter()
        .map(|h| driver.close_session(*h))
        .collect::<kdriver::Result<Vec<_>>>()?;
    assert_eq!(driver.active_sessions(), 0);
    Ok(())
}

#[test]
fn test_double_close_is_rejected() -> kdriver::Result<()> {
    init_logging();
    let driver = DriverState::initialize(DriverConfig::default())?;
    let session = driver.open_session()?;
    driver.close_session(session)?;
    match driver.close_session(session) {
        Err(Error::InvalidSession(h)) => assert_eq!(h, session),
        other => panic!("unexpected result {:?}", other),
    }
    assert_eq!(driver.active_sessions(), 0);
    Ok(())
}

#[test]
fn test_no_writes_after_close() -> kdriver::Result<()> {
    init_logging();
    let writes = Arc::new(AtomicU64::new(0));
    let source_writes = Arc::clone(&writes);
    let config = DriverConfig::default()
        .set_counter_source(move || Counting(Arc::clone(&source_writes)));
    let driver = DriverState::initialize(config)?;

    let session = driver.open_session()?;
    thread::sleep(Duration::from_millis(20));
    driver.close_session(session)?;

    let after_close = writes.load(Ordering::SeqCst);
    assert!(after_close > 0);
    thread::sleep(Duration::from_millis(20));
    assert_eq!(writes.load(Ordering::SeqCst), after_close);
    Ok(())
}

#[test]
fn test_unresponsive_task_is_reported() -> kdriver::Result<()> {
    init_logging();
    let release = Arc::new(AtomicBool::new(false));
    let source_release = Arc::clone(&release);
    let config = DriverConfig::default()
        .set_stop_timeout(Duration::from_millis(20))
        .set_counter_source(move || Stuck(Arc::clone(&source_release)));
    let driver = DriverState::initialize(config)?;

    let session = driver.open_session()?;
    thread::sleep(Duration::from_millis(5));
    let err = match driver.close_session(session) {
        Err(e) => e,
        Ok(()) => panic!("close of a stuck session succeeded"),
    };
    assert!(err.is_task_stop());
    match err {
        Error::TaskStop(TaskStopError::Timeout { timeout, .. }) => {
            assert_eq!(timeout, Duration::from_millis(20))
        }
        other => panic!("unexpected error {:?}", other),
    }

    // Teardown went ahead regardless.
    assert_eq!(driver.active_sessions(), 0);
    assert!(!driver.is_open(session));

    release.store(true, Ordering::SeqCst);
    let next = driver.open_session()?;
    driver.close_session(next)?;
    Ok(())
}
