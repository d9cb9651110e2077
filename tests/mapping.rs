use kdriver::{
    DriverConfig, DriverState, Error, MapError, MapOpcode, PinPolicy, COUNTER_REGION_SIZE,
    MAP_OPC_COUNTER,
};
use std::thread;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn driver() -> DriverState {
    init_logging();
    DriverState::initialize(DriverConfig::default()).unwrap()
}

#[test]
fn test_live_counters_through_mapping() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    let counters = driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE)?;
    assert_eq!(counters.len(), COUNTER_REGION_SIZE);
    assert_eq!(counters.get(0), Some(0));

    thread::sleep(Duration::from_millis(10));
    let live = COUNTER_REGION_SIZE / 2..COUNTER_REGION_SIZE;
    let mut changed = false;
    for _ in 0..20 {
        let before: Vec<u8> = live.clone().filter_map(|i| counters.get(i)).collect();
        thread::sleep(Duration::from_millis(5));
        let after: Vec<u8> = live.clone().filter_map(|i| counters.get(i)).collect();
        if before != after {
            changed = true;
            break;
        }
    }
    assert!(changed);

    drop(counters);
    driver.close_session(session)
}

#[test]
fn test_reserved_band_stays_zero() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    let counters = driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE)?;
    for _ in 0..10 {
        thread::sleep(Duration::from_millis(5));
        assert_eq!(counters.count_nonzero(0..COUNTER_REGION_SIZE / 2), 0);
    }
    assert!(counters.count_nonzero(COUNTER_REGION_SIZE / 2..COUNTER_REGION_SIZE) > 0);
    counters.unmap()?;
    driver.close_session(session)
}

#[test]
fn test_invalid_opcode_is_rejected() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    for opcode in &[0u64, 2, 0x1000] {
        match driver.map(session, *opcode, COUNTER_REGION_SIZE) {
            Err(Error::InvalidOpcode(x)) => assert_eq!(x, *opcode),
            other => panic!("unexpected result {:?}", other),
        }
    }
    // No mapping was left behind, so the close goes through.
    driver.close_session(session)
}

#[test]
fn test_map_without_session() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    driver.close_session(session)?;
    match driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE) {
        Err(Error::InvalidSession(h)) => assert_eq!(h, session),
        other => panic!("unexpected result {:?}", other),
    }

    let other_driver = DriverState::initialize(DriverConfig::default())?;
    let foreign = other_driver.open_session()?;
    let own = driver.open_session()?;
    assert_eq!(foreign, session);
    assert!(driver.map(foreign, MAP_OPC_COUNTER, COUNTER_REGION_SIZE).is_err());
    driver.close_session(own)?;
    other_driver.close_session(foreign)
}

#[test]
fn test_wrong_length_is_rejected() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    match driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE / 2) {
        Err(Error::Map(MapError::Length {
            expected,
            requested,
        })) => {
            assert_eq!(expected, COUNTER_REGION_SIZE);
            assert_eq!(requested, COUNTER_REGION_SIZE / 2);
        }
        other => panic!("unexpected result {:?}", other),
    }
    driver.close_session(session)
}

#[test]
fn test_close_waits_for_mappings() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    let request = MapOpcode::from_page_offset(MapOpcode::Counter.page_offset())?
        .request(driver.region_size());
    let first = driver.map_request(session, request)?;
    let second = driver.map_request(session, request)?;

    match driver.close_session(session) {
        Err(Error::SessionBusy { handle, mappings }) => {
            assert_eq!(handle, session);
            assert_eq!(mappings, 2);
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(driver.is_open(session));
    assert_eq!(driver.active_sessions(), 1);

    drop(first);
    assert!(driver.close_session(session).is_err());
    second.unmap()?;
    driver.close_session(session)?;
    assert_eq!(driver.active_sessions(), 0);
    Ok(())
}

#[test]
fn test_mapping_from_another_thread() -> kdriver::Result<()> {
    let driver = driver();
    let session = driver.open_session()?;
    let counters = driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE)?;
    let nonzero = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        counters.count_nonzero(COUNTER_REGION_SIZE / 2..COUNTER_REGION_SIZE)
    })
    .join()
    .unwrap();
    assert!(nonzero > 0);
    driver.close_session(session)
}

#[test]
fn test_required_pinning() -> kdriver::Result<()> {
    init_logging();
    let driver = DriverState::initialize(DriverConfig::default().set_pin_policy(PinPolicy::Required))?;
    let session = driver.open_session()?;
    match driver.map(session, MAP_OPC_COUNTER, COUNTER_REGION_SIZE) {
        Ok(counters) => {
            assert!(counters.is_pinned());
            counters.unmap()?;
        }
        // RLIMIT_MEMLOCK below the region size.
        Err(Error::Map(MapError::Pin(_))) => {}
        Err(e) => return Err(e),
    }
    driver.close_session(session)?;
    assert_eq!(driver.live_regions(), 0);
    Ok(())
}
