use kdriver::{DriverConfig, DriverState, MapOpcode, MAP_OPC_COUNTER};
use log::{error, info};

fn usage() {
    println!("Usage: kdriver_app [OPTIONS] <iterations>");
    println!("\t\t\tOptions: -o Open/Close for user-specified iterations");
    println!("\t\t\tOptions: -m Memory Map for user-specified iterations");
}

fn run_openclose_test_one(driver: &DriverState) -> kdriver::Result<()> {
    let session = driver.open_session()?;

    // Give the simulator a moment to start writing
    std::thread::sleep(std::time::Duration::from_millis(1));

    driver.close_session(session)
}

fn run_openmmapclose_test_one(driver: &DriverState) -> kdriver::Result<()> {
    let session = driver.open_session()?;
    let len = driver.region_size();

    // Same request as an mmap of the device at offset `opcode * page_size`
    let opcode = MapOpcode::from_page_offset(MapOpcode::Counter.page_offset())?;
    let counters = match driver.map(session, opcode as u64, len) {
        Ok(counters) => counters,
        Err(e) => {
            let _ = driver.close_session(session);
            return Err(e);
        }
    };

    info!("Reading out kdriver performance counter");
    info!("=========================================");
    let count = counters.count_nonzero(0..len);
    info!("\n{}", counters.dump(len / 2..len / 2 + 64));
    info!("Number of non-zero counter entries: {}", count);
    info!("=========================================");

    if let Err(e) = counters.unmap() {
        let _ = driver.close_session(session);
        return Err(e.into());
    }
    driver.close_session(session)
}

fn run_test<F>(name: &str, iterations: u32, driver: &DriverState, test: F) -> kdriver::Result<()>
where
    F: Fn(&DriverState) -> kdriver::Result<()>,
{
    for i in 0..iterations {
        if let Err(e) = test(driver) {
            error!("Unable to run {} test iter {}: {}", name, i, e);
            return Err(e);
        }
    }
    Ok(())
}

fn main() -> kdriver::Result<()> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (open_close, mmap, iterations) = match args.as_slice() {
        [flag, iter] if flag == "-o" => (true, false, iter),
        [flag, iter] if flag == "-m" => (false, true, iter),
        [iter] => (true, true, iter),
        _ => {
            usage();
            std::process::exit(1);
        }
    };
    let iterations: u32 = iterations.parse()?;

    let driver = DriverState::initialize(DriverConfig::from_env()?)?;
    if open_close {
        run_test("open/close", iterations, &driver, run_openclose_test_one)?;
    }
    if mmap {
        debug_assert_eq!(MapOpcode::Counter as u64, MAP_OPC_COUNTER);
        run_test("open/mmap/close", iterations, &driver, run_openmmapclose_test_one)?;
    }
    driver.teardown()
}
