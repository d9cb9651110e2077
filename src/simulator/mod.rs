//! Background simulation of hardware writing live counters.

use rand::rngs::{OsRng, StdRng};
use rand::{Rng, SeedableRng};
use std::ops::Range;

mod task;
pub use task::{CounterSimulatorTask, TaskSettings};

/// Produces the writes a simulator task applies to its region.
pub trait CounterSource: Send {
    /// Choose the next `(offset, value)` to write.
    ///
    /// `live_band` is the range of offsets the task is allowed to write. Offsets outside of it are
    /// redirected to the start of the band by the task.
    fn next_write(&mut self, live_band: Range<usize>) -> (usize, u8);
}

/// Writes a random byte at a uniformly chosen offset of the live band.
#[derive(Debug)]
pub struct RandomCounterSource {
    rng: StdRng,
}

impl RandomCounterSource {
    /// Create a source seeded from the operating system's entropy pool.
    pub fn new() -> Self {
        RandomCounterSource {
            rng: StdRng::from_entropy(),
        }
    }

    /// Like [`new`](RandomCounterSource::new), but reports an unavailable entropy source
    /// instead of panicking.
    pub fn from_os_rng() -> std::io::Result<Self> {
        let rng = StdRng::from_rng(OsRng)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        Ok(RandomCounterSource { rng })
    }
}

impl Default for RandomCounterSource {
    fn default() -> Self {
        RandomCounterSource::new()
    }
}

impl CounterSource for RandomCounterSource {
    fn next_write(&mut self, live_band: Range<usize>) -> (usize, u8) {
        let offset = if live_band.start < live_band.end {
            self.rng.gen_range(live_band)
        } else {
            live_band.start
        };
        (offset, self.rng.gen())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_source_stays_in_band() {
        let mut source = RandomCounterSource::from_os_rng().unwrap();
        let band = 512..1024;
        let mut nonzero = 0;
        for _ in 0..10_000 {
            let (off, val) = source.next_write(band.clone());
            assert!(band.contains(&off));
            if val != 0 {
                nonzero += 1;
            }
        }
        assert!(nonzero > 9_000);
    }
}
