//! Simulated counter memory.
//!
//! A region is an anonymous memfd object mapped once into the driver. Caller views of the same
//! pages are produced by [`CounterMapping`], so live writes become visible without copies.
//!
//! Memory layout:
//! ```text
//! ┌──── reserved ────┐  ▲
//! │                  │  │
//! │   never written  │ size/2
//! │                  │  │
//! ├──── live band ───┤  ▲
//! │                  │  │
//! │  rewritten by    │ size/2
//! │  simulator task  │  │
//! └──────────────────┘  ▼
//! ```

use log::debug;
use nix::libc;
use nix::sys::mman;
use std::convert::TryInto;
use std::ffi::CString;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

mod mapping;
pub use mapping::CounterMapping;
pub(crate) use mapping::MappingRef;

lazy_static::lazy_static! {
    /// Native page size of the system.
    pub(crate) static ref PAGE_SIZE: usize = nix::unistd::sysconf(nix::unistd::SysconfVar::PAGE_SIZE)
        .ok()
        .and_then(|x| x)
        .and_then(|x| x.try_into().ok())
        .unwrap_or(4096);
}

/// Hands out zero-filled regions of a fixed size.
#[derive(Debug)]
pub struct RegionAllocator {
    /// Size of every region.
    size: usize,
    /// Sequence number used to name the backing objects.
    serial: AtomicU64,
    /// Regions whose backing pages are still mapped.
    live: Arc<AtomicUsize>,
}

impl RegionAllocator {
    /// Create an allocator for regions of `size` bytes.
    pub fn new(size: usize) -> Self {
        RegionAllocator {
            size,
            serial: AtomicU64::new(0),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Size of the regions produced by this allocator.
    #[inline]
    pub fn region_size(&self) -> usize {
        self.size
    }

    /// Number of regions from this allocator that have not been dropped yet.
    pub fn live_regions(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Allocate a new zero-filled region.
    pub fn allocate(&self) -> nix::Result<Region> {
        let serial = self.serial.fetch_add(1, Ordering::Relaxed);
        Region::new(
            &format!("kdriver-region-{}", serial),
            self.size,
            Arc::clone(&self.live),
        )
    }

    /// Release `region`.
    ///
    /// The backing pages are returned to the system once no caller mapping or task refers to
    /// them anymore.
    pub fn free(&self, region: Arc<Region>) {
        debug!(
            target: "kdriver::fops",
            "Releasing region {:p} ({} other reference(s))",
            region.base.as_ptr(),
            Arc::strong_count(&region) - 1
        );
    }
}

/// A fixed-size byte buffer acting as the memory of a counter device.
#[derive(Debug)]
pub struct Region {
    /// memfd holding the backing pages.
    file: std::fs::File,
    /// Driver-side view of the backing pages.
    base: NonNull<u8>,
    /// Length in bytes.
    size: usize,
    /// Serialises writes into the live band and the setup of caller mappings.
    lock: Mutex<()>,
    /// Number of caller mappings alive or being established.
    mappings: AtomicUsize,
    /// Live-region count of the allocator, decremented on drop.
    live: Arc<AtomicUsize>,
}

// The driver-side view is only accessed through `AtomicU8`s.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn new(name: &str, size: usize, live: Arc<AtomicUsize>) -> nix::Result<Self> {
        let cname = CString::new(name).map_err(|_| nix::Error::InvalidPath)?;
        let fd = nix::sys::memfd::memfd_create(&cname, nix::sys::memfd::MemFdCreateFlag::MFD_CLOEXEC)?;
        // Owning the fd right away closes it on every error path below.
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let len: libc::off_t = size
            .try_into()
            .map_err(|_| nix::Error::Sys(nix::errno::Errno::EINVAL))?;
        nix::unistd::ftruncate(fd, len)?;
        let base = unsafe {
            mman::mmap(
                std::ptr::null_mut(),
                size,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                fd,
                0,
            )?
        };
        let base = NonNull::new(base as *mut u8)
            .ok_or_else(|| nix::Error::Sys(nix::errno::Errno::ENOMEM))?;
        debug!(
            target: "kdriver::fops",
            "Allocated region {:p} size {:#x} backing fd {}",
            base.as_ptr(),
            size,
            fd
        );
        live.fetch_add(1, Ordering::SeqCst);
        Ok(Region {
            file,
            base,
            size,
            lock: Mutex::new(()),
            mappings: AtomicUsize::new(0),
            live,
        })
    }

    /// Length of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.size
    }

    /// Regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Offsets rewritten by the simulator task.
    #[inline]
    pub fn live_band(&self) -> std::ops::Range<usize> {
        self.size / 2..self.size
    }

    /// Offsets that are never written.
    #[inline]
    pub fn reserved_band(&self) -> std::ops::Range<usize> {
        0..self.size / 2
    }

    /// Driver-side address of the first byte.
    #[inline]
    pub fn base_addr(&self) -> usize {
        self.base.as_ptr() as usize
    }

    /// Number of caller mappings alive or being established.
    #[inline]
    pub fn mappings(&self) -> usize {
        self.mappings.load(Ordering::SeqCst)
    }

    /// Acquire the region lock.
    pub fn lock(&self) -> RegionGuard<'_> {
        RegionGuard {
            region: self,
            _guard: self.lock.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Read the byte at `offset` through the driver-side view.
    pub fn load(&self, offset: usize) -> Option<u8> {
        self.bytes().get(offset).map(|b| b.load(Ordering::Relaxed))
    }

    pub(crate) fn bytes(&self) -> &[AtomicU8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr() as *const AtomicU8, self.size) }
    }

    pub(crate) fn backing_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        unsafe {
            let _ = mman::munmap(self.base.as_ptr() as *mut libc::c_void, self.size);
        }
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(target: "kdriver::fops", "Freed region {:p}", self.base.as_ptr());
    }
}

/// Exclusive access to a region's live band.
#[derive(Debug)]
pub struct RegionGuard<'r> {
    region: &'r Region,
    _guard: MutexGuard<'r, ()>,
}

impl<'r> RegionGuard<'r> {
    /// Store `value` at `offset`.
    ///
    /// Writes outside the live band are ignored and reported as `false`.
    pub fn store(&self, offset: usize, value: u8) -> bool {
        if !self.region.live_band().contains(&offset) {
            return false;
        }
        self.region.bytes()[offset].store(value, Ordering::Relaxed);
        true
    }

    pub(crate) fn region(&self) -> &'r Region {
        self.region
    }
}
