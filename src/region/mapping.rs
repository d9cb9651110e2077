//! Caller views of a region.

use super::{Region, RegionGuard};
use crate::config::PinPolicy;
use crate::errors::MapError;
use log::{debug, warn};
use nix::libc;
use nix::sys::mman;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Counts as one outstanding mapping of a region for as long as it lives.
///
/// Taken while the session is known to be open, so a close cannot slip in between the lookup of
/// a session and the establishment of its mapping.
#[derive(Debug)]
pub(crate) struct MappingRef {
    region: Arc<Region>,
}

impl MappingRef {
    pub(crate) fn new(region: &Arc<Region>) -> Self {
        region.mappings.fetch_add(1, Ordering::SeqCst);
        MappingRef {
            region: Arc::clone(region),
        }
    }

    pub(crate) fn region(&self) -> &Arc<Region> {
        &self.region
    }
}

impl Drop for MappingRef {
    fn drop(&mut self) {
        self.region.mappings.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A live view of a session's region in the caller's address space.
///
/// The view is read/write, shares its pages with the driver (no copies are made), is excluded
/// from copy-on-fork and, depending on the [`PinPolicy`], locked into memory. Bytes written by
/// the simulator task become visible without further calls, one byte at a time.
///
/// Dropping the mapping unmaps it. A session cannot be closed while any of its mappings is
/// alive.
#[derive(Debug)]
pub struct CounterMapping {
    /// Keeps the backing region alive and counts this mapping.
    owner: MappingRef,
    /// First byte of the caller view.
    base: NonNull<u8>,
    /// Length in bytes.
    len: usize,
    /// The view was locked into memory.
    pinned: bool,
    /// The view has not been torn down yet.
    mapped: bool,
}

// All access to the view goes through `AtomicU8`s.
unsafe impl Send for CounterMapping {}
unsafe impl Sync for CounterMapping {}

impl CounterMapping {
    /// Establish a new view over the region held by `guard`.
    ///
    /// The caller must hold the region lock for the duration of the call.
    pub(crate) fn establish(
        owner: MappingRef,
        guard: &RegionGuard<'_>,
        policy: PinPolicy,
    ) -> Result<Self, MapError> {
        let region = guard.region();
        let len = region.len();
        let addr = unsafe {
            mman::mmap(
                std::ptr::null_mut(),
                len,
                mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
                mman::MapFlags::MAP_SHARED,
                region.backing_fd(),
                0,
            )
        }
        .map_err(MapError::Remap)?;
        let base = NonNull::new(addr as *mut u8)
            .ok_or_else(|| MapError::Remap(nix::Error::Sys(nix::errno::Errno::ENOMEM)))?;

        // From here on dropping `mapping` tears the view down again.
        let mut mapping = CounterMapping {
            owner,
            base,
            len,
            pinned: false,
            mapped: true,
        };

        unsafe { mman::madvise(addr, len, mman::MmapAdvise::MADV_DONTFORK) }
            .map_err(MapError::Advise)?;

        match unsafe { mman::mlock(addr as *const libc::c_void, len) } {
            Ok(()) => mapping.pinned = true,
            Err(e) if policy == PinPolicy::BestEffort => {
                warn!(
                    target: "kdriver::mmap",
                    "Unable to pin mapping {:p}, continuing unpinned. Reason: {}", addr, e
                );
            }
            Err(e) => return Err(MapError::Pin(e)),
        }

        debug!(
            target: "kdriver::mmap",
            "Mapped region {:#x} (fd {}) at {:p} len {:#x} pinned: {}",
            region.base_addr(),
            region.backing_fd(),
            addr,
            len,
            mapping.pinned
        );
        Ok(mapping)
    }

    /// Length of the view in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Views are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the view is locked into memory.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pinned
    }

    /// Address of the first byte of the view.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.base.as_ptr()
    }

    /// The view as single-byte atomics.
    pub fn as_atomic(&self) -> &[AtomicU8] {
        unsafe { std::slice::from_raw_parts(self.base.as_ptr() as *const AtomicU8, self.len) }
    }

    /// Read the byte at `offset`.
    pub fn get(&self, offset: usize) -> Option<u8> {
        self.as_atomic()
            .get(offset)
            .map(|b| b.load(Ordering::Relaxed))
    }

    /// Number of non-zero bytes in `range`.
    pub fn count_nonzero(&self, range: std::ops::Range<usize>) -> usize {
        self.as_atomic()
            .get(range)
            .map(|bytes| {
                bytes
                    .iter()
                    .filter(|b| b.load(Ordering::Relaxed) != 0)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Hexdump of the bytes in `range`.
    pub fn dump(&self, range: std::ops::Range<usize>) -> String {
        let start = range.start;
        let bytes: Vec<u8> = self
            .as_atomic()
            .get(range)
            .map(|bytes| bytes.iter().map(|b| b.load(Ordering::Relaxed)).collect())
            .unwrap_or_default();
        crate::util::hexdump(start, &bytes)
    }

    /// Tear the view down, reporting failures of the OS unmap primitive.
    pub fn unmap(mut self) -> Result<(), MapError> {
        self.release()
    }

    fn release(&mut self) -> Result<(), MapError> {
        if !self.mapped {
            return Ok(());
        }
        self.mapped = false;
        let addr = self.base.as_ptr() as *mut libc::c_void;
        if self.pinned {
            let _ = unsafe { mman::munlock(addr as *const libc::c_void, self.len) };
        }
        unsafe { mman::munmap(addr, self.len) }.map_err(MapError::Unmap)?;
        debug!(
            target: "kdriver::mmap",
            "Unmapped {:p} of region {:#x}",
            addr,
            self.owner.region().base_addr()
        );
        Ok(())
    }
}

impl Drop for CounterMapping {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(target: "kdriver::mmap", "Unable to unmap {:p}. Reason: {}", self.base.as_ptr(), e);
        }
    }
}
