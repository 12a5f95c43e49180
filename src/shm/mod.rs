//! Shared Region Access
//!
//! Byte-level access to the memory region shared between the producer and
//! consumer processes. The region is either a mapped file (the normal
//! cross-process path, via `memmap2`) or an anonymous allocation (loopback
//! and tests).
//!
//! This module is the only unsafe boundary in the crate. Everything above it
//! works with three primitives:
//!
//! - bounds-checked byte copies in and out of the region,
//! - bounds-checked plain-old-data snapshots (`read_pod`/`write_pod`),
//! - word-aligned atomics for the handshake flags and queue positions.
//!
//! The peer process can mutate any byte at any time, so no reference into
//! the region is ever held across a validation step: callers snapshot first
//! and validate the copy.

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::AtomicU32;

use memmap2::MmapRaw;

use crate::error::{RelayError, Result};

/// Marker for types that can be copied raw in and out of the region
///
/// # Safety
///
/// Implementors must be `#[repr(C)]`, contain no padding-sensitive invariants
/// and be valid for any bit pattern. Every field is re-validated after the
/// snapshot, so a torn or hostile value can never cause more than a rejected
/// message.
pub unsafe trait ShmPod: Copy {}

unsafe impl ShmPod for u32 {}
unsafe impl ShmPod for u64 {}

enum Backing {
    Mmap(MmapRaw),
    Anon {
        ptr: *mut u8,
        layout: std::alloc::Layout,
    },
}

/// A shared memory region of fixed size
///
/// Cloneable only through `Arc`; the producer and consumer sides hold the
/// same region and touch disjoint fields, synchronizing exclusively through
/// the atomics exposed here.
pub struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    backing: Backing,
}

// The region is raw shared memory; all cross-thread coordination goes
// through the atomic accessors.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create (or truncate) a region file of `len` bytes and map it
    pub fn create_file<P: AsRef<Path>>(path: P, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;
        file.set_len(len as u64)?;
        let map = MmapRaw::map_raw(&file)?;
        Ok(Self {
            ptr: map.as_mut_ptr(),
            len,
            backing: Backing::Mmap(map),
        })
    }

    /// Map an existing region file at its current size
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path.as_ref())?;
        let len = file.metadata()?.len() as usize;
        let map = MmapRaw::map_raw(&file)?;
        Ok(Self {
            ptr: map.as_mut_ptr(),
            len,
            backing: Backing::Mmap(map),
        })
    }

    /// Allocate an anonymous zeroed region (loopback mode and tests)
    pub fn anon(len: usize) -> Self {
        let layout = std::alloc::Layout::from_size_align(len.max(1), 8)
            .expect("region layout");
        // Zeroed so a fresh region never parses as a valid header.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "region allocation failed");
        Self {
            ptr,
            len,
            backing: Backing::Anon { ptr, layout },
        }
    }

    /// Total size of the region in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    fn check(&self, offset: usize, len: usize) -> Result<()> {
        if offset.checked_add(len).map_or(true, |end| end > self.len) {
            return Err(RelayError::OutOfBounds {
                offset,
                len,
                size: self.len,
            });
        }
        Ok(())
    }

    /// Validate that a byte range lies inside the region
    pub fn check_range(&self, offset: usize, len: usize) -> Result<()> {
        self.check(offset, len)
    }

    /// Copy bytes out of the region
    pub fn read_bytes(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.check(offset, dst.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(self.ptr.add(offset), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy bytes into the region
    pub fn write_bytes(&self, offset: usize, src: &[u8]) -> Result<()> {
        self.check(offset, src.len())?;
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.ptr.add(offset), src.len());
        }
        Ok(())
    }

    /// Snapshot a plain-old-data value out of the region
    ///
    /// This is the copy-before-validate primitive: the returned value is a
    /// local copy the peer can no longer touch.
    pub fn read_pod<T: ShmPod>(&self, offset: usize) -> Result<T> {
        self.check(offset, std::mem::size_of::<T>())?;
        Ok(unsafe { self.ptr.add(offset).cast::<T>().read_unaligned() })
    }

    /// Write a plain-old-data value into the region
    pub fn write_pod<T: ShmPod>(&self, offset: usize, value: T) -> Result<()> {
        self.check(offset, std::mem::size_of::<T>())?;
        unsafe {
            self.ptr.add(offset).cast::<T>().write_unaligned(value);
        }
        Ok(())
    }

    /// A word-aligned atomic view into the region
    ///
    /// These words are the only cross-process synchronization primitive:
    /// handshake flags, queue positions and the subscriber word.
    pub fn atomic_u32(&self, offset: usize) -> Result<&AtomicU32> {
        self.check(offset, 4)?;
        if offset % 4 != 0 {
            return Err(RelayError::OutOfBounds {
                offset,
                len: 4,
                size: self.len,
            });
        }
        Ok(unsafe { &*self.ptr.add(offset).cast::<AtomicU32>() })
    }

    /// Borrow a payload range for zero-copy handoff to the render backend
    ///
    /// The producer keeps the slot out of rotation while the consumer holds
    /// this; a misbehaving peer can at worst deliver garbage pixels, which
    /// the descriptor validation has already bounded.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts(self.ptr.add(offset), len) })
    }

    /// Borrow a mutable payload range (producer side only)
    ///
    /// Producer and consumer touch disjoint ranges by construction of the
    /// region layout; this is never handed out for a slot that is visible
    /// to the consumer queue.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn slice_mut(&self, offset: usize, len: usize) -> Result<&mut [u8]> {
        self.check(offset, len)?;
        Ok(unsafe { std::slice::from_raw_parts_mut(self.ptr.add(offset), len) })
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        if let Backing::Anon { ptr, layout } = &self.backing {
            unsafe { std::alloc::dealloc(*ptr, *layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_anon_region_zeroed() {
        let region = SharedRegion::anon(4096);
        let mut buf = [0xffu8; 16];
        region.read_bytes(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
    }

    #[test]
    fn test_read_write_roundtrip() {
        let region = SharedRegion::anon(256);
        region.write_bytes(10, b"framerelay").unwrap();
        let mut buf = [0u8; 10];
        region.read_bytes(10, &mut buf).unwrap();
        assert_eq!(&buf, b"framerelay");
    }

    #[test]
    fn test_pod_roundtrip_unaligned() {
        let region = SharedRegion::anon(64);
        region.write_pod::<u64>(3, 0xdead_beef_cafe_f00d).unwrap();
        assert_eq!(region.read_pod::<u64>(3).unwrap(), 0xdead_beef_cafe_f00d);
    }

    #[test]
    fn test_bounds_rejected() {
        let region = SharedRegion::anon(32);
        assert!(region.read_pod::<u64>(28).is_err());
        assert!(region.slice(16, 17).is_err());
        assert!(region.write_bytes(usize::MAX, &[0]).is_err());
    }

    #[test]
    fn test_atomic_alignment_enforced() {
        let region = SharedRegion::anon(32);
        assert!(region.atomic_u32(2).is_err());
        let word = region.atomic_u32(8).unwrap();
        word.store(7, Ordering::Release);
        assert_eq!(region.read_pod::<u32>(8).unwrap(), 7);
    }

    #[test]
    fn test_file_backed_region() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        {
            let region = SharedRegion::create_file(&path, 8192).unwrap();
            region.write_bytes(100, b"persisted").unwrap();
        }
        let region = SharedRegion::open_file(&path).unwrap();
        assert_eq!(region.len(), 8192);
        let mut buf = [0u8; 9];
        region.read_bytes(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persisted");
    }
}
