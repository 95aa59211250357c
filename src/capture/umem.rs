//! UMEM: the userspace memory region shared with the kernel for the
//! mmap-ring backend's zero-copy path.
//!
//! The region is partitioned into fixed-size, power-of-two chunks. Packets
//! that borrow a chunk return its address through a recycler channel when
//! their last owner drops; the capture loop republishes recycled addresses
//! to the fill ring. A chunk is never reused while a packet still
//! references it.

use crate::{Error, Result};
use crossbeam_channel::Sender;
use std::ptr;
use std::sync::Arc;

/// Contiguous, page-aligned, pre-populated anonymous mapping.
pub struct UmemRegion {
    base: *mut u8,
    len: usize,
    chunk_size: usize,
    chunk_count: usize,
}

unsafe impl Send for UmemRegion {}
unsafe impl Sync for UmemRegion {}

impl UmemRegion {
    /// Allocates `chunk_count` chunks of `chunk_size` bytes, rounded up to
    /// whole pages. `chunk_size` must be a power of two (ring descriptor
    /// addresses are masked back to their chunk base).
    pub fn allocate(chunk_count: usize, chunk_size: usize) -> Result<Self> {
        if chunk_count == 0 || chunk_size == 0 {
            return Err(Error::InvalidArgument("UMEM dimensions must be nonzero".into()));
        }
        if !chunk_size.is_power_of_two() {
            return Err(Error::InvalidArgument(format!(
                "UMEM chunk size {chunk_size} is not a power of two"
            )));
        }

        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (chunk_count * chunk_size + page - 1) & !(page - 1);

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::InitializationFailed(format!(
                "allocating UMEM ({len} bytes): {}",
                std::io::Error::last_os_error()
            )));
        }

        Ok(Self {
            base: base as *mut u8,
            len,
            chunk_size,
            chunk_count,
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    /// UMEM-relative address of chunk `index`.
    pub fn chunk_addr(&self, index: usize) -> u64 {
        debug_assert!(index < self.chunk_count);
        (index * self.chunk_size) as u64
    }

    /// Masks a descriptor address back to the base of its chunk.
    pub fn chunk_base(&self, addr: u64) -> u64 {
        addr & !(self.chunk_size as u64 - 1)
    }

    /// Borrows `len` bytes at UMEM-relative `addr`. Returns an empty slice
    /// for out-of-range requests rather than reading past the region.
    pub fn slice(&self, addr: u64, len: u32) -> &[u8] {
        let addr = addr as usize;
        let len = len as usize;
        if addr.checked_add(len).map(|end| end <= self.len) != Some(true) {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.base.add(addr), len) }
    }

    /// Mutable view of one chunk, for tests and TX staging.
    ///
    /// # Safety
    /// The caller must be the only writer of the chunk.
    pub unsafe fn chunk_mut(&self, index: usize) -> &mut [u8] {
        let offset = index * self.chunk_size;
        std::slice::from_raw_parts_mut(self.base.add(offset), self.chunk_size)
    }
}

impl Drop for UmemRegion {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let ret = unsafe { libc::munmap(self.base as *mut _, self.len) };
            if ret != 0 {
                tracing::warn!("unmapping UMEM failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

/// A borrowed view of one received frame inside UMEM. Dropping the last
/// clone of the owning packet sends the chunk address to the recycler.
pub struct UmemSlice {
    region: Arc<UmemRegion>,
    addr: u64,
    len: u32,
    recycler: Sender<u64>,
}

impl UmemSlice {
    pub fn new(region: Arc<UmemRegion>, addr: u64, len: u32, recycler: Sender<u64>) -> Self {
        Self {
            region,
            addr,
            len,
            recycler,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.region.slice(self.addr, self.len)
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }
}

impl Drop for UmemSlice {
    fn drop(&mut self) {
        // The loop side may already be gone during teardown; losing the
        // address then is fine, the region itself is being unmapped.
        let _ = self.recycler.try_send(self.region.chunk_base(self.addr));
    }
}
