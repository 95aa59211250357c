//! Mbuf pools: fixed-size packet buffers carved out of one hugepage-backed
//! region, recycled through a free list. An `Mbuf` returns itself to its
//! pool when dropped.

use crate::{Error, Result};
use std::ptr;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// One mapped region, hugepage-backed when the system allows it.
struct Region {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    fn allocate(len: usize) -> Result<Self> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = (len + page - 1) & !(page - 1);

        // Prefer hugepages; fall back to regular pages when the pool is
        // unavailable.
        let mut base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            base = unsafe {
                libc::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if base == libc::MAP_FAILED {
                return Err(Error::InitializationFailed(format!(
                    "allocating mbuf region ({len} bytes): {}",
                    std::io::Error::last_os_error()
                )));
            }
            debug!(bytes = len, "mbuf region on regular pages (no hugepages)");
        }

        Ok(Self {
            base: base as *mut u8,
            len,
        })
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        if !self.base.is_null() {
            let ret = unsafe { libc::munmap(self.base as *mut _, self.len) };
            if ret != 0 {
                warn!("unmapping mbuf region failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

/// Pool of `count` buffers of `buf_size` bytes on one NUMA socket.
pub struct MbufPool {
    name: String,
    region: Region,
    buf_size: usize,
    count: usize,
    socket_id: u32,
    free: Mutex<Vec<u32>>,
}

impl MbufPool {
    pub fn create(name: &str, count: usize, buf_size: usize, socket_id: u32) -> Result<Arc<Self>> {
        if count == 0 || buf_size == 0 {
            return Err(Error::InvalidArgument("mbuf pool dimensions must be nonzero".into()));
        }
        let region = Region::allocate(count * buf_size)?;
        let free = (0..count as u32).rev().collect();
        debug!(name, count, buf_size, socket_id, "mbuf pool created");
        Ok(Arc::new(Self {
            name: name.to_string(),
            region,
            buf_size,
            count,
            socket_id,
            free: Mutex::new(free),
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn capacity(&self) -> usize {
        self.count
    }

    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn available(&self) -> usize {
        self.free.lock().unwrap().len()
    }

    /// Takes one buffer; `None` when the pool is exhausted.
    pub fn alloc(self: &Arc<Self>, len: usize) -> Option<Mbuf> {
        if len > self.buf_size {
            return None;
        }
        let index = self.free.lock().unwrap().pop()?;
        Some(Mbuf {
            pool: self.clone(),
            index,
            len,
        })
    }

    fn buf_ptr(&self, index: u32) -> *mut u8 {
        debug_assert!((index as usize) < self.count);
        unsafe { self.region.base.add(index as usize * self.buf_size) }
    }

    fn reclaim(&self, index: u32) {
        self.free.lock().unwrap().push(index);
    }
}

/// One packet buffer borrowed from a pool. Dropping returns it.
pub struct Mbuf {
    pool: Arc<MbufPool>,
    index: u32,
    len: usize,
}

impl Mbuf {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.pool.buf_ptr(self.index), self.len) }
    }

    /// Copies `data` into the buffer and sets the frame length.
    pub fn fill(&mut self, data: &[u8]) {
        let len = data.len().min(self.pool.buf_size);
        unsafe {
            ptr::copy_nonoverlapping(data.as_ptr(), self.pool.buf_ptr(self.index), len);
        }
        self.len = len;
    }

    /// Zeroes `len` bytes of the buffer.
    pub fn fill_zeroed(&mut self, len: usize) {
        let len = len.min(self.pool.buf_size);
        unsafe {
            ptr::write_bytes(self.pool.buf_ptr(self.index), 0, len);
        }
        self.len = len;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.pool.buf_size
    }
}

impl Drop for Mbuf {
    fn drop(&mut self) {
        self.pool.reclaim(self.index);
    }
}

/// NUMA-tagged memory returned by the framework allocator; used for DMA
/// buffer sets by the poll-mode backends.
pub struct SocketMemory {
    name: String,
    region: Region,
    socket_id: u32,
}

impl SocketMemory {
    pub(super) fn allocate(name: &str, bytes: usize, socket_id: u32) -> Result<Self> {
        if bytes == 0 {
            return Err(Error::InvalidArgument("allocation size must be nonzero".into()));
        }
        let region = Region::allocate(bytes)?;
        debug!(name, bytes, socket_id, "socket memory allocated");
        Ok(Self {
            name: name.to_string(),
            region,
            socket_id,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.region.len
    }

    pub fn is_empty(&self) -> bool {
        self.region.len == 0
    }

    pub fn socket_id(&self) -> u32 {
        self.socket_id
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.region.base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_alloc_and_reclaim() {
        let pool = MbufPool::create("t1", 4, 2048, 0).unwrap();
        assert_eq!(pool.available(), 4);

        let mut held = Vec::new();
        for _ in 0..4 {
            held.push(pool.alloc(64).unwrap());
        }
        assert!(pool.alloc(64).is_none(), "pool exhausted");

        held.clear();
        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_mbuf_fill_and_read() {
        let pool = MbufPool::create("t2", 2, 256, 0).unwrap();
        let mut mbuf = pool.alloc(0).unwrap();
        mbuf.fill(b"hello frame");
        assert_eq!(mbuf.as_bytes(), b"hello frame");
        assert_eq!(mbuf.len(), 11);
        assert_eq!(mbuf.capacity(), 256);
    }

    #[test]
    fn test_fill_clamps_to_capacity() {
        let pool = MbufPool::create("t3", 1, 16, 0).unwrap();
        let mut mbuf = pool.alloc(0).unwrap();
        mbuf.fill(&[7u8; 64]);
        assert_eq!(mbuf.len(), 16);
    }

    #[test]
    fn test_alloc_longer_than_buf_refused() {
        let pool = MbufPool::create("t4", 1, 64, 0).unwrap();
        assert!(pool.alloc(65).is_none());
        assert!(pool.alloc(64).is_some());
    }

    #[test]
    fn test_socket_memory() {
        let memory = SocketMemory::allocate("dma", 8192, 0).unwrap();
        assert!(memory.len() >= 8192);
        assert_eq!(memory.socket_id(), 0);
        assert!(!memory.as_ptr().is_null());
    }
}
