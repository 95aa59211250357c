//! Pinned DMA buffer set shared by the backends.
//!
//! Either the set is absent (null base, zero count, closed fd) or every
//! field is coherent; transitions happen only while the owning backend is
//! not running. Freeing is the strict inverse of allocation; failures on
//! the free path are logged and never block teardown.

use crate::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::ptr;
use tracing::{info, warn};

const DEFAULT_BUFFER_SIZE: usize = 2048;

pub struct DmaBuffers {
    access_enabled: bool,
    device: String,
    buffer_size: usize,
    base: *mut libc::c_void,
    count: usize,
    fd: RawFd,
}

// The mapping is owned exclusively by this struct; mutation goes through
// &mut self.
unsafe impl Send for DmaBuffers {}
unsafe impl Sync for DmaBuffers {}

impl Default for DmaBuffers {
    fn default() -> Self {
        Self::new()
    }
}

impl DmaBuffers {
    pub fn new() -> Self {
        Self {
            access_enabled: false,
            device: String::new(),
            buffer_size: 0,
            base: ptr::null_mut(),
            count: 0,
            fd: -1,
        }
    }

    pub fn is_access_enabled(&self) -> bool {
        self.access_enabled
    }

    pub fn is_allocated(&self) -> bool {
        !self.base.is_null()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn set_access(&mut self, enabled: bool, device: &str) {
        if enabled && !device.is_empty() {
            self.device = device.to_string();
            self.access_enabled = true;
            info!(device, "DMA access enabled");
        } else {
            self.access_enabled = false;
            self.device.clear();
            info!("DMA access disabled");
        }
    }

    pub fn set_buffer_size(&mut self, size: usize) {
        if size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
            info!(bytes = self.buffer_size, "DMA buffer size set to auto");
        } else {
            self.buffer_size = size;
            info!(bytes = size, "DMA buffer size set");
        }
    }

    /// Maps `count` pinned buffers, backed by the configured device or an
    /// anonymous region when none is set.
    pub fn allocate(&mut self, count: usize) -> Result<()> {
        if !self.access_enabled {
            return Err(Error::InvalidArgument("DMA access not enabled".into()));
        }
        if self.is_allocated() {
            return Err(Error::InvalidArgument("DMA buffers already allocated".into()));
        }
        if count == 0 {
            return Err(Error::InvalidArgument("DMA buffer count must be nonzero".into()));
        }
        if self.buffer_size == 0 {
            self.buffer_size = DEFAULT_BUFFER_SIZE;
        }

        let total = count * self.buffer_size;
        let mut flags = libc::MAP_SHARED | libc::MAP_LOCKED;
        let fd = if self.device.is_empty() {
            flags |= libc::MAP_ANONYMOUS;
            -1
        } else {
            let path = CString::new(self.device.clone())
                .map_err(|_| Error::InvalidArgument("device path contains NUL".into()))?;
            let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR) };
            if fd < 0 {
                return Err(Error::last_os("opening DMA device"));
            }
            fd
        };

        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                total,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                fd,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            if fd >= 0 {
                unsafe { libc::close(fd) };
            }
            return Err(Error::InitializationFailed(format!(
                "mapping DMA buffers: {}",
                std::io::Error::last_os_error()
            )));
        }

        self.base = base;
        self.count = count;
        self.fd = fd;
        info!(count, bytes = total, "DMA buffers allocated");
        Ok(())
    }

    /// Unmaps, closes and clears. Always leaves the set absent.
    pub fn free(&mut self) -> Result<()> {
        if !self.is_allocated() {
            return Ok(());
        }

        let total = self.count * self.buffer_size;
        let unmap = unsafe { libc::munmap(self.base, total) };
        if unmap < 0 {
            warn!("unmapping DMA buffers failed: {}", std::io::Error::last_os_error());
        }
        if self.fd >= 0 {
            let close = unsafe { libc::close(self.fd) };
            if close < 0 {
                warn!("closing DMA device failed: {}", std::io::Error::last_os_error());
            }
        }
        self.base = ptr::null_mut();
        self.count = 0;
        self.fd = -1;
        info!("DMA buffers freed");
        Ok(())
    }
}

impl Drop for DmaBuffers {
    fn drop(&mut self) {
        let _ = self.free();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_requires_access() {
        let mut dma = DmaBuffers::new();
        let err = dma.allocate(4).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::InvalidArgument);
    }

    #[test]
    fn test_anonymous_allocate_free_round_trip() {
        let mut dma = DmaBuffers::new();
        // Anonymous mapping path: enable access without a device by
        // toggling through set_access with a device then clearing it is
        // not possible, so drive the fields directly as a backend with no
        // device configured would.
        dma.access_enabled = true;
        dma.set_buffer_size(4096);

        // MAP_LOCKED can fail under restrictive RLIMIT_MEMLOCK; treat that
        // as an acceptable environment, not a code failure.
        match dma.allocate(4) {
            Ok(()) => {
                assert!(dma.is_allocated());
                assert_eq!(dma.count(), 4);
                dma.free().unwrap();
                assert!(!dma.is_allocated());
                assert_eq!(dma.count(), 0);
            }
            Err(e) => {
                assert_eq!(e.code(), crate::ErrorCode::InitializationFailed);
            }
        }
    }

    #[test]
    fn test_free_absent_set_is_noop() {
        let mut dma = DmaBuffers::new();
        assert!(dma.free().is_ok());
    }

    #[test]
    fn test_buffer_size_auto() {
        let mut dma = DmaBuffers::new();
        dma.set_buffer_size(0);
        assert_eq!(dma.buffer_size(), DEFAULT_BUFFER_SIZE);
        dma.set_buffer_size(8192);
        assert_eq!(dma.buffer_size(), 8192);
    }
}
