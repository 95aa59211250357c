//! Kernel-shared descriptor rings for the mmap-ring backend.
//!
//! Each ring is a single-producer/single-consumer queue of descriptors
//! with free-running producer and consumer indices over a power-of-two
//! size. The producer publishes a descriptor before advancing its index
//! (release store); the consumer reads the peer index with an acquire
//! load before touching descriptors. Index arithmetic is modulo ring
//! size; the producer never laps the consumer.
//!
//! Ring ABI constants mirror the kernel's published values, the same way
//! the original AF_XDP ecosystem code carries them when the libc shims
//! lag behind.

use crate::{Error, Result};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicU32, Ordering};

pub const AF_XDP: libc::c_int = 44;
pub const SOL_XDP: libc::c_int = 283;

pub const XDP_MMAP_OFFSETS: libc::c_int = 1;
pub const XDP_RX_RING: libc::c_int = 2;
pub const XDP_TX_RING: libc::c_int = 3;
pub const XDP_UMEM_REG: libc::c_int = 4;
pub const XDP_UMEM_FILL_RING: libc::c_int = 5;
pub const XDP_UMEM_COMPLETION_RING: libc::c_int = 6;

/// Fixed page offsets of the four rings in the socket's mmap space. The
/// TX and UMEM rings carry high bits the kernel dictates.
pub const XDP_PGOFF_RX_RING: i64 = 0;
pub const XDP_PGOFF_TX_RING: i64 = 0x8000_0000;
pub const XDP_UMEM_PGOFF_FILL_RING: i64 = 0x1_0000_0000;
pub const XDP_UMEM_PGOFF_COMPLETION_RING: i64 = 0x1_8000_0000;

/// RX/TX descriptor: an address into UMEM plus the frame length.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XdpDesc {
    pub addr: u64,
    pub len: u32,
    pub options: u32,
}

/// UMEM registration argument for `XDP_UMEM_REG`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XdpUmemReg {
    pub addr: u64,
    pub len: u64,
    pub chunk_size: u32,
    pub headroom: u32,
    pub flags: u32,
}

/// Offsets of one ring's producer index, consumer index and descriptor
/// array inside its mapping.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XdpRingOffset {
    pub producer: u64,
    pub consumer: u64,
    pub desc: u64,
    pub flags: u64,
}

/// `XDP_MMAP_OFFSETS` result: rx, tx, fill, completion.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct XdpMmapOffsets {
    pub rx: XdpRingOffset,
    pub tx: XdpRingOffset,
    pub fr: XdpRingOffset,
    pub cr: XdpRingOffset,
}

/// `bind` address for an AF_XDP socket.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockaddrXdp {
    pub sxdp_family: u16,
    pub sxdp_flags: u16,
    pub sxdp_ifindex: u32,
    pub sxdp_queue_id: u32,
    pub sxdp_shared_umem_fd: u32,
}

enum Backing {
    /// Socket-owned mapping, unmapped on drop.
    Kernel { map: *mut u8, len: usize },
    /// Heap memory laid out like a kernel ring, for unit tests and
    /// loopback use. Backed by u64 words to keep descriptors aligned.
    Heap { _buf: Box<[u64]> },
}

/// One mapped ring: raw index pointers plus the descriptor array.
pub struct RingMem<T: Copy> {
    backing: Backing,
    producer: *mut u32,
    consumer: *mut u32,
    desc: *mut T,
    size: u32,
}

unsafe impl<T: Copy + Send> Send for RingMem<T> {}

impl<T: Copy + Default> RingMem<T> {
    /// Maps one ring of the socket at `page_offset`.
    pub fn map(fd: RawFd, page_offset: i64, offsets: XdpRingOffset, entries: u32) -> Result<Self> {
        debug_assert!(entries.is_power_of_two());
        let len = offsets.desc as usize + entries as usize * std::mem::size_of::<T>();
        let map = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_POPULATE,
                fd,
                page_offset,
            )
        };
        if map == libc::MAP_FAILED {
            return Err(Error::InitializationFailed(format!(
                "mapping ring at page offset {page_offset:#x}: {}",
                std::io::Error::last_os_error()
            )));
        }
        let base = map as *mut u8;
        Ok(Self {
            producer: unsafe { base.add(offsets.producer as usize) } as *mut u32,
            consumer: unsafe { base.add(offsets.consumer as usize) } as *mut u32,
            desc: unsafe { base.add(offsets.desc as usize) } as *mut T,
            size: entries,
            backing: Backing::Kernel { map: base, len },
        })
    }

    /// Heap-backed ring with the kernel layout. Used by unit tests and
    /// the loopback driver.
    pub fn heap(entries: u32) -> Self {
        assert!(entries.is_power_of_two());
        assert!(std::mem::align_of::<T>() <= 8);
        let header = 16usize;
        let len = header + entries as usize * std::mem::size_of::<T>();
        let buf = vec![0u64; len.div_ceil(8)].into_boxed_slice();
        let base = buf.as_ptr() as *mut u8;
        Self {
            producer: base as *mut u32,
            consumer: unsafe { base.add(std::mem::size_of::<u32>()) } as *mut u32,
            desc: unsafe { base.add(header) } as *mut T,
            size: entries,
            backing: Backing::Heap { _buf: buf },
        }
    }

    fn producer_idx(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.producer) }
    }

    fn consumer_idx(&self) -> &AtomicU32 {
        unsafe { AtomicU32::from_ptr(self.consumer) }
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

impl<T: Copy> Drop for RingMem<T> {
    fn drop(&mut self) {
        if let Backing::Kernel { map, len } = self.backing {
            let ret = unsafe { libc::munmap(map as *mut _, len) };
            if ret != 0 {
                tracing::warn!("unmapping ring failed: {}", std::io::Error::last_os_error());
            }
        }
    }
}

/// Userspace-producer ring (Fill, TX).
pub struct ProducerRing<T: Copy>(pub RingMem<T>);

impl<T: Copy + Default> ProducerRing<T> {
    /// Publishes one descriptor. Returns false when the ring is full.
    pub fn push(&mut self, value: T) -> bool {
        let ring = &self.0;
        let prod = ring.producer_idx().load(Ordering::Relaxed);
        let cons = ring.consumer_idx().load(Ordering::Acquire);
        if prod.wrapping_sub(cons) >= ring.size {
            return false;
        }
        unsafe {
            *ring.desc.add((prod & (ring.size - 1)) as usize) = value;
        }
        ring.producer_idx().store(prod.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn free_entries(&self) -> u32 {
        let ring = &self.0;
        let prod = ring.producer_idx().load(Ordering::Relaxed);
        let cons = ring.consumer_idx().load(Ordering::Acquire);
        ring.size - prod.wrapping_sub(cons)
    }
}

/// Userspace-consumer ring (RX, Completion).
pub struct ConsumerRing<T: Copy>(pub RingMem<T>);

impl<T: Copy + Default> ConsumerRing<T> {
    /// Takes one descriptor, if the peer has published any.
    pub fn pop(&mut self) -> Option<T> {
        let ring = &self.0;
        let cons = ring.consumer_idx().load(Ordering::Relaxed);
        let prod = ring.producer_idx().load(Ordering::Acquire);
        if cons == prod {
            return None;
        }
        let value = unsafe { *ring.desc.add((cons & (ring.size - 1)) as usize) };
        ring.consumer_idx().store(cons.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    pub fn pending(&self) -> u32 {
        let ring = &self.0;
        let prod = ring.producer_idx().load(Ordering::Acquire);
        let cons = ring.consumer_idx().load(Ordering::Relaxed);
        prod.wrapping_sub(cons)
    }
}

/// Pairs a heap ring's two ends for loopback use: what one side produces
/// the other consumes through the same memory.
#[cfg(test)]
pub fn heap_pair<T: Copy + Default>(entries: u32) -> (ProducerRing<T>, ConsumerRing<T>) {
    let mem = RingMem::heap(entries);
    // Alias the same ring memory for both ends. The backing box lives in
    // the producer half; the consumer half must not outlive it.
    let alias = RingMem {
        producer: mem.producer,
        consumer: mem.consumer,
        desc: mem.desc,
        size: mem.size,
        backing: Backing::Heap {
            _buf: Vec::new().into_boxed_slice(),
        },
    };
    (ProducerRing(mem), ConsumerRing(alias))
}
