//! Captured packets: shared-ownership byte buffers plus decoded metadata.
//!
//! A `Packet` is immutable after publication and cheap to clone; clones are
//! independent observers of the same bytes. The drop action of the
//! underlying buffer is chosen by the backend that produced it: heap
//! buffers are freed, ring chunks go back to the fill queue, mbufs return
//! to their pool. The last owner's drop triggers exactly one reclamation.

use crate::capture::umem::UmemSlice;
use crate::decode;
use crate::pmd::mbuf::Mbuf;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Instant;

/// Per-packet metadata filled in by the backend RX decode step. Fields the
/// decode could not determine stay zeroed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub interface: String,
    pub source_mac: [u8; 6],
    pub destination_mac: [u8; 6],
    pub source_ip: IpAddr,
    pub destination_ip: IpAddr,
    pub source_port: u16,
    pub destination_port: u16,
    /// Transport protocol number (TCP=6, UDP=17, ...).
    pub protocol: u8,
    pub vlan_id: u16,
    pub is_ipv6: bool,
    pub is_fragment: bool,
    pub fragment_offset: u16,
    pub ttl: u8,
    pub tos: u8,
    pub flow_label: u32,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            interface: String::new(),
            source_mac: [0; 6],
            destination_mac: [0; 6],
            source_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            destination_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            source_port: 0,
            destination_port: 0,
            protocol: 0,
            vlan_id: 0,
            is_ipv6: false,
            is_fragment: false,
            fragment_offset: 0,
            ttl: 0,
            tos: 0,
            flow_label: 0,
        }
    }
}

/// Backing storage of a packet. The variant decides what happens when the
/// last shared owner drops.
pub enum PacketBuf {
    /// Owned heap bytes (kernel-copy backends).
    Heap(Box<[u8]>),
    /// Borrowed chunk of a shared ring memory region; drop recycles the
    /// chunk address to the fill queue.
    Umem(UmemSlice),
    /// Poll-mode buffer; drop returns it to its pool.
    Mbuf(Mbuf),
}

impl PacketBuf {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            PacketBuf::Heap(bytes) => bytes,
            PacketBuf::Umem(slice) => slice.as_bytes(),
            PacketBuf::Mbuf(mbuf) => mbuf.as_bytes(),
        }
    }
}

impl std::fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PacketBuf::Heap(b) => write!(f, "Heap({} bytes)", b.len()),
            PacketBuf::Umem(s) => write!(f, "Umem(addr={:#x})", s.addr()),
            PacketBuf::Mbuf(m) => write!(f, "Mbuf({} bytes)", m.as_bytes().len()),
        }
    }
}

/// One captured frame. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Arc<PacketBuf>,
    length: usize,
    timestamp: Instant,
    metadata: Arc<Metadata>,
}

impl Packet {
    pub fn new(buf: PacketBuf, length: usize, timestamp: Instant, metadata: Metadata) -> Self {
        let length = length.min(buf.as_bytes().len());
        Self {
            buf: Arc::new(buf),
            length,
            timestamp,
            metadata: Arc::new(metadata),
        }
    }

    /// Copies `bytes` into a fresh heap buffer and decodes its metadata.
    pub fn from_bytes(bytes: &[u8], interface: &str) -> Self {
        let metadata = decode::decode_metadata(bytes, interface);
        Self::new(
            PacketBuf::Heap(bytes.to_vec().into_boxed_slice()),
            bytes.len(),
            Instant::now(),
            metadata,
        )
    }

    pub fn data(&self) -> &[u8] {
        &self.buf.as_bytes()[..self.length]
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn has_protocol(&self, protocol: u8) -> bool {
        self.metadata.protocol == protocol
    }

    pub fn is_tcp(&self) -> bool {
        self.has_protocol(6)
    }

    pub fn is_udp(&self) -> bool {
        self.has_protocol(17)
    }

    pub fn is_icmp(&self) -> bool {
        self.has_protocol(1)
    }

    pub fn is_ipv6(&self) -> bool {
        self.metadata.is_ipv6
    }

    pub fn is_ipv4(&self) -> bool {
        !self.metadata.is_ipv6
    }

    /// First `bytes` bytes, clamped to the packet length.
    pub fn header(&self, bytes: usize) -> &[u8] {
        &self.data()[..bytes.min(self.length)]
    }

    /// Bytes after a header of `header_size`, empty when out of range.
    pub fn payload(&self, header_size: usize) -> &[u8] {
        if header_size >= self.length {
            &[]
        } else {
            &self.data()[header_size..]
        }
    }

    /// Classic 16-bytes-per-line hex dump with an ASCII gutter.
    pub fn hex_dump(&self) -> String {
        let data = self.data();
        let mut out = String::new();
        for (line, chunk) in data.chunks(16).enumerate() {
            out.push_str(&format!("{:08x}  ", line * 16));
            for i in 0..16 {
                match chunk.get(i) {
                    Some(b) => out.push_str(&format!("{b:02x} ")),
                    None => out.push_str("   "),
                }
                if i == 7 {
                    out.push(' ');
                }
            }
            out.push(' ');
            for &b in chunk {
                out.push(if (0x20..0x7f).contains(&b) { b as char } else { '.' });
            }
            out.push('\n');
        }
        out
    }
}
