//! Virtual poll-mode drivers.
//!
//! `net_null` produces zeroed frames, `net_ring` is an in-memory loopback
//! with an injection handle, `net_pcap` replays a capture file, and
//! `net_tap`/`net_tun` open a kernel tap/tun device (privileged). The
//! remaining kinds are accepted by name for compatibility but map onto
//! the loopback driver.

use super::mbuf::{Mbuf, MbufPool};
use super::Pmd;
use crate::{Error, Result};
use pcap_parser::traits::PcapReaderIterator;
use pcap_parser::{LegacyPcapReader, PcapBlockOwned, PcapError};
use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::fs::File;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, OnceLock};
use tracing::{debug, warn};

/// Synthetic device kinds the framework accepts.
pub const SUPPORTED_KINDS: [&str; 8] = [
    "net_tap",
    "net_tun",
    "net_pcap",
    "net_null",
    "net_ring",
    "net_vdev",
    "net_af_packet",
    "net_af_xdp",
];

/// Parsed `--vdev` expression: `net_pcap0,path=/tmp/x.pcap,loop=1`.
#[derive(Debug, Clone)]
pub struct VdevSpec {
    /// Device kind, e.g. `net_null`.
    pub kind: String,
    /// Full instance name, e.g. `net_null0`.
    pub name: String,
    pub params: HashMap<String, String>,
}

impl VdevSpec {
    pub fn parse(expr: &str) -> Result<Self> {
        let mut parts = expr.split(',');
        let name = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidArgument("empty vdev expression".into()))?
            .to_string();

        let kind = name.trim_end_matches(|c: char| c.is_ascii_digit()).to_string();
        if !SUPPORTED_KINDS.contains(&kind.as_str()) {
            return Err(Error::InvalidArgument(format!("unsupported device kind {kind}")));
        }

        let mut params = HashMap::new();
        for part in parts {
            match part.split_once('=') {
                Some((key, value)) => {
                    params.insert(key.to_string(), value.to_string());
                }
                None => {
                    return Err(Error::InvalidArgument(format!("bad vdev parameter {part:?}")));
                }
            }
        }
        Ok(Self { kind, name, params })
    }
}

/// Builds the driver for a parsed spec.
pub fn create_driver(spec: &VdevSpec) -> Result<Box<dyn Pmd>> {
    match spec.kind.as_str() {
        "net_null" => Ok(Box::new(NullPmd {
            frame_len: spec
                .params
                .get("size")
                .and_then(|s| s.parse().ok())
                .unwrap_or(64),
        })),
        "net_pcap" => {
            let path = spec
                .params
                .get("path")
                .or_else(|| spec.params.get("rx_pcap"))
                .ok_or_else(|| {
                    Error::InvalidArgument("net_pcap needs a path=<file> parameter".into())
                })?;
            let packets = load_pcap(path)?;
            Ok(Box::new(PcapPmd {
                packets,
                cursor: 0,
                repeat: spec.params.get("loop").map(|v| v == "1").unwrap_or(false),
            }))
        }
        "net_tap" | "net_tun" => Ok(Box::new(TapPmd {
            device_name: spec
                .params
                .get("iface")
                .cloned()
                .unwrap_or_else(|| spec.name.clone()),
            tun: spec.kind == "net_tun",
            fd: -1,
        })),
        // Loopback semantics for the ring kind and the compatibility
        // aliases.
        _ => Ok(Box::new(RingPmd {
            queue: ring_queue(&spec.name),
            name: spec.name.clone(),
        })),
    }
}

/// Generates zero-filled frames on every burst, like a null device.
struct NullPmd {
    frame_len: usize,
}

impl Pmd for NullPmd {
    fn kind(&self) -> &'static str {
        "net_null"
    }

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn stop(&mut self) {}

    fn rx_burst(&mut self, pool: &Arc<MbufPool>, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut produced = 0;
        for _ in 0..max {
            match pool.alloc(0) {
                Some(mut mbuf) => {
                    mbuf.fill_zeroed(self.frame_len);
                    out.push(mbuf);
                    produced += 1;
                }
                None => break,
            }
        }
        produced
    }
}

type SharedQueue = Arc<Mutex<VecDeque<Vec<u8>>>>;

fn ring_registry() -> &'static Mutex<HashMap<String, SharedQueue>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, SharedQueue>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

fn ring_queue(name: &str) -> SharedQueue {
    ring_registry()
        .lock()
        .unwrap()
        .entry(name.to_string())
        .or_default()
        .clone()
}

/// Test/teardown hook: forgets per-device driver state.
pub(super) fn release_driver_state(name: &str) {
    ring_registry().lock().unwrap().remove(name);
}

/// Handle for feeding frames into a `net_ring` device from outside.
#[derive(Clone)]
pub struct RingInjector {
    queue: SharedQueue,
}

impl RingInjector {
    pub fn inject(&self, frame: &[u8]) {
        self.queue.lock().unwrap().push_back(frame.to_vec());
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

/// Injection handle for an existing `net_ring` device.
pub fn ring_injector(name: &str) -> RingInjector {
    RingInjector {
        queue: ring_queue(name),
    }
}

/// In-memory loopback: RX pops what was injected or transmitted.
struct RingPmd {
    queue: SharedQueue,
    name: String,
}

impl Pmd for RingPmd {
    fn kind(&self) -> &'static str {
        "net_ring"
    }

    fn start(&mut self) -> Result<()> {
        debug!(device = %self.name, "ring device started");
        Ok(())
    }

    fn stop(&mut self) {}

    fn rx_burst(&mut self, pool: &Arc<MbufPool>, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let mut produced = 0;
        while produced < max {
            let Some(frame) = queue.pop_front() else { break };
            match pool.alloc(0) {
                Some(mut mbuf) => {
                    mbuf.fill(&frame);
                    out.push(mbuf);
                    produced += 1;
                }
                None => {
                    queue.push_front(frame);
                    break;
                }
            }
        }
        produced
    }

    fn tx_burst(&mut self, frames: Vec<Mbuf>) -> usize {
        let mut queue = self.queue.lock().unwrap();
        let n = frames.len();
        for frame in frames {
            queue.push_back(frame.as_bytes().to_vec());
        }
        n
    }
}

/// Replays the packets of a legacy pcap file.
struct PcapPmd {
    packets: Vec<Vec<u8>>,
    cursor: usize,
    repeat: bool,
}

impl Pmd for PcapPmd {
    fn kind(&self) -> &'static str {
        "net_pcap"
    }

    fn start(&mut self) -> Result<()> {
        self.cursor = 0;
        Ok(())
    }

    fn stop(&mut self) {}

    fn rx_burst(&mut self, pool: &Arc<MbufPool>, out: &mut Vec<Mbuf>, max: usize) -> usize {
        let mut produced = 0;
        while produced < max {
            if self.cursor >= self.packets.len() {
                if self.repeat && !self.packets.is_empty() {
                    self.cursor = 0;
                } else {
                    break;
                }
            }
            match pool.alloc(0) {
                Some(mut mbuf) => {
                    mbuf.fill(&self.packets[self.cursor]);
                    self.cursor += 1;
                    out.push(mbuf);
                    produced += 1;
                }
                None => break,
            }
        }
        produced
    }
}

fn load_pcap(path: &str) -> Result<Vec<Vec<u8>>> {
    let file = File::open(path).map_err(|e| Error::from_os("opening pcap file", e))?;
    let mut reader = LegacyPcapReader::new(65536, file)
        .map_err(|e| Error::InvalidArgument(format!("reading pcap header: {e:?}")))?;

    let mut packets = Vec::new();
    loop {
        match reader.next() {
            Ok((offset, block)) => {
                if let PcapBlockOwned::Legacy(record) = block {
                    packets.push(record.data.to_vec());
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete(_)) => {
                reader
                    .refill()
                    .map_err(|e| Error::InvalidArgument(format!("truncated pcap file: {e:?}")))?;
            }
            Err(e) => {
                return Err(Error::InvalidArgument(format!("malformed pcap file: {e:?}")));
            }
        }
    }
    debug!(path, count = packets.len(), "pcap replay source loaded");
    Ok(packets)
}

/// Kernel tap/tun device. Opening requires CAP_NET_ADMIN.
struct TapPmd {
    device_name: String,
    tun: bool,
    fd: RawFd,
}

impl Pmd for TapPmd {
    fn kind(&self) -> &'static str {
        "net_tap"
    }

    fn start(&mut self) -> Result<()> {
        let path = CString::new("/dev/net/tun").expect("static path");
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_NONBLOCK) };
        if fd < 0 {
            return Err(Error::last_os("opening /dev/net/tun"));
        }

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        let mut flags = if self.tun { libc::IFF_TUN } else { libc::IFF_TAP };
        flags |= libc::IFF_NO_PI;
        ifr.ifr_ifru.ifru_flags = flags as libc::c_short;
        let name = CString::new(self.device_name.clone())
            .map_err(|_| Error::InvalidArgument("device name contains NUL".into()))?;
        let bytes = name.as_bytes_with_nul();
        if bytes.len() > ifr.ifr_name.len() {
            unsafe { libc::close(fd) };
            return Err(Error::InvalidArgument("device name too long".into()));
        }
        for (dst, &src) in ifr.ifr_name.iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }

        let ret = unsafe { libc::ioctl(fd, libc::TUNSETIFF, &ifr) };
        if ret < 0 {
            let err = Error::last_os("TUNSETIFF");
            unsafe { libc::close(fd) };
            return Err(err);
        }

        debug!(device = %self.device_name, tun = self.tun, "tap device opened");
        self.fd = fd;
        Ok(())
    }

    fn stop(&mut self) {
        if self.fd >= 0 {
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }

    fn rx_burst(&mut self, pool: &Arc<MbufPool>, out: &mut Vec<Mbuf>, max: usize) -> usize {
        if self.fd < 0 {
            return 0;
        }
        let mut scratch = [0u8; 65536];
        let mut produced = 0;
        while produced < max {
            let n = unsafe {
                libc::read(self.fd, scratch.as_mut_ptr() as *mut _, scratch.len())
            };
            if n <= 0 {
                break;
            }
            match pool.alloc(0) {
                Some(mut mbuf) => {
                    mbuf.fill(&scratch[..n as usize]);
                    out.push(mbuf);
                    produced += 1;
                }
                None => break,
            }
        }
        produced
    }
}

impl Drop for TapPmd {
    fn drop(&mut self) {
        if self.fd >= 0 {
            warn!(device = %self.device_name, "tap device still open at drop");
            self.stop();
        }
    }
}
