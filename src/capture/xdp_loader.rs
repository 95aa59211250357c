//! In-kernel filter program loader for the mmap-ring backend.
//!
//! Drives one XDP program through `None -> Loaded -> Attached -> Detached
//! -> Unloaded`. Loading opens the object file, loads it into the kernel
//! and takes its redirect map; attaching puts it on the interface in
//! driver or skb/generic mode. Pinning the program and map under the BPF
//! filesystem is attempted but non-fatal, the objects stay live through
//! their descriptors. Teardown always tries detach-then-unload, even
//! after partial failures.

use crate::{Error, Result};
use aya::maps::XskMap;
use aya::programs::{Xdp, XdpFlags};
use aya::Ebpf;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const BPF_FS_ROOT: &str = "/sys/fs/bpf";

/// Name of the redirect map the filter program must export: entries are
/// keyed by RX queue id and hold the backend's socket fd.
pub const REDIRECT_MAP: &str = "XSK_MAP";

/// Attach mode for the filter program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdpMode {
    /// Native driver hook; needs NIC driver support.
    Driver,
    /// Generic SKB-layer hook; slower, always available.
    Skb,
}

impl XdpMode {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "driver" | "drv" => Some(XdpMode::Driver),
            "skb" | "generic" => Some(XdpMode::Skb),
            _ => None,
        }
    }

    fn flags(self) -> XdpFlags {
        match self {
            XdpMode::Driver => XdpFlags::DRV_MODE,
            XdpMode::Skb => XdpFlags::SKB_MODE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProgramState {
    #[default]
    None,
    Loaded,
    Attached,
    Detached,
    Unloaded,
}

#[derive(Default)]
pub struct XdpLoader {
    state: ProgramState,
    ebpf: Option<Ebpf>,
    program_name: Option<String>,
    interface: Option<String>,
    link_id: Option<aya::programs::xdp::XdpLinkId>,
    mode: Option<XdpMode>,
    pinned: Vec<PathBuf>,
}

impl XdpLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ProgramState {
        self.state
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.state, ProgramState::Loaded | ProgramState::Attached)
    }

    pub fn is_attached(&self) -> bool {
        self.state == ProgramState::Attached
    }

    pub fn attach_mode(&self) -> Option<XdpMode> {
        self.mode
    }

    /// Loads the program object into the kernel and pins program and map.
    pub fn load_program(&mut self, object_path: &Path, program_name: &str) -> Result<()> {
        if self.is_loaded() {
            return Err(Error::InvalidArgument("a program is already loaded".into()));
        }
        if !Path::new(BPF_FS_ROOT).exists() {
            return Err(Error::ResourceUnavailable(format!(
                "BPF filesystem not mounted at {BPF_FS_ROOT}"
            )));
        }

        let mut ebpf = Ebpf::load_file(object_path).map_err(|e| {
            Error::InitializationFailed(format!(
                "loading program object {}: {e}",
                object_path.display()
            ))
        })?;

        let resolved = resolve_program_name(&ebpf, program_name)?;
        {
            let program: &mut Xdp = ebpf
                .program_mut(&resolved)
                .expect("resolved name exists")
                .try_into()
                .map_err(|e| {
                    Error::InitializationFailed(format!("{resolved} is not an XDP program: {e}"))
                })?;
            program.load().map_err(|e| {
                Error::InitializationFailed(format!("loading {resolved} into the kernel: {e}"))
            })?;

            // Pinning keeps the program reachable after this process
            // exits. Failure leaves it live via its fd.
            let pin_path = Path::new(BPF_FS_ROOT).join(&resolved);
            match program.pin(&pin_path) {
                Ok(()) => self.pinned.push(pin_path),
                Err(e) => warn!("pinning program at {}: {e}", pin_path.display()),
            }
        }

        match ebpf.map_mut(REDIRECT_MAP) {
            Some(map) => {
                let pin_path = Path::new(BPF_FS_ROOT).join(format!("{resolved}_map"));
                match map.pin(&pin_path) {
                    Ok(()) => self.pinned.push(pin_path),
                    Err(e) => warn!("pinning redirect map at {}: {e}", pin_path.display()),
                }
            }
            None => {
                return Err(Error::InitializationFailed(format!(
                    "program object exports no {REDIRECT_MAP} map"
                )));
            }
        }

        info!(program = %resolved, object = %object_path.display(), "XDP program loaded");
        self.program_name = Some(resolved);
        self.ebpf = Some(ebpf);
        self.state = ProgramState::Loaded;
        Ok(())
    }

    /// Attaches the loaded program to `interface`.
    pub fn attach_program(&mut self, interface: &str, mode: XdpMode) -> Result<()> {
        if self.state != ProgramState::Loaded && self.state != ProgramState::Detached {
            return Err(Error::InitializationFailed(
                "no loaded program to attach".into(),
            ));
        }
        let name = self.program_name.clone().expect("loaded implies a name");
        let ebpf = self.ebpf.as_mut().expect("loaded implies an object");
        let program: &mut Xdp = ebpf
            .program_mut(&name)
            .expect("loaded program present")
            .try_into()
            .map_err(|e| Error::Internal(format!("program type changed: {e}")))?;

        let link_id = program.attach(interface, mode.flags()).map_err(|e| {
            Error::InitializationFailed(format!(
                "attaching {name} to {interface} in {mode:?} mode: {e}"
            ))
        })?;

        info!(program = %name, interface, ?mode, "XDP program attached");
        self.link_id = Some(link_id);
        self.interface = Some(interface.to_string());
        self.mode = Some(mode);
        self.state = ProgramState::Attached;
        Ok(())
    }

    /// Writes the AF_XDP socket fd into the redirect map under `queue_id`.
    pub fn register_socket(&mut self, queue_id: u32, socket_fd: std::os::fd::RawFd) -> Result<()> {
        let ebpf = self
            .ebpf
            .as_mut()
            .ok_or_else(|| Error::InitializationFailed("no program loaded".into()))?;
        let map = ebpf
            .map_mut(REDIRECT_MAP)
            .ok_or_else(|| Error::Internal(format!("{REDIRECT_MAP} disappeared")))?;
        let mut xsk: XskMap<_> = XskMap::try_from(map)
            .map_err(|e| Error::Internal(format!("{REDIRECT_MAP} has the wrong type: {e}")))?;
        xsk.set(queue_id, socket_fd, 0)
            .map_err(|e| Error::InitializationFailed(format!("redirect map update: {e}")))?;
        debug!(queue_id, socket_fd, "socket registered in redirect map");
        Ok(())
    }

    pub fn detach_program(&mut self) -> Result<()> {
        if self.state != ProgramState::Attached {
            return Err(Error::InvalidArgument("program is not attached".into()));
        }
        let name = self.program_name.clone().expect("attached implies a name");
        let ebpf = self.ebpf.as_mut().expect("attached implies an object");
        let program: &mut Xdp = ebpf
            .program_mut(&name)
            .expect("attached program present")
            .try_into()
            .map_err(|e| Error::Internal(format!("program type changed: {e}")))?;

        if let Some(link_id) = self.link_id.take() {
            program
                .detach(link_id)
                .map_err(|e| Error::Internal(format!("detaching {name}: {e}")))?;
        }
        info!(program = %name, "XDP program detached");
        self.interface = None;
        self.mode = None;
        self.state = ProgramState::Detached;
        Ok(())
    }

    /// Unloads the program and removes whatever was pinned.
    pub fn unload_program(&mut self) -> Result<()> {
        if self.state == ProgramState::Attached {
            // Unload implies detach, mirroring teardown order.
            let _ = self.detach_program();
        }
        if self.ebpf.is_none() {
            warn!("unload requested with no loaded program");
            return Ok(());
        }
        for path in self.pinned.drain(..) {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("removing pinned object {}: {e}", path.display());
                }
            }
        }
        // Dropping the object releases program and map descriptors.
        self.ebpf = None;
        self.program_name = None;
        self.link_id = None;
        self.state = ProgramState::Unloaded;
        info!("XDP program unloaded");
        Ok(())
    }

    /// Human-readable summary of the loader's view of the program.
    pub fn program_stats(&self) -> String {
        match (&self.program_name, &self.interface) {
            (Some(name), Some(interface)) => format!(
                "program {name} attached to {interface} ({:?} mode)",
                self.mode.unwrap_or(XdpMode::Skb)
            ),
            (Some(name), None) => format!("program {name} loaded, not attached"),
            _ => "no program loaded".to_string(),
        }
    }
}

impl Drop for XdpLoader {
    fn drop(&mut self) {
        // Cleanup must always attempt detach-then-unload and close every
        // descriptor, even when earlier steps failed.
        if self.state == ProgramState::Attached {
            let _ = self.detach_program();
        }
        if self.ebpf.is_some() {
            let _ = self.unload_program();
        }
    }
}

/// Resolves the program inside the object: the requested name first, then
/// the conventional fallbacks.
fn resolve_program_name(ebpf: &Ebpf, requested: &str) -> Result<String> {
    for candidate in [requested, "xdp_prog", "xdp"] {
        if ebpf.program(candidate).is_some() {
            if candidate != requested {
                warn!(requested, found = candidate, "program name fell back");
            }
            return Ok(candidate.to_string());
        }
    }
    let available: Vec<String> = ebpf.programs().map(|(name, _)| name.to_string()).collect();
    Err(Error::InitializationFailed(format!(
        "no suitable program in object; requested {requested:?}, available {available:?}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse() {
        assert_eq!(XdpMode::parse("driver"), Some(XdpMode::Driver));
        assert_eq!(XdpMode::parse("drv"), Some(XdpMode::Driver));
        assert_eq!(XdpMode::parse("skb"), Some(XdpMode::Skb));
        assert_eq!(XdpMode::parse("generic"), Some(XdpMode::Skb));
        assert_eq!(XdpMode::parse("turbo"), None);
    }

    #[test]
    fn test_initial_state() {
        let loader = XdpLoader::new();
        assert_eq!(loader.state(), ProgramState::None);
        assert!(!loader.is_attached());
        assert_eq!(loader.program_stats(), "no program loaded");
    }

    #[test]
    fn test_attach_without_load_fails() {
        let mut loader = XdpLoader::new();
        assert!(loader.attach_program("lo", XdpMode::Skb).is_err());
        assert_eq!(loader.state(), ProgramState::None);
    }

    #[test]
    fn test_load_missing_object_fails_cleanly() {
        let mut loader = XdpLoader::new();
        let err = loader
            .load_program(Path::new("/nonexistent/prog.o"), "xdp_filter")
            .unwrap_err();
        // Either the BPF filesystem is absent or the object is; both keep
        // the state machine at None.
        assert!(matches!(
            err.code(),
            crate::ErrorCode::ResourceUnavailable | crate::ErrorCode::InitializationFailed
        ));
        assert_eq!(loader.state(), ProgramState::None);
    }

    #[test]
    fn test_detach_without_attach_fails() {
        let mut loader = XdpLoader::new();
        assert!(loader.detach_program().is_err());
    }

    #[test]
    fn test_unload_without_load_is_noop() {
        let mut loader = XdpLoader::new();
        assert!(loader.unload_program().is_ok());
    }
}
