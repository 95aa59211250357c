//! fastcap - high-throughput packet capture SDK for Linux.
//!
//! Hand the SDK an interface name and a backend kind and it delivers a
//! stream of parsed packets with statistics, filtering and pluggable
//! per-packet processors. Four backends implement the same contract:
//!
//! - raw socket: portable kernel-copy capture, no special setup
//! - mmap ring: kernel-bypass socket over shared rings, cooperating with a
//!   small in-kernel filter program (requires kernel 4.18+)
//! - poll mode: userspace NIC driver with hugepage buffer pools
//! - virtual device: poll-mode machinery over synthetic devices, for tests

pub mod capture;
pub mod config;
pub mod context;
pub mod decode;
pub mod error;
pub mod filter;
pub mod packet;
pub mod pmd;
pub mod telemetry;

/// The protocol parser engine, re-exported from the `wireparse` crate.
pub use wireparse as parser;

pub use capture::{BackendKind, CaptureBackend, CaptureConfig, CaptureState, Statistics};
pub use context::CaptureContext;
pub use error::{Error, ErrorCode, Result};
pub use filter::{FilterChain, FilterConfig, FilterResult, FilterType};
pub use packet::{Metadata, Packet};
