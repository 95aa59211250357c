//! Capture context: binds one backend to a chain of per-packet
//! processors, owns the delivery loop and the pipeline metrics.
//!
//! Delivery is single-threaded (one loop pulling batches) or
//! multi-threaded (N workers pulling concurrently; cross-worker ordering
//! is not guaranteed). The usual termination signals flip a process-wide
//! flag the loops observe, and a control handle offers pause/resume,
//! which masks dispatch without draining the backend.

use crate::capture::{CaptureBackend, CaptureConfig};
use crate::config::Config;
use crate::packet::Packet;
use crate::telemetry::MetricsRegistry;
use crate::{Error, Result};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const PULL_TIMEOUT: Duration = Duration::from_millis(100);
const IDLE_BACKOFF: Duration = Duration::from_micros(100);
const PAUSE_BACKOFF: Duration = Duration::from_millis(1);

/// One stage of the per-packet processing chain.
pub trait PacketProcessor: Send + Sync {
    fn name(&self) -> &str;
    fn process(&self, packet: &Packet);
}

/// Closure adapter for simple processors.
pub struct FnProcessor<F: Fn(&Packet) + Send + Sync> {
    name: String,
    f: F,
}

impl<F: Fn(&Packet) + Send + Sync> FnProcessor<F> {
    pub fn new(name: &str, f: F) -> Self {
        Self {
            name: name.to_string(),
            f,
        }
    }
}

impl<F: Fn(&Packet) + Send + Sync> PacketProcessor for FnProcessor<F> {
    fn name(&self) -> &str {
        &self.name
    }

    fn process(&self, packet: &Packet) {
        (self.f)(packet)
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_termination(signal: libc::c_int) {
    // Async-signal-safe: just flip the flag.
    let _ = signal;
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// True once SIGINT/SIGTERM/SIGHUP has been observed.
pub fn shutdown_requested() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

fn install_signal_handlers() {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = handle_termination as extern "C" fn(libc::c_int) as usize;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) != 0 {
                warn!(signal, "installing signal handler failed: {}", std::io::Error::last_os_error());
            }
        }
    }
    debug!("termination signal handlers installed");
}

/// Pause/resume and stop control shared with the running loops.
#[derive(Clone, Default)]
pub struct ControlHandle {
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl ControlHandle {
    /// Masks processor dispatch without draining the backend.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Ends `run` after the current iteration.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn should_run(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst) && !shutdown_requested()
    }
}

pub struct CaptureContext {
    backend: Box<dyn CaptureBackend>,
    processors: Vec<Arc<dyn PacketProcessor>>,
    metrics: Arc<MetricsRegistry>,
    config: Config,
    control: ControlHandle,
}

impl CaptureContext {
    pub fn new(backend: Box<dyn CaptureBackend>, config: Config) -> Self {
        Self {
            backend,
            processors: Vec::new(),
            metrics: Arc::new(MetricsRegistry::new()),
            config,
            control: ControlHandle::default(),
        }
    }

    pub fn add_processor(&mut self, processor: Arc<dyn PacketProcessor>) {
        info!(processor = processor.name(), "processor added");
        self.processors.push(processor);
    }

    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    pub fn control(&self) -> ControlHandle {
        self.control.clone()
    }

    pub fn backend(&self) -> &dyn CaptureBackend {
        self.backend.as_ref()
    }

    pub fn backend_mut(&mut self) -> &mut (dyn CaptureBackend + 'static) {
        self.backend.as_mut()
    }

    /// Validates the configuration, initializes the backend from it and
    /// installs signal handlers.
    pub fn initialize(&mut self) -> Result<()> {
        let validation = crate::config::validate(&self.config);
        for warning in &validation.warnings {
            warn!("config: {warning}");
        }
        if !validation.is_valid() {
            return Err(Error::InvalidArgument(validation.errors.join("; ")));
        }

        self.backend
            .initialize(CaptureConfig::from(&self.config.network))?;
        install_signal_handlers();
        info!(backend = self.backend.name(), "capture context initialized");
        Ok(())
    }

    /// Starts capture and runs packet delivery until stopped or signaled.
    pub fn run(&mut self) -> Result<()> {
        if !self.backend.is_running() {
            self.backend.start()?;
        }

        let workers = self.config.performance.worker_threads.max(1);
        let batch_size = self.config.performance.batch_size.max(1);
        info!(workers, batch_size, "capture context running");

        if workers > 1 {
            self.run_multi_threaded(workers, batch_size);
        } else {
            self.run_single_threaded(batch_size);
        }
        Ok(())
    }

    /// Stops capture and releases the backend.
    pub fn shutdown(&mut self) -> Result<()> {
        self.control.stop();
        if let Err(e) = self.backend.stop() {
            error!("stopping backend: {e}");
        }
        self.backend.release()?;
        info!("capture context shut down");
        Ok(())
    }

    fn run_single_threaded(&mut self, batch_size: usize) {
        let control = self.control.clone();
        while control.should_run() {
            if control.is_paused() {
                thread::sleep(PAUSE_BACKOFF);
                continue;
            }
            let batch = self.backend.get_packets(batch_size, PULL_TIMEOUT);
            if batch.is_empty() {
                thread::sleep(IDLE_BACKOFF);
                continue;
            }
            let started = Instant::now();
            for packet in &batch {
                if !control.should_run() {
                    break;
                }
                dispatch(&self.processors, &self.metrics, packet);
            }
            self.metrics.counter("packets_processed").add(batch.len() as u64);
            self.metrics
                .histogram("processing_latency_us")
                .observe(started.elapsed().as_micros() as u64);
        }
        debug!("single-threaded delivery loop ended");
    }

    fn run_multi_threaded(&mut self, workers: usize, batch_size: usize) {
        let backend: &dyn CaptureBackend = self.backend.as_ref();
        let processors = &self.processors;
        let metrics = &self.metrics;
        let control = &self.control;
        let pin_threads = self.config.performance.pin_threads;
        let affinity = &self.config.performance.cpu_affinity;

        thread::scope(|scope| {
            for worker in 0..workers {
                let control = control.clone();
                let cpu = if pin_threads {
                    affinity.get(worker).copied()
                } else {
                    None
                };
                let builder = thread::Builder::new().name(format!("fastcap-worker-{worker}"));
                let _ = builder.spawn_scoped(scope, move || {
                    if let Some(cpu) = cpu {
                        crate::capture::raw_socket::pin_current_thread(cpu);
                    }
                    while control.should_run() {
                        if control.is_paused() {
                            thread::sleep(PAUSE_BACKOFF);
                            continue;
                        }
                        let batch = backend.get_packets(batch_size, PULL_TIMEOUT);
                        if batch.is_empty() {
                            thread::sleep(IDLE_BACKOFF);
                            continue;
                        }
                        let started = Instant::now();
                        for packet in &batch {
                            if !control.should_run() {
                                break;
                            }
                            dispatch(processors, metrics, packet);
                        }
                        metrics.counter("packets_processed").add(batch.len() as u64);
                        metrics
                            .histogram("processing_latency_us")
                            .observe(started.elapsed().as_micros() as u64);
                    }
                    debug!(worker, "delivery worker ended");
                });
            }
        });
    }
}

/// Runs one packet through every processor in order. A panicking
/// processor is logged and counted; it does not kill the pipeline.
fn dispatch(
    processors: &[Arc<dyn PacketProcessor>],
    metrics: &Arc<MetricsRegistry>,
    packet: &Packet,
) {
    for processor in processors {
        let outcome = catch_unwind(AssertUnwindSafe(|| processor.process(packet)));
        if outcome.is_err() {
            error!(processor = processor.name(), "processor panicked on packet");
            metrics.counter("packets_dropped").inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::virtual_dev::VirtualDeviceBackend;
    use crate::capture::BackendKind;
    use crate::pmd::vdev::ring_injector;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    fn ring_context(device: &str, workers: usize) -> CaptureContext {
        let mut backend = VirtualDeviceBackend::new();
        backend
            .add_virtual_device(device, &HashMap::new())
            .unwrap();
        let mut config = Config::default();
        config.network.interface = device.to_string();
        config.network.backend = BackendKind::VirtualDevice;
        config.network.num_buffers = 64;
        config.performance.worker_threads = workers;
        config.performance.batch_size = 8;
        CaptureContext::new(Box::new(backend), config)
    }

    #[test]
    fn test_single_threaded_pipeline_dispatches_in_order() {
        let mut context = ring_context("net_ring70", 1);

        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        context.add_processor(Arc::new(FnProcessor::new("collect", move |packet| {
            sink.lock().unwrap().push(packet.data()[0]);
        })));

        context.initialize().unwrap();
        context.backend_mut().start().unwrap();

        let injector = ring_injector("net_ring70");
        for tag in 0..10u8 {
            injector.inject(&[tag; 60]);
        }

        let control = context.control();
        let stopper = thread::spawn({
            let control = control.clone();
            move || {
                thread::sleep(Duration::from_millis(500));
                control.stop();
            }
        });
        context.run().unwrap();
        stopper.join().unwrap();

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, (0..10u8).collect::<Vec<_>>(), "FIFO through the pipeline");
        context.shutdown().unwrap();
    }

    #[test]
    fn test_panicking_processor_does_not_kill_pipeline() {
        let mut context = ring_context("net_ring71", 1);

        let good = Arc::new(AtomicUsize::new(0));
        let counter = good.clone();
        context.add_processor(Arc::new(FnProcessor::new("bad", |_| panic!("boom"))));
        context.add_processor(Arc::new(FnProcessor::new("good", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        context.initialize().unwrap();
        context.backend_mut().start().unwrap();
        ring_injector("net_ring71").inject(&[9; 60]);

        let control = context.control();
        let stopper = thread::spawn({
            let control = control.clone();
            move || {
                thread::sleep(Duration::from_millis(400));
                control.stop();
            }
        });
        context.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(good.load(Ordering::Relaxed), 1);
        let exported = context.metrics().export();
        assert!(exported.contains(&("packets_dropped".to_string(), 1)));
        context.shutdown().unwrap();
    }

    #[test]
    fn test_pause_masks_dispatch_without_draining() {
        let mut context = ring_context("net_ring72", 1);
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        context.add_processor(Arc::new(FnProcessor::new("count", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        context.initialize().unwrap();
        context.backend_mut().start().unwrap();

        let control = context.control();
        control.pause();
        ring_injector("net_ring72").inject(&[1; 60]);

        let stopper = thread::spawn({
            let control = control.clone();
            move || {
                // While paused nothing must be dispatched.
                thread::sleep(Duration::from_millis(300));
                control.resume();
                thread::sleep(Duration::from_millis(400));
                control.stop();
            }
        });
        context.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 1, "dispatched after resume");
        context.shutdown().unwrap();
    }

    #[test]
    fn test_multi_threaded_delivery() {
        let mut context = ring_context("net_ring73", 3);
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = processed.clone();
        context.add_processor(Arc::new(FnProcessor::new("count", move |_| {
            counter.fetch_add(1, Ordering::Relaxed);
        })));

        context.initialize().unwrap();
        context.backend_mut().start().unwrap();
        let injector = ring_injector("net_ring73");
        for tag in 0..50u8 {
            injector.inject(&[tag; 60]);
        }

        let control = context.control();
        let stopper = thread::spawn({
            let control = control.clone();
            move || {
                thread::sleep(Duration::from_millis(700));
                control.stop();
            }
        });
        context.run().unwrap();
        stopper.join().unwrap();

        assert_eq!(processed.load(Ordering::Relaxed), 50);
        context.shutdown().unwrap();
    }
}
