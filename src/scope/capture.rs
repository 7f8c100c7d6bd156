//! Acquisition thread
//!
//! Owns the instrument on a dedicated thread and hands each sequence-mode
//! acquisition to the analysis loop over a small bounded channel, so at
//! most a few capture buffers are alive at once.

use anyhow::{Context, Result};
use crossbeam_channel::{bounded, Receiver, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::decode::CaptureMetadata;

/// Acquisitions buffered between the capture thread and the analysis loop
const CHANNEL_CAPACITY: usize = 2;

/// How often a blocked send re-checks the running flag
const SEND_POLL: Duration = Duration::from_millis(50);

/// Shape of one sequence-mode acquisition
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRequest {
    /// Segments per acquisition (one trigger each)
    pub segments: usize,
    /// Requested samples per segment; the instrument may round it
    pub samples_per_segment: usize,
    /// Delay applied to the reference channel by the instrument (s)
    pub deskew: f64,
}

/// Raw bytes and calibration of one channel
#[derive(Debug, Clone)]
pub struct ChannelCapture {
    pub raw: Vec<u8>,
    pub metadata: CaptureMetadata,
}

/// Both channels of one acquisition
#[derive(Debug, Clone)]
pub struct RawAcquisition {
    /// Position in the worker's output, stamped by the worker
    pub sequence: u64,
    pub reference: ChannelCapture,
    pub chip: ChannelCapture,
    pub segments: usize,
    /// Samples per segment actually used by the instrument
    pub samples_per_segment: usize,
}

impl RawAcquisition {
    pub fn byte_len(&self) -> usize {
        self.reference.raw.len() + self.chip.raw.len()
    }
}

/// A digitizer able to return both channels of a sequence-mode acquisition
pub trait Instrument: Send {
    fn acquire(&mut self, request: &AcquisitionRequest) -> Result<RawAcquisition>;

    fn name(&self) -> &str {
        "instrument"
    }
}

/// Capture counters (atomic for thread-safe access)
#[derive(Debug, Default)]
pub struct CaptureStats {
    pub acquisitions: AtomicU64,
    pub bytes_captured: AtomicU64,
    pub instrument_errors: AtomicU64,
    /// Acquisitions produced after the consumer stopped listening
    pub discarded: AtomicU64,
}

impl CaptureStats {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::Relaxed)
    }

    pub fn bytes_captured(&self) -> u64 {
        self.bytes_captured.load(Ordering::Relaxed)
    }

    pub fn instrument_errors(&self) -> u64 {
        self.instrument_errors.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

/// Acquisition thread controller
pub struct AcquisitionWorker {
    instrument: Arc<Mutex<Box<dyn Instrument>>>,
    running: Arc<AtomicBool>,
    stats: Arc<CaptureStats>,
    handle: Option<JoinHandle<()>>,
}

impl AcquisitionWorker {
    pub fn new(instrument: Box<dyn Instrument>) -> Self {
        Self {
            instrument: Arc::new(Mutex::new(instrument)),
            running: Arc::new(AtomicBool::new(false)),
            stats: CaptureStats::new(),
            handle: None,
        }
    }

    /// Start acquiring and return a receiver for raw acquisitions
    ///
    /// A previous run is stopped first. The channel disconnects when the
    /// worker stops or the instrument fails.
    pub fn start(&mut self, request: AcquisitionRequest) -> Result<Receiver<RawAcquisition>> {
        self.stop();

        debug!(
            "Starting acquisition: {} segments x {} samples, deskew {:e} s",
            request.segments, request.samples_per_segment, request.deskew
        );

        let (tx, rx) = bounded::<RawAcquisition>(CHANNEL_CAPACITY);

        let instrument = self.instrument.clone();
        let running = self.running.clone();
        let stats = self.stats.clone();

        running.store(true, Ordering::SeqCst);

        let handle = thread::Builder::new()
            .name("scope-capture".to_string())
            .spawn(move || {
                if let Err(e) = run_capture(instrument, request, &running, &stats, tx) {
                    error!("Acquisition error: {:#}", e);
                    stats.instrument_errors.fetch_add(1, Ordering::Relaxed);
                }
                running.store(false, Ordering::SeqCst);
            })
            .context("Failed to spawn acquisition thread")?;

        self.handle = Some(handle);
        Ok(rx)
    }

    /// Stop acquiring and wait for the thread to exit
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            debug!("Waiting for acquisition thread to exit");
            if handle.join().is_err() {
                error!("Acquisition thread panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &Arc<CaptureStats> {
        &self.stats
    }
}

/// Capture loop (runs in dedicated thread)
fn run_capture(
    instrument: Arc<Mutex<Box<dyn Instrument>>>,
    request: AcquisitionRequest,
    running: &AtomicBool,
    stats: &CaptureStats,
    tx: Sender<RawAcquisition>,
) -> Result<()> {
    let mut instrument = instrument
        .lock()
        .map_err(|_| anyhow::anyhow!("instrument lock poisoned"))?;

    while running.load(Ordering::SeqCst) {
        let started = Instant::now();
        let mut acquisition = instrument
            .acquire(&request)
            .with_context(|| format!("{} failed to acquire", instrument.name()))?;

        acquisition.sequence = stats.acquisitions.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_captured
            .fetch_add(acquisition.byte_len() as u64, Ordering::Relaxed);
        debug!(
            "Acquisition {} ready: {} bytes in {:.1} ms",
            acquisition.sequence,
            acquisition.byte_len(),
            started.elapsed().as_secs_f64() * 1e3
        );

        let mut pending = acquisition;
        loop {
            match tx.send_timeout(pending, SEND_POLL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(back)) => {
                    if !running.load(Ordering::SeqCst) {
                        stats.discarded.fetch_add(1, Ordering::Relaxed);
                        return Ok(());
                    }
                    pending = back;
                }
                Err(SendTimeoutError::Disconnected(_)) => {
                    stats.discarded.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                }
            }
        }
    }

    info!(
        "Acquisition stopped after {} captures, {} bytes ({} discarded)",
        stats.acquisitions(),
        stats.bytes_captured(),
        stats.discarded()
    );
    Ok(())
}

impl Drop for AcquisitionWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("Acquisition worker dropped while running");
        }
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits tiny acquisitions, failing after `fail_after` of them
    struct CountingInstrument {
        produced: usize,
        fail_after: Option<usize>,
    }

    impl Instrument for CountingInstrument {
        fn acquire(&mut self, request: &AcquisitionRequest) -> Result<RawAcquisition> {
            if self.fail_after == Some(self.produced) {
                anyhow::bail!("link dropped");
            }
            self.produced += 1;
            let metadata = CaptureMetadata {
                volts_per_div: 0.1,
                offset_volts: 0.0,
                dt: 1e-10,
                clip: 0,
            };
            let samples = request.segments * request.samples_per_segment;
            Ok(RawAcquisition {
                sequence: 0,
                reference: ChannelCapture {
                    raw: vec![0; samples],
                    metadata,
                },
                chip: ChannelCapture {
                    raw: vec![0; samples],
                    metadata,
                },
                segments: request.segments,
                samples_per_segment: request.samples_per_segment,
            })
        }
    }

    fn request() -> AcquisitionRequest {
        AcquisitionRequest {
            segments: 2,
            samples_per_segment: 8,
            deskew: 0.0,
        }
    }

    #[test]
    fn test_sequence_numbers_in_order() {
        let mut worker = AcquisitionWorker::new(Box::new(CountingInstrument {
            produced: 0,
            fail_after: None,
        }));
        let rx = worker.start(request()).unwrap();

        for expected in 0..5u64 {
            let acq = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(acq.sequence, expected);
            assert_eq!(acq.byte_len(), 32);
        }

        drop(rx);
        worker.stop();
        assert!(!worker.is_running());
        let stats = worker.stats();
        assert!(stats.acquisitions() >= 5);
        assert_eq!(stats.bytes_captured(), 32 * stats.acquisitions());
    }

    #[test]
    fn test_instrument_error_disconnects() {
        let mut worker = AcquisitionWorker::new(Box::new(CountingInstrument {
            produced: 0,
            fail_after: Some(3),
        }));
        let rx = worker.start(request()).unwrap();

        let received: Vec<_> = rx.iter().collect();
        assert_eq!(received.len(), 3);

        worker.stop();
        assert_eq!(worker.stats().instrument_errors(), 1);
    }

    #[test]
    fn test_restart_reuses_instrument() {
        let mut worker = AcquisitionWorker::new(Box::new(CountingInstrument {
            produced: 0,
            fail_after: None,
        }));

        let rx = worker.start(request()).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        drop(rx);
        worker.stop();

        let rx = worker.start(request()).unwrap();
        let acq = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(acq.sequence >= 1);
        drop(rx);
        worker.stop();
    }
}
