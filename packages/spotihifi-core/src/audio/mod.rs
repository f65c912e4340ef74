//! Bounded PCM pipeline to the OS audio device.
//!
//! One [`AudioSink`] owns one worker thread. The worker opens the output
//! device (retrying on failure), then services the sink's command queue
//! with a one-second idle wake; write closures append samples to a shared
//! ring that the device drains from its data callback. `queued_frames`
//! counts frames handed to [`AudioSink::write_pcm`] but not yet accepted
//! by the device; the streaming library polls it through the
//! audio-buffer-stats callback and throttles its decoder, which is the
//! only back-pressure in the pipeline.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;

use crate::error::SpotihifiError;
use crate::sync::CommandQueue;

/// Fixed output sample rate.
pub const SAMPLE_RATE: u32 = 44_100;
/// Fixed channel count (interleaved stereo).
pub const CHANNELS: u16 = 2;

/// Device open attempts before the worker gives up.
const OPEN_RETRIES: u32 = 10;
/// Back-off between open attempts.
const OPEN_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Idle wake interval of the sink worker.
const POP_TIMEOUT: Duration = Duration::from_secs(1);

type SinkCommand = Box<dyn FnOnce() + Send>;

/// State shared between producers, the worker and the device callback.
struct SinkShared {
    samples: Mutex<VecDeque<i16>>,
    queued_frames: AtomicI64,
    /// Edge detector so an underrun burst logs once, not per callback.
    underrun: AtomicBool,
}

impl SinkShared {
    fn new() -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            queued_frames: AtomicI64::new(0),
            underrun: AtomicBool::new(false),
        }
    }

    /// Moves ring samples into the device buffer, zero-filling any
    /// shortfall, and settles the frame accounting.
    fn fill_output(&self, output: &mut [i16]) {
        let available = {
            let mut ring = self.samples.lock();
            let available = ring.len().min(output.len());
            for slot in output.iter_mut().take(available) {
                *slot = ring.pop_front().unwrap_or(0);
            }
            available
        };

        let consumed_frames = (available / usize::from(CHANNELS)) as i64;
        if consumed_frames > 0 {
            self.queued_frames.fetch_sub(consumed_frames, Ordering::Relaxed);
        }

        if available < output.len() {
            output[available..].fill(0);
            // Only a starved ring with frames still in flight counts as an
            // underrun; an idle sink plays silence without complaint.
            if self.queued_frames.load(Ordering::Relaxed) > 0
                && !self.underrun.swap(true, Ordering::Relaxed)
            {
                tracing::warn!("audio underrun, inserting silence");
            }
        } else {
            self.underrun.store(false, Ordering::Relaxed);
        }
    }
}

/// Single-writer PCM sink feeding the OS audio device.
///
/// Shared between the engine thread (creation, `stop`) and the service
/// library's delivery thread (`write_pcm`, `queued_frames`); all device
/// access stays on the sink worker.
pub struct AudioSink {
    queue: Arc<CommandQueue<SinkCommand>>,
    shared: Arc<SinkShared>,
    running: Arc<AtomicBool>,
    /// Set directly by `stop` so a worker still in its open-retry loop
    /// gives up instead of sleeping through the remaining back-off.
    abort_open: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioSink {
    /// Creates the sink and starts its worker thread.
    ///
    /// Device open failures are retried on the worker (10 attempts, one
    /// second apart); a sink whose device never opens keeps servicing its
    /// queue so shutdown still works.
    #[must_use]
    pub fn new(device_name: &str) -> Self {
        let queue = Arc::new(CommandQueue::new());
        let shared = Arc::new(SinkShared::new());
        let running = Arc::new(AtomicBool::new(true));
        let abort_open = Arc::new(AtomicBool::new(false));

        let worker = {
            let device_name = device_name.to_string();
            let queue = queue.clone();
            let shared = shared.clone();
            let running = running.clone();
            let abort_open = abort_open.clone();
            std::thread::Builder::new()
                .name("audio-sink".to_string())
                .spawn(move || worker_main(&device_name, &shared, &queue, &running, &abort_open))
                .expect("failed to spawn audio sink thread")
        };

        Self {
            queue,
            shared,
            running,
            abort_open,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Copies an interleaved 16-bit sample batch into the pipeline.
    ///
    /// Returns immediately; `queued_frames` is incremented by the batch's
    /// frame count before the write closure is enqueued.
    pub fn write_pcm(&self, samples: &[i16]) {
        if samples.is_empty() {
            return;
        }

        let frames = (samples.len() / usize::from(CHANNELS)) as i64;
        let buffer: Vec<i16> = samples.to_vec();

        self.shared.queued_frames.fetch_add(frames, Ordering::Relaxed);

        let shared = self.shared.clone();
        self.queue.push(Box::new(move || {
            shared.samples.lock().extend(buffer);
        }));
    }

    /// Frames enqueued but not yet accepted by the device.
    #[must_use]
    pub fn queued_frames(&self) -> i64 {
        self.shared.queued_frames.load(Ordering::Relaxed)
    }

    /// Schedules an orderly worker shutdown after pending writes.
    pub fn stop(&self) {
        self.abort_open.store(true, Ordering::Relaxed);
        let running = self.running.clone();
        self.queue.push(Box::new(move || {
            running.store(false, Ordering::Relaxed);
        }));
    }
}

impl Drop for AudioSink {
    fn drop(&mut self) {
        self.stop();
        if let Some(worker) = self.worker.lock().take() {
            if let Err(err) = worker.join() {
                tracing::error!(?err, "audio sink worker panicked");
            }
        }
    }
}

fn worker_main(
    device_name: &str,
    shared: &Arc<SinkShared>,
    queue: &CommandQueue<SinkCommand>,
    running: &AtomicBool,
    abort_open: &AtomicBool,
) {
    let stream = open_stream_with_retry(device_name, shared, abort_open);
    if stream.is_none() {
        tracing::error!(device = device_name, "audio device unavailable, sink runs without output");
    }

    while running.load(Ordering::Relaxed) {
        if let Some(command) = queue.pop(POP_TIMEOUT) {
            command();
        }
    }

    if stream.is_some() {
        tracing::info!(device = device_name, "closing audio device");
    }
    // Dropping the stream closes the device on this thread.
}

fn open_stream_with_retry(
    device_name: &str,
    shared: &Arc<SinkShared>,
    abort_open: &AtomicBool,
) -> Option<cpal::Stream> {
    for attempt in 1..=OPEN_RETRIES {
        if abort_open.load(Ordering::Relaxed) {
            return None;
        }
        match open_stream(device_name, shared) {
            Ok(stream) => {
                tracing::debug!(device = device_name, "audio device opened");
                return Some(stream);
            }
            Err(err) => {
                tracing::error!(device = device_name, attempt, %err, "failed to open audio device");
                // Sleep in slices so a concurrent stop cuts the back-off
                // short instead of waiting out the full retry budget.
                let slices = 10;
                for _ in 0..slices {
                    if abort_open.load(Ordering::Relaxed) {
                        return None;
                    }
                    std::thread::sleep(OPEN_RETRY_DELAY / slices);
                }
            }
        }
    }
    None
}

fn open_stream(device_name: &str, shared: &Arc<SinkShared>) -> Result<cpal::Stream, SpotihifiError> {
    let host = cpal::default_host();

    let device = if device_name == "default" {
        host.default_output_device()
            .ok_or_else(|| SpotihifiError::Device("no default output device".to_string()))?
    } else {
        host.output_devices()
            .map_err(|err| SpotihifiError::Device(err.to_string()))?
            .find(|device| device.name().is_ok_and(|name| name == device_name))
            .ok_or_else(|| {
                SpotihifiError::Device(format!("output device '{device_name}' not found"))
            })?
    };

    let config = cpal::StreamConfig {
        channels: CHANNELS,
        sample_rate: cpal::SampleRate(SAMPLE_RATE),
        buffer_size: cpal::BufferSize::Default,
    };

    let callback_shared = shared.clone();
    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                callback_shared.fill_output(data);
            },
            |err| tracing::error!(%err, "audio stream error"),
            None,
        )
        .map_err(|err| SpotihifiError::Device(err.to_string()))?;

    stream
        .play()
        .map_err(|err| SpotihifiError::Device(err.to_string()))?;

    Ok(stream)
}
