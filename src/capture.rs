//! This module contains all the acquisition logic

// The acquisition thread does one thing: pull buffers out of the radio and
// push them through a bounded channel. The writer on the other end turns each
// buffer into a capture file. If the writer falls behind, new buffers are
// dropped on the floor rather than stalling the radio.

use std::{sync::Arc, time::Duration, time::Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use num_complex::Complex32;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, error, info, trace, warn};

use crate::{
    error::RadioError,
    naming::{capture_file_name, CaptureTime},
    sample::SampleBuffer,
    shutdown::StopToken,
    spool::Spool,
};

/// The radio driver seam: fill the next fixed-size buffer and stamp it
pub trait Radio: Send {
    fn samples_per_buffer(&self) -> usize;
    /// Blocks for at most about one buffer's worth of time
    fn receive(&mut self) -> Result<SampleBuffer, RadioError>;
}

/// Stand-in for the receiver when no hardware is attached.
///
/// Produces one buffer per `record_time` of uniform noise on I and Q, with an
/// occasional full-scale impulse so the detector has something to find.
pub struct SimulatedRadio {
    samples_per_buffer: usize,
    period: Duration,
    noise: f32,
    impulse_probability: f64,
    next_due: Instant,
    rng: StdRng,
}

impl SimulatedRadio {
    pub fn new(
        sample_rate: f64,
        record_time: f64,
        noise: f32,
        impulse_probability: f64,
    ) -> Result<Self, RadioError> {
        let samples_per_buffer = (sample_rate * record_time).floor() as usize;
        if samples_per_buffer == 0 {
            return Err(RadioError::Setup(format!(
                "{} Hz for {} s is an empty buffer",
                sample_rate, record_time
            )));
        }
        if !(0.0..=1.0).contains(&noise) {
            return Err(RadioError::Setup(format!(
                "noise amplitude {} is outside [0, 1]",
                noise
            )));
        }
        if !(0.0..=1.0).contains(&impulse_probability) {
            return Err(RadioError::Setup(format!(
                "impulse probability {} is outside [0, 1]",
                impulse_probability
            )));
        }
        Ok(Self {
            samples_per_buffer,
            period: Duration::from_secs_f64(record_time),
            noise,
            impulse_probability,
            next_due: Instant::now(),
            rng: StdRng::from_entropy(),
        })
    }

    /// Deterministic noise, for tests and benchmarks
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Don't wait for the wall clock between buffers
    pub fn unpaced(mut self) -> Self {
        self.period = Duration::ZERO;
        self
    }
}

impl Radio for SimulatedRadio {
    fn samples_per_buffer(&self) -> usize {
        self.samples_per_buffer
    }

    fn receive(&mut self) -> Result<SampleBuffer, RadioError> {
        let now = Instant::now();
        if self.next_due > now {
            std::thread::sleep(self.next_due - now);
        }
        self.next_due = Instant::now() + self.period;

        let time = CaptureTime::now();
        let mut buf = SampleBuffer::zeroed(time, self.samples_per_buffer);
        if self.noise > 0.0 {
            for v in buf.iq_mut() {
                *v = self.rng.gen_range(-self.noise..=self.noise);
            }
        }
        if self.rng.gen_bool(self.impulse_probability) {
            let idx = self.rng.gen_range(0..self.samples_per_buffer);
            let polarity = if self.rng.gen_bool(0.5) { 1.0 } else { -1.0 };
            buf.set(idx, Complex32::new(polarity, 0.0));
        }
        Ok(buf)
    }
}

/// What the writer gets back from [`SampleQueue::next`]
#[derive(Debug)]
pub enum Fetch {
    Ready(SampleBuffer),
    /// Nothing arrived within the timeout
    Empty,
    /// The producer is gone and everything it queued has been taken
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Push {
    Queued,
    /// Queue full, the new buffer was discarded
    Dropped,
    /// Consumer is gone
    Closed,
}

/// Producer half of the acquisition queue
#[derive(Debug, Clone)]
pub struct QueueProducer {
    sender: Sender<SampleBuffer>,
}

/// Consumer half of the acquisition queue
#[derive(Debug)]
pub struct SampleQueue {
    receiver: Receiver<SampleBuffer>,
}

pub fn sample_queue(capacity: usize) -> (QueueProducer, SampleQueue) {
    let (sender, receiver) = bounded(capacity);
    (QueueProducer { sender }, SampleQueue { receiver })
}

impl QueueProducer {
    /// Never blocks. On a full queue the new buffer is the one that goes.
    pub fn push(&self, buf: SampleBuffer) -> Push {
        match self.sender.try_send(buf) {
            Ok(()) => Push::Queued,
            Err(TrySendError::Full(_)) => Push::Dropped,
            Err(TrySendError::Disconnected(_)) => Push::Closed,
        }
    }
}

impl SampleQueue {
    pub fn next(&self, timeout: Duration) -> Fetch {
        match self.receiver.recv_timeout(timeout) {
            Ok(buf) => Fetch::Ready(buf),
            Err(RecvTimeoutError::Timeout) => Fetch::Empty,
            Err(RecvTimeoutError::Disconnected) => Fetch::Closed,
        }
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

/// Acquisition loop. Returns the number of buffers dropped on a full queue.
pub fn acquire(mut radio: Box<dyn Radio>, producer: QueueProducer, stop: StopToken) -> u64 {
    let mut dropped = 0u64;
    let mut consecutive_errors = 0u32;
    info!(
        samples_per_buffer = radio.samples_per_buffer(),
        "Acquisition started"
    );
    while !stop.is_stopped() {
        let buf = match radio.receive() {
            Ok(buf) => {
                consecutive_errors = 0;
                buf
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!("Error receiving samples: {}", e);
                // Don't spin on a radio that keeps failing
                if consecutive_errors > 1 {
                    stop.sleep(Duration::from_millis(100));
                }
                continue;
            }
        };
        match producer.push(buf) {
            Push::Queued => (),
            Push::Dropped => {
                dropped += 1;
                warn!(dropped, "Queue full, dropping samples");
            }
            Push::Closed => {
                error!("Capture writer is gone, stopping acquisition");
                break;
            }
        }
    }
    info!(dropped, "Acquisition stopped");
    dropped
}

/// Sole consumer of the acquisition queue, publishes each buffer as a capture file
pub struct CaptureWriter {
    site: String,
    spool: Arc<dyn Spool>,
    fetch_timeout: Duration,
}

impl CaptureWriter {
    pub fn new(site: &str, spool: Arc<dyn Spool>, fetch_timeout: Duration) -> Self {
        Self {
            site: site.to_owned(),
            spool,
            fetch_timeout,
        }
    }

    /// Publish one buffer, returning its file name
    pub fn write(&self, buf: &SampleBuffer) -> std::io::Result<String> {
        let name = capture_file_name(&self.site, buf.time);
        self.spool.publish(&name, buf.as_bytes())?;
        Ok(name)
    }

    /// Runs until the producer is gone and the queue is drained. Returns the
    /// number of files written.
    ///
    /// There is no stop token here: acquisition drops the producer on its way
    /// out, so whatever it pushed after a stop request still lands on disk.
    pub fn run(&self, queue: SampleQueue) -> u64 {
        let mut written = 0u64;
        loop {
            trace!(depth = queue.len(), "Samples in queue");
            match queue.next(self.fetch_timeout) {
                Fetch::Ready(buf) => match self.write(&buf) {
                    Ok(name) => {
                        written += 1;
                        debug!("Saved {}", name);
                    }
                    // The buffer is gone either way, keep truckin
                    Err(e) => error!(
                        "Error saving capture {}: {}",
                        capture_file_name(&self.site, buf.time),
                        e
                    ),
                },
                Fetch::Empty => continue,
                Fetch::Closed => break,
            }
        }
        info!(written, "Capture writer stopped");
        written
    }
}
