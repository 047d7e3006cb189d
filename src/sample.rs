//! Raw I/Q sample buffers and their on-disk encoding

use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
use num_complex::Complex32;

use crate::{error::CaptureError, naming::CaptureTime};

/// Bytes per complex sample (two native-endian `f32`)
pub const BYTES_PER_SAMPLE: usize = 2 * std::mem::size_of::<f32>();

/// One fixed-length acquisition, stamped with the time of its first sample.
///
/// Samples are stored interleaved (`I, Q, I, Q, ...`), each component
/// normalized to `[-1, 1]`.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleBuffer {
    pub time: CaptureTime,
    iq: Vec<f32>,
}

impl SampleBuffer {
    pub fn zeroed(time: CaptureTime, len: usize) -> Self {
        Self {
            time,
            iq: vec![0f32; 2 * len],
        }
    }

    pub fn from_samples(time: CaptureTime, samples: &[Complex32]) -> Self {
        let iq = samples.iter().flat_map(|c| [c.re, c.im]).collect();
        Self { time, iq }
    }

    /// Decode a capture body written by [`SampleBuffer::as_bytes`]
    pub fn from_bytes(time: CaptureTime, bytes: &[u8]) -> Result<Self, CaptureError> {
        if bytes.len() % BYTES_PER_SAMPLE != 0 {
            return Err(CaptureError::Corrupt(format!(
                "{} bytes is not a whole number of samples",
                bytes.len()
            )));
        }
        let mut iq = vec![0f32; bytes.len() / std::mem::size_of::<f32>()];
        // Copy rather than cast in place, the read buffer has no f32 alignment
        iq.as_mut_byte_slice().copy_from_slice(bytes);
        Ok(Self { time, iq })
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.iq.as_byte_slice()
    }

    pub fn len(&self) -> usize {
        self.iq.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.iq.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Complex32> {
        self.iq
            .chunks_exact(2)
            .nth(idx)
            .map(|pair| Complex32::new(pair[0], pair[1]))
    }

    /// Overwrite sample `idx`. Returns false, leaving the buffer alone, if
    /// `idx` is past the end.
    pub fn set(&mut self, idx: usize, sample: Complex32) -> bool {
        match self.iq.chunks_exact_mut(2).nth(idx) {
            Some(pair) => {
                pair[0] = sample.re;
                pair[1] = sample.im;
                true
            }
            None => false,
        }
    }

    pub fn samples(&self) -> impl Iterator<Item = Complex32> + '_ {
        self.iq
            .chunks_exact(2)
            .map(|pair| Complex32::new(pair[0], pair[1]))
    }

    /// In-phase components only
    pub fn in_phase(&self) -> impl Iterator<Item = f32> + '_ {
        self.iq.iter().step_by(2).copied()
    }

    pub fn iq_mut(&mut self) -> &mut [f32] {
        &mut self.iq
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_round_trip() {
        let time = CaptureTime::new(1_700_000_000, 5);
        let samples = [
            Complex32::new(0.5, -0.25),
            Complex32::new(-1.0, 1.0),
            Complex32::new(0.0, 0.125),
        ];
        let buf = SampleBuffer::from_samples(time, &samples);
        assert_eq!(buf.as_bytes().len(), 3 * BYTES_PER_SAMPLE);
        let back = SampleBuffer::from_bytes(time, buf.as_bytes()).unwrap();
        assert_eq!(back, buf);
        assert_eq!(back.samples().collect::<Vec<_>>(), samples);
        assert_eq!(back.in_phase().collect::<Vec<_>>(), vec![0.5, -1.0, 0.0]);
    }

    #[test]
    fn test_truncated_body() {
        let err = SampleBuffer::from_bytes(CaptureTime::default(), &[0u8; 12]);
        assert!(matches!(err, Err(CaptureError::Corrupt(_))));
    }

    #[test]
    fn test_set_get() {
        let mut buf = SampleBuffer::zeroed(CaptureTime::default(), 4);
        assert!(buf.set(2, Complex32::new(0.5, 0.0)));
        assert_eq!(buf.len(), 4);
        assert_eq!(buf.get(2), Some(Complex32::new(0.5, 0.0)));
        assert_eq!(buf.get(4), None);

        // Out of range is refused, not a panic
        assert!(!buf.set(4, Complex32::new(1.0, 1.0)));
        assert!(!buf.set(usize::MAX / 2, Complex32::new(1.0, 1.0)));
        assert_eq!(buf.samples().filter(|s| s.re != 0.0).count(), 1);
    }
}
