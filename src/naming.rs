//! Timestamp encoding shared by capture and segment file names.
//!
//! Sub-second time is carried as microseconds * 10 ("fraction units"), always
//! printed as 7 zero-padded digits, so a listing sorted by name is also sorted
//! by time.

use chrono::{DateTime, Utc};

/// Fraction units in one whole second
pub const UNITS_PER_SECOND: u64 = 10_000_000;
/// Width of the whole-second field in a capture name
pub const SECONDS_DIGITS: usize = 10;
/// Width of the fraction field
pub const FRACTION_DIGITS: usize = 7;
/// Site names are fixed width so capture stems are too
pub const SITE_NAME_LEN: usize = 4;
/// `<site><10-digit-seconds>.<7-digit-fraction>`
pub const CAPTURE_STEM_LEN: usize = SITE_NAME_LEN + SECONDS_DIGITS + 1 + FRACTION_DIGITS;
/// Extension of a completed capture file (interleaved I/Q `f32`)
pub const CAPTURE_EXT: &str = "cf32";
/// Extension of a capture that is still being written
pub const PARTIAL_EXT: &str = "part";
/// Extension of a capture set aside on overflow
pub const OVERFLOW_EXT: &str = "over";

/// Absolute time of a capture or a peak
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct CaptureTime {
    pub seconds: u64,
    /// Always below [`UNITS_PER_SECOND`]
    pub fraction: u32,
}

impl CaptureTime {
    pub fn new(seconds: u64, fraction: u32) -> Self {
        let time = Self {
            seconds,
            fraction: 0,
        };
        time.offset_by(fraction as u64)
    }

    pub fn from_datetime(time: &DateTime<Utc>) -> Option<Self> {
        let seconds = u64::try_from(time.timestamp()).ok()?;
        // Leap seconds report more than a million micros, clamp them into the second
        let micros = time.timestamp_subsec_micros().min(999_999);
        Some(Self {
            seconds,
            fraction: micros * 10,
        })
    }

    pub fn now() -> Self {
        Self::from_datetime(&Utc::now()).unwrap_or_default()
    }

    /// Advance by `units` fraction units, carrying whole seconds into `seconds`
    pub fn offset_by(self, units: u64) -> Self {
        let total = self.fraction as u64 + units;
        Self {
            seconds: self.seconds + total / UNITS_PER_SECOND,
            fraction: (total % UNITS_PER_SECOND) as u32,
        }
    }
}

/// Convert a sample offset into elapsed fraction units at `sample_rate` Hz
pub fn elapsed_units(offset: usize, sample_rate: f64) -> u64 {
    (offset as f64 / sample_rate * UNITS_PER_SECOND as f64).round() as u64
}

/// Stem of a capture file, `<site><seconds>.<fraction>`
pub fn capture_stem(site: &str, time: CaptureTime) -> String {
    format!(
        "{}{:0sw$}.{:0fw$}",
        site,
        time.seconds,
        time.fraction,
        sw = SECONDS_DIGITS,
        fw = FRACTION_DIGITS
    )
}

/// Full capture file name including the extension
pub fn capture_file_name(site: &str, time: CaptureTime) -> String {
    format!("{}.{}", capture_stem(site, time), CAPTURE_EXT)
}

/// Segment files collect every peak of one whole second, `<site><seconds>`
pub fn segment_file_name(site: &str, seconds: u64) -> String {
    format!("{}{}", site, seconds)
}

/// One line of a segment file
pub fn segment_line(fraction: u32, millivolts: f64) -> String {
    format!("{:0fw$}={:.2}\n", fraction, millivolts, fw = FRACTION_DIGITS)
}

/// Why a directory entry is not handed to the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Still being written, or set aside
    InProgress,
    /// Not a capture extension at all
    Extension,
    /// Stem is not exactly [`CAPTURE_STEM_LEN`] characters
    StemLength,
    /// Fixed-width numeric fields did not parse
    Fields,
}

/// Split a capture file name into its timestamp, or say why it is not one
pub fn parse_capture_name(name: &str) -> Result<CaptureTime, Rejection> {
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) => (stem, ext.to_ascii_lowercase()),
        None => return Err(Rejection::Extension),
    };
    if ext == PARTIAL_EXT || ext == OVERFLOW_EXT {
        return Err(Rejection::InProgress);
    }
    if ext != CAPTURE_EXT {
        return Err(Rejection::Extension);
    }
    if stem.len() != CAPTURE_STEM_LEN || !stem.is_ascii() {
        return Err(Rejection::StemLength);
    }
    let seconds = &stem[SITE_NAME_LEN..SITE_NAME_LEN + SECONDS_DIGITS];
    let dot = &stem[SITE_NAME_LEN + SECONDS_DIGITS..SITE_NAME_LEN + SECONDS_DIGITS + 1];
    let fraction = &stem[SITE_NAME_LEN + SECONDS_DIGITS + 1..];
    if dot != "." || !all_digits(seconds) || !all_digits(fraction) {
        return Err(Rejection::Fields);
    }
    match (seconds.parse::<u64>(), fraction.parse::<u32>()) {
        (Ok(seconds), Ok(fraction)) => Ok(CaptureTime { seconds, fraction }),
        _ => Err(Rejection::Fields),
    }
}

fn all_digits(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit())
}
