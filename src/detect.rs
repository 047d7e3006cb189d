//! Turns capture files into per-second segment files of threshold-crossing peaks.
//!
//! For every capture: take the in-phase component as volts, cut it into 1 ms
//! windows, keep the largest-magnitude sample of each window if it reaches the
//! trigger level, and append `<fraction>=<mV>` lines to the segment file for
//! the second the peak falls in.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    config::{secs, StationConfig},
    error::CaptureError,
    naming::{
        elapsed_units, parse_capture_name, segment_file_name, segment_line, CaptureTime, Rejection,
    },
    sample::SampleBuffer,
    shutdown::StopToken,
    spool::Spool,
};

/// A window maximum that reached the trigger level
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Peak {
    /// Sample index from the start of the buffer
    pub offset: usize,
    /// Signed, rounded to 0.01 mV
    pub millivolts: f64,
}

/// A peak placed in absolute time
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeakRecord {
    pub time: CaptureTime,
    pub millivolts: f64,
}

/// Round to two decimal places.
///
/// Goes through the decimal formatter, which rounds the exact binary value,
/// so `199.975` (really `199.97499...`) becomes `199.97`.
pub fn round_mv(mv: f64) -> f64 {
    format!("{:.2}", mv).parse().unwrap_or(mv)
}

/// Convert the in-phase component to millivolts
pub fn digitize(buf: &SampleBuffer, adc_voltage_range: f64) -> Vec<f64> {
    buf.in_phase()
        .map(|re| re as f64 * adc_voltage_range * 1000.0)
        .collect()
}

/// Largest-magnitude sample of each `window_len` window, kept if it reaches
/// `trigger_level`. The last window may be short. Ties go to the first sample.
pub fn find_peaks(voltage: &[f64], window_len: usize, trigger_level: f64) -> Vec<Peak> {
    let window_len = window_len.max(1);
    voltage
        .chunks(window_len)
        .enumerate()
        .filter_map(|(w, window)| {
            let (idx, value) = window.iter().copied().enumerate().fold(
                (0usize, 0f64),
                |(best_idx, best), (i, v)| {
                    if i == 0 || v.abs() > best.abs() {
                        (i, v)
                    } else {
                        (best_idx, best)
                    }
                },
            );
            let millivolts = round_mv(value);
            (millivolts.abs() >= trigger_level).then(|| Peak {
                offset: w * window_len + idx,
                millivolts,
            })
        })
        .collect()
}

/// Place peaks in absolute time relative to the capture's first sample
pub fn timestamp_peaks(base: CaptureTime, peaks: &[Peak], sample_rate: f64) -> Vec<PeakRecord> {
    peaks
        .iter()
        .map(|peak| PeakRecord {
            time: base.offset_by(elapsed_units(peak.offset, sample_rate)),
            millivolts: peak.millivolts,
        })
        .collect()
}

/// Segment file body per whole second, lines kept in arrival order
pub fn group_by_second(site: &str, records: &[PeakRecord]) -> BTreeMap<String, String> {
    let mut groups: BTreeMap<u64, String> = BTreeMap::new();
    for record in records {
        groups
            .entry(record.time.seconds)
            .or_default()
            .push_str(&segment_line(record.time.fraction, record.millivolts));
    }
    groups
        .into_iter()
        .map(|(second, body)| (segment_file_name(site, second), body))
        .collect()
}

/// Detection parameters taken from the station config
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub site: String,
    pub sample_rate: f64,
    pub adc_voltage_range: f64,
    pub trigger_level: f64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
}

impl DetectorSettings {
    pub fn from_config(config: &StationConfig) -> Self {
        Self {
            site: config.site_name.clone(),
            sample_rate: config.radio.sample_rate,
            adc_voltage_range: config.radio.adc_voltage_range,
            trigger_level: config.trigger_level,
            poll_interval: secs(config.poll_interval),
            error_backoff: secs(config.error_backoff),
        }
    }

    pub fn window_len(&self) -> usize {
        ((self.sample_rate * 0.001).floor() as usize).max(1)
    }
}

/// Outcome of one scan of the capture spool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Too few captures to safely process any
    Waiting,
    Pass {
        consumed: usize,
        skipped: usize,
    },
}

pub struct SegmentDetector {
    settings: DetectorSettings,
    captures: Arc<dyn Spool>,
    segments: Arc<dyn Spool>,
}

impl SegmentDetector {
    pub fn new(settings: DetectorSettings, captures: Arc<dyn Spool>, segments: Arc<dyn Spool>) -> Self {
        Self {
            settings,
            captures,
            segments,
        }
    }

    /// Peaks found in one capture, in absolute time
    pub fn detect(&self, buf: &SampleBuffer) -> Vec<PeakRecord> {
        let voltage = digitize(buf, self.settings.adc_voltage_range);
        let peaks = find_peaks(
            &voltage,
            self.settings.window_len(),
            self.settings.trigger_level,
        );
        timestamp_peaks(buf.time, &peaks, self.settings.sample_rate)
    }

    /// Append peaks to their segment files. Returns how many files failed.
    pub fn emit(&self, records: &[PeakRecord]) -> usize {
        let mut failures = 0;
        for (name, body) in group_by_second(&self.settings.site, records) {
            match self.segments.append(&name, body.as_bytes()) {
                Ok(()) => debug!("Saved data to: {}", name),
                Err(e) => {
                    failures += 1;
                    error!("Error saving segment {}: {}", name, e);
                }
            }
        }
        failures
    }

    /// Read, detect, emit and delete one capture.
    /// Unreadable captures are left where they are.
    pub fn process(&self, name: &str, time: CaptureTime) -> Result<usize, CaptureError> {
        let bytes = self.captures.read(name)?;
        let buf = SampleBuffer::from_bytes(time, &bytes)?;
        let records = self.detect(&buf);
        // Segment write failures are logged, the capture is consumed regardless
        self.emit(&records);
        self.captures.remove(name)?;
        Ok(records.len())
    }

    /// One pass over the capture spool, oldest first
    pub fn scan(&self) -> std::io::Result<Scan> {
        let names = self.captures.list_sorted()?;
        let mut skipped = 0;
        let mut pending = Vec::with_capacity(names.len());
        for name in names {
            match parse_capture_name(&name) {
                Ok(time) => pending.push((name, time)),
                Err(Rejection::InProgress) => skipped += 1,
                Err(why) => {
                    debug!(?why, "Skipping {}", name);
                    skipped += 1;
                }
            }
        }
        // A lone capture might be the one being written right now
        if pending.len() <= 1 {
            return Ok(Scan::Waiting);
        }
        let mut consumed = 0;
        for (name, time) in &pending {
            match self.process(name, *time) {
                Ok(peaks) => {
                    consumed += 1;
                    debug!(peaks, "Processed {}", name);
                }
                Err(e) => {
                    skipped += 1;
                    warn!("Error processing file {}: {}", name, e);
                }
            }
        }
        Ok(Scan::Pass { consumed, skipped })
    }

    /// Poll until stopped. Rescans immediately while captures are being consumed.
    pub fn run(&self, stop: StopToken) {
        info!(
            window_len = self.settings.window_len(),
            trigger_level = self.settings.trigger_level,
            "Segment detector started"
        );
        while !stop.is_stopped() {
            let pause = match self.scan() {
                Ok(Scan::Pass { consumed, .. }) if consumed > 0 => None,
                Ok(_) => Some(self.settings.poll_interval),
                Err(e) => {
                    error!("Error in segment detector: {}", e);
                    Some(self.settings.error_backoff)
                }
            };
            if let Some(pause) = pause {
                stop.sleep(pause);
            }
        }
        info!("Segment detector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{naming::capture_file_name, shutdown::StopSource, spool::MemorySpool};
    use num_complex::Complex32;
    use std::{
        io,
        sync::atomic::{AtomicUsize, Ordering},
        time::SystemTime,
    };

    fn refused() -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, "read-only filesystem")
    }

    /// Segment spool on a disk that refuses every write
    struct ReadOnlySegments;

    impl Spool for ReadOnlySegments {
        fn publish(&self, _name: &str, _bytes: &[u8]) -> io::Result<()> {
            Err(refused())
        }
        fn append(&self, _name: &str, _bytes: &[u8]) -> io::Result<()> {
            Err(refused())
        }
        fn list_sorted(&self) -> io::Result<Vec<String>> {
            Ok(Vec::new())
        }
        fn read(&self, _name: &str) -> io::Result<Vec<u8>> {
            Err(refused())
        }
        fn modified(&self, _name: &str) -> io::Result<Option<SystemTime>> {
            Err(refused())
        }
        fn remove(&self, _name: &str) -> io::Result<()> {
            Err(refused())
        }
    }

    /// Capture spool whose directory listing always fails
    #[derive(Default)]
    struct UnlistableCaptures {
        listings: AtomicUsize,
    }

    impl Spool for UnlistableCaptures {
        fn publish(&self, _name: &str, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn append(&self, _name: &str, _bytes: &[u8]) -> io::Result<()> {
            Ok(())
        }
        fn list_sorted(&self) -> io::Result<Vec<String>> {
            self.listings.fetch_add(1, Ordering::SeqCst);
            Err(io::Error::new(io::ErrorKind::NotFound, "capture dir is gone"))
        }
        fn read(&self, name: &str) -> io::Result<Vec<u8>> {
            Err(io::Error::new(io::ErrorKind::NotFound, name.to_owned()))
        }
        fn modified(&self, _name: &str) -> io::Result<Option<SystemTime>> {
            Ok(None)
        }
        fn remove(&self, _name: &str) -> io::Result<()> {
            Ok(())
        }
    }

    fn settings() -> DetectorSettings {
        DetectorSettings {
            site: "KOR1".to_owned(),
            sample_rate: 10_000.0,
            adc_voltage_range: 1.0,
            trigger_level: 100.0,
            poll_interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_find_peaks() {
        let voltage = [1.0, -250.004, 3.0, 40.0, 120.0, -119.0, 5.0];
        let peaks = find_peaks(&voltage, 3, 100.0);
        assert_eq!(
            peaks,
            vec![
                Peak {
                    offset: 1,
                    millivolts: -250.0
                },
                Peak {
                    offset: 4,
                    millivolts: 120.0
                },
            ]
        );
        // Pure function of its input
        assert_eq!(find_peaks(&voltage, 3, 100.0), peaks);
    }

    #[test]
    fn test_threshold_boundary() {
        assert_eq!(find_peaks(&[100.0], 1, 100.0).len(), 1);
        assert_eq!(find_peaks(&[-100.0], 1, 100.0).len(), 1);
        assert!(find_peaks(&[99.99], 1, 100.0).is_empty());
        // Rounding happens before the comparison
        assert_eq!(find_peaks(&[99.996], 1, 100.0).len(), 1);
    }

    #[test]
    fn test_partial_last_window() {
        let peaks = find_peaks(&[0.0, 0.0, 0.0, 0.0, 300.0], 4, 100.0);
        assert_eq!(
            peaks,
            vec![Peak {
                offset: 4,
                millivolts: 300.0
            }]
        );
    }

    #[test]
    fn test_ties_keep_first() {
        let peaks = find_peaks(&[200.0, -200.0], 2, 100.0);
        assert_eq!(peaks[0].offset, 0);
        assert_eq!(peaks[0].millivolts, 200.0);
    }

    #[test]
    fn test_digitize_uses_in_phase() {
        let buf = SampleBuffer::from_samples(
            CaptureTime::default(),
            &[Complex32::new(0.5, 0.9), Complex32::new(-0.25, -0.9)],
        );
        assert_eq!(digitize(&buf, 2.0), vec![1000.0, -500.0]);
    }

    #[test]
    fn test_timestamp_carry() {
        let base = CaptureTime::new(100, 9_999_000);
        let peaks = [
            Peak {
                offset: 0,
                millivolts: 1.0,
            },
            Peak {
                offset: 1,
                millivolts: 2.0,
            },
        ];
        // One sample at 10 kHz is 1000 units
        let records = timestamp_peaks(base, &peaks, 10_000.0);
        assert_eq!(records[0].time, CaptureTime::new(100, 9_999_000));
        assert_eq!(records[1].time, CaptureTime::new(101, 0));

        let stays = timestamp_peaks(CaptureTime::new(100, 9_998_999), &peaks[1..], 10_000.0);
        assert_eq!(stays[0].time, CaptureTime::new(100, 9_999_999));
    }

    #[test]
    fn test_group_by_second() {
        let records = [
            PeakRecord {
                time: CaptureTime::new(10, 9_000_000),
                millivolts: 150.0,
            },
            PeakRecord {
                time: CaptureTime::new(11, 5),
                millivolts: -120.5,
            },
            PeakRecord {
                time: CaptureTime::new(10, 9_500_000),
                millivolts: 101.0,
            },
        ];
        let groups = group_by_second("KOR1", &records);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["KOR110"], "9000000=150.00\n9500000=101.00\n");
        assert_eq!(groups["KOR111"], "0000005=-120.50\n");
    }

    fn capture(spool: &MemorySpool, time: CaptureTime, spikes: &[(usize, f32)]) -> String {
        let mut buf = SampleBuffer::zeroed(time, 20);
        for &(idx, re) in spikes {
            buf.set(idx, Complex32::new(re, 0.0));
        }
        let name = capture_file_name("KOR1", time);
        spool.publish(&name, buf.as_bytes()).unwrap();
        name
    }

    #[test]
    fn test_scan_waits_for_second_file() {
        let captures = Arc::new(MemorySpool::new());
        let segments = Arc::new(MemorySpool::new());
        let detector = SegmentDetector::new(settings(), captures.clone(), segments.clone());
        capture(&captures, CaptureTime::new(10, 0), &[(3, 0.5)]);
        assert_eq!(detector.scan().unwrap(), Scan::Waiting);
        assert_eq!(captures.len(), 1);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_scan_filters_malformed() {
        let captures = Arc::new(MemorySpool::new());
        let segments = Arc::new(MemorySpool::new());
        let detector = SegmentDetector::new(settings(), captures.clone(), segments.clone());
        let good = capture(&captures, CaptureTime::new(10, 0), &[(3, 0.5)]);
        captures.publish("KOR110.0000000.cf32", &[0u8; 16]).unwrap();
        captures
            .publish("KOR10000000010.5000000.over", &[0u8; 16])
            .unwrap();
        captures
            .publish("KOR10000000010.6000000.cf32.part", &[0u8; 3])
            .unwrap();
        // Valid name, body cut short
        captures
            .publish("KOR10000000010.7000000.cf32", &[0u8; 12])
            .unwrap();

        assert_eq!(
            detector.scan().unwrap(),
            Scan::Pass {
                consumed: 1,
                skipped: 4
            }
        );
        assert!(!captures.contains(&good));
        assert_eq!(captures.len(), 4);
        assert!(captures.contains("KOR10000000010.7000000.cf32"));
        assert_eq!(
            segments.read("KOR110").unwrap(),
            b"0003000=500.00\n".to_vec()
        );
    }

    #[test]
    fn test_segments_accumulate_across_captures() {
        let captures = Arc::new(MemorySpool::new());
        let segments = Arc::new(MemorySpool::new());
        let detector = SegmentDetector::new(settings(), captures.clone(), segments.clone());
        // 20 samples at 10 kHz is 2 ms, two windows of 10 samples
        capture(&captures, CaptureTime::new(10, 9_990_000), &[(2, 0.2), (15, -0.3)]);
        capture(&captures, CaptureTime::new(11, 1_000_000), &[(0, 0.4)]);
        assert_eq!(
            detector.scan().unwrap(),
            Scan::Pass {
                consumed: 2,
                skipped: 0
            }
        );
        assert!(captures.is_empty());
        assert_eq!(segments.read("KOR110").unwrap(), b"9992000=200.00\n".to_vec());
        assert_eq!(
            segments.read("KOR111").unwrap(),
            b"0005000=-300.00\n1000000=400.00\n".to_vec()
        );
    }

    #[test]
    fn test_round_mv_is_correctly_rounded() {
        assert_eq!(round_mv(199.975), 199.97);
        assert_eq!(round_mv(-250.004), -250.0);
        assert_eq!(round_mv(99.996), 100.0);
        assert_eq!(round_mv(123.456), 123.46);
    }

    #[test]
    fn test_lone_capture_waits_beside_partial() {
        let captures = Arc::new(MemorySpool::new());
        let segments = Arc::new(MemorySpool::new());
        let detector = SegmentDetector::new(settings(), captures.clone(), segments.clone());
        let lone = capture(&captures, CaptureTime::new(10, 0), &[(3, 0.5)]);
        captures
            .publish("KOR10000000011.0000000.cf32.part", &[0u8; 8])
            .unwrap();
        captures.publish("notes.txt", b"junk").unwrap();
        assert_eq!(detector.scan().unwrap(), Scan::Waiting);
        assert!(captures.contains(&lone));
        assert_eq!(captures.len(), 3);
        assert!(segments.is_empty());
    }

    #[test]
    fn test_capture_consumed_when_segments_fail() {
        let captures = Arc::new(MemorySpool::new());
        let detector = SegmentDetector::new(settings(), captures.clone(), Arc::new(ReadOnlySegments));
        let name = capture(&captures, CaptureTime::new(10, 0), &[(3, 0.5), (13, -0.5)]);
        assert_eq!(detector.process(&name, CaptureTime::new(10, 0)).unwrap(), 2);
        assert!(captures.is_empty());
    }

    #[test]
    fn test_run_backs_off_on_listing_errors() {
        let captures = Arc::new(UnlistableCaptures::default());
        let detector = SegmentDetector::new(
            settings(),
            captures.clone(),
            Arc::new(MemorySpool::new()),
        );
        let stop = StopSource::new();
        let token = stop.token();
        let worker = std::thread::spawn(move || detector.run(token));
        std::thread::sleep(Duration::from_millis(100));
        stop.stop();
        worker.join().unwrap();
        // Kept polling after the first failure, but paused between attempts
        let listings = captures.listings.load(Ordering::SeqCst);
        assert!(listings >= 2);
        assert!(listings < 1000);
    }
}
