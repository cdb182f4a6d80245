//! Throughput and remaining-time estimation.
//!
//! One sample is taken per completed pull. The exposed speed is a running
//! average of the per-sample instantaneous rates; an ETA is only shown
//! once 3 samples exist, because the first couple of rates are noise.

use std::time::Instant;

use crate::stream::Snapshot;

/// Samples below this count produce byte counters but no ETA string.
const MIN_ETA_SAMPLES: u64 = 3;

pub struct ProgressEstimator {
    start: Instant,
    avg_bytes: u64,
    avg_samples: u64,
}

impl Default for ProgressEstimator {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressEstimator {
    pub fn new() -> Self {
        ProgressEstimator {
            start: Instant::now(),
            avg_bytes: 0,
            avg_samples: 0,
        }
    }

    /// Returns `(percent, message)` for the current counters.
    ///
    /// Call with `done = false` after every chunk and `done = true` once
    /// after the loop ends. The done message is an elapsed-time summary
    /// when the transfer completed, and empty otherwise.
    pub fn status(&mut self, snap: &Snapshot, done: bool) -> (u8, String) {
        self.status_at(snap, done, Instant::now())
    }

    fn status_at(&mut self, snap: &Snapshot, done: bool, now: Instant) -> (u8, String) {
        let elapsed = now.saturating_duration_since(self.start).as_secs();

        if done {
            if snap.file_size.is_some_and(|fs| snap.read_size >= fs) {
                let (h, m, s) = hms(elapsed);
                return (
                    100,
                    format!(
                        "Done. {} MiB written in {:02}:{:02}:{:02}",
                        snap.read_size >> 20,
                        h,
                        m,
                        s
                    ),
                );
            }
            return (0, String::new());
        }

        let mut remaining = String::new();
        if elapsed >= 1 && snap.read_size > 0 {
            let instantaneous = if snap.file_size.is_some() {
                snap.read_size / elapsed
            } else {
                snap.cmrd_size / elapsed
            };
            self.avg_bytes += instantaneous;
            self.avg_samples += 1;
            let average = self.avg_bytes / self.avg_samples;

            if self.avg_samples >= MIN_ETA_SAMPLES && average > 0 {
                let left = match snap.file_size {
                    Some(fs) => fs.saturating_sub(snap.read_size),
                    None => snap.comp_size.saturating_sub(snap.cmrd_size),
                } / average;
                remaining = format_remaining(left);
            }
        }

        let sep = if remaining.is_empty() { "" } else { ", " };
        let message = match snap.file_size {
            Some(fs) => format!(
                "{:6} MiB / {} MiB{}{}",
                snap.read_size >> 20,
                fs >> 20,
                sep,
                remaining
            ),
            None => format!("{:6} MiB so far{}{}", snap.read_size >> 20, sep, remaining),
        };

        // read_size may overshoot file_size by up to a sector of padding,
        // hence the cap. The +1 keeps the compressed-domain formula from
        // dividing by zero before anything has been read.
        let percent = match snap.file_size {
            Some(fs) if fs > 0 => (snap.read_size * 1000) / (fs * 10),
            _ => (snap.cmrd_size * 1000) / (snap.comp_size * 10 + 1),
        };
        (percent.min(100) as u8, message)
    }
}

fn hms(secs: u64) -> (u64, u64, u64) {
    (secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn format_remaining(secs: u64) -> String {
    let (h, m, s) = hms(secs);
    if h > 0 {
        format!("{} hour{} and {} min{} left", h, plural(h), m, plural(m))
    } else if m > 0 {
        format!("{} min{} and {} sec{} left", m, plural(m), s, plural(s))
    } else {
        format!("{} sec{} left", s, plural(s))
    }
}

fn plural(n: u64) -> &'static str {
    if n == 1 { "" } else { "s" }
}
