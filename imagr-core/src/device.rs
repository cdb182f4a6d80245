use std::fmt;
use std::path::PathBuf;

/// What kind of target an entry refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TargetKind {
    /// A raw block device (USB stick, SD card, disk).
    BlockDevice,
    /// A serial port speaking to a remote bootloader.
    SerialPort,
}

/// One discovered write target.
///
/// Entries are produced by a [`crate::backend::DeviceBackend`] during a
/// catalog refresh. They are immutable snapshots: a refresh rebuilds the
/// whole list and invalidates previous indices.
#[derive(Clone, Debug)]
pub struct DeviceEntry {
    /// The platform path of the target (e.g. `/dev/sdb`, `/dev/ttyUSB0`
    /// or `\\.\PhysicalDrive2`).
    pub path: PathBuf,
    /// Human-readable label: name, size, vendor/model where known.
    pub label: String,
    /// Reported capacity in bytes. `0` means the size could not be
    /// determined and the pre-write size check is skipped.
    pub capacity: u64,
    /// Block device or serial port.
    pub kind: TargetKind,
    /// True when this entry backs the running system. Such entries only
    /// show up with the all-disks override and are still refused by
    /// [`crate::session::DeviceSession::open`] unless explicitly allowed.
    pub system: bool,
}

impl fmt::Display for DeviceEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<15} {}", self.path.display(), self.label)
    }
}

/// Formats a byte count the way device labels show it, with one decimal.
pub fn human_size(bytes: u64) -> String {
    if bytes == 0 {
        return "?".to_string();
    }
    // Tenths without going through floats, matching the label layout of
    // the systems this replaces.
    let gib_times_10 = (10 * bytes) >> 30;
    if gib_times_10 >= 10 {
        format!("{}.{} GiB", gib_times_10 / 10, gib_times_10 % 10)
    } else {
        let mib_times_10 = (10 * bytes) >> 20;
        format!("{}.{} MiB", mib_times_10 / 10, mib_times_10 % 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn human_size_picks_unit() {
        assert_eq!(human_size(0), "?");
        assert_eq!(human_size(512 << 20), "512.0 MiB");
        assert_eq!(human_size(16 << 30), "16.0 GiB");
        assert_eq!(human_size((7 << 30) + (460 << 20)), "7.4 GiB");
    }
}
