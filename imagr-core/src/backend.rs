//! The seam between the portable acquisition logic and the operating
//! system. [`crate::session::DeviceSession`] drives these primitives in a
//! fixed order; each platform (and the test suite) supplies its own
//! implementation.

use std::io::{self, Read, Seek, Write};
use std::path::PathBuf;

use crate::device::DeviceEntry;

/// Raw I/O on an acquired target. Block devices and serial ports both
/// satisfy this; serial ports simply fail on `seek`, which only the
/// verify path uses.
pub trait TargetIo: Read + Write + Seek + Send {}

impl<T: Read + Write + Seek + Send> TargetIo for T {}

/// An exclusive-access token (volume lock, disk arbitration claim, ...)
/// handed out during acquisition. Releasing is the implementor's `Drop`;
/// the session holds these and drops them in reverse acquisition order.
pub trait Claim: Send {}

/// A filesystem currently mounted from the target device (or one of its
/// partitions).
#[derive(Clone, Debug)]
pub struct Mount {
    /// The backing device node, e.g. `/dev/sdb1` or `\\.\E:`.
    pub source: PathBuf,
    /// Where it is mounted.
    pub point: PathBuf,
}

/// What to include when rebuilding the device catalog.
#[derive(Clone, Copy, Debug, Default)]
pub struct ScanOptions {
    /// Also list serial ports as targets.
    pub include_serial: bool,
    /// List every disk, not just removable ones. The system disk is
    /// included but stays marked so the session can refuse it.
    pub all_disks: bool,
}

/// Platform operations needed to discover and exclusively acquire a
/// target. Implementations live in [`crate::platform`]; tests inject
/// mocks.
pub trait DeviceBackend {
    /// Enumerates candidate targets in discovery order.
    fn scan(&mut self, opts: &ScanOptions) -> io::Result<Vec<DeviceEntry>>;

    /// Lists mounted filesystems backed by `entry`, partitions included.
    fn mounts(&self, entry: &DeviceEntry) -> io::Result<Vec<Mount>>;

    /// Force-unmounts one filesystem. May return a claim that has to be
    /// held until the session closes (e.g. a locked Windows volume).
    fn unmount(&mut self, mount: &Mount) -> io::Result<Option<Box<dyn Claim>>>;

    /// Takes a device-level exclusive claim where the platform has one
    /// (disk arbitration and friends). `None` where open-exclusive is
    /// already sufficient.
    fn claim(&mut self, entry: &DeviceEntry) -> io::Result<Option<Box<dyn Claim>>>;

    /// Opens the raw device node for synchronous, unbuffered, exclusive
    /// read-write.
    fn open_raw(&mut self, entry: &DeviceEntry) -> io::Result<Box<dyn TargetIo>>;

    /// Opens and configures a serial port: raw mode, 8 data bits, no
    /// parity, 1 stop bit, short read timeouts, non-blocking.
    fn open_serial(&mut self, entry: &DeviceEntry, baud: u32) -> io::Result<Box<dyn TargetIo>>;
}
