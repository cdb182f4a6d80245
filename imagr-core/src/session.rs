//! Exclusive acquisition of a write target.
//!
//! A [`DeviceSession`] walks a fixed sequence of stages (validate,
//! unmount, lock, open), collecting a claim guard for every exclusive
//! token it takes. Whatever stage fails, every claim taken so far is
//! released, in reverse; the same unwind runs on [`DeviceSession::close`]
//! and on drop. A leaked volume lock leaves the device unusable until
//! reboot, so the release path is the one invariant this module must
//! never break.
//!
//! Serial targets skip the unmount/lock phases and instead run an
//! optional synchronization handshake with the remote bootloader.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::{Claim, DeviceBackend, TargetIo};
use crate::catalog::DeviceCatalog;
use crate::device::TargetKind;
use crate::error::AcquireError;

/// Delay between polls while waiting for serial handshake bytes.
const SERIAL_POLL: Duration = Duration::from_millis(10);

/// Stages of acquisition. Only `Opened` accepts I/O; `Closed` is
/// terminal and reached from every other state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Unopened,
    Validating,
    Unmounting,
    Locking,
    Opened,
    Closed,
}

/// Knobs for [`DeviceSession::open`].
#[derive(Clone)]
pub struct SessionOptions {
    /// Accept a target marked as the system disk.
    pub allow_system_disk: bool,
    /// Serial line speed.
    pub baud: u32,
    /// Run the bootloader synchronization handshake after opening a
    /// serial target.
    pub handshake: bool,
    /// Cooperative cancellation, checked inside the handshake poll loop.
    /// Cancellation during a blocking platform call (unmount, raw open)
    /// only takes effect once that call returns.
    pub running: Arc<AtomicBool>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        SessionOptions {
            allow_system_disk: false,
            baud: 115_200,
            handshake: false,
            running: Arc::new(AtomicBool::new(true)),
        }
    }
}

/// An exclusively acquired target, ready for raw writes.
pub struct DeviceSession {
    state: SessionState,
    kind: TargetKind,
    target: Option<Box<dyn TargetIo>>,
    claims: Vec<Box<dyn Claim>>,
}

impl std::fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceSession")
            .field("state", &self.state)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl DeviceSession {
    /// Acquires the catalog entry at `index` for writing `declared_size`
    /// bytes.
    ///
    /// Block devices: validate, force-unmount every filesystem backed by
    /// the device (refusing outright if one of them is the root or boot
    /// filesystem), take the platform's exclusive claim, then open the
    /// raw node. Serial ports: open and configure the port, then run the
    /// handshake if configured. Every failure releases exactly the
    /// claims already taken.
    pub fn open(
        backend: &mut dyn DeviceBackend,
        catalog: &DeviceCatalog,
        index: usize,
        declared_size: u64,
        opts: &SessionOptions,
    ) -> Result<DeviceSession, AcquireError> {
        let entry = catalog
            .get(index)
            .ok_or(AcquireError::InvalidTarget(index))?;

        if entry.system && !opts.allow_system_disk {
            return Err(AcquireError::SystemDisk);
        }

        if entry.kind == TargetKind::SerialPort {
            debug!(path = %entry.path.display(), baud = opts.baud, "opening serial target");
            let mut port = backend
                .open_serial(entry, opts.baud)
                .map_err(AcquireError::Open)?;
            if opts.handshake {
                serial_handshake(port.as_mut(), declared_size, &opts.running)?;
            }
            return Ok(DeviceSession {
                state: SessionState::Opened,
                kind: TargetKind::SerialPort,
                target: Some(port),
                claims: Vec::new(),
            });
        }

        // Capacity 0 means the platform could not size the device; the
        // check is skipped rather than treated as an empty target.
        if declared_size > 0 && entry.capacity > 0 && declared_size > entry.capacity {
            return Err(AcquireError::TargetTooSmall {
                capacity: entry.capacity,
                needed: declared_size,
            });
        }

        let mounts = backend.mounts(entry).map_err(|e| AcquireError::Unmount {
            path: entry.path.clone(),
            source: e,
        })?;

        // Refuse before touching anything if the device backs the
        // running system.
        if let Some(m) = mounts.iter().find(|m| is_system_mount(&m.point)) {
            return Err(AcquireError::RootMount(m.point.clone()));
        }

        let mut claims: Vec<Box<dyn Claim>> = Vec::new();
        for mount in &mounts {
            debug!(point = %mount.point.display(), "force-unmounting");
            match backend.unmount(mount) {
                Ok(Some(claim)) => claims.push(claim),
                Ok(None) => {}
                Err(e) => {
                    release_claims(&mut claims);
                    return Err(AcquireError::Unmount {
                        path: mount.point.clone(),
                        source: e,
                    });
                }
            }
        }

        match backend.claim(entry) {
            Ok(Some(claim)) => claims.push(claim),
            Ok(None) => {}
            Err(e) => {
                release_claims(&mut claims);
                return Err(AcquireError::Lock(e));
            }
        }

        debug!(path = %entry.path.display(), "opening raw device");
        let target = match backend.open_raw(entry) {
            Ok(t) => t,
            Err(e) => {
                release_claims(&mut claims);
                return Err(AcquireError::Open(e));
            }
        };

        Ok(DeviceSession {
            state: SessionState::Opened,
            kind: TargetKind::BlockDevice,
            target: Some(target),
            claims,
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn kind(&self) -> TargetKind {
        self.kind
    }

    /// Writes one chunk to the target. The chunk is already sector
    /// padded by the decoder.
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let target = self.target_mut()?;
        target.write_all(buf)?;
        Ok(buf.len())
    }

    /// Re-reads the just-written chunk into `buf`: seeks back by
    /// `buf.len()`, reads, and leaves the offset where it was. Only
    /// meaningful on block devices.
    pub fn read_back(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let len = buf.len() as i64;
        let target = self.target_mut()?;
        target.seek(SeekFrom::Current(-len))?;
        target.read_exact(buf)
    }

    /// Reads the next chunk from the target (the device→image direction).
    pub fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.target_mut()?.read_exact(buf)
    }

    /// Flushes and releases everything: target handle first, then every
    /// claim in reverse acquisition order. Idempotent, best-effort, and
    /// also run on drop.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if let Some(mut target) = self.target.take() {
            if let Err(e) = target.flush() {
                warn!(error = %e, "flush on close failed");
            }
        }
        while let Some(claim) = self.claims.pop() {
            drop(claim);
        }
        self.state = SessionState::Closed;
        debug!("session closed");
    }

    fn target_mut(&mut self) -> io::Result<&mut Box<dyn TargetIo>> {
        if self.state != SessionState::Opened {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "session is not open",
            ));
        }
        self.target.as_mut().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "session has no target")
        })
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn release_claims(claims: &mut Vec<Box<dyn Claim>>) {
    while let Some(claim) = claims.pop() {
        drop(claim);
    }
}

fn is_system_mount(point: &Path) -> bool {
    point == Path::new("/") || point == Path::new("/boot")
}

/// Bootloader synchronization, as spoken by raspbootin-style loaders:
/// the client sends three consecutive `0x03` bytes, we answer with the
/// image length as LE32, and the client acknowledges with `"OK"`.
///
/// Any byte other than `0x03` resets the match counter; the sequence
/// must be three in a row, not three accumulated.
fn serial_handshake(
    port: &mut dyn TargetIo,
    declared_size: u64,
    running: &AtomicBool,
) -> Result<(), AcquireError> {
    debug!("awaiting serial client");
    let mut seen = 0u8;
    while seen < 3 {
        if !running.load(Ordering::SeqCst) {
            return Err(AcquireError::Cancelled);
        }
        let mut byte = [0u8; 1];
        match port.read(&mut byte) {
            Ok(1) => {
                if byte[0] == 0x03 {
                    seen += 1;
                } else {
                    // Anything else restarts the match; echo it for
                    // diagnostics since bootloaders print over the same
                    // line.
                    seen = 0;
                    debug!(byte = byte[0], "serial noise");
                }
            }
            Ok(_) => thread::sleep(SERIAL_POLL),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(SERIAL_POLL),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => thread::sleep(SERIAL_POLL),
            Err(e) => return Err(AcquireError::Comm(e)),
        }
    }
    debug!("serial client connected, sending size");

    let size = (declared_size as u32).to_le_bytes();
    port.write_all(&size).map_err(AcquireError::Comm)?;
    port.flush().map_err(AcquireError::Comm)?;

    let mut ack = [0u8; 2];
    let mut got = 0usize;
    while got < 2 {
        if !running.load(Ordering::SeqCst) {
            return Err(AcquireError::Cancelled);
        }
        match port.read(&mut ack[got..]) {
            Ok(0) => thread::sleep(SERIAL_POLL),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(SERIAL_POLL),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => thread::sleep(SERIAL_POLL),
            Err(e) => return Err(AcquireError::Comm(e)),
        }
    }
    if &ack != b"OK" {
        return Err(AcquireError::Handshake(format!(
            "expected OK, got {:02x} {:02x}",
            ack[0], ack[1]
        )));
    }
    debug!("serial handshake complete");
    Ok(())
}
