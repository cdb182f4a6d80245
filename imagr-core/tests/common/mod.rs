#![allow(dead_code)]

//! Shared test doubles: a scriptable device backend, an in-memory block
//! target, and a serial port that speaks the bootloader handshake.

use std::collections::VecDeque;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use imagr_core::backend::{Claim, DeviceBackend, Mount, ScanOptions, TargetIo};
use imagr_core::device::{DeviceEntry, TargetKind};

pub type EventLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn events(log: &EventLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn block_entry(name: &str, capacity: u64, system: bool) -> DeviceEntry {
    DeviceEntry {
        path: PathBuf::from(format!("/dev/{name}")),
        label: name.to_string(),
        capacity,
        kind: TargetKind::BlockDevice,
        system,
    }
}

pub fn serial_entry(name: &str) -> DeviceEntry {
    DeviceEntry {
        path: PathBuf::from(format!("/dev/{name}")),
        label: name.to_string(),
        capacity: 0,
        kind: TargetKind::SerialPort,
        system: false,
    }
}

pub fn mount(source: &str, point: &str) -> Mount {
    Mount {
        source: PathBuf::from(source),
        point: PathBuf::from(point),
    }
}

/// A claim that records its release in the event log.
pub struct MockClaim {
    log: EventLog,
    name: String,
}

impl MockClaim {
    pub fn new(log: &EventLog, name: String) -> Self {
        MockClaim {
            log: Arc::clone(log),
            name,
        }
    }
}

impl Claim for MockClaim {}

impl Drop for MockClaim {
    fn drop(&mut self) {
        self.log.lock().unwrap().push(format!("release:{}", self.name));
    }
}

/// An in-memory block device. The backing buffer is shared so tests can
/// inspect it after the session is gone; `flip_read_at` corrupts one
/// byte on the read path to exercise verification.
pub struct MemTarget {
    buf: Arc<Mutex<Vec<u8>>>,
    pos: u64,
    flip_read_at: Option<u64>,
}

impl MemTarget {
    pub fn new(buf: Arc<Mutex<Vec<u8>>>, flip_read_at: Option<u64>) -> Self {
        MemTarget {
            buf,
            pos: 0,
            flip_read_at,
        }
    }
}

impl Read for MemTarget {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let buf = self.buf.lock().unwrap();
        let start = self.pos as usize;
        if start >= buf.len() {
            return Ok(0);
        }
        let n = out.len().min(buf.len() - start);
        out[..n].copy_from_slice(&buf[start..start + n]);
        if let Some(at) = self.flip_read_at {
            if at >= self.pos && at < self.pos + n as u64 {
                out[(at - self.pos) as usize] ^= 0xff;
            }
        }
        self.pos += n as u64;
        Ok(n)
    }
}

impl Write for MemTarget {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut buf = self.buf.lock().unwrap();
        let start = self.pos as usize;
        if buf.len() < start + data.len() {
            buf.resize(start + data.len(), 0);
        }
        buf[start..start + data.len()].copy_from_slice(data);
        self.pos += data.len() as u64;
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MemTarget {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let len = self.buf.lock().unwrap().len() as i64;
        let new = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => len + d,
        };
        if new < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek before start"));
        }
        self.pos = new as u64;
        Ok(self.pos)
    }
}

/// Scripted serial endpoint. Bytes in `feed` are served first, one per
/// read; once four bytes have been written (the size word), `ack` is
/// served. Everything written is captured for inspection.
#[derive(Default)]
pub struct SerialScript {
    pub feed: VecDeque<u8>,
    pub ack: VecDeque<u8>,
    pub written: Vec<u8>,
}

pub struct MockSerial {
    state: Arc<Mutex<SerialScript>>,
}

impl MockSerial {
    pub fn new(state: Arc<Mutex<SerialScript>>) -> Self {
        MockSerial { state }
    }
}

impl Read for MockSerial {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let mut s = self.state.lock().unwrap();
        if let Some(b) = s.feed.pop_front() {
            out[0] = b;
            return Ok(1);
        }
        if s.written.len() >= 4 {
            if let Some(b) = s.ack.pop_front() {
                out[0] = b;
                return Ok(1);
            }
        }
        Err(io::Error::new(io::ErrorKind::WouldBlock, "no data"))
    }
}

impl Write for MockSerial {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.state.lock().unwrap().written.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for MockSerial {
    fn seek(&mut self, _pos: SeekFrom) -> io::Result<u64> {
        Err(io::Error::new(io::ErrorKind::Unsupported, "serial ports do not seek"))
    }
}

/// A backend whose every answer is scripted and whose every call is
/// logged.
pub struct MockBackend {
    pub entries: Vec<DeviceEntry>,
    pub mounts: Vec<Mount>,
    /// Hand out a claim from each successful unmount.
    pub unmount_claims: bool,
    /// Fail the nth unmount call (0-based).
    pub fail_unmount_at: Option<usize>,
    /// Hand out a device-level claim.
    pub claim_returns: bool,
    pub fail_claim: bool,
    pub fail_open: bool,
    pub log: EventLog,
    pub target_buf: Arc<Mutex<Vec<u8>>>,
    pub flip_read_at: Option<u64>,
    pub serial: Arc<Mutex<SerialScript>>,
    unmount_calls: usize,
}

impl MockBackend {
    pub fn new(entries: Vec<DeviceEntry>) -> Self {
        MockBackend {
            entries,
            mounts: Vec::new(),
            unmount_claims: false,
            fail_unmount_at: None,
            claim_returns: false,
            fail_claim: false,
            fail_open: false,
            log: new_log(),
            target_buf: Arc::new(Mutex::new(Vec::new())),
            flip_read_at: None,
            serial: Arc::new(Mutex::new(SerialScript::default())),
            unmount_calls: 0,
        }
    }
}

impl DeviceBackend for MockBackend {
    fn scan(&mut self, _opts: &ScanOptions) -> io::Result<Vec<DeviceEntry>> {
        self.log.lock().unwrap().push("scan".into());
        Ok(self.entries.clone())
    }

    fn mounts(&self, _entry: &DeviceEntry) -> io::Result<Vec<Mount>> {
        self.log.lock().unwrap().push("mounts".into());
        Ok(self.mounts.clone())
    }

    fn unmount(&mut self, mount: &Mount) -> io::Result<Option<Box<dyn Claim>>> {
        let call = self.unmount_calls;
        self.unmount_calls += 1;
        if self.fail_unmount_at == Some(call) {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        }
        let point = mount.point.display().to_string();
        self.log.lock().unwrap().push(format!("unmount:{point}"));
        Ok(self
            .unmount_claims
            .then(|| Box::new(MockClaim::new(&self.log, format!("lock:{point}"))) as Box<dyn Claim>))
    }

    fn claim(&mut self, entry: &DeviceEntry) -> io::Result<Option<Box<dyn Claim>>> {
        if self.fail_claim {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "claim refused"));
        }
        let name = entry.path.display().to_string();
        self.log.lock().unwrap().push(format!("claim:{name}"));
        Ok(self
            .claim_returns
            .then(|| Box::new(MockClaim::new(&self.log, format!("claim:{name}"))) as Box<dyn Claim>))
    }

    fn open_raw(&mut self, _entry: &DeviceEntry) -> io::Result<Box<dyn TargetIo>> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "open refused"));
        }
        self.log.lock().unwrap().push("open".into());
        Ok(Box::new(MemTarget::new(
            Arc::clone(&self.target_buf),
            self.flip_read_at,
        )))
    }

    fn open_serial(&mut self, _entry: &DeviceEntry, baud: u32) -> io::Result<Box<dyn TargetIo>> {
        self.log.lock().unwrap().push(format!("open_serial:{baud}"));
        Ok(Box::new(MockSerial::new(Arc::clone(&self.serial))))
    }
}
