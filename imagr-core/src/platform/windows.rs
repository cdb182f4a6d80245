use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::fs::OpenOptionsExt;
use std::os::windows::io::{FromRawHandle, RawHandle};
use std::path::PathBuf;
use std::ptr;

use tracing::debug;

use windows_sys::Win32::Devices::Communication::{
    COMMTIMEOUTS, DCB, GetCommState, NOPARITY, ONESTOPBIT, SetCommState, SetCommTimeouts,
};
use windows_sys::Win32::Foundation::{
    CloseHandle, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Storage::FileSystem::{
    CreateFileW, FILE_FLAG_NO_BUFFERING, FILE_FLAG_WRITE_THROUGH, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows_sys::Win32::System::IO::DeviceIoControl;
use windows_sys::Win32::System::Ioctl::{
    DISK_GEOMETRY_EX, FSCTL_DISMOUNT_VOLUME, FSCTL_LOCK_VOLUME, FSCTL_UNLOCK_VOLUME,
    IOCTL_DISK_GET_DRIVE_GEOMETRY_EX, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS,
    VOLUME_DISK_EXTENTS,
};

use crate::backend::{Claim, DeviceBackend, Mount, ScanOptions, TargetIo};
use crate::device::{DeviceEntry, TargetKind, human_size};

const MAX_PHYSICAL_DRIVES: u32 = 64;
const MAX_COM_PORTS: u32 = 64;

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

fn open_handle(path: &OsStr, access: u32, flags: u32) -> io::Result<HANDLE> {
    let name = wide(path);
    let handle = unsafe {
        CreateFileW(
            name.as_ptr(),
            access,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            ptr::null(),
            OPEN_EXISTING,
            flags,
            ptr::null_mut(),
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        Err(io::Error::last_os_error())
    } else {
        Ok(handle)
    }
}

fn ioctl_read<T>(handle: HANDLE, code: u32) -> io::Result<T> {
    let mut out = std::mem::MaybeUninit::<T>::zeroed();
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            ptr::null(),
            0,
            out.as_mut_ptr().cast(),
            std::mem::size_of::<T>() as u32,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(unsafe { out.assume_init() })
    }
}

fn ioctl_nodata(handle: HANDLE, code: u32) -> io::Result<()> {
    let mut returned = 0u32;
    let ok = unsafe {
        DeviceIoControl(
            handle,
            code,
            ptr::null(),
            0,
            ptr::null_mut(),
            0,
            &mut returned,
            ptr::null_mut(),
        )
    };
    if ok == 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// A locked, dismounted volume. The handle is kept open for the whole
/// session; unlocking then closing it hands the volume back to the OS.
struct VolumeLock {
    handle: HANDLE,
}

unsafe impl Send for VolumeLock {}

impl Claim for VolumeLock {}

impl Drop for VolumeLock {
    fn drop(&mut self) {
        unsafe {
            DeviceIoControl(
                self.handle,
                FSCTL_UNLOCK_VOLUME,
                ptr::null(),
                0,
                ptr::null_mut(),
                0,
                &mut 0u32,
                ptr::null_mut(),
            );
            CloseHandle(self.handle);
        }
    }
}

/// Which physical drive number a volume's extents sit on, if any.
fn volume_disk_number(letter: char) -> Option<u32> {
    let path: PathBuf = format!(r"\\.\{letter}:").into();
    let handle = open_handle(path.as_os_str(), GENERIC_READ, 0).ok()?;
    let extents: io::Result<VOLUME_DISK_EXTENTS> =
        ioctl_read(handle, IOCTL_VOLUME_GET_VOLUME_DISK_EXTENTS);
    unsafe { CloseHandle(handle) };
    let extents = extents.ok()?;
    (extents.NumberOfDiskExtents > 0).then(|| extents.Extents[0].DiskNumber)
}

fn drive_number(entry: &DeviceEntry) -> io::Result<u32> {
    entry
        .path
        .to_string_lossy()
        .rsplit("PhysicalDrive")
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "not a physical drive path"))
}

#[derive(Default)]
pub struct WindowsBackend;

pub fn native_backend() -> WindowsBackend {
    WindowsBackend
}

impl DeviceBackend for WindowsBackend {
    fn scan(&mut self, opts: &ScanOptions) -> io::Result<Vec<DeviceEntry>> {
        let system_drive = volume_disk_number('C');
        let mut entries = Vec::new();

        for n in 0..MAX_PHYSICAL_DRIVES {
            let path: PathBuf = format!(r"\\.\PhysicalDrive{n}").into();
            let Ok(handle) = open_handle(path.as_os_str(), GENERIC_READ, 0) else {
                continue;
            };
            let geometry: io::Result<DISK_GEOMETRY_EX> =
                ioctl_read(handle, IOCTL_DISK_GET_DRIVE_GEOMETRY_EX);
            unsafe { CloseHandle(handle) };
            let capacity = geometry.map(|g| g.DiskSize as u64).unwrap_or(0);

            // Geometry media type is unreliable for USB disks, so the
            // default listing only excludes the disk holding C:.
            let system = system_drive == Some(n);
            if !opts.all_disks && system {
                continue;
            }

            entries.push(DeviceEntry {
                label: format!("PhysicalDrive{n} [{}]", human_size(capacity)),
                path,
                capacity,
                kind: TargetKind::BlockDevice,
                system,
            });
        }

        if opts.include_serial {
            for n in 1..=MAX_COM_PORTS {
                let path: PathBuf = format!(r"\\.\COM{n}").into();
                if let Ok(handle) =
                    open_handle(path.as_os_str(), GENERIC_READ | GENERIC_WRITE, 0)
                {
                    unsafe { CloseHandle(handle) };
                    entries.push(DeviceEntry {
                        label: format!("COM{n}"),
                        path,
                        capacity: 0,
                        kind: TargetKind::SerialPort,
                        system: false,
                    });
                }
            }
        }

        Ok(entries)
    }

    fn mounts(&self, entry: &DeviceEntry) -> io::Result<Vec<Mount>> {
        let disk = drive_number(entry)?;
        let mut mounts = Vec::new();
        for letter in 'A'..='Z' {
            if volume_disk_number(letter) == Some(disk) {
                mounts.push(Mount {
                    source: format!(r"\\.\{letter}:").into(),
                    point: format!(r"{letter}:\").into(),
                });
            }
        }
        Ok(mounts)
    }

    /// Locks and dismounts one volume. The lock handle is the claim and
    /// must be held open until the write finishes.
    fn unmount(&mut self, mount: &Mount) -> io::Result<Option<Box<dyn Claim>>> {
        debug!(volume = %mount.source.display(), "locking and dismounting");
        let handle = open_handle(
            mount.source.as_os_str(),
            GENERIC_READ | GENERIC_WRITE,
            0,
        )?;
        if let Err(e) = ioctl_nodata(handle, FSCTL_LOCK_VOLUME) {
            unsafe { CloseHandle(handle) };
            return Err(e);
        }
        if let Err(e) = ioctl_nodata(handle, FSCTL_DISMOUNT_VOLUME) {
            unsafe {
                DeviceIoControl(
                    handle,
                    FSCTL_UNLOCK_VOLUME,
                    ptr::null(),
                    0,
                    ptr::null_mut(),
                    0,
                    &mut 0u32,
                    ptr::null_mut(),
                );
                CloseHandle(handle);
            }
            return Err(e);
        }
        Ok(Some(Box::new(VolumeLock { handle })))
    }

    fn claim(&mut self, _entry: &DeviceEntry) -> io::Result<Option<Box<dyn Claim>>> {
        // Volume locks taken during unmount are the exclusivity
        // mechanism on Windows.
        Ok(None)
    }

    fn open_raw(&mut self, entry: &DeviceEntry) -> io::Result<Box<dyn TargetIo>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(FILE_FLAG_NO_BUFFERING | FILE_FLAG_WRITE_THROUGH)
            .open(&entry.path)?;
        Ok(Box::new(file))
    }

    fn open_serial(&mut self, entry: &DeviceEntry, baud: u32) -> io::Result<Box<dyn TargetIo>> {
        let handle = open_handle(
            entry.path.as_os_str(),
            GENERIC_READ | GENERIC_WRITE,
            0,
        )?;
        if let Err(e) = configure_com(handle, baud) {
            unsafe { CloseHandle(handle) };
            return Err(e);
        }
        let file = unsafe { File::from_raw_handle(handle as RawHandle) };
        Ok(Box::new(file))
    }
}

/// 8N1 at the requested speed with 1 ms read timeouts, matching the
/// polling cadence of the handshake loop.
fn configure_com(handle: HANDLE, baud: u32) -> io::Result<()> {
    let mut dcb: DCB = unsafe { std::mem::zeroed() };
    dcb.DCBlength = std::mem::size_of::<DCB>() as u32;
    if unsafe { GetCommState(handle, &mut dcb) } == 0 {
        return Err(io::Error::last_os_error());
    }
    dcb.BaudRate = baud;
    dcb.ByteSize = 8;
    dcb.Parity = NOPARITY;
    dcb.StopBits = ONESTOPBIT;
    if unsafe { SetCommState(handle, &dcb) } == 0 {
        return Err(io::Error::last_os_error());
    }

    let timeouts = COMMTIMEOUTS {
        ReadIntervalTimeout: 1,
        ReadTotalTimeoutMultiplier: 1,
        ReadTotalTimeoutConstant: 1,
        WriteTotalTimeoutMultiplier: 1,
        WriteTotalTimeoutConstant: 1,
    };
    if unsafe { SetCommTimeouts(handle, &timeouts) } == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
