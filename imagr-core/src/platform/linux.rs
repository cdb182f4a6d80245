use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use nix::mount::{MntFlags, umount2};
use tracing::debug;

use crate::backend::{Claim, DeviceBackend, Mount, ScanOptions, TargetIo};
use crate::device::{DeviceEntry, TargetKind, human_size};

/// Helper to read one attribute file from /sys/block.
fn read_sys_file(device_name: &str, file: &str) -> io::Result<String> {
    let path = PathBuf::from("/sys/block").join(device_name).join(file);
    fs::read_to_string(path).map(|s| s.trim().to_string())
}

/// Finds the parent device of a partition (e.g. /dev/sda1 -> /dev/sda),
/// used to recognize the disk behind the root filesystem.
fn parent_device_path(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str.starts_with("/dev/sd") {
        if let Some(index) = path_str.rfind(|c: char| c.is_alphabetic()) {
            return PathBuf::from(&path_str[..=index]);
        }
    } else if path_str.starts_with("/dev/mmcblk") || path_str.starts_with("/dev/nvme") {
        if let Some(index) = path_str.find('p') {
            return PathBuf::from(&path_str[..index]);
        }
    }

    path.to_path_buf()
}

/// True when `disk_name` (e.g. "sdb1") is the device `device` (e.g.
/// "sdb") or one of its partitions. The suffix must start with a digit
/// or a 'p' so that "sdb1" matches "sdb" but "sdbx" does not.
fn is_on_device(disk_name: &str, device: &str) -> bool {
    match disk_name.strip_prefix(device) {
        Some("") => true,
        Some(rest) => rest
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_digit() || c == 'p'),
        None => false,
    }
}

#[derive(Default)]
pub struct LinuxBackend;

pub fn native_backend() -> LinuxBackend {
    LinuxBackend
}

impl LinuxBackend {
    fn scan_disks(&self, opts: &ScanOptions) -> io::Result<Vec<DeviceEntry>> {
        // The disk backing "/" is recognized by name so it can be
        // excluded (or merely flagged when listing everything).
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let system_disk = disks
            .iter()
            .find(|d| d.mount_point() == Path::new("/"))
            .map(|d| parent_device_path(&PathBuf::from("/dev/").join(d.name())));

        let mut entries = Vec::new();
        for entry in fs::read_dir("/sys/block")?.filter_map(Result::ok) {
            let device_name = entry.file_name().to_string_lossy().to_string();
            let device_path = PathBuf::from("/dev/").join(&device_name);

            if device_name.starts_with("loop")
                || device_name.starts_with("ram")
                || device_name.starts_with("zram")
                || device_name.starts_with("dm-")
            {
                continue;
            }

            let system = system_disk.as_deref() == Some(&device_path);
            let removable = read_sys_file(&device_name, "removable")
                .map(|s| s == "1")
                .unwrap_or(false);
            let read_only = read_sys_file(&device_name, "ro")
                .map(|s| s == "1")
                .unwrap_or(false);

            if read_only {
                continue;
            }
            if !opts.all_disks && (!removable || system) {
                continue;
            }

            // Size 0 usually means an empty card reader; the slot is
            // still listed so the user sees it exists.
            let size_sectors = read_sys_file(&device_name, "size")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .unwrap_or(0);
            let capacity = size_sectors * 512;

            let mut label = format!("{} [{}]", device_name, human_size(capacity));
            for attr in ["device/vendor", "device/model"] {
                if let Ok(s) = read_sys_file(&device_name, attr) {
                    if !s.is_empty() {
                        label.push(' ');
                        label.push_str(&s);
                    }
                }
            }

            entries.push(DeviceEntry {
                path: device_path,
                label,
                capacity,
                kind: TargetKind::BlockDevice,
                system,
            });
        }

        entries.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(entries)
    }

    fn scan_serial(&self) -> Vec<DeviceEntry> {
        // Stable names with the hardware id, as udev populates them.
        let Ok(dir) = fs::read_dir("/dev/serial/by-id") else {
            return Vec::new();
        };
        let mut ports = Vec::new();
        for entry in dir.filter_map(Result::ok) {
            let link = entry.path();
            let Ok(path) = fs::canonicalize(&link) else {
                continue;
            };
            ports.push(DeviceEntry {
                label: entry.file_name().to_string_lossy().to_string(),
                path,
                capacity: 0,
                kind: TargetKind::SerialPort,
                system: false,
            });
        }
        ports.sort_by(|a, b| a.path.cmp(&b.path));
        ports
    }
}

impl DeviceBackend for LinuxBackend {
    fn scan(&mut self, opts: &ScanOptions) -> io::Result<Vec<DeviceEntry>> {
        let mut entries = self.scan_disks(opts)?;
        if opts.include_serial {
            entries.extend(self.scan_serial());
        }
        Ok(entries)
    }

    fn mounts(&self, entry: &DeviceEntry) -> io::Result<Vec<Mount>> {
        let device = entry
            .path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let disks = sysinfo::Disks::new_with_refreshed_list();
        let mut mounts = Vec::new();
        for disk in disks.iter() {
            let name = disk.name().to_string_lossy();
            if is_on_device(&name, &device) {
                mounts.push(Mount {
                    source: PathBuf::from("/dev/").join(disk.name()),
                    point: disk.mount_point().to_path_buf(),
                });
            }
        }
        Ok(mounts)
    }

    fn unmount(&mut self, mount: &Mount) -> io::Result<Option<Box<dyn Claim>>> {
        debug!(point = %mount.point.display(), "umount2 MNT_FORCE");
        umount2(&mount.point, MntFlags::MNT_FORCE).map_err(io::Error::from)?;
        Ok(None)
    }

    fn claim(&mut self, _entry: &DeviceEntry) -> io::Result<Option<Box<dyn Claim>>> {
        // No separate lock on Linux; O_EXCL on the block node is the
        // exclusivity mechanism.
        Ok(None)
    }

    fn open_raw(&mut self, entry: &DeviceEntry) -> io::Result<Box<dyn TargetIo>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_SYNC | libc::O_EXCL)
            .open(&entry.path)?;
        Ok(Box::new(file))
    }

    fn open_serial(&mut self, entry: &DeviceEntry, baud: u32) -> io::Result<Box<dyn TargetIo>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_NONBLOCK)
            .open(&entry.path)?;
        configure_tty(&file, baud)?;
        Ok(Box::new(file))
    }
}

/// Raw 8N1 with a 100 ms read timeout. The port is opened non-blocking
/// so a missing carrier cannot hang the open; blocking mode is restored
/// afterwards so ordinary writes do not short-circuit.
fn configure_tty(file: &File, baud: u32) -> io::Result<()> {
    use termios::os::linux::{B57600, B115200, B230400, B460800};
    use termios::*;

    let fd = file.as_raw_fd();
    let mut term = Termios::from_fd(fd)?;
    cfmakeraw(&mut term);
    term.c_cflag |= CS8 | CLOCAL | CREAD;
    term.c_cflag &= !(PARENB | CSTOPB);
    term.c_cc[VMIN] = 0;
    term.c_cc[VTIME] = 1;

    let speed = match baud {
        9_600 => B9600,
        19_200 => B19200,
        38_400 => B38400,
        57_600 => B57600,
        230_400 => B230400,
        460_800 => B460800,
        _ => B115200,
    };
    cfsetspeed(&mut term, speed)?;
    tcsetattr(fd, TCSANOW, &term)?;
    tcflush(fd, TCIOFLUSH)?;

    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parent_of_partition_paths() {
        assert_eq!(
            parent_device_path(Path::new("/dev/sda3")),
            PathBuf::from("/dev/sda")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/nvme0n1p2")),
            PathBuf::from("/dev/nvme0n1")
        );
        assert_eq!(
            parent_device_path(Path::new("/dev/mmcblk0p1")),
            PathBuf::from("/dev/mmcblk0")
        );
    }

    #[test]
    fn partition_to_device_matching() {
        assert!(is_on_device("sdb", "sdb"));
        assert!(is_on_device("sdb1", "sdb"));
        assert!(is_on_device("mmcblk0p1", "mmcblk0"));
        assert!(!is_on_device("sdbx", "sdb"));
        assert!(!is_on_device("sdc1", "sdb"));
        assert!(!is_on_device("sd", "sdb"));
    }
}
