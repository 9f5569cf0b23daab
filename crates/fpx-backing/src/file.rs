//! File- and block-device-backed targets using `pread`/`pwrite` style I/O.

use crate::{BackingKind, BackingOpener, BackingTarget, TargetStats};
use fpx_error::{FpxError, Result};
use fpx_types::{DeviceMode, MAX_BACKING_PATH_LEN};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::{FileExt, FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backing target over an open file descriptor.
///
/// Uses `std::os::unix::fs::FileExt`, which is thread-safe and does not
/// require a shared seek position.
#[derive(Debug)]
pub struct FileTarget {
    file: File,
    path: PathBuf,
    kind: BackingKind,
    stats: Mutex<TargetStats>,
}

impl FileTarget {
    /// Open `path` according to the device `mode`.
    ///
    /// The path must already exist; backing stores are never created here.
    pub fn open(path: impl AsRef<Path>, mode: DeviceMode) -> Result<Self> {
        let path = path.as_ref();
        let mut flags = 0;
        if mode.sync {
            flags |= libc::O_SYNC;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(mode.writable)
            .custom_flags(flags)
            .open(path)
            .map_err(|source| FpxError::OpenFailed {
                path: path.display().to_string(),
                source,
            })?;

        let file_type = file.metadata()?.file_type();
        let kind = if file_type.is_block_device() {
            BackingKind::BlockDevice
        } else {
            if !file_type.is_file() {
                warn!(
                    target: "fpx::backing",
                    path = %path.display(),
                    "backing_unknown_kind"
                );
            }
            BackingKind::RegularFile
        };
        info!(
            target: "fpx::backing",
            path = %path.display(),
            kind = kind.as_str(),
            %mode,
            "backing_opened"
        );
        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind,
            stats: Mutex::new(TargetStats::default()),
        })
    }
}

impl Drop for FileTarget {
    fn drop(&mut self) {
        debug!(target: "fpx::backing", path = %self.path.display(), "backing_closed");
    }
}

impl BackingTarget for FileTarget {
    fn kind(&self) -> BackingKind {
        self.kind
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            match self.file.write_at(&buf[done..], pos) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FpxError::Io(e)),
            }
        }
        let mut s = self.stats.lock();
        s.writes += 1;
        s.bytes_written += done as u64;
        drop(s);
        Ok(done)
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0_usize;
        while done < buf.len() {
            let pos = offset + done as u64;
            match self.file.read_at(&mut buf[done..], pos) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(FpxError::Io(e)),
            }
        }
        let mut s = self.stats.lock();
        s.reads += 1;
        s.bytes_read += done as u64;
        drop(s);
        Ok(done)
    }

    fn punch_hole(&self, offset: u64, len: u64) -> Result<()> {
        self.stats.lock().punches += 1;
        punch_hole(&self.file, offset, len)
    }

    fn sync(&self) -> Result<()> {
        self.stats.lock().syncs += 1;
        self.file.sync_all()?;
        Ok(())
    }

    fn stats(&self) -> TargetStats {
        self.stats.lock().clone()
    }
}

#[cfg(target_os = "linux")]
fn punch_hole(file: &File, offset: u64, len: u64) -> Result<()> {
    use nix::fcntl::{FallocateFlags, fallocate};
    use std::os::fd::AsRawFd;

    let offset = libc::off_t::try_from(offset)
        .map_err(|_| FpxError::InvalidConfig(format!("discard offset {offset} overflows off_t")))?;
    let len = libc::off_t::try_from(len)
        .map_err(|_| FpxError::InvalidConfig(format!("discard length {len} overflows off_t")))?;
    fallocate(
        file.as_raw_fd(),
        FallocateFlags::FALLOC_FL_PUNCH_HOLE | FallocateFlags::FALLOC_FL_KEEP_SIZE,
        offset,
        len,
    )
    .map_err(|errno| FpxError::Io(std::io::Error::from(errno)))
}

#[cfg(not(target_os = "linux"))]
fn punch_hole(_file: &File, _offset: u64, _len: u64) -> Result<()> {
    Err(FpxError::Unsupported("punch_hole"))
}

/// Opens real paths on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsOpener;

impl BackingOpener for FsOpener {
    fn open(&self, path: &str, mode: DeviceMode) -> Result<Arc<dyn BackingTarget>> {
        if path.len() > MAX_BACKING_PATH_LEN {
            return Err(FpxError::InvalidConfig(format!(
                "backing path longer than {MAX_BACKING_PATH_LEN} bytes"
            )));
        }
        Ok(Arc::new(FileTarget::open(path, mode)?))
    }
}
