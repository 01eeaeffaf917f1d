//! Swap file holding evicted chunk records
//!
//! The swap file is scratch space: it is truncated when the store starts
//! and never read back after a restart. Free space is tracked with the same
//! extent map the regions use, so released records are reused best-fit
//! before the file grows.

use crate::allocator::extent::ExtentMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The file grows in steps of at least this many bytes
const GROWTH_STEP: u64 = 64 * 1024;

/// Number of `<swap>.<n>` names tried when cloning for a forked child
const CHILD_FILE_ATTEMPTS: u32 = 10;

/// Disk-backed store of swap records
#[derive(Debug)]
pub struct SwapFile {
    file: File,
    path: PathBuf,
    space: ExtentMap,
    limit: Option<u64>,
}

impl SwapFile {
    /// Create (or truncate) the swap file at `path`
    ///
    /// `initial_bytes` are reserved up front; `limit` caps how far the file
    /// may grow.
    pub fn create<P: AsRef<Path>>(
        path: P,
        initial_bytes: u64,
        limit: Option<u64>,
    ) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let initial = match limit {
            Some(limit) => initial_bytes.min(limit),
            None => initial_bytes,
        };
        if initial > 0 {
            preallocate(&file, initial)?;
        }

        Ok(SwapFile {
            file,
            path: path.as_ref().to_path_buf(),
            space: ExtentMap::new(initial),
            limit,
        })
    }

    /// Write a record and return its offset
    pub fn store(&mut self, record: &[u8]) -> io::Result<u64> {
        let len = record.len() as u64;
        let offset = match self.space.allocate(len) {
            Some(offset) => offset,
            None => {
                self.grow_for(len)?;
                self.space.allocate(len).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::Other, "swap file has no room for record")
                })?
            }
        };

        if let Err(e) = self.write_at(offset, record) {
            self.space.free(offset, len);
            return Err(e);
        }
        Ok(offset)
    }

    fn grow_for(&mut self, len: u64) -> io::Result<()> {
        let capacity = self.space.capacity();
        // Free tail space counts towards the record
        let tail = capacity - self.space.high_water();
        let mut target = capacity + (len - tail.min(len)).max(GROWTH_STEP);
        if let Some(limit) = self.limit {
            target = target.min(limit);
            if target - self.space.high_water() < len {
                return Err(io::Error::new(
                    io::ErrorKind::Other,
                    format!("swap file limit of {} bytes reached", limit),
                ));
            }
        }
        debug!("Growing swap file from {} to {} bytes", capacity, target);
        self.space.grow(target);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, record: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(record)
    }

    /// Read `len` bytes at `offset`
    pub fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = &self.file;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Return a record's space for reuse
    pub fn release(&mut self, offset: u64, len: usize) {
        self.space.free(offset, len as u64);
    }

    /// Flush buffered writes
    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }

    /// Reset the file cursor after another process shared the descriptor
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        Ok(())
    }

    /// Copy the file to the first free `<path>.<n>` and open the copy
    pub fn clone_for_child(&mut self) -> io::Result<SwapFile> {
        self.flush()?;

        let used = self.space.high_water();
        let mut last_err = None;
        for n in 0..CHILD_FILE_ATTEMPTS {
            let child_path = PathBuf::from(format!("{}.{}", self.path.display(), n));
            let created = create_filled(&child_path, |child| {
                if used > 0 {
                    preallocate(child, used)?;
                }
                let mut source = &self.file;
                source.seek(SeekFrom::Start(0))?;
                io::copy(&mut source.take(used), child)?;
                child.flush()
            });

            match created {
                Ok(child) => {
                    debug!(
                        "Cloned {} bytes of swap into {}",
                        used,
                        child_path.display()
                    );
                    return Ok(SwapFile {
                        file: child,
                        path: child_path,
                        space: self.space.clone(),
                        limit: self.limit,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    warn!("Swap clone {} already exists", child_path.display());
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "no free swap clone name")
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes occupied by live records
    pub fn used_bytes(&self) -> u64 {
        self.space.used_bytes()
    }

    /// Bytes currently addressable in the file
    pub fn capacity(&self) -> u64 {
        self.space.capacity()
    }
}

/// Create `path` exclusively and fill it
///
/// A failed fill removes the file again, so the name stays free.
fn create_filled<F>(path: &Path, fill: F) -> io::Result<File>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(path)?;

    if let Err(e) = fill(&mut file) {
        drop(file);
        if let Err(remove_err) = fs::remove_file(path) {
            warn!(
                "Failed to remove partial swap clone {}: {}",
                path.display(),
                remove_err
            );
        }
        return Err(e);
    }
    Ok(file)
}

#[cfg(target_os = "linux")]
fn preallocate(file: &File, len: u64) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;

    // SAFETY: the descriptor is owned by `file` and stays open for the call
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, len as libc::off_t) };
    match rc {
        0 => Ok(()),
        // Filesystems without fallocate support fall back to a sparse file
        libc::EOPNOTSUPP | libc::EINVAL => file.set_len(len),
        errno => Err(io::Error::from_raw_os_error(errno)),
    }
}

#[cfg(not(target_os = "linux"))]
fn preallocate(file: &File, len: u64) -> io::Result<()> {
    file.set_len(len)
}
