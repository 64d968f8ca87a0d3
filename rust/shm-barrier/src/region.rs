//! File-backed shared memory mapped with `MAP_SHARED`.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

/// A mapping every attached process sees the same bytes through.
///
/// The creator owns the file and deletes it on drop; attachers only
/// unmap.
#[derive(Debug)]
pub(crate) struct SharedRegion {
    ptr: *mut u8,
    len: usize,
    /// Kept open to hold the mapping's backing file alive.
    #[allow(dead_code)]
    file: File,
    path: PathBuf,
    owns_file: bool,
}

// The region is plain shared bytes; all access synchronisation is the
// caller's business (the barrier guards it with its semaphore).
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl SharedRegion {
    /// Create the backing file (0600), size it, and map it.
    pub(crate) fn create(path: &Path, len: usize) -> io::Result<Self> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "region size must be > 0",
            ));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;
        file.set_len(len as u64)?;
        let ptr = map(&file, len)?;
        Ok(Self {
            ptr,
            len,
            file,
            path: path.to_path_buf(),
            owns_file: true,
        })
    }

    /// Map a file some other process created.
    pub(crate) fn attach(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "region file is empty",
            ));
        }
        let ptr = map(&file, len)?;
        Ok(Self {
            ptr,
            len,
            file,
            path: path.to_path_buf(),
            owns_file: false,
        })
    }

    pub(crate) fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

fn map(file: &File, len: usize) -> io::Result<*mut u8> {
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    Ok(ptr as *mut u8)
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
        if self.owns_file {
            if let Err(err) = std::fs::remove_file(&self.path) {
                tracing::debug!(path = %self.path.display(), error = %err, "region cleanup failed");
            }
        }
    }
}
