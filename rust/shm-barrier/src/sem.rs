//! A one-slot SysV semaphore used as a cross-process mutex.
//!
//! The semaphore is keyed off the barrier's backing file via `ftok`, so
//! unrelated processes can find it from the path alone. `SEM_UNDO` is
//! set on every operation: a process that dies holding the lock does
//! not wedge the others.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

const FTOK_PROJECT: libc::c_int = 0x42;

#[derive(Debug)]
pub(crate) struct SemMutex {
    id: libc::c_int,
    owned: bool,
}

/// Held lock; released on drop.
pub(crate) struct SemGuard<'a> {
    sem: &'a SemMutex,
}

impl SemMutex {
    /// Create the semaphore for `path` and initialise it to 1. Fails if
    /// one already exists for this key.
    pub(crate) fn create(path: &Path) -> io::Result<Self> {
        let key = ftok(path)?;
        let id = unsafe { libc::semget(key, 1, libc::IPC_CREAT | libc::IPC_EXCL | 0o600) };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }
        let ret = unsafe { libc::semctl(id, 0, libc::SETVAL, 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::semctl(id, 0, libc::IPC_RMID) };
            return Err(err);
        }
        Ok(Self { id, owned: true })
    }

    /// Attach to the semaphore some other process created for `path`.
    pub(crate) fn attach(path: &Path) -> io::Result<Self> {
        let key = ftok(path)?;
        let id = unsafe { libc::semget(key, 1, 0) };
        if id < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { id, owned: false })
    }

    /// Take the lock, retrying through signal interruptions.
    pub(crate) fn lock(&self) -> io::Result<SemGuard<'_>> {
        self.op(-1)?;
        Ok(SemGuard { sem: self })
    }

    fn op(&self, delta: libc::c_short) -> io::Result<()> {
        let mut sop = libc::sembuf {
            sem_num: 0,
            sem_op: delta,
            sem_flg: libc::SEM_UNDO as libc::c_short,
        };
        loop {
            let ret = unsafe { libc::semop(self.id, &mut sop, 1) };
            if ret == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

impl Drop for SemGuard<'_> {
    fn drop(&mut self) {
        if let Err(err) = self.sem.op(1) {
            tracing::warn!(error = %err, "semaphore release failed");
        }
    }
}

impl Drop for SemMutex {
    fn drop(&mut self) {
        if self.owned {
            unsafe { libc::semctl(self.id, 0, libc::IPC_RMID) };
        }
    }
}

fn ftok(path: &Path) -> io::Result<libc::key_t> {
    let cpath = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let key = unsafe { libc::ftok(cpath.as_ptr(), FTOK_PROJECT) };
    if key == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(key)
}
