//! N-party rendezvous across processes, built on file-backed shared
//! memory, a SysV semaphore, and signal wakeup.
//!
//! One process [`create`](Barrier::create)s the barrier; the others
//! [`attach`](Barrier::attach) by path. [`wait`](Barrier::wait) blocks
//! until the configured number of parties has arrived: the last arriver
//! releases everyone (and is told it was the leader), the rest sleep in
//! `sigtimedwait` on the wakeup signal until released. The barrier is
//! reusable: each release starts a new generation.
//!
//! A timeout on `wait` breaks the barrier for every party: the expiring
//! waiter marks it broken and wakes the others, which all observe
//! [`BarrierError::Broken`]. [`reset`](Barrier::reset) restores a broken
//! barrier.
//!
//! The wakeup is a process-directed signal, so run at most one waiter
//! per process. The wakeup signal number is stored in the shared header
//! at creation time; attachers follow it automatically.

use std::io;
use std::mem;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

mod region;
mod sem;

use region::SharedRegion;
use sem::SemMutex;

const MAGIC: u32 = 0x4752_4252;
const VERSION: u32 = 1;

/// Upper bound on simultaneously sleeping parties.
pub const MAX_WAITERS: usize = 64;

/// Default wakeup signal. Distinct from the router's urgent-delivery
/// default so both can coexist in one process.
pub const DEFAULT_WAKEUP_SIGNAL: libc::c_int = libc::SIGUSR2;

/// All fields are mutated under the semaphore; the atomics make the
/// cross-process aliasing well-defined, not lock-free.
#[repr(C)]
struct BarrierHeader {
    magic: AtomicU32,
    version: AtomicU32,
    wakeup_signal: AtomicI32,
    parties: AtomicU32,
    generation: AtomicU32,
    arrived: AtomicU32,
    broken: AtomicU32,
    waiter_count: AtomicU32,
    waiters: [AtomicI32; MAX_WAITERS],
}

/// How a successful `wait` completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// This party was the last to arrive and released the others.
    Leader,
    /// This party slept and was released by the leader.
    Follower,
}

#[derive(Debug)]
pub enum BarrierError {
    Io(io::Error),
    /// The mapped file does not carry a compatible barrier header.
    Incompatible,
    /// The barrier was broken by a timed-out party. `reset` restores it.
    Broken,
    /// This party's own timeout expired; the barrier is now broken.
    TimedOut,
    /// A foreign signal interrupted the sleep before release.
    Interrupted,
    /// More than [`MAX_WAITERS`] parties tried to sleep at once.
    TooManyWaiters,
}

impl std::fmt::Display for BarrierError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BarrierError::Io(err) => write!(f, "barrier I/O failed: {err}"),
            BarrierError::Incompatible => write!(f, "not a compatible barrier segment"),
            BarrierError::Broken => write!(f, "barrier is broken"),
            BarrierError::TimedOut => write!(f, "wait timed out; barrier is now broken"),
            BarrierError::Interrupted => write!(f, "wait interrupted by a foreign signal"),
            BarrierError::TooManyWaiters => {
                write!(f, "more than {MAX_WAITERS} simultaneous waiters")
            }
        }
    }
}

impl std::error::Error for BarrierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BarrierError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for BarrierError {
    fn from(err: io::Error) -> Self {
        BarrierError::Io(err)
    }
}

#[derive(Debug)]
pub struct Barrier {
    sem: SemMutex,
    region: SharedRegion,
    wakeup: libc::c_int,
}

impl Barrier {
    /// Create a barrier for `parties` at `path`, using the default
    /// wakeup signal. The creator owns the backing file and the
    /// semaphore; both are removed when it drops the barrier.
    pub fn create(path: &Path, parties: u32) -> Result<Self, BarrierError> {
        Self::create_with_signal(path, parties, DEFAULT_WAKEUP_SIGNAL)
    }

    /// Create with an explicit wakeup signal; attachers follow it.
    pub fn create_with_signal(
        path: &Path,
        parties: u32,
        wakeup: libc::c_int,
    ) -> Result<Self, BarrierError> {
        let region = SharedRegion::create(path, mem::size_of::<BarrierHeader>())?;
        let sem = SemMutex::create(path)?;

        let header = unsafe { &*(region.ptr() as *const BarrierHeader) };
        header.version.store(VERSION, Ordering::Relaxed);
        header.wakeup_signal.store(wakeup, Ordering::Relaxed);
        header.parties.store(parties, Ordering::Relaxed);
        header.generation.store(0, Ordering::Relaxed);
        header.arrived.store(0, Ordering::Relaxed);
        header.broken.store(0, Ordering::Relaxed);
        header.waiter_count.store(0, Ordering::Relaxed);
        // Stamp the magic last: an attacher that sees it sees the rest.
        header.magic.store(MAGIC, Ordering::Release);

        install_wakeup_disposition(wakeup)?;
        Ok(Self {
            sem,
            region,
            wakeup,
        })
    }

    /// Attach to a barrier another process created at `path`.
    pub fn attach(path: &Path) -> Result<Self, BarrierError> {
        let region = SharedRegion::attach(path)?;
        if region.len() < mem::size_of::<BarrierHeader>() {
            return Err(BarrierError::Incompatible);
        }
        let header = unsafe { &*(region.ptr() as *const BarrierHeader) };
        if header.magic.load(Ordering::Acquire) != MAGIC
            || header.version.load(Ordering::Relaxed) != VERSION
        {
            return Err(BarrierError::Incompatible);
        }
        let wakeup = header.wakeup_signal.load(Ordering::Relaxed);
        let sem = SemMutex::attach(path)?;

        install_wakeup_disposition(wakeup)?;
        Ok(Self {
            sem,
            region,
            wakeup,
        })
    }

    fn header(&self) -> &BarrierHeader {
        unsafe { &*(self.region.ptr() as *const BarrierHeader) }
    }

    pub fn parties(&self) -> u32 {
        self.header().parties.load(Ordering::Relaxed)
    }

    /// Parties arrived in the current generation.
    pub fn arrived(&self) -> u32 {
        self.header().arrived.load(Ordering::Relaxed)
    }

    pub fn is_broken(&self) -> bool {
        self.header().broken.load(Ordering::Relaxed) != 0
    }

    /// Restore a broken barrier and start a fresh generation. Sleeping
    /// waiters of the old generation, if any, are released as followers.
    pub fn reset(&self) -> Result<(), BarrierError> {
        let header = self.header();
        let stale = {
            let _guard = self.sem.lock()?;
            header.broken.store(0, Ordering::Relaxed);
            header.arrived.store(0, Ordering::Relaxed);
            header.generation.fetch_add(1, Ordering::Relaxed);
            take_waiters(header)
        };
        wake_all(&stale, self.wakeup);
        Ok(())
    }

    /// Rendezvous with the other parties.
    ///
    /// Blocks until all `parties` have arrived, the timeout expires, the
    /// barrier breaks, or a foreign signal interrupts the sleep. A
    /// barrier of zero or one parties returns immediately without
    /// signalling anyone.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<Outcome, BarrierError> {
        let header = self.header();
        let (set, _mask) = block_signal(self.wakeup)?;
        let me = unsafe { libc::getpid() };

        let my_generation = {
            let guard = self.sem.lock()?;
            if header.broken.load(Ordering::Relaxed) != 0 {
                return Err(BarrierError::Broken);
            }
            let parties = header.parties.load(Ordering::Relaxed);
            if parties <= 1 {
                return Ok(Outcome::Leader);
            }

            let arrived = header.arrived.load(Ordering::Relaxed) + 1;
            if arrived == parties {
                // Last arriver: release everyone and start over.
                header.arrived.store(0, Ordering::Relaxed);
                header.generation.fetch_add(1, Ordering::Relaxed);
                let sleepers = take_waiters(header);
                drop(guard);
                wake_all(&sleepers, self.wakeup);
                return Ok(Outcome::Leader);
            }

            let slot = header.waiter_count.load(Ordering::Relaxed) as usize;
            if slot >= MAX_WAITERS {
                return Err(BarrierError::TooManyWaiters);
            }
            header.arrived.store(arrived, Ordering::Relaxed);
            header.waiters[slot].store(me, Ordering::Relaxed);
            header.waiter_count.store(slot as u32 + 1, Ordering::Relaxed);
            header.generation.load(Ordering::Relaxed)
        };

        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let woke = wait_signal(&set, deadline)?;
            let guard = self.sem.lock()?;
            if header.generation.load(Ordering::Relaxed) != my_generation {
                return Ok(Outcome::Follower);
            }
            if header.broken.load(Ordering::Relaxed) != 0 {
                return Err(BarrierError::Broken);
            }
            match woke {
                SigWait::Woken => {
                    // Stale wakeup from an earlier generation; keep sleeping.
                    continue;
                }
                SigWait::TimedOut => {
                    header.broken.store(1, Ordering::Relaxed);
                    header.arrived.store(0, Ordering::Relaxed);
                    let sleepers = take_waiters(header);
                    drop(guard);
                    wake_all(
                        &sleepers.into_iter().filter(|p| *p != me).collect::<Vec<_>>(),
                        self.wakeup,
                    );
                    return Err(BarrierError::TimedOut);
                }
                SigWait::Interrupted => {
                    remove_waiter(header, me);
                    let arrived = header.arrived.load(Ordering::Relaxed);
                    header.arrived.store(arrived.saturating_sub(1), Ordering::Relaxed);
                    return Err(BarrierError::Interrupted);
                }
            }
        }
    }
}

/// Pull the registered waiter pids out of the header, clearing the list.
/// Caller holds the lock.
fn take_waiters(header: &BarrierHeader) -> Vec<libc::pid_t> {
    let count = header.waiter_count.load(Ordering::Relaxed) as usize;
    let mut pids = Vec::with_capacity(count);
    for slot in header.waiters.iter().take(count) {
        pids.push(slot.load(Ordering::Relaxed));
    }
    header.waiter_count.store(0, Ordering::Relaxed);
    pids
}

/// Drop one pid from the waiter list, compacting it. Caller holds the
/// lock.
fn remove_waiter(header: &BarrierHeader, pid: libc::pid_t) {
    let count = header.waiter_count.load(Ordering::Relaxed) as usize;
    for i in 0..count {
        if header.waiters[i].load(Ordering::Relaxed) == pid {
            let last = header.waiters[count - 1].load(Ordering::Relaxed);
            header.waiters[i].store(last, Ordering::Relaxed);
            header.waiter_count.store(count as u32 - 1, Ordering::Relaxed);
            return;
        }
    }
}

fn wake_all(pids: &[libc::pid_t], signal: libc::c_int) {
    for pid in pids {
        let ret = unsafe { libc::kill(*pid, signal) };
        if ret != 0 {
            let err = io::Error::last_os_error();
            tracing::debug!(pid = *pid, error = %err, "barrier wakeup failed (waiter likely gone)");
        }
    }
}

enum SigWait {
    Woken,
    TimedOut,
    Interrupted,
}

fn wait_signal(set: &libc::sigset_t, deadline: Option<Instant>) -> io::Result<SigWait> {
    let ret = match deadline {
        None => unsafe { libc::sigwaitinfo(set, ptr::null_mut()) },
        Some(deadline) => {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(SigWait::TimedOut);
            }
            let ts = libc::timespec {
                tv_sec: remaining.as_secs() as libc::time_t,
                tv_nsec: libc::c_long::from(remaining.subsec_nanos()),
            };
            unsafe { libc::sigtimedwait(set, ptr::null_mut(), &ts) }
        }
    };
    if ret >= 0 {
        return Ok(SigWait::Woken);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EAGAIN) => Ok(SigWait::TimedOut),
        Some(libc::EINTR) => Ok(SigWait::Interrupted),
        _ => Err(err),
    }
}

/// Restores the previous signal mask when dropped.
struct MaskGuard {
    old: libc::sigset_t,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        unsafe {
            libc::pthread_sigmask(libc::SIG_SETMASK, &self.old, ptr::null_mut());
        }
    }
}

/// Block `signal` for this thread so only `sigtimedwait` consumes it.
fn block_signal(signal: libc::c_int) -> io::Result<(libc::sigset_t, MaskGuard)> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, signal);
        let mut old: libc::sigset_t = mem::zeroed();
        let ret = libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
        if ret != 0 {
            return Err(io::Error::from_raw_os_error(ret));
        }
        Ok((set, MaskGuard { old }))
    }
}

extern "C" fn noop_handler(_signal: libc::c_int) {}

/// Give the wakeup signal a no-op handler: the default disposition
/// would kill the process on a stray (unblocked) delivery, and SIG_IGN
/// would discard it even while blocked.
fn install_wakeup_disposition(signal: libc::c_int) -> io::Result<()> {
    let handler: extern "C" fn(libc::c_int) = noop_handler;
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as usize as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(signal, &action, ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn barrier_path(dir: &tempfile::TempDir, name: &str) -> std::path::PathBuf {
        dir.path().join(name)
    }

    #[test]
    fn single_party_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::create(&barrier_path(&dir, "one.shm"), 1).unwrap();
        assert!(matches!(barrier.wait(None), Ok(Outcome::Leader)));
        assert_eq!(barrier.arrived(), 0);
    }

    #[test]
    fn zero_party_barrier_never_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::create(&barrier_path(&dir, "zero.shm"), 0).unwrap();
        assert!(matches!(barrier.wait(None), Ok(Outcome::Leader)));
    }

    #[test]
    fn timeout_breaks_the_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::create(&barrier_path(&dir, "two.shm"), 2).unwrap();

        let err = barrier.wait(Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, BarrierError::TimedOut));
        assert!(barrier.is_broken());

        // Every later party observes the break.
        let err = barrier.wait(Some(Duration::from_secs(1))).unwrap_err();
        assert!(matches!(err, BarrierError::Broken));
    }

    #[test]
    fn reset_restores_a_broken_barrier() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::create(&barrier_path(&dir, "reset.shm"), 2).unwrap();

        barrier.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(barrier.is_broken());

        barrier.reset().unwrap();
        assert!(!barrier.is_broken());
        assert_eq!(barrier.arrived(), 0);

        // Usable again: a fresh timeout is TimedOut, not Broken.
        let err = barrier.wait(Some(Duration::from_millis(20))).unwrap_err();
        assert!(matches!(err, BarrierError::TimedOut));
    }

    #[test]
    fn attach_to_nothing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = Barrier::attach(&barrier_path(&dir, "missing.shm")).unwrap_err();
        assert!(matches!(err, BarrierError::Io(_)));
    }

    #[test]
    fn attach_rejects_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = barrier_path(&dir, "junk.shm");
        std::fs::write(&path, vec![0u8; mem::size_of::<BarrierHeader>()]).unwrap();
        let err = Barrier::attach(&path).unwrap_err();
        assert!(matches!(err, BarrierError::Incompatible));
    }

    #[test]
    fn accessors_reflect_creation() {
        let dir = tempfile::tempdir().unwrap();
        let barrier = Barrier::create(&barrier_path(&dir, "acc.shm"), 5).unwrap();
        assert_eq!(barrier.parties(), 5);
        assert_eq!(barrier.arrived(), 0);
        assert!(!barrier.is_broken());
    }
}
