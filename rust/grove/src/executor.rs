//! Process-tree lifecycle: fork, child reaping, the event loop, and
//! graceful shutdown.
//!
//! The executor owns the reactor, the router, and the listener set, and
//! is the single object user code talks to. Forking creates a
//! socketpair edge, runs the OS fork, and turns the child into a fresh
//! node: new reactor, new router keyed by the optional alias, only the
//! parent edge registered. The listener set crosses the fork by value.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::mem;
use std::os::unix::io::OwnedFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork as os_fork, getpid, getppid, ForkResult, Pid};

use crate::endpoint::FlushOrder;
use crate::error::{ErrorOp, ForkError, RouterError};
use crate::listener::{panic_message, Listener, ListenerSet};
use crate::reactor::{Reactor, Wake};
use crate::router::{
    Destination, DispatchMode, Router, RouterDiagnostics, RouterNotice, SubmitOptions,
};

/// Poll timeout once the shutdown flag is set, so the TTL cap is reached
/// even when no event will ever fire.
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(10);

bitflags! {
    /// What the loop waits for after `shutdown()` before exiting.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ShutdownBehavior: u32 {
        /// Keep looping while frames are still queued toward neighbours.
        const FLUSH_PENDING_MESSAGES = 1 << 0;
        /// Keep looping while child records exist, living or not yet
        /// consumed via [`Executor::read_child_state`].
        const WAIT_FOR_PEERS_TERMINATION = 1 << 1;
    }
}

/// How a child ended, if it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Living,
    Exited { code: i32, uptime: Duration },
    Signaled { signal: i32, uptime: Duration },
}

impl Termination {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Termination::Living)
    }
}

/// Bookkeeping for one direct child.
#[derive(Debug, Clone)]
pub struct ChildState {
    pub pid: u32,
    pub alias: Option<String>,
    pub spawned_at: Instant,
    pub termination: Termination,
}

/// Configuration for the root executor.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Alias of the root node.
    pub alias: Option<String>,
    pub mode: DispatchMode,
    /// Signal sent to the next hop after an urgent frame is flushed.
    pub urgent_signal: Signal,
    pub shutdown_behavior: ShutdownBehavior,
    /// Iterations the loop survives after `shutdown()` with no living
    /// children before it is forced out.
    pub shutdown_ttl: u32,
    /// Exit code used when this process exits after its loop.
    pub exit_code: i32,
    /// Whether the root process exits after teardown. Non-root processes
    /// always exit.
    pub exit_after_shutdown: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            alias: None,
            mode: DispatchMode::default(),
            urgent_signal: Signal::SIGUSR1,
            shutdown_behavior: ShutdownBehavior::empty(),
            shutdown_ttl: 100,
            exit_code: 0,
            exit_after_shutdown: false,
        }
    }
}

/// Per-fork configuration.
#[derive(Debug, Clone, Default)]
pub struct ForkOptions {
    /// Alias the child registers under.
    pub alias: Option<String>,
    /// Exit code override for the child.
    pub exit_code: Option<i32>,
}

/// Work waiting for the listener set. Callbacks triggered from inside
/// another callback are queued here and dispatched once the current one
/// returns, so nested dispatches never run against the taken-out set.
enum Pending {
    Notice(RouterNotice),
    Start,
    Shutdown,
    ExitLoop,
}

/// The per-process node: reactor + router + listeners + child table.
pub struct Executor {
    reactor: Reactor,
    router: Router,
    listeners: ListenerSet,
    root_pid: u32,
    pid: u32,
    parent_pid: Option<u32>,
    children: HashMap<u32, ChildState>,
    shutdown: bool,
    behavior: ShutdownBehavior,
    shutdown_ttl: u32,
    exit_code: i32,
    exit_after_shutdown: bool,
    mode: DispatchMode,
    urgent_signal: Signal,
    pending: VecDeque<Pending>,
    dispatching: bool,
}

impl Executor {
    /// Build the root node of a tree.
    pub fn new(options: ExecutorOptions) -> io::Result<Self> {
        let pid = getpid().as_raw() as u32;
        let reactor = Reactor::new(options.urgent_signal)?;
        let router = Router::new(pid, options.alias, options.mode, options.urgent_signal);
        Ok(Self {
            reactor,
            router,
            listeners: ListenerSet::default(),
            root_pid: pid,
            pid,
            parent_pid: None,
            children: HashMap::new(),
            shutdown: false,
            behavior: options.shutdown_behavior,
            shutdown_ttl: options.shutdown_ttl,
            exit_code: options.exit_code,
            exit_after_shutdown: options.exit_after_shutdown,
            mode: options.mode,
            urgent_signal: options.urgent_signal,
            pending: VecDeque::new(),
            dispatching: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn parent_pid(&self) -> Option<u32> {
        self.parent_pid
    }

    pub fn root_pid(&self) -> u32 {
        self.root_pid
    }

    pub fn is_root(&self) -> bool {
        self.parent_pid.is_none()
    }

    pub fn alias(&self) -> Option<&str> {
        self.router.alias()
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    /// Frames not yet fully on the wire, across all endpoints.
    pub fn pending(&self) -> usize {
        self.router.pending()
    }

    pub fn diagnostics(&self) -> RouterDiagnostics {
        self.router.diagnostics()
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    pub fn child_state(&self, pid: u32) -> Option<&ChildState> {
        self.children.get(&pid)
    }

    /// Consume a child record. A terminal state is removed and returned;
    /// a living child is only snapshotted. With
    /// [`ShutdownBehavior::WAIT_FOR_PEERS_TERMINATION`] the loop holds
    /// until every terminal record has been consumed this way.
    pub fn read_child_state(&mut self, pid: u32) -> Option<ChildState> {
        let terminal = self.children.get(&pid)?.termination.is_terminal();
        if terminal {
            self.children.remove(&pid)
        } else {
            self.children.get(&pid).cloned()
        }
    }

    /// Register a listener. Order among equal priorities is registration
    /// order; listeners registered from inside a callback take effect
    /// after the current dispatch completes.
    pub fn add_listener(&mut self, listener: Box<dyn Listener>) {
        self.listeners.insert(listener);
    }

    /// Register a pre-connected descriptor as a neighbour edge.
    pub fn add_route(&mut self, pid: u32, sock: OwnedFd) -> Result<(), RouterError> {
        self.router.add_endpoint(&self.reactor, pid, sock)
    }

    /// Emit a message into the tree. Returns the fresh message id.
    pub fn submit(
        &mut self,
        payload: impl Into<Bytes>,
        dst: Destination<'_>,
        opts: SubmitOptions,
    ) -> Result<u32, RouterError> {
        self.router.submit(&self.reactor, payload.into(), dst, opts)
    }

    /// Push queued frames out immediately instead of waiting for the
    /// reactor. The only path honouring [`FlushOrder::NewestFirst`].
    /// Write failures surface through `on_router_error`, not here.
    pub fn flush_writes(&mut self, order: FlushOrder) {
        let notices = self.router.flush_writes(&self.reactor, order);
        self.dispatch_all(notices);
    }

    /// Run the urgent read pass by hand. Normally triggered by the
    /// urgent signal; calling it while a drain is active (including from
    /// an `on_interrupt_receive` listener) is fatal.
    pub fn drain_urgent(&mut self) -> Result<(), RouterError> {
        let notices = self.router.drain_urgent(&self.reactor)?;
        self.dispatch_all(notices);
        self.router.end_interrupt();
        Ok(())
    }

    /// Whether the urgent drain is currently active.
    pub fn is_interrupted(&self) -> bool {
        self.router.is_interrupted()
    }

    /// Fork a child node. In the parent this registers the child edge,
    /// runs `parent_hook`, and returns the child pid. In the child it
    /// rebuilds the reactor and router, runs `child_main`, enters the
    /// loop, and exits the process: fork never returns in the child.
    pub fn fork<C, P>(
        &mut self,
        opts: ForkOptions,
        child_main: C,
        parent_hook: P,
    ) -> Result<u32, ForkError>
    where
        C: FnOnce(&mut Executor),
        P: FnOnce(&mut Executor, u32),
    {
        let (parent_half, child_half) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_NONBLOCK,
        )
        .map_err(ForkError::SocketPair)?;

        match unsafe { os_fork() }.map_err(ForkError::Fork)? {
            ForkResult::Parent { child } => {
                drop(child_half);
                let child_pid = child.as_raw() as u32;
                self.router
                    .add_endpoint(&self.reactor, child_pid, parent_half)
                    .map_err(|e| ForkError::Register(Box::new(e)))?;
                self.children.insert(
                    child_pid,
                    ChildState {
                        pid: child_pid,
                        alias: opts.alias.clone(),
                        spawned_at: Instant::now(),
                        termination: Termination::Living,
                    },
                );
                tracing::debug!(parent = self.pid, child = child_pid, "forked");
                parent_hook(self, child_pid);
                Ok(child_pid)
            }
            ForkResult::Child => {
                drop(parent_half);
                self.become_child(child_half, opts);
                child_main(self);
                let code = match self.run() {
                    Ok(()) => self.exit_code,
                    Err(err) => {
                        tracing::error!(pid = self.pid, error = %err, "loop failed");
                        70
                    }
                };
                // Unreachable when run() exits the non-root process
                // itself; kept so a failing loop still terminates.
                std::process::exit(code);
            }
        }
    }

    /// Turn this (just-forked) process into a fresh node holding only
    /// the parent edge. Inherited reactor registrations and the child
    /// table must not survive; listeners do.
    fn become_child(&mut self, parent_half: OwnedFd, opts: ForkOptions) {
        self.pid = getpid().as_raw() as u32;
        self.parent_pid = Some(getppid().as_raw() as u32);
        self.children.clear();
        self.shutdown = false;
        self.pending.clear();
        self.dispatching = false;
        if let Some(code) = opts.exit_code {
            self.exit_code = code;
        }

        match Reactor::new(self.urgent_signal) {
            Ok(reactor) => self.reactor = reactor,
            Err(err) => {
                tracing::error!(pid = self.pid, error = %err, "reactor rebuild failed");
                std::process::exit(70);
            }
        }
        self.router = Router::new(self.pid, opts.alias, self.mode, self.urgent_signal);

        let parent = self.parent_pid.unwrap_or_default();
        if let Err(err) = self
            .router
            .add_endpoint(&self.reactor, parent, parent_half)
        {
            tracing::error!(pid = self.pid, error = %err, "parent edge registration failed");
            std::process::exit(70);
        }
    }

    /// Request shutdown. The loop drains or waits according to the
    /// configured [`ShutdownBehavior`], bounded by the TTL cap.
    pub fn shutdown(&mut self) {
        if !self.shutdown {
            self.shutdown = true;
            tracing::debug!(pid = self.pid, "shutdown requested");
            self.pending.push_back(Pending::Shutdown);
            self.drain_dispatch();
        }
    }

    /// One blocking reactor turn: wait for readiness, then dispatch.
    pub fn run_once(&mut self) -> Result<(), RouterError> {
        self.run_cycle(None)
    }

    /// One non-blocking reactor turn.
    pub fn run_nonblocking(&mut self) -> Result<(), RouterError> {
        self.run_cycle(Some(Duration::ZERO))
    }

    /// The event loop. Returns in the root process when the loop
    /// condition goes false (and exits it when `exit_after_shutdown` is
    /// set); a non-root process exits with its configured code instead
    /// of returning.
    pub fn run(&mut self) -> Result<(), RouterError> {
        tracing::debug!(pid = self.pid, root = self.is_root(), "entering loop");
        self.pending.push_back(Pending::Start);
        self.drain_dispatch();

        let mut ttl = self.shutdown_ttl;
        while self.keep_looping() {
            if self.shutdown && !self.has_living_children() {
                if ttl == 0 {
                    tracing::debug!(pid = self.pid, "shutdown ttl exhausted");
                    break;
                }
                ttl -= 1;
            }
            self.run_cycle(self.poll_timeout())?;
        }

        self.pending.push_back(Pending::ExitLoop);
        self.drain_dispatch();
        self.teardown();

        if self.parent_pid.is_some() {
            tracing::debug!(pid = self.pid, code = self.exit_code, "child exiting");
            std::process::exit(self.exit_code);
        }
        if self.exit_after_shutdown {
            std::process::exit(self.exit_code);
        }
        Ok(())
    }

    fn keep_looping(&self) -> bool {
        !self.shutdown
            || (self
                .behavior
                .contains(ShutdownBehavior::FLUSH_PENDING_MESSAGES)
                && self.router.pending() > 0)
            || (self
                .behavior
                .contains(ShutdownBehavior::WAIT_FOR_PEERS_TERMINATION)
                && !self.children.is_empty())
    }

    fn poll_timeout(&self) -> Option<Duration> {
        if self.shutdown {
            Some(SHUTDOWN_POLL_INTERVAL)
        } else {
            None
        }
    }

    fn run_cycle(&mut self, timeout: Option<Duration>) -> Result<(), RouterError> {
        let wakes = self.reactor.poll(timeout).map_err(|source| RouterError::Io {
            op: ErrorOp::Recv,
            peer: 0,
            source,
        })?;

        for wake in wakes {
            match wake {
                Wake::Signal(libc::SIGCHLD) => self.reap_children(),
                Wake::Signal(sig) if sig == self.urgent_signal as libc::c_int => {
                    let notices = self.router.drain_urgent(&self.reactor)?;
                    self.dispatch_all(notices);
                    self.router.end_interrupt();
                }
                Wake::Signal(other) => {
                    tracing::trace!(signal = other, "unhandled signal wake");
                }
                Wake::Readable(pid) => {
                    let notices = self.router.handle_readable(&self.reactor, pid);
                    self.dispatch_all(notices);
                }
                Wake::Writable(pid) => {
                    let notices = self.router.handle_writable(&self.reactor, pid);
                    self.dispatch_all(notices);
                }
            }
        }
        Ok(())
    }

    fn dispatch_all(&mut self, notices: Vec<RouterNotice>) {
        self.pending.extend(notices.into_iter().map(Pending::Notice));
        self.drain_dispatch();
    }

    /// Work through the pending queue. A nested call (from inside a
    /// listener callback) returns immediately; the outer drain picks the
    /// queued work up after the current callback completes.
    fn drain_dispatch(&mut self) {
        if self.dispatching {
            return;
        }
        self.dispatching = true;
        while let Some(item) = self.pending.pop_front() {
            match item {
                Pending::Start => {
                    self.each_listener(ErrorOp::Recv, |l, ex| l.on_start(ex));
                }
                Pending::Shutdown => {
                    self.each_listener(ErrorOp::Send, |l, ex| l.on_shutdown(ex));
                }
                Pending::ExitLoop => {
                    self.each_listener(ErrorOp::Recv, |l, ex| l.on_exit_loop(ex));
                }
                Pending::Notice(RouterNotice::Sent(event)) => {
                    self.each_listener(ErrorOp::Send, |l, ex| l.on_message_sent(ex, &event));
                }
                Pending::Notice(RouterNotice::Received(mut event)) => {
                    self.each_listener(ErrorOp::Recv, |l, ex| {
                        l.on_message_received(ex, &mut event)
                    });
                }
                Pending::Notice(RouterNotice::Interrupted(mut event)) => {
                    self.each_listener(ErrorOp::Recv, |l, ex| {
                        l.on_interrupt_receive(ex, &mut event)
                    });
                }
                Pending::Notice(RouterNotice::PeerShutdown { pid, unsent }) => {
                    self.each_listener(ErrorOp::Recv, |l, ex| {
                        l.on_peer_shutdown(ex, pid, &unsent)
                    });
                }
                Pending::Notice(RouterNotice::Error(error)) => {
                    self.report_error(error);
                }
            }
        }
        self.dispatching = false;
    }

    /// Invoke one callback on every listener, in priority order, with
    /// panics contained and reported afterwards.
    fn each_listener<F>(&mut self, op: ErrorOp, mut f: F)
    where
        F: FnMut(&mut dyn Listener, &mut Executor),
    {
        if self.listeners.len() == 0 {
            return;
        }
        let mut set = mem::take(&mut self.listeners);
        let mut panics = Vec::new();
        for entry in set.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| f(entry.listener.as_mut(), self)));
            if let Err(payload) = result {
                panics.push(panic_message(payload));
            }
        }
        let added = mem::replace(&mut self.listeners, set);
        self.listeners.absorb(added);

        for detail in panics {
            self.report_error(RouterError::ListenerPanic { op, detail });
        }
    }

    /// Like `each_listener` for `on_router_error`, but a panic here is
    /// only logged, never re-reported, so error dispatch cannot recurse.
    fn report_error(&mut self, error: RouterError) {
        tracing::debug!(pid = self.pid, error = %error, "router error");
        let mut set = mem::take(&mut self.listeners);
        for entry in set.iter_mut() {
            let result = catch_unwind(AssertUnwindSafe(|| {
                entry.listener.on_router_error(self, &error)
            }));
            if result.is_err() {
                tracing::warn!(pid = self.pid, "listener panicked inside on_router_error");
            }
        }
        let added = mem::replace(&mut self.listeners, set);
        self.listeners.absorb(added);
    }

    fn has_living_children(&self) -> bool {
        self.children
            .values()
            .any(|c| matches!(c.termination, Termination::Living))
    }

    /// Harvest exit statuses without blocking. Waits on each known
    /// living child individually, never `-1`: the embedding process (or
    /// another executor in it) may own children of its own.
    fn reap_children(&mut self) {
        for pid in self.living_children() {
            loop {
                match waitpid(Pid::from_raw(pid as i32), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => break,
                    Ok(status) => {
                        self.record_wait_status(status);
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(err) => {
                        tracing::debug!(child = pid, error = %err, "waitpid failed");
                        break;
                    }
                }
            }
        }
    }

    fn living_children(&self) -> Vec<u32> {
        self.children
            .values()
            .filter(|c| !c.termination.is_terminal())
            .map(|c| c.pid)
            .collect()
    }

    fn record_wait_status(&mut self, status: WaitStatus) {
        match status {
            WaitStatus::Exited(pid, code) => {
                self.mark_child(pid.as_raw() as u32, |uptime| Termination::Exited {
                    code,
                    uptime,
                });
            }
            WaitStatus::Signaled(pid, signal, _core_dumped) => {
                self.mark_child(pid.as_raw() as u32, |uptime| Termination::Signaled {
                    signal: signal as i32,
                    uptime,
                });
            }
            _ => {}
        }
    }

    fn mark_child(&mut self, pid: u32, make: impl FnOnce(Duration) -> Termination) {
        if let Some(child) = self.children.get_mut(&pid) {
            if !child.termination.is_terminal() {
                child.termination = make(child.spawned_at.elapsed());
                tracing::debug!(child = pid, state = ?child.termination, "child reaped");
            }
        }
    }

    /// Close remaining sockets and block-reap any still-living children.
    fn teardown(&mut self) {
        self.router.close_all(&self.reactor);
        for pid in self.living_children() {
            loop {
                match waitpid(Pid::from_raw(pid as i32), None) {
                    Ok(status) => {
                        self.record_wait_status(status);
                        break;
                    }
                    Err(Errno::EINTR) => continue,
                    Err(_) => break,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Recorder {
        log: Rc<RefCell<Vec<&'static str>>>,
    }

    impl Listener for Recorder {
        fn on_start(&mut self, _exec: &mut Executor) {
            self.log.borrow_mut().push("start");
        }
        fn on_shutdown(&mut self, _exec: &mut Executor) {
            self.log.borrow_mut().push("shutdown");
        }
        fn on_exit_loop(&mut self, _exec: &mut Executor) {
            self.log.borrow_mut().push("exit_loop");
        }
    }

    #[test]
    fn shutdown_with_nothing_to_wait_for_exits_immediately() {
        let mut exec = Executor::new(ExecutorOptions {
            shutdown_behavior: ShutdownBehavior::FLUSH_PENDING_MESSAGES
                | ShutdownBehavior::WAIT_FOR_PEERS_TERMINATION,
            ..ExecutorOptions::default()
        })
        .unwrap();

        let log = Rc::new(RefCell::new(Vec::new()));
        exec.add_listener(Box::new(Recorder { log: log.clone() }));

        exec.shutdown();
        exec.run().unwrap();
        assert_eq!(*log.borrow(), vec!["shutdown", "start", "exit_loop"]);
    }

    #[test]
    fn shutdown_ttl_bounds_the_loop() {
        let mut exec = Executor::new(ExecutorOptions {
            shutdown_behavior: ShutdownBehavior::WAIT_FOR_PEERS_TERMINATION,
            shutdown_ttl: 5,
            ..ExecutorOptions::default()
        })
        .unwrap();

        // An unconsumed terminal child record keeps the wait condition
        // alive forever; the TTL must force the loop out anyway.
        exec.children.insert(
            999_999,
            ChildState {
                pid: 999_999,
                alias: None,
                spawned_at: Instant::now(),
                termination: Termination::Exited {
                    code: 0,
                    uptime: Duration::ZERO,
                },
            },
        );

        exec.shutdown();
        let started = Instant::now();
        exec.run().unwrap();
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(exec.child_count(), 1, "the record is still unconsumed");
    }

    #[test]
    fn read_child_state_of_unknown_pid_is_none() {
        let mut exec = Executor::new(ExecutorOptions::default()).unwrap();
        assert!(exec.read_child_state(12345).is_none());
        assert_eq!(exec.child_count(), 0);
    }

    struct Panicker;

    impl Listener for Panicker {
        fn priority(&self) -> i32 {
            -10
        }
        fn on_shutdown(&mut self, _exec: &mut Executor) {
            panic!("listener bug");
        }
    }

    struct ErrorLog {
        seen: Rc<RefCell<Vec<String>>>,
    }

    impl Listener for ErrorLog {
        fn on_router_error(&mut self, _exec: &mut Executor, error: &RouterError) {
            self.seen.borrow_mut().push(error.to_string());
        }
    }

    #[test]
    fn listener_panic_is_contained_and_reported() {
        let mut exec = Executor::new(ExecutorOptions::default()).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        exec.add_listener(Box::new(Panicker));
        exec.add_listener(Box::new(ErrorLog { seen: seen.clone() }));

        exec.shutdown();
        assert_eq!(seen.borrow().len(), 1);
        assert!(seen.borrow()[0].contains("listener bug"));
    }
}
