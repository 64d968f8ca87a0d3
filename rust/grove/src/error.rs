//! Error types for the router and the process-tree executor.

use std::io;

use grove_wire::FrameError;

/// Direction of the operation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOp {
    Send,
    Recv,
}

impl std::fmt::Display for ErrorOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorOp::Send => write!(f, "send"),
            ErrorOp::Recv => write!(f, "recv"),
        }
    }
}

/// Errors produced by the router and surfaced through
/// [`Listener::on_router_error`](crate::Listener::on_router_error), or
/// returned directly from calls that fail fast.
#[derive(Debug)]
pub enum RouterError {
    /// A socket operation failed. The endpoint stays alive until EOF.
    Io {
        op: ErrorOp,
        /// Peer pid the operation was directed at; `0` when not tied to a
        /// specific endpoint (e.g. the reactor itself).
        peer: u32,
        source: io::Error,
    },
    /// The byte stream from `peer` violated the wire format. There is no
    /// way to resynchronise, so the endpoint is closed.
    Protocol { peer: u32, source: FrameError },
    /// A submit addressed this process itself. Returned straight to the
    /// submitting caller, never dispatched to listeners.
    Loopback { pid: u32 },
    /// A submit found no endpoint to carry the message.
    NoRoute,
    /// A route registration collided with an existing endpoint.
    PeerExists { pid: u32 },
    /// The urgent drain was entered while one was already active. A bug
    /// in the caller; returned straight to it (and out of the loop),
    /// never dispatched to listeners.
    UrgentReentry,
    /// A listener panicked during dispatch. The panic is contained and the
    /// loop continues.
    ListenerPanic { op: ErrorOp, detail: String },
}

impl RouterError {
    /// Direction of the failed operation.
    pub fn op(&self) -> ErrorOp {
        match self {
            RouterError::Io { op, .. } | RouterError::ListenerPanic { op, .. } => *op,
            RouterError::Protocol { .. } => ErrorOp::Recv,
            RouterError::Loopback { .. }
            | RouterError::NoRoute
            | RouterError::PeerExists { .. }
            | RouterError::UrgentReentry => ErrorOp::Send,
        }
    }

    /// OS errno of the underlying failure, when there is one.
    pub fn errno(&self) -> Option<i32> {
        match self {
            RouterError::Io { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::Io { op, peer, source } => {
                write!(f, "{op} failed for peer {peer}: {source}")
            }
            RouterError::Protocol { peer, source } => {
                write!(f, "protocol fault on stream from peer {peer}: {source}")
            }
            RouterError::Loopback { pid } => {
                write!(f, "message addressed to the local process {pid}")
            }
            RouterError::NoRoute => write!(f, "no endpoint to route the message over"),
            RouterError::PeerExists { pid } => {
                write!(f, "an endpoint for peer {pid} is already registered")
            }
            RouterError::UrgentReentry => {
                write!(f, "urgent drain entered while one was already active")
            }
            RouterError::ListenerPanic { op, detail } => {
                write!(f, "listener panicked during {op} dispatch: {detail}")
            }
        }
    }
}

impl std::error::Error for RouterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RouterError::Io { source, .. } => Some(source),
            RouterError::Protocol { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Errors from [`Executor::fork`](crate::Executor::fork). All of these
/// leave the tree unchanged: no child was created.
#[derive(Debug)]
pub enum ForkError {
    /// Creating the parent/child socketpair failed.
    SocketPair(nix::Error),
    /// The OS fork itself failed.
    Fork(nix::Error),
    /// Registering the new edge with the router failed.
    Register(Box<RouterError>),
}

impl std::fmt::Display for ForkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForkError::SocketPair(e) => write!(f, "socketpair failed: {e}"),
            ForkError::Fork(e) => write!(f, "fork failed: {e}"),
            ForkError::Register(e) => write!(f, "registering child route failed: {e}"),
        }
    }
}

impl std::error::Error for ForkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForkError::SocketPair(e) | ForkError::Fork(e) => Some(e),
            ForkError::Register(e) => Some(e.as_ref()),
        }
    }
}
