//! Trees of cooperating processes exchanging typed messages over
//! per-edge socketpairs.
//!
//! A parent process forks children; each child may itself fork,
//! producing an arbitrary tree:
//!
//! ```text
//!          ┌─────────┐
//!          │  root   │
//!          └────┬────┘
//!               │
//!     ┌─────────┼─────────┐
//!     │         │         │
//! ┌───┴───┐ ┌───┴───┐ ┌───┴───┐
//! │ child │ │ child │ │ child │──┐
//! └───────┘ └───────┘ └───────┘  │
//!                            ┌───┴───┐
//!                            │ grand │
//!                            └───────┘
//! ```
//!
//! Each node runs one cooperative event loop over the sockets to its
//! direct neighbours. Messages are routed by flooding with
//! split-horizon: a node forwards an unmatched frame to every neighbour
//! except the one that delivered it, until the frame reaches its
//! destination — a pid, an alias, or every node (broadcast).
//!
//! # Usage
//!
//! ```ignore
//! use grove::{Destination, Executor, ExecutorOptions, ForkOptions, SubmitOptions};
//!
//! let mut exec = Executor::new(ExecutorOptions::default())?;
//! exec.add_listener(Box::new(MyListener));
//!
//! let worker = exec.fork(
//!     ForkOptions { alias: Some("worker".into()), ..ForkOptions::default() },
//!     |child| { /* runs in the child before its loop */ },
//!     |_parent, _pid| {},
//! )?;
//!
//! exec.submit("job", Destination::Alias("worker"), SubmitOptions::default())?;
//! exec.run()?;
//! ```
//!
//! Payload serialization is application-level: the library carries
//! opaque bytes and forwards the `serialize` marker untouched.

mod endpoint;
mod error;
mod event;
mod executor;
mod intercept;
mod listener;
mod reactor;
mod router;

pub use endpoint::FlushOrder;
pub use error::{ErrorOp, ForkError, RouterError};
pub use event::{MessageEvent, UnsentFrame};
pub use executor::{
    ChildState, Executor, ExecutorOptions, ForkOptions, ShutdownBehavior, Termination,
};
pub use intercept::{Intercepted, Interceptor, InterceptorLayer, Flow};
pub use listener::Listener;
pub use router::{
    Destination, DispatchMode, EndpointDiagnostics, RouterDiagnostics, SubmitOptions,
};

// Re-export the wire types: listeners and resubmission paths see them.
pub use grove_wire::{Frame, FrameError, MAX_ALIAS_LEN, MAX_PAYLOAD_SIZE};

/// The urgent signal default. Override per executor via
/// [`ExecutorOptions::urgent_signal`].
pub use nix::sys::signal::Signal;
