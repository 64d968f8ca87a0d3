//! Interceptor chains layered over the listener contract.
//!
//! [`InterceptorLayer`] is an ordinary [`Listener`] that re-expresses
//! each callback as an explicit [`Intercepted`] variant and walks a
//! user-registered chain: every interceptor whose predicate matches is
//! invoked, until one of them stops propagation.

use crate::error::RouterError;
use crate::event::MessageEvent;
use crate::executor::Executor;
use crate::listener::Listener;

/// A dispatched callback, reified so one interceptor signature can
/// handle every kind.
pub enum Intercepted<'a> {
    /// An outgoing frame was flushed.
    Sent(&'a MessageEvent),
    /// A frame arrived on the normal path.
    Received(&'a mut MessageEvent),
    /// A frame arrived during the urgent drain.
    Interrupted(&'a mut MessageEvent),
    /// The router reported a failure.
    Failed(&'a RouterError),
}

impl Intercepted<'_> {
    /// The message event, when this dispatch carries one.
    pub fn event(&self) -> Option<&MessageEvent> {
        match self {
            Intercepted::Sent(ev) => Some(*ev),
            Intercepted::Received(ev) => Some(&**ev),
            Intercepted::Interrupted(ev) => Some(&**ev),
            Intercepted::Failed(_) => None,
        }
    }
}

/// Whether the chain keeps walking after an interceptor ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One link of the chain.
pub trait Interceptor {
    /// Whether this interceptor wants the dispatch at all.
    fn matches(&self, dispatch: &Intercepted<'_>) -> bool;

    /// Handle the dispatch. Returning [`Flow::Stop`] ends the walk; the
    /// interceptors behind this one never see the dispatch.
    fn handle(&mut self, exec: &mut Executor, dispatch: &mut Intercepted<'_>) -> Flow;
}

/// A listener that forwards every dispatch through an interceptor chain
/// in registration order.
pub struct InterceptorLayer {
    priority: i32,
    chain: Vec<Box<dyn Interceptor>>,
}

impl InterceptorLayer {
    pub fn new(priority: i32) -> Self {
        Self {
            priority,
            chain: Vec::new(),
        }
    }

    /// Append an interceptor to the end of the chain.
    pub fn push(&mut self, interceptor: Box<dyn Interceptor>) {
        self.chain.push(interceptor);
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    fn walk(&mut self, exec: &mut Executor, mut dispatch: Intercepted<'_>) {
        for interceptor in &mut self.chain {
            if interceptor.matches(&dispatch) {
                if interceptor.handle(exec, &mut dispatch) == Flow::Stop {
                    break;
                }
            }
        }
    }
}

impl Listener for InterceptorLayer {
    fn priority(&self) -> i32 {
        self.priority
    }

    fn on_message_sent(&mut self, exec: &mut Executor, event: &MessageEvent) {
        self.walk(exec, Intercepted::Sent(event));
    }

    fn on_message_received(&mut self, exec: &mut Executor, event: &mut MessageEvent) {
        self.walk(exec, Intercepted::Received(event));
    }

    fn on_interrupt_receive(&mut self, exec: &mut Executor, event: &mut MessageEvent) {
        self.walk(exec, Intercepted::Interrupted(event));
    }

    fn on_router_error(&mut self, exec: &mut Executor, error: &RouterError) {
        self.walk(exec, Intercepted::Failed(error));
    }
}
