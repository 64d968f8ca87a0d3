//! The listener contract and the priority-ordered listener set.

use std::any::Any;

use crate::error::RouterError;
use crate::event::{MessageEvent, UnsentFrame};
use crate::executor::Executor;

/// User callbacks invoked by the executor's event loop.
///
/// Every method has a default empty body; implement the ones you need.
/// The executor is passed explicitly so a callback can submit messages,
/// register further listeners, or initiate shutdown. All callbacks run to
/// completion before the next event is dispatched; a panicking callback
/// is contained and reported through [`on_router_error`](Self::on_router_error).
pub trait Listener {
    /// Read once at registration. Lower priorities fire earlier;
    /// listeners with equal priority fire in registration order.
    fn priority(&self) -> i32 {
        0
    }

    /// The event loop was entered.
    fn on_start(&mut self, exec: &mut Executor) {
        let _ = exec;
    }

    /// An outgoing frame was fully flushed. In process-context mode this
    /// fires exactly once per local submission, regardless of fan-out.
    fn on_message_sent(&mut self, exec: &mut Executor, event: &MessageEvent) {
        let _ = (exec, event);
    }

    /// A locally targeted frame arrived on the normal path.
    fn on_message_received(&mut self, exec: &mut Executor, event: &mut MessageEvent) {
        let _ = (exec, event);
    }

    /// A frame arrived during the urgent drain. Keep the body short; the
    /// drain runs between reactor dispatches and delays everything else.
    fn on_interrupt_receive(&mut self, exec: &mut Executor, event: &mut MessageEvent) {
        let _ = (exec, event);
    }

    /// A peer endpoint reached EOF. `unsent` holds the frames that were
    /// still queued toward it, in enqueue order.
    fn on_peer_shutdown(&mut self, exec: &mut Executor, pid: u32, unsent: &[UnsentFrame]) {
        let _ = (exec, pid, unsent);
    }

    /// An I/O failure or a contained listener panic.
    fn on_router_error(&mut self, exec: &mut Executor, error: &RouterError) {
        let _ = (exec, error);
    }

    /// `shutdown()` was called on the executor.
    fn on_shutdown(&mut self, exec: &mut Executor) {
        let _ = exec;
    }

    /// The loop condition went false; teardown is about to run.
    fn on_exit_loop(&mut self, exec: &mut Executor) {
        let _ = exec;
    }
}

pub(crate) struct Entry {
    pub(crate) priority: i32,
    pub(crate) listener: Box<dyn Listener>,
}

/// Listeners sorted by ascending priority with stable insertion order
/// among equals.
#[derive(Default)]
pub(crate) struct ListenerSet {
    entries: Vec<Entry>,
}

impl ListenerSet {
    pub(crate) fn insert(&mut self, listener: Box<dyn Listener>) {
        let priority = listener.priority();
        let at = self
            .entries
            .iter()
            .position(|e| e.priority > priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(at, Entry { priority, listener });
    }

    /// Merge listeners registered while the set was taken out for
    /// dispatch, preserving priority order.
    pub(crate) fn absorb(&mut self, other: ListenerSet) {
        for entry in other.entries {
            let at = self
                .entries
                .iter()
                .position(|e| e.priority > entry.priority)
                .unwrap_or(self.entries.len());
            self.entries.insert(at, entry);
        }
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Entry> {
        self.entries.iter_mut()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Best-effort rendering of a caught panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Tagged(i32);

    impl Listener for Tagged {
        fn priority(&self) -> i32 {
            self.0
        }
    }

    #[test]
    fn insertion_sorts_by_priority_with_stable_ties() {
        let mut set = ListenerSet::default();
        set.insert(Box::new(Tagged(10)));
        set.insert(Box::new(Tagged(-5)));
        set.insert(Box::new(Tagged(10)));
        set.insert(Box::new(Tagged(0)));

        let order: Vec<i32> = set.iter_mut().map(|e| e.priority).collect();
        assert_eq!(order, vec![-5, 0, 10, 10]);
    }

    #[test]
    fn absorb_keeps_order() {
        let mut set = ListenerSet::default();
        set.insert(Box::new(Tagged(1)));
        set.insert(Box::new(Tagged(3)));

        let mut late = ListenerSet::default();
        late.insert(Box::new(Tagged(2)));
        late.insert(Box::new(Tagged(0)));

        set.absorb(late);
        let order: Vec<i32> = set.iter_mut().map(|e| e.priority).collect();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }
}
