//! Interruptible tick sleep.
//!
//! The tick thread sleeps until its next deadline through
//! [`SleeperHandler::sleep_until`]. Other threads hold a [`SleeperNotifier`]
//! and call [`SleeperNotifier::wake_up_sleeper`] when they have queued
//! something. The sleeper wakes, runs the matching handler on the tick thread,
//! then goes back to sleep for whatever time is left.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Identifies one registered notifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotifierId(u32);

impl NotifierId {
    /// Returns the raw id.
    #[must_use]
    pub const fn raw(self) -> u32 {
        self.0
    }
}

struct Shared {
    pending: Mutex<BTreeSet<NotifierId>>,
    condvar: Condvar,
}

/// Cross-thread handle that wakes the sleeper.
///
/// Repeated wake-ups before the sleeper gets to them coalesce into one
/// handler call.
#[derive(Clone)]
pub struct SleeperNotifier {
    id: NotifierId,
    shared: Arc<Shared>,
}

impl SleeperNotifier {
    /// Flags this notifier and wakes the sleeping tick thread.
    pub fn wake_up_sleeper(&self) {
        self.shared.pending.lock().insert(self.id);
        self.shared.condvar.notify_one();
    }

    /// Returns the notifier id.
    #[must_use]
    pub const fn id(&self) -> NotifierId {
        self.id
    }
}

impl fmt::Debug for SleeperNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleeperNotifier").field("id", &self.id).finish()
    }
}

type Handler<C> = Box<dyn FnMut(&mut C)>;

/// Owns the notifier handlers and performs the tick sleep.
///
/// `C` is the context the handlers receive, normally the server itself.
/// Handlers are not `Send`: they only ever run on the thread that sleeps.
pub struct SleeperHandler<C> {
    shared: Arc<Shared>,
    handlers: HashMap<NotifierId, Handler<C>>,
    next_id: u32,
}

impl<C> SleeperHandler<C> {
    /// Creates a sleeper with no notifiers.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(BTreeSet::new()),
                condvar: Condvar::new(),
            }),
            handlers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Registers a handler and returns the notifier that triggers it.
    pub fn add_notifier(&mut self, handler: impl FnMut(&mut C) + 'static) -> SleeperNotifier {
        let id = NotifierId(self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        self.handlers.insert(id, Box::new(handler));
        SleeperNotifier {
            id,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Unregisters a handler. Later wake-ups from its notifier are ignored.
    pub fn remove_notifier(&mut self, id: NotifierId) -> bool {
        self.shared.pending.lock().remove(&id);
        self.handlers.remove(&id).is_some()
    }

    /// Returns the number of registered notifiers.
    #[must_use]
    pub fn notifier_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs the handlers of every flagged notifier without sleeping.
    ///
    /// Returns the number of handlers run.
    pub fn process_notifications(&mut self, ctx: &mut C) -> usize {
        let flagged = std::mem::take(&mut *self.shared.pending.lock());
        let mut ran = 0;
        for id in flagged {
            if let Some(handler) = self.handlers.get_mut(&id) {
                handler(ctx);
                ran += 1;
            } else {
                tracing::trace!(notifier = id.raw(), "Wake-up from removed notifier ignored");
            }
        }
        ran
    }

    /// Sleeps until `deadline`, servicing notifications as they arrive.
    ///
    /// Returns the number of handlers run. Returns immediately (after
    /// processing pending notifications) if the deadline has passed.
    pub fn sleep_until(&mut self, deadline: Instant, ctx: &mut C) -> usize {
        let mut ran = self.process_notifications(ctx);
        loop {
            {
                let mut pending = self.shared.pending.lock();
                while pending.is_empty() {
                    if self.shared.condvar.wait_until(&mut pending, deadline).timed_out() {
                        break;
                    }
                }
                if pending.is_empty() {
                    return ran;
                }
            }
            ran += self.process_notifications(ctx);
            if Instant::now() >= deadline {
                return ran;
            }
        }
    }
}

impl<C> Default for SleeperHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> fmt::Debug for SleeperHandler<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SleeperHandler")
            .field("notifiers", &self.handlers.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sleep_without_notifications_reaches_deadline() {
        let mut sleeper: SleeperHandler<u32> = SleeperHandler::new();
        let mut ctx = 0;
        let start = Instant::now();

        let ran = sleeper.sleep_until(start + Duration::from_millis(20), &mut ctx);

        assert_eq!(ran, 0);
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_past_deadline_returns_immediately() {
        let mut sleeper: SleeperHandler<u32> = SleeperHandler::new();
        let mut ctx = 0;
        let start = Instant::now();

        sleeper.sleep_until(start, &mut ctx);

        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_notification_runs_handler_on_sleeping_thread() {
        let mut sleeper: SleeperHandler<Vec<&'static str>> = SleeperHandler::new();
        let notifier = sleeper.add_notifier(|log| log.push("console"));
        let mut log = Vec::new();

        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            notifier.wake_up_sleeper();
        });

        let deadline = Instant::now() + Duration::from_millis(300);
        let ran = sleeper.sleep_until(deadline, &mut log);
        waker.join().unwrap();

        assert_eq!(ran, 1);
        assert_eq!(log, vec!["console"]);
    }

    #[test]
    fn test_repeated_wake_ups_coalesce() {
        let mut sleeper: SleeperHandler<u32> = SleeperHandler::new();
        let notifier = sleeper.add_notifier(|count| *count += 1);
        let mut count = 0;

        notifier.wake_up_sleeper();
        notifier.wake_up_sleeper();
        notifier.wake_up_sleeper();

        assert_eq!(sleeper.process_notifications(&mut count), 1);
        assert_eq!(count, 1);
        assert_eq!(sleeper.process_notifications(&mut count), 0);
    }

    #[test]
    fn test_removed_notifier_is_ignored() {
        let mut sleeper: SleeperHandler<u32> = SleeperHandler::new();
        let kept = sleeper.add_notifier(|count| *count += 1);
        let removed = sleeper.add_notifier(|count| *count += 100);
        assert_eq!(sleeper.notifier_count(), 2);

        assert!(sleeper.remove_notifier(removed.id()));
        assert!(!sleeper.remove_notifier(removed.id()));

        kept.wake_up_sleeper();
        removed.wake_up_sleeper();

        let mut count = 0;
        sleeper.process_notifications(&mut count);
        assert_eq!(count, 1);
    }
}
