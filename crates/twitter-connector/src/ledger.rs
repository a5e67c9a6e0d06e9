//! Idempotency ledger for keyed mutations.
//!
//! A key is claimed before the backend is called, so a second dispatch with
//! the same key waits for the first instead of sending the mutation again.
//! Only successes are remembered; the oldest is forgotten once the ledger is
//! full.

use crate::action::ActionKind;
use crate::error::ConnectorResult;
use crate::model::ActionResult;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tracing::debug;

pub(crate) type LedgerKey = (ActionKind, String);

/// Outcome published by the owner of a key; `None` until it finishes.
type Published = Option<ConnectorResult<ActionResult>>;

enum Entry {
    InFlight(watch::Receiver<Published>),
    Done(ActionResult),
}

#[derive(Default)]
struct Entries {
    by_key: HashMap<LedgerKey, Entry>,
    /// Keys of `Done` entries, oldest first
    completed: VecDeque<LedgerKey>,
}

/// What a caller holding an idempotency key should do.
pub(crate) enum Claim<'a> {
    /// Run the action and report through the guard
    Owner(LedgerGuard<'a>),
    /// The key already succeeded
    Recorded(ActionResult),
    /// Another dispatch holds the key
    Wait(watch::Receiver<Published>),
}

pub(crate) struct IdempotencyLedger {
    capacity: usize,
    entries: Mutex<Entries>,
}

impl IdempotencyLedger {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(Entries::default()),
        }
    }

    pub(crate) fn claim(&self, key: &LedgerKey) -> Claim<'_> {
        let mut entries = self.lock();
        match entries.by_key.get(key) {
            Some(Entry::Done(result)) => Claim::Recorded(result.clone()),
            Some(Entry::InFlight(receiver)) => Claim::Wait(receiver.clone()),
            None => {
                let (sender, receiver) = watch::channel(None);
                entries.by_key.insert(key.clone(), Entry::InFlight(receiver));
                Claim::Owner(LedgerGuard {
                    ledger: self,
                    key: key.clone(),
                    sender,
                    finished: false,
                })
            }
        }
    }

    /// Number of remembered successes.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock().completed.len()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Ownership of an in-flight key. Dropping it unfinished releases the key.
pub(crate) struct LedgerGuard<'a> {
    ledger: &'a IdempotencyLedger,
    key: LedgerKey,
    sender: watch::Sender<Published>,
    finished: bool,
}

impl LedgerGuard<'_> {
    /// Record the outcome and hand it to every waiter.
    pub(crate) fn finish(mut self, outcome: &ConnectorResult<ActionResult>) {
        {
            let mut entries = self.ledger.lock();
            match outcome {
                Ok(result) => {
                    entries
                        .by_key
                        .insert(self.key.clone(), Entry::Done(result.clone()));
                    entries.completed.push_back(self.key.clone());
                    while entries.completed.len() > self.ledger.capacity {
                        if let Some(oldest) = entries.completed.pop_front() {
                            debug!(idempotency_key = %oldest.1, "Forgetting oldest idempotency key");
                            entries.by_key.remove(&oldest);
                        }
                    }
                }
                Err(_) => {
                    entries.by_key.remove(&self.key);
                }
            }
        }
        self.finished = true;
        self.sender.send_replace(Some(outcome.clone()));
    }
}

impl Drop for LedgerGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            // Cancelled: waiters see the channel close and claim the key themselves.
            self.ledger.lock().by_key.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClassifiedError;
    use crate::model::Tweet;

    fn key(k: &str) -> LedgerKey {
        (ActionKind::PostTweet, k.to_string())
    }

    fn tweet(id: &str) -> ActionResult {
        ActionResult::Tweet(Tweet::new(id, "t"))
    }

    fn owner<'a>(ledger: &'a IdempotencyLedger, k: &str) -> LedgerGuard<'a> {
        match ledger.claim(&key(k)) {
            Claim::Owner(guard) => guard,
            _ => panic!("expected to own {}", k),
        }
    }

    #[test]
    fn test_success_is_replayed() {
        let ledger = IdempotencyLedger::new(4);
        owner(&ledger, "a").finish(&Ok(tweet("1")));

        match ledger.claim(&key("a")) {
            Claim::Recorded(result) => assert_eq!(result, tweet("1")),
            _ => panic!("expected a recorded result"),
        };
    }

    #[test]
    fn test_failure_releases_key() {
        let ledger = IdempotencyLedger::new(4);
        owner(&ledger, "a").finish(&Err(ClassifiedError::auth("expired")));
        assert!(matches!(ledger.claim(&key("a")), Claim::Owner(_)));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_in_flight_key_makes_callers_wait() {
        let ledger = IdempotencyLedger::new(4);
        let guard = owner(&ledger, "a");

        let Claim::Wait(receiver) = ledger.claim(&key("a")) else {
            panic!("expected to wait");
        };
        guard.finish(&Ok(tweet("1")));
        match &*receiver.borrow() {
            Some(Ok(result)) => assert_eq!(*result, tweet("1")),
            other => panic!("unexpected outcome: {:?}", other),
        };
    }

    #[test]
    fn test_dropped_owner_releases_key() {
        let ledger = IdempotencyLedger::new(4);
        drop(owner(&ledger, "a"));
        assert!(matches!(ledger.claim(&key("a")), Claim::Owner(_)));
    }

    #[test]
    fn test_capacity_forgets_oldest() {
        let ledger = IdempotencyLedger::new(2);
        for (k, id) in [("a", "1"), ("b", "2"), ("c", "3")] {
            owner(&ledger, k).finish(&Ok(tweet(id)));
        }

        assert_eq!(ledger.len(), 2);
        assert!(matches!(ledger.claim(&key("a")), Claim::Owner(_)));
        assert!(matches!(ledger.claim(&key("c")), Claim::Recorded(_)));
    }
}
