//! Per-operation identity map: source allocation address to clone
//! handle, the mechanism that makes cycles and shared references safe.
//!
//! Keys are reference identities, never value equality. Each distinct
//! source identity yields exactly one clone identity for the lifetime
//! of the operation; an entry, once created, is never replaced.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use rustc_hash::FxHashMap;

use crate::core::policy::{AnyValue, SharedSpec};

enum Entry {
    /// Shell handle exists and already circulates; its target is still
    /// being populated. Cycles that reach this entry reuse the handle.
    Allocated { handle: AnyValue },
    /// Reserved but no clone handle exists yet: either the winner is
    /// still allocating its shell, or the handle is plain and its
    /// target must be cloned before any handle can exist. The owning
    /// thread is recorded to tell a concurrent discovery (wait) from a
    /// same-thread cycle (error).
    Pending { owner: ThreadId },
    /// Terminal: target fully populated.
    Populated { handle: AnyValue },
}

/// Outcome of a reservation attempt.
pub(crate) enum Reservation {
    /// Caller won; it must populate the target and then complete or
    /// fail the entry.
    Owner,
    /// The clone handle already exists; reuse it.
    Existing(AnyValue),
    /// The same thread re-encountered its own pending entry: a cycle
    /// through a handle that cannot circulate before its target exists.
    SelfCycle,
    /// The owning operation failed while this caller was waiting.
    Cancelled,
}

#[derive(Default)]
pub(crate) struct IdentityMap {
    entries: Mutex<FxHashMap<usize, Entry>>,
    available: Condvar,
}

impl IdentityMap {
    /// Race-resolving reservation: exactly one caller wins per source
    /// identity. The winner gets a pending entry and nothing else is
    /// allocated until it either promotes a shell handle or completes.
    /// A caller that loses to a pending entry on another thread blocks
    /// until that entry becomes available.
    pub(crate) fn reserve(
        &self,
        key: usize,
        spec: &dyn SharedSpec,
        cancelled: impl Fn() -> bool,
    ) -> Reservation {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        loop {
            match entries.get(&key) {
                None => {
                    entries.insert(
                        key,
                        Entry::Pending {
                            owner: thread::current().id(),
                        },
                    );
                    return Reservation::Owner;
                }
                Some(Entry::Allocated { handle }) | Some(Entry::Populated { handle }) => {
                    return match spec.dup_handle(handle.as_ref()) {
                        Some(dup) => Reservation::Existing(dup),
                        // Address reuse across types cannot happen while
                        // the source graph is borrowed; treat as cancel.
                        None => Reservation::Cancelled,
                    };
                }
                Some(Entry::Pending { owner }) => {
                    if *owner == thread::current().id() {
                        return Reservation::SelfCycle;
                    }
                    if cancelled() {
                        return Reservation::Cancelled;
                    }
                    entries = self
                        .available
                        .wait(entries)
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                }
            }
        }
    }

    /// Upgrades the owner's pending entry with its now-allocated shell
    /// handle, which then circulates: cycles and concurrent discoveries
    /// of the same source resolve to it while the target is still being
    /// populated.
    pub(crate) fn promote(&self, key: usize, handle: AnyValue) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key, Entry::Allocated { handle });
        drop(entries);
        self.available.notify_all();
    }

    /// Marks the entry populated. For pending entries the now-existing
    /// handle must be supplied; for allocated entries it is reused.
    pub(crate) fn complete(&self, key: usize, handle: Option<AnyValue>) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let next = match (entries.remove(&key), handle) {
            (Some(Entry::Allocated { handle }), None) => Entry::Populated { handle },
            (_, Some(handle)) => Entry::Populated { handle },
            (Some(entry), None) => entry,
            (None, None) => return,
        };
        entries.insert(key, next);
        drop(entries);
        self.available.notify_all();
    }

    /// Removes a reservation whose population failed and wakes waiters
    /// so they can observe cancellation.
    pub(crate) fn fail(&self, key: usize) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(&key);
        drop(entries);
        self.available.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::engine::CopyScope;
    use crate::core::error::CloneError;
    use crate::core::path::FieldPath;
    use crate::core::policy::AnyRef;
    use std::sync::Arc;

    struct DummySpec;

    impl SharedSpec for DummySpec {
        fn type_name(&self) -> &'static str {
            "dummy"
        }
        fn identity(&self, _src: AnyRef<'_>) -> Option<usize> {
            Some(0)
        }
        fn dup_handle(&self, handle: &(dyn std::any::Any + Send + Sync)) -> Option<AnyValue> {
            handle
                .downcast_ref::<Arc<u32>>()
                .map(|h| Box::new(h.clone()) as AnyValue)
        }
        fn reserve(&self, _path: &FieldPath) -> Result<Option<AnyValue>, CloneError> {
            Ok(None)
        }
        fn populate<'g>(
            &self,
            _src: AnyRef<'g>,
            _shell: &(dyn std::any::Any + Send + Sync),
            _scope: &mut CopyScope<'_>,
        ) -> Result<(), CloneError> {
            Ok(())
        }
        fn clone_deferred<'g>(
            &self,
            _src: AnyRef<'g>,
            _scope: &mut CopyScope<'_>,
        ) -> Result<AnyValue, CloneError> {
            Ok(Box::new(Arc::new(0u32)))
        }
    }

    #[test]
    fn second_reservation_reuses_the_promoted_handle() {
        let map = IdentityMap::default();
        let spec = DummySpec;
        let shell = Arc::new(9u32);

        assert!(matches!(
            map.reserve(1, &spec, || false),
            Reservation::Owner
        ));
        map.promote(1, Box::new(shell.clone()));
        match map.reserve(1, &spec, || false) {
            Reservation::Existing(handle) => {
                let handle = handle.downcast::<Arc<u32>>().expect("stored handle type");
                assert!(Arc::ptr_eq(&handle, &shell));
            }
            _ => panic!("expected existing handle"),
        }
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn same_thread_pending_reentry_is_a_cycle() {
        let map = IdentityMap::default();
        let spec = DummySpec;
        assert!(matches!(
            map.reserve(2, &spec, || false),
            Reservation::Owner
        ));
        assert!(matches!(
            map.reserve(2, &spec, || false),
            Reservation::SelfCycle
        ));
        map.fail(2);
        assert_eq!(map.len(), 0);
    }

    #[test]
    fn complete_fills_a_pending_entry() {
        let map = IdentityMap::default();
        let spec = DummySpec;
        let clone = Arc::new(3u32);
        assert!(matches!(
            map.reserve(3, &spec, || false),
            Reservation::Owner
        ));
        map.complete(3, Some(Box::new(clone.clone())));
        match map.reserve(3, &spec, || false) {
            Reservation::Existing(handle) => {
                let handle = handle.downcast::<Arc<u32>>().expect("handle type");
                assert!(Arc::ptr_eq(&handle, &clone));
            }
            _ => panic!("expected existing handle"),
        }
    }
}
