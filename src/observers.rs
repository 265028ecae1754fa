//! Per-folder update observers.
//!
//! Each registered folder has exactly one single-use delivery slot. The slot
//! is resolved at most once, with `Ok(())` when the server pushes an update
//! or an error when the connection goes away, and the entry is removed in the
//! same critical section that picks it for delivery. A caller that wants to
//! keep waiting registers again.
//!
//! Every slot carries a ticket. Withdrawing takes the ticket, so a caller
//! cleaning up after a failed registration can never remove a newer slot
//! installed for the same folder after a disconnect emptied the table.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::MdServerError;
use crate::types::TlfId;

/// Receiving end handed to the caller of `register_for_update`.
///
/// A value of `Ok(())` means "an update happened". An `Err` or a closed
/// channel means the wait is over without an update.
pub type UpdateReceiver = oneshot::Receiver<Result<(), MdServerError>>;

type UpdateSender = oneshot::Sender<Result<(), MdServerError>>;

struct Slot {
    ticket: u64,
    tx: UpdateSender,
}

#[derive(Default)]
struct Table {
    next_ticket: u64,
    slots: HashMap<TlfId, Slot>,
}

#[derive(Default)]
pub struct ObserverRegistry {
    table: Mutex<Table>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        // Every critical section leaves the table consistent.
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the delivery slot for `id`.
    ///
    /// # Panics
    /// If `id` already has a live slot. Replacing it would leave the earlier
    /// waiter hanging forever, so this is treated as a caller bug.
    pub fn install(&self, id: TlfId) -> (u64, UpdateReceiver) {
        let mut table = self.lock();
        if table.slots.contains_key(&id) {
            drop(table);
            panic!("Attempted double-registration for folder: {}", id);
        }
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        let (tx, rx) = oneshot::channel();
        table.slots.insert(id, Slot { ticket, tx });
        (ticket, rx)
    }

    /// Drop the slot `ticket` installed for `id` without delivering anything.
    /// The receiver sees the channel closed.
    pub fn withdraw(&self, id: &TlfId, ticket: u64) -> bool {
        let mut table = self.lock();
        let owned = table.slots.get(id).is_some_and(|slot| slot.ticket == ticket);
        if owned {
            table.slots.remove(id);
        }
        owned
    }

    /// Deliver "update happened" to `id`'s waiter. Returns false if nobody
    /// was waiting.
    pub fn signal(&self, id: &TlfId) -> bool {
        let observer = self.lock().slots.remove(id);
        match observer {
            Some(slot) => {
                debug!(folder = %id, "Signalling folder update");
                let _ = slot.tx.send(Ok(()));
                true
            }
            None => false,
        }
    }

    /// Fail every waiter with `Disconnected` and empty the table.
    ///
    /// Returns how many waiters were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(TlfId, Slot)> = self.lock().slots.drain().collect();
        let count = drained.len();
        for (id, slot) in drained {
            debug!(folder = %id, "Cancelling folder observer");
            let _ = slot.tx.send(Err(MdServerError::Disconnected));
        }
        count
    }

    pub fn is_registered(&self, id: &TlfId) -> bool {
        self.lock().slots.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot::error::TryRecvError;

    fn folder(n: u8) -> TlfId {
        let mut bytes = [n; 16];
        bytes[15] = crate::types::TLF_ID_SUFFIX;
        TlfId::from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_signal_delivers_once_and_removes() {
        let registry = ObserverRegistry::new();
        let (_, mut rx) = registry.install(folder(1));

        assert!(registry.signal(&folder(1)));
        assert!(matches!(rx.try_recv(), Ok(Ok(()))));
        assert!(registry.is_empty());

        // A second push for the same folder has nobody to wake
        assert!(!registry.signal(&folder(1)));
    }

    #[test]
    fn test_signal_only_touches_its_own_folder() {
        let registry = ObserverRegistry::new();
        let (_, mut a) = registry.install(folder(1));
        let (_, mut b) = registry.install(folder(2));

        registry.signal(&folder(1));

        assert!(matches!(a.try_recv(), Ok(Ok(()))));
        assert!(matches!(b.try_recv(), Err(TryRecvError::Empty)));
        assert!(registry.is_registered(&folder(2)));
    }

    #[test]
    fn test_cancel_all_fails_every_waiter() {
        let registry = ObserverRegistry::new();
        let mut receivers: Vec<_> = (1..=3).map(|n| registry.install(folder(n)).1).collect();

        assert_eq!(registry.cancel_all(), 3);
        assert!(registry.is_empty());
        for rx in receivers.iter_mut() {
            assert!(matches!(rx.try_recv(), Ok(Err(MdServerError::Disconnected))));
        }
    }

    #[test]
    fn test_withdraw_closes_without_value() {
        let registry = ObserverRegistry::new();
        let (ticket, mut rx) = registry.install(folder(4));

        assert!(registry.withdraw(&folder(4), ticket));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Closed)));
        assert!(!registry.withdraw(&folder(4), ticket));
    }

    #[test]
    fn test_stale_ticket_leaves_newer_slot_alone() {
        let registry = ObserverRegistry::new();
        let (stale, _first) = registry.install(folder(7));
        registry.cancel_all();
        let (_, mut second) = registry.install(folder(7));

        assert!(!registry.withdraw(&folder(7), stale));
        assert!(registry.is_registered(&folder(7)));
        assert!(matches!(second.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_reinstall_after_delivery() {
        let registry = ObserverRegistry::new();
        let _first = registry.install(folder(5));
        registry.signal(&folder(5));
        let _second = registry.install(folder(5));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    #[should_panic(expected = "double-registration")]
    fn test_double_registration_panics() {
        let registry = ObserverRegistry::new();
        let _first = registry.install(folder(6));
        let _second = registry.install(folder(6));
    }
}
