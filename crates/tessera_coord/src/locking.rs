//! Per-table lock state.
//!
//! READ is shared with READ; WRITE and CREATE exclude every other intent.
//! Waiters are admitted in FIFO order, so a queued writer is not overtaken by
//! readers that arrive after it. There is no acquisition timeout.

use std::collections::{BTreeMap, VecDeque};

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::types::{LockRequest, LockType, TableKey};

struct Waiter {
    requestor: LockRequest,
    lock_type: LockType,
    tx: oneshot::Sender<LockType>,
}

#[derive(Default)]
struct LockState {
    holders: BTreeMap<LockRequest, LockType>,
    waiters: VecDeque<Waiter>,
    closed: bool,
}

impl LockState {
    /// Grant immediately when compatible. `queued` is true for a waiter being
    /// re-evaluated from the queue, which skips the FIFO check.
    fn try_grant(&mut self, lock_type: LockType, requestor: &LockRequest, queued: bool) -> Option<LockType> {
        let wanted = lock_type.effective();
        if let Some(held) = self.holders.get(requestor).copied() {
            if held.is_exclusive() || wanted == LockType::Read {
                return Some(held);
            }
            // READ -> exclusive upgrade only for the sole holder.
            if self.holders.len() == 1 {
                self.holders.insert(requestor.clone(), wanted);
                return Some(wanted);
            }
            return None;
        }

        if !queued && !self.waiters.is_empty() {
            return None;
        }
        let compatible = match wanted {
            LockType::Read => self.holders.values().all(|held| *held == LockType::Read),
            _ => self.holders.is_empty(),
        };
        if compatible {
            self.holders.insert(requestor.clone(), wanted);
            Some(wanted)
        } else {
            None
        }
    }

    /// Admit queued waiters front to back until one is still incompatible.
    fn admit_waiters(&mut self) {
        // Upgrades by existing holders cannot wait behind the queue head.
        let mut idx = 0;
        while idx < self.waiters.len() {
            if self.holders.contains_key(&self.waiters[idx].requestor) {
                let requestor = self.waiters[idx].requestor.clone();
                let lock_type = self.waiters[idx].lock_type;
                if let Some(granted) = self.try_grant(lock_type, &requestor, true) {
                    if let Some(waiter) = self.waiters.remove(idx) {
                        self.deliver(waiter, granted);
                    }
                    continue;
                }
            }
            idx += 1;
        }

        while let Some(front) = self.waiters.front() {
            if front.tx.is_closed() {
                self.waiters.pop_front();
                continue;
            }
            let requestor = front.requestor.clone();
            let lock_type = front.lock_type;
            let Some(granted) = self.try_grant(lock_type, &requestor, true) else {
                break;
            };
            if let Some(waiter) = self.waiters.pop_front() {
                self.deliver(waiter, granted);
            }
        }
    }

    fn deliver(&mut self, waiter: Waiter, granted: LockType) {
        if waiter.tx.send(granted).is_err() {
            // The requester stopped waiting; undo the grant.
            self.holders.remove(&waiter.requestor);
        }
    }
}

/// Lock intents held and queued on one table.
pub struct LockingTable {
    table: TableKey,
    state: Mutex<LockState>,
}

impl LockingTable {
    pub fn new(table: TableKey) -> Self {
        Self {
            table,
            state: Mutex::new(LockState::default()),
        }
    }

    /// Suspend until `lock_type` is compatible and return the granted intent.
    ///
    /// `LockType::None` is returned when the table is closed while waiting.
    pub async fn request_lock(&self, lock_type: LockType, requestor: &LockRequest) -> LockType {
        if lock_type == LockType::None {
            return LockType::None;
        }
        let rx = {
            let mut state = self.state.lock();
            if state.closed {
                return LockType::None;
            }
            if let Some(granted) = state.try_grant(lock_type, requestor, false) {
                tracing::trace!(table = %self.table, requestor = %requestor, lock = %granted, "lock granted");
                return granted;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(Waiter {
                requestor: requestor.clone(),
                lock_type,
                tx,
            });
            tracing::debug!(
                table = %self.table,
                requestor = %requestor,
                lock = %lock_type,
                queued = state.waiters.len(),
                "lock request queued"
            );
            rx
        };
        rx.await.unwrap_or(LockType::None)
    }

    /// Grant without waiting; `LockType::None` when incompatible.
    pub fn try_request_lock(&self, lock_type: LockType, requestor: &LockRequest) -> LockType {
        if lock_type == LockType::None {
            return LockType::None;
        }
        let mut state = self.state.lock();
        if state.closed {
            return LockType::None;
        }
        state
            .try_grant(lock_type, requestor, false)
            .unwrap_or(LockType::None)
    }

    /// Release whatever `requestor` holds. Returns false when it held nothing.
    pub fn release_lock(&self, requestor: &LockRequest) -> bool {
        let mut state = self.state.lock();
        let released = state.holders.remove(requestor).is_some();
        if released {
            state.admit_waiters();
        }
        released
    }

    pub fn peek_at_lock_granted(&self, requestor: &LockRequest) -> LockType {
        self.state
            .lock()
            .holders
            .get(requestor)
            .copied()
            .unwrap_or(LockType::None)
    }

    /// Current holders with the intent each was granted.
    pub fn holders(&self) -> Vec<(LockRequest, LockType)> {
        self.state
            .lock()
            .holders
            .iter()
            .map(|(requestor, lock)| (requestor.clone(), *lock))
            .collect()
    }

    pub fn waiting(&self) -> usize {
        self.state.lock().waiters.len()
    }

    /// Drop every holder and wake every waiter with `LockType::None`.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        state.holders.clear();
        state.waiters.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::types::DatabaseId;

    fn requestor(session: u64) -> LockRequest {
        LockRequest::new(DatabaseId::new("127.0.0.1:7100", "a"), session)
    }

    fn table() -> LockingTable {
        LockingTable::new(TableKey::new("public", "orders"))
    }

    #[test]
    fn readers_share_and_writers_exclude() {
        let locks = table();
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(1)), LockType::Read);
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(2)), LockType::Read);
        assert_eq!(locks.try_request_lock(LockType::Write, &requestor(3)), LockType::None);
        assert!(locks.release_lock(&requestor(1)));
        assert!(locks.release_lock(&requestor(2)));
        assert_eq!(locks.try_request_lock(LockType::Create, &requestor(3)), LockType::Create);
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(1)), LockType::None);
    }

    #[test]
    fn holder_reentry_and_sole_reader_upgrade() {
        let locks = table();
        assert_eq!(locks.try_request_lock(LockType::Write, &requestor(1)), LockType::Write);
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(1)), LockType::Write);
        assert!(locks.release_lock(&requestor(1)));

        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(1)), LockType::Read);
        assert_eq!(locks.try_request_lock(LockType::Drop, &requestor(1)), LockType::Write);
        assert_eq!(locks.peek_at_lock_granted(&requestor(1)), LockType::Write);
        assert_eq!(locks.peek_at_lock_granted(&requestor(2)), LockType::None);
    }

    #[tokio::test]
    async fn second_writer_waits_for_release() {
        let locks = Arc::new(table());
        assert_eq!(locks.request_lock(LockType::Write, &requestor(1)).await, LockType::Write);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.request_lock(LockType::Write, &requestor(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());
        assert_eq!(locks.waiting(), 1);

        locks.release_lock(&requestor(1));
        let granted = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter woke")
            .expect("join");
        assert_eq!(granted, LockType::Write);
        assert_eq!(locks.holders(), vec![(requestor(2), LockType::Write)]);
    }

    #[tokio::test]
    async fn queued_writer_is_not_overtaken_by_later_reader() {
        let locks = Arc::new(table());
        assert_eq!(locks.request_lock(LockType::Read, &requestor(1)).await, LockType::Read);
        let writer = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.request_lock(LockType::Write, &requestor(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(3)), LockType::None);

        locks.release_lock(&requestor(1));
        assert_eq!(writer.await.expect("join"), LockType::Write);
    }

    #[tokio::test]
    async fn close_wakes_waiters_with_none() {
        let locks = Arc::new(table());
        locks.request_lock(LockType::Create, &requestor(1)).await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.request_lock(LockType::Read, &requestor(2)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.close();
        assert_eq!(waiter.await.expect("join"), LockType::None);
        assert_eq!(locks.try_request_lock(LockType::Read, &requestor(3)), LockType::None);
    }
}
