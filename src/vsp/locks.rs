use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};

use rocket::tokio::sync::{Mutex, OwnedMutexGuard};

use crate::model::hash::TxHash;

/// Held while a ticket's state is read, checked and written back.
pub type TicketGuard = OwnedMutexGuard<()>;

/// One async mutex per ticket hash, created on demand.
///
/// Entries are weak, so the table only holds tickets someone is currently
/// locking or waiting on. Tickets never contend with each other.
#[derive(Debug, Clone, Default)]
pub struct TicketLocks {
    locks: Arc<StdMutex<HashMap<TxHash, Weak<Mutex<()>>>>>,
}

impl TicketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, hash: &TxHash) -> TicketGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            match locks.get(hash).and_then(Weak::upgrade) {
                Some(mutex) => mutex,
                None => {
                    locks.retain(|_, lock| lock.strong_count() > 0);
                    let mutex = Arc::new(Mutex::new(()));
                    locks.insert(*hash, Arc::downgrade(&mutex));
                    mutex
                }
            }
        };
        mutex.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}
