use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{check_stamp, StoreError, TicketStore};
use crate::model::{
    alt_sign_addr::AltSignAddrData,
    hash::TxHash,
    request::{Action, RequestStamp},
    ticket::{FeeStatus, Ticket},
    vote_change::VoteChangeRecord,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    tickets: HashMap<TxHash, Ticket>,
    alt_sign_addrs: HashMap<TxHash, Vec<AltSignAddrData>>,
    vote_changes: HashMap<TxHash, Vec<VoteChangeRecord>>,
    stamps: HashMap<(TxHash, Action), i64>,
}

impl Tables {
    fn check(&self, stamp: Option<&RequestStamp>) -> Result<(), StoreError> {
        match stamp {
            Some(stamp) => check_stamp(
                stamp,
                self.stamps.get(&(stamp.ticket_hash, stamp.action)).copied(),
            ),
            None => Ok(()),
        }
    }

    fn record(&mut self, stamp: Option<&RequestStamp>) {
        if let Some(stamp) = stamp {
            self.stamps
                .insert((stamp.ticket_hash, stamp.action), stamp.timestamp);
        }
    }
}

/// A [`TicketStore`] held in process memory.
///
/// Each operation runs under a single mutex, which makes it trivially atomic.
/// Clones share the same tables.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new store holding a copy of everything persisted so far, sharing
    /// nothing with this one. Stands in for reopening a database after a
    /// process restart.
    pub fn reopen(&self) -> Self {
        Self {
            tables: Arc::new(Mutex::new(self.lock().clone())),
            offline: Arc::default(),
        }
    }

    /// While offline every operation fails with [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        // Operations validate before mutating, so poisoned tables are still consistent.
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>, StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(self.lock())
    }
}

#[rocket::async_trait]
impl TicketStore for MemoryStore {
    async fn ticket(&self, hash: &TxHash) -> Result<Option<Ticket>, StoreError> {
        Ok(self.tables()?.tickets.get(hash).cloned())
    }

    async fn insert_ticket(
        &self,
        ticket: &Ticket,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        if tables.tickets.contains_key(&ticket.hash) {
            return Err(StoreError::TicketExists(ticket.hash));
        }
        tables.check(stamp)?;
        tables.tickets.insert(ticket.hash, ticket.clone());
        tables.record(stamp);
        Ok(())
    }

    async fn update_ticket(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        match tables.tickets.get(&ticket.hash) {
            None => return Err(StoreError::TicketNotFound(ticket.hash)),
            Some(stored) if stored.fee_status != expected => {
                return Err(StoreError::Conflict {
                    hash: ticket.hash,
                    expected,
                })
            }
            Some(_) => {}
        }
        tables.check(stamp)?;
        tables.tickets.insert(ticket.hash, ticket.clone());
        tables.record(stamp);
        Ok(())
    }

    async fn set_vote_choices(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        record: &VoteChangeRecord,
        max_records: usize,
        stamp: &RequestStamp,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let stored = tables
            .tickets
            .get(&ticket.hash)
            .ok_or(StoreError::TicketNotFound(ticket.hash))?;
        if stored.fee_status != expected {
            return Err(StoreError::Conflict {
                hash: ticket.hash,
                expected,
            });
        }
        tables.check(Some(stamp))?;

        tables.tickets.insert(ticket.hash, ticket.clone());
        let records = tables.vote_changes.entry(ticket.hash).or_default();
        records.push(record.clone());
        if records.len() > max_records {
            let excess = records.len() - max_records;
            records.drain(..excess);
        }
        tables.record(Some(stamp));
        Ok(())
    }

    async fn vote_changes(&self, hash: &TxHash) -> Result<Vec<VoteChangeRecord>, StoreError> {
        Ok(self
            .tables()?
            .vote_changes
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn alt_sign_addr_history(
        &self,
        hash: &TxHash,
    ) -> Result<Vec<AltSignAddrData>, StoreError> {
        Ok(self
            .tables()?
            .alt_sign_addrs
            .get(hash)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_alt_sign_addr(
        &self,
        data: &AltSignAddrData,
        max_records: usize,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        let count = tables
            .alt_sign_addrs
            .get(&data.ticket_hash)
            .map_or(0, Vec::len);
        if count >= max_records {
            return Err(StoreError::HistoryFull(data.ticket_hash));
        }
        tables.check(stamp)?;
        tables
            .alt_sign_addrs
            .entry(data.ticket_hash)
            .or_default()
            .push(data.clone());
        tables.record(stamp);
        Ok(())
    }

    async fn last_timestamp(
        &self,
        hash: &TxHash,
        action: Action,
    ) -> Result<Option<i64>, StoreError> {
        Ok(self.tables()?.stamps.get(&(*hash, action)).copied())
    }

    async fn record_timestamp(&self, stamp: &RequestStamp) -> Result<(), StoreError> {
        let mut tables = self.tables()?;
        tables.check(Some(stamp))?;
        tables.record(Some(stamp));
        Ok(())
    }

    async fn tickets_with_status(
        &self,
        statuses: &[FeeStatus],
    ) -> Result<Vec<Ticket>, StoreError> {
        let tables = self.tables()?;
        let mut tickets: Vec<Ticket> = tables
            .tickets
            .values()
            .filter(|t| statuses.contains(&t.fee_status))
            .cloned()
            .collect();
        tickets.sort_by_key(|t| t.hash);
        Ok(tickets)
    }

    async fn count_by_status(&self) -> Result<HashMap<FeeStatus, u64>, StoreError> {
        let mut counts = HashMap::new();
        for ticket in self.tables()?.tickets.values() {
            *counts.entry(ticket.fee_status).or_insert(0) += 1;
        }
        Ok(counts)
    }
}
