//! Durable ticket state.
//!
//! Every mutation is a single atomic operation keyed by ticket hash. Mutations
//! that answer a signed request also take that request's [`RequestStamp`]; the
//! store refuses the whole write unless the stamp is strictly newer than the
//! last one recorded for the same ticket and action, and records it in the
//! same transaction as the business state.

use std::collections::HashMap;

use thiserror::Error;

use crate::model::{
    alt_sign_addr::AltSignAddrData,
    hash::TxHash,
    request::{Action, RequestStamp},
    ticket::{FeeStatus, Ticket},
    vote_change::VoteChangeRecord,
};

mod memory;
mod mongo;

pub use self::memory::MemoryStore;
pub use self::mongo::MongoStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("ticket {0} already exists")]
    TicketExists(TxHash),
    #[error("ticket {0} not found")]
    TicketNotFound(TxHash),
    /// The ticket changed since it was read; a compare-and-set lost.
    #[error("ticket {hash} is no longer in fee status '{expected}'")]
    Conflict { hash: TxHash, expected: FeeStatus },
    #[error("alternate signing address history for ticket {0} is full")]
    HistoryFull(TxHash),
    #[error("timestamp {timestamp} for {action} on ticket {hash} is not newer than {last}")]
    StaleTimestamp {
        hash: TxHash,
        action: Action,
        timestamp: i64,
        last: i64,
    },
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Db(#[from] mongodb::error::Error),
}

#[rocket::async_trait]
pub trait TicketStore: Send + Sync {
    async fn ticket(&self, hash: &TxHash) -> Result<Option<Ticket>, StoreError>;

    /// Insert a new ticket. Fails with [`StoreError::TicketExists`] if present.
    async fn insert_ticket(
        &self,
        ticket: &Ticket,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError>;

    /// Replace a ticket, provided its stored fee status is still `expected`.
    async fn update_ticket(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError>;

    /// Replace a ticket's vote choices and append an audit record, pruning the
    /// oldest records beyond `max_records`.
    async fn set_vote_choices(
        &self,
        ticket: &Ticket,
        expected: FeeStatus,
        record: &VoteChangeRecord,
        max_records: usize,
        stamp: &RequestStamp,
    ) -> Result<(), StoreError>;

    /// Vote change records for a ticket, oldest first.
    async fn vote_changes(&self, hash: &TxHash) -> Result<Vec<VoteChangeRecord>, StoreError>;

    /// Alternate signing address records for a ticket, oldest first. The last
    /// one is current.
    async fn alt_sign_addr_history(
        &self,
        hash: &TxHash,
    ) -> Result<Vec<AltSignAddrData>, StoreError>;

    /// Append an alternate signing address record. Fails with
    /// [`StoreError::HistoryFull`] once `max_records` exist.
    async fn insert_alt_sign_addr(
        &self,
        data: &AltSignAddrData,
        max_records: usize,
        stamp: Option<&RequestStamp>,
    ) -> Result<(), StoreError>;

    /// The newest accepted timestamp for a ticket and action.
    async fn last_timestamp(&self, hash: &TxHash, action: Action)
        -> Result<Option<i64>, StoreError>;

    /// Record a stamp for a request that changes nothing else.
    async fn record_timestamp(&self, stamp: &RequestStamp) -> Result<(), StoreError>;

    async fn tickets_with_status(&self, statuses: &[FeeStatus])
        -> Result<Vec<Ticket>, StoreError>;

    async fn count_by_status(&self) -> Result<HashMap<FeeStatus, u64>, StoreError>;
}

/// Check `stamp` against the last recorded timestamp for its ticket and action.
pub(crate) fn check_stamp(stamp: &RequestStamp, last: Option<i64>) -> Result<(), StoreError> {
    match last {
        Some(last) if stamp.timestamp <= last => Err(StoreError::StaleTimestamp {
            hash: stamp.ticket_hash,
            action: stamp.action,
            timestamp: stamp.timestamp,
            last,
        }),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stamps_must_strictly_increase() {
        let stamp = RequestStamp {
            ticket_hash: TxHash::of(b"t"),
            action: Action::PayFee,
            timestamp: 10,
        };
        assert!(check_stamp(&stamp, None).is_ok());
        assert!(check_stamp(&stamp, Some(9)).is_ok());
        assert!(matches!(
            check_stamp(&stamp, Some(10)),
            Err(StoreError::StaleTimestamp { last: 10, .. })
        ));
        assert!(check_stamp(&stamp, Some(11)).is_err());
    }
}
