//! The blockchain node the service consults for chain facts.

use thiserror::Error;

use crate::model::{
    hash::TxHash,
    network::NetworkParams,
    tx::{Transaction, TxError},
};

mod rpc;

pub use self::rpc::RpcNode;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transaction not found: {0}")]
    NotFound(String),
    /// The transaction spends outputs the node has not seen. Recoverable once
    /// the transactions creating them are mined.
    #[error("transaction references unknown outputs: {0}")]
    UnknownOutputs(String),
    #[error("node rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("could not reach node: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed node response: {0}")]
    Malformed(String),
}

/// A transaction as the node reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawTransaction {
    pub hash: TxHash,
    pub hex: String,
    /// Zero while unmined.
    pub confirmations: i64,
}

impl RawTransaction {
    pub fn decode(&self) -> Result<Transaction, TxError> {
        Transaction::from_hex(&self.hex)
    }
}

#[rocket::async_trait]
pub trait Node: Send + Sync {
    async fn get_raw_transaction(&self, hash: &TxHash) -> Result<RawTransaction, NodeError>;

    /// Is the ticket currently in the live ticket pool?
    async fn exists_live_ticket(&self, hash: &TxHash) -> Result<bool, NodeError>;

    /// Submit a hex-encoded transaction to the network. Resubmitting a
    /// transaction the node already holds succeeds.
    async fn broadcast_transaction(&self, hex: &str) -> Result<(), NodeError>;

    /// Can this ticket still vote, now or in future?
    ///
    /// Tickets past maturity plus expiry are too old. Immature tickets will
    /// be able to. Mature ones can iff they are live.
    async fn can_ticket_vote(
        &self,
        ticket: &RawTransaction,
        params: &NetworkParams,
    ) -> Result<bool, NodeError> {
        if ticket.confirmations > params.max_ticket_confirmations() {
            return Ok(false);
        }
        if ticket.confirmations <= i64::from(params.ticket_maturity) {
            return Ok(true);
        }
        self.exists_live_ticket(&ticket.hash).await
    }
}
