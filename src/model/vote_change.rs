use serde::{Deserialize, Serialize};

use super::hash::TxHash;

/// Audit record of one accepted vote choice update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteChangeRecord {
    pub ticket_hash: TxHash,
    pub request: String,
    pub request_sig: String,
    pub response: String,
    pub response_sig: String,
}
