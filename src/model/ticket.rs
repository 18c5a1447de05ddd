use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use mongodb::bson::Bson;
use serde::{Deserialize, Serialize};

use super::hash::TxHash;

/// Where a ticket's fee payment is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeeStatus {
    /// Fee address issued, no payment yet.
    #[serde(rename = "none")]
    NoFee,
    /// A valid fee transaction is held but not yet broadcast.
    #[serde(rename = "received")]
    Received,
    #[serde(rename = "broadcast")]
    Broadcast,
    /// Fee transaction mined with enough depth.
    #[serde(rename = "confirmed")]
    Confirmed,
    /// The fee deadline passed before a fee was broadcast.
    #[serde(rename = "expired")]
    Expired,
    /// Broadcast was attempted and refused. Retried by background processing.
    #[serde(rename = "error")]
    BroadcastFailed,
    /// Broadcast was refused because the fee spends outputs the node does not
    /// know yet. Retried once those outputs are confirmed.
    #[serde(rename = "unknownoutputs")]
    UnknownOutputs,
}

impl FeeStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoFee => "none",
            Self::Received => "received",
            Self::Broadcast => "broadcast",
            Self::Confirmed => "confirmed",
            Self::Expired => "expired",
            Self::BroadcastFailed => "error",
            Self::UnknownOutputs => "unknownoutputs",
        }
    }

    /// Has a fee transaction been accepted for this ticket?
    pub const fn is_paid(self) -> bool {
        matches!(
            self,
            Self::Received
                | Self::Broadcast
                | Self::Confirmed
                | Self::BroadcastFailed
                | Self::UnknownOutputs
        )
    }

    /// Is `next` a legal successor of this status?
    pub const fn can_transition_to(self, next: Self) -> bool {
        use FeeStatus::*;
        matches!(
            (self, next),
            (NoFee, Received | Expired)
                | (Received, Broadcast | BroadcastFailed | UnknownOutputs | Expired)
                | (
                    BroadcastFailed | UnknownOutputs,
                    Broadcast | BroadcastFailed | UnknownOutputs
                )
                | (Broadcast, Confirmed)
        )
    }
}

impl Display for FeeStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<FeeStatus> for Bson {
    fn from(status: FeeStatus) -> Self {
        Bson::String(status.as_str().to_string())
    }
}

/// A voting ticket the service has issued a fee address for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    #[serde(rename = "_id")]
    pub hash: TxHash,
    /// Address the ticket purchase committed to. Its key signs requests until
    /// an alternate signing address is registered.
    pub commitment_address: String,
    /// Whether the ticket purchase is mined.
    pub confirmed: bool,
    /// Address the fee must be paid to.
    pub fee_address: String,
    /// Minimum fee, in atoms.
    pub fee_amount: i64,
    /// Unix time after which an unpaid fee is refused.
    pub fee_expiration: i64,
    pub fee_status: FeeStatus,
    pub fee_tx_hash: Option<TxHash>,
    pub fee_tx_hex: Option<String>,
    #[serde(default)]
    pub vote_choices: HashMap<String, String>,
}

impl Ticket {
    pub fn new(
        hash: TxHash,
        commitment_address: String,
        fee_address: String,
        fee_amount: i64,
        fee_expiration: i64,
    ) -> Self {
        Self {
            hash,
            commitment_address,
            confirmed: false,
            fee_address,
            fee_amount,
            fee_expiration,
            fee_status: FeeStatus::NoFee,
            fee_tx_hash: None,
            fee_tx_hex: None,
            vote_choices: HashMap::new(),
        }
    }

    pub fn fee_expired(&self, now: i64) -> bool {
        now > self.fee_expiration
    }
}
