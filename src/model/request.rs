//! Request and response bodies of the client API.
//!
//! Field names are the concatenated lower case names wallets already send, so
//! every field is renamed explicitly.

use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use super::hash::TxHash;
use super::ticket::FeeStatus;

/// Header carrying the client's base64 signature over the raw request body.
pub const CLIENT_SIGNATURE_HEADER: &str = "VSP-Client-Signature";
/// Header carrying the server's base64 signature over the raw response body.
pub const SERVER_SIGNATURE_HEADER: &str = "VSP-Server-Signature";

/// Every ticket-scoped operation a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    FeeAddress,
    PayFee,
    SetVoteChoices,
    SetAltSignAddr,
    TicketStatus,
}

impl Action {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::FeeAddress => "feeaddress",
            Self::PayFee => "payfee",
            Self::SetVoteChoices => "setvotechoices",
            Self::SetAltSignAddr => "setaltsignaddr",
            Self::TicketStatus => "ticketstatus",
        }
    }

    /// Must the ticket already be registered with the service?
    /// Only the request that registers it may name an unknown ticket.
    pub const fn requires_known_ticket(self) -> bool {
        !matches!(self, Self::FeeAddress)
    }

    /// Is the replay check left to the handler, under the ticket lock?
    /// A fee payment for a ticket that is already paid is refused as such,
    /// whatever its timestamp.
    pub const fn checks_stamp_under_lock(self) -> bool {
        matches!(self, Self::PayFee)
    }

    /// Is this action refused while the service is closed?
    pub const fn blocked_when_closed(self) -> bool {
        matches!(self, Self::FeeAddress | Self::PayFee | Self::SetAltSignAddr)
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The newest accepted timestamp for one ticket and action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestStamp {
    pub ticket_hash: TxHash,
    pub action: Action,
    pub timestamp: i64,
}

/// A request as received: the untouched body bytes and the signature header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    pub body: Vec<u8>,
    pub signature: Option<String>,
}

impl ClientRequest {
    pub fn new(body: impl Into<Vec<u8>>, signature: Option<String>) -> Self {
        Self {
            body: body.into(),
            signature,
        }
    }
}

/// Fields common to every ticket-scoped body. Parsed before the signature is
/// checked, so it holds nothing that influences state.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub timestamp: i64,
    #[serde(rename = "tickethash")]
    pub ticket_hash: TxHash,
    /// Raw ticket purchase, sent when registering a ticket the node may not
    /// have seen yet.
    #[serde(rename = "tickethex", default)]
    pub ticket_hex: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PayFeeRequest {
    pub timestamp: i64,
    #[serde(rename = "tickethash")]
    pub ticket_hash: TxHash,
    #[serde(rename = "feetx")]
    pub fee_tx: String,
    #[serde(rename = "votechoices", default)]
    pub vote_choices: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetVoteChoicesRequest {
    pub timestamp: i64,
    #[serde(rename = "tickethash")]
    pub ticket_hash: TxHash,
    #[serde(rename = "votechoices")]
    pub vote_choices: HashMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SetAltSignAddrRequest {
    pub timestamp: i64,
    #[serde(rename = "tickethash")]
    pub ticket_hash: TxHash,
    #[serde(rename = "altsignaddress")]
    pub alt_sign_address: String,
}

#[derive(Debug, Serialize)]
pub struct FeeAddressResponse {
    pub timestamp: i64,
    #[serde(rename = "feeaddress")]
    pub fee_address: String,
    #[serde(rename = "feeamount")]
    pub fee_amount: i64,
    pub expiration: i64,
    pub request: Box<RawValue>,
}

/// Response to requests whose only result is success.
#[derive(Debug, Serialize)]
pub struct AckResponse {
    pub timestamp: i64,
    pub request: Box<RawValue>,
}

#[derive(Debug, Serialize)]
pub struct TicketStatusResponse {
    pub timestamp: i64,
    #[serde(rename = "ticketconfirmed")]
    pub ticket_confirmed: bool,
    #[serde(rename = "feetxstatus")]
    pub fee_tx_status: FeeStatus,
    #[serde(rename = "feetxhash")]
    pub fee_tx_hash: String,
    #[serde(rename = "altsignaddress")]
    pub alt_sign_address: String,
    #[serde(rename = "votechoices")]
    pub vote_choices: HashMap<String, String>,
    pub request: Box<RawValue>,
}

#[derive(Debug, Serialize)]
pub struct VspInfoResponse {
    #[serde(rename = "apiversions")]
    pub api_versions: Vec<u32>,
    pub timestamp: i64,
    #[serde(rename = "pubkey")]
    pub pub_key: String,
    #[serde(rename = "feepercentage")]
    pub fee_percentage: f64,
    #[serde(rename = "vspclosed")]
    pub vsp_closed: bool,
    #[serde(rename = "vspclosedmsg")]
    pub vsp_closed_msg: String,
    pub network: String,
    /// Number of tickets in each fee status.
    pub tickets: BTreeMap<String, u64>,
}
