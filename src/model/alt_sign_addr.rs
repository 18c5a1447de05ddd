use serde::{Deserialize, Serialize};

use super::hash::TxHash;

/// One accepted change of a ticket's signing address.
///
/// The exact request and response bodies are kept together with both
/// signatures, so the exchange that authorised the change can be shown
/// verbatim later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AltSignAddrData {
    pub ticket_hash: TxHash,
    pub alt_sign_addr: String,
    pub req: String,
    pub req_sig: String,
    pub resp: String,
    pub resp_sig: String,
}
