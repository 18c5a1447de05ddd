use ed25519_dalek::VerifyingKey;
use log::{debug, error};

use super::{now, Services};
use crate::crypto::{decode_signature, verify};
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    address::Address,
    network::NetworkParams,
    request::{Action, ClientRequest, Envelope, RequestStamp},
    ticket::Ticket,
    tx::Transaction,
};
use crate::node::{NodeError, RawTransaction};
use crate::store::check_stamp;

/// Fail unless `stamp` is newer than the last one accepted for its ticket and
/// action. The store checks again when the stamp is recorded.
pub(crate) async fn ensure_fresh(services: &Services, stamp: &RequestStamp) -> Result<()> {
    let last = services
        .store
        .last_timestamp(&stamp.ticket_hash, stamp.action)
        .await?;
    check_stamp(stamp, last)?;
    Ok(())
}

/// Everything learned about a request while authenticating it.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub action: Action,
    /// The verified body, exactly as received.
    pub body: String,
    /// The client's signature header, exactly as received.
    pub signature: String,
    pub envelope: Envelope,
    /// The stored ticket. Only absent when registering a new ticket.
    pub ticket: Option<Ticket>,
    /// The ticket purchase, when registering a new ticket.
    pub ticket_tx: Option<TicketTx>,
    pub stamp: RequestStamp,
}

/// A ticket purchase being registered.
#[derive(Debug, Clone)]
pub struct TicketTx {
    pub raw: RawTransaction,
    pub tx: Transaction,
    /// The node did not know the ticket; it was supplied by the client and
    /// must be broadcast.
    pub needs_broadcast: bool,
}

/// Gatekeeper for every ticket-scoped request.
#[derive(Clone)]
pub struct Authenticator {
    services: Services,
}

impl Authenticator {
    pub(crate) fn new(services: Services) -> Self {
        Self { services }
    }

    /// Accept or reject a request before any business logic sees it.
    ///
    /// Checks, in order: the body parses, a signature is present and well
    /// formed, the ticket is known (unless `action` registers it), the
    /// signature is valid for the ticket's current signing key, the timestamp
    /// is not too far ahead, and it is newer than any accepted before for this
    /// ticket and action. Actions that [check the stamp under the ticket
    /// lock](Action::checks_stamp_under_lock) skip the last check here.
    pub async fn authenticate(
        &self,
        request: &ClientRequest,
        action: Action,
    ) -> Result<RequestContext> {
        let body = std::str::from_utf8(&request.body)
            .map_err(|_| Error::bad_request("request body is not valid utf-8"))?;
        let envelope: Envelope = serde_json::from_str(body)
            .map_err(|e| Error::bad_request(format!("invalid request body: {e}")))?;

        let encoded_signature = request
            .signature
            .as_deref()
            .ok_or(ErrorKind::NoClientSignature)?;
        let signature = decode_signature(encoded_signature)
            .map_err(|e| Error::bad_request(format!("invalid signature header: {e}")))?;

        let hash = envelope.ticket_hash;
        let ticket = self.services.store.ticket(&hash).await?;

        let (key, ticket_tx) = match &ticket {
            Some(ticket) => (self.signing_key(ticket).await?, None),
            None if action.requires_known_ticket() => {
                return Err(ErrorKind::UnknownTicket.into());
            }
            None => {
                let ticket_tx = self.ticket_tx(&envelope).await?;
                let key = commitment_key(&ticket_tx.tx, &self.services.settings.network)?;
                (key, Some(ticket_tx))
            }
        };

        if !verify(&key, &request.body, &signature) {
            return Err(ErrorKind::BadSignature.into());
        }

        let timestamp = envelope.timestamp;
        let max_skew = self.services.settings.max_clock_skew;
        if timestamp > now() + max_skew {
            return Err(Error::detail(
                ErrorKind::InvalidTimestamp,
                "timestamp is too far in the future",
            ));
        }
        let stamp = RequestStamp {
            ticket_hash: hash,
            action,
            timestamp,
        };
        if !action.checks_stamp_under_lock() {
            ensure_fresh(&self.services, &stamp).await?;
        }

        debug!("Authenticated {action} for ticket {hash}");
        Ok(RequestContext {
            action,
            body: body.to_string(),
            signature: encoded_signature.to_string(),
            envelope,
            ticket,
            ticket_tx,
            stamp,
        })
    }

    /// The key currently authorised to sign for a known ticket: the latest
    /// alternate signing address if one was registered, else the commitment
    /// address.
    async fn signing_key(&self, ticket: &Ticket) -> Result<VerifyingKey> {
        let history = self
            .services
            .store
            .alt_sign_addr_history(&ticket.hash)
            .await?;
        let address = match history.last() {
            Some(alt) => &alt.alt_sign_addr,
            None => &ticket.commitment_address,
        };
        // Stored addresses were validated on the way in.
        Address::decode(address, &self.services.settings.network)
            .and_then(|a| a.verifying_key())
            .map_err(|e| {
                error!(
                    "Stored signing address {address} for ticket {} is unusable: {e}",
                    ticket.hash
                );
                Error::from(ErrorKind::InternalError)
            })
    }

    /// Find the purchase of a ticket being registered: the node's copy, or
    /// failing that the one the client sent.
    async fn ticket_tx(&self, envelope: &Envelope) -> Result<TicketTx> {
        let hash = envelope.ticket_hash;
        let (raw, needs_broadcast) = match self.services.node.get_raw_transaction(&hash).await {
            Ok(raw) => (raw, false),
            Err(NodeError::NotFound(_)) => {
                let hex = envelope.ticket_hex.as_deref().ok_or_else(|| {
                    Error::detail(
                        ErrorKind::UnknownTicket,
                        "ticket not found by node and no tickethex provided",
                    )
                })?;
                let raw = RawTransaction {
                    hash,
                    hex: hex.to_string(),
                    confirmations: 0,
                };
                (raw, true)
            }
            Err(e) => return Err(e.into()),
        };

        let tx = raw.decode().map_err(|e| {
            Error::detail(ErrorKind::InvalidTicket, format!("cannot decode ticket: {e}"))
        })?;
        if tx.hash() != hash {
            return Err(Error::detail(
                ErrorKind::InvalidTicket,
                "ticket transaction does not match ticket hash",
            ));
        }
        if !tx.is_ticket() {
            return Err(ErrorKind::InvalidTicket.into());
        }
        Ok(TicketTx {
            raw,
            tx,
            needs_broadcast,
        })
    }
}

/// The key of the address a ticket purchase committed to.
fn commitment_key(tx: &Transaction, network: &NetworkParams) -> Result<VerifyingKey> {
    let address = tx.commitment_address().ok_or(ErrorKind::InvalidTicket)?;
    if address.prefix() != network.addr_prefix {
        return Err(Error::detail(
            ErrorKind::InvalidTicket,
            format!("commitment address is not a {} address", network.name),
        ));
    }
    address.verifying_key().map_err(|e| {
        Error::detail(
            ErrorKind::InvalidTicket,
            format!("commitment address is unusable: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use rocket::serde::json::serde_json::json;

    use crate::model::tx::TxType;
    use crate::testing::Harness;

    use super::*;

    #[vsp_test]
    async fn timestamps_must_increase(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let timestamp = harness.timestamp();
        let body = json!({ "timestamp": timestamp, "tickethash": ticket });
        let request = harness.wallet.request(&body);
        harness.vsp.ticket_status(&request).await.unwrap();
        let err = harness.vsp.ticket_status(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTimestamp, err.kind());

        // Each action keeps its own history.
        harness.vsp.fee_address(&request).await.unwrap();

        let ahead = now() + harness.settings.max_clock_skew + 60;
        let request = harness
            .wallet
            .request(&json!({ "timestamp": ahead, "tickethash": ticket }));
        let err = harness.vsp.ticket_status(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTimestamp, err.kind());
    }

    #[vsp_test]
    async fn ticket_must_be_registered(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        for action in [Action::PayFee, Action::SetVoteChoices, Action::TicketStatus] {
            let request = harness.request(&ticket, json!({}));
            let err = harness
                .vsp
                .auth
                .authenticate(&request, action)
                .await
                .unwrap_err();
            assert_eq!(ErrorKind::UnknownTicket, err.kind());
        }
    }

    #[vsp_test]
    async fn malformed_requests(harness: Harness) {
        let (ticket, _) = harness.ticket(5);

        let mut request = harness.request(&ticket, json!({}));
        request.signature = None;
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::NoClientSignature, err.kind());

        request.signature = Some("not base64!".to_string());
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::BadRequest, err.kind());

        let request = harness.wallet.request(&json!({ "tickethash": "00" }));
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::BadRequest, err.kind());
    }

    #[vsp_test]
    async fn tampered_body_fails_signature(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        let mut request = harness.request(&ticket, json!({}));
        // Whitespace is still a different message.
        request.body.push(b' ');
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::BadSignature, err.kind());
    }

    #[vsp_test]
    async fn supplied_ticket_must_match(harness: Harness) {
        let tx = harness.wallet.buy_ticket();
        let other = harness.wallet.buy_ticket();

        let request = harness.request(&tx.hash(), json!({ "tickethex": other.to_hex() }));
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTicket, err.kind());

        let mut regular = harness.wallet.buy_ticket();
        regular.tx_type = TxType::Regular;
        let request = harness.request(&regular.hash(), json!({ "tickethex": regular.to_hex() }));
        let err = harness.vsp.fee_address(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTicket, err.kind());

        assert!(harness.node.broadcasts().is_empty());
    }
}
