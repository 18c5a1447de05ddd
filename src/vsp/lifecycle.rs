use log::{debug, error, info, warn};

use super::auth::ensure_fresh;
use super::{now, RequestContext, Services};
use crate::crypto::SignedResponse;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    address::Address,
    hash::TxHash,
    request::{
        AckResponse, FeeAddressResponse, PayFeeRequest, SetVoteChoicesRequest,
        TicketStatusResponse,
    },
    ticket::{FeeStatus, Ticket},
    tx::Transaction,
    vote_change::VoteChangeRecord,
};
use crate::node::{NodeError, RawTransaction};
use crate::store::StoreError;

/// Counts of what one background pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeeReport {
    pub expired: usize,
    pub broadcast: usize,
    pub failed: usize,
    pub confirmed: usize,
}

/// The ticket fee state machine.
///
/// Every transition re-reads the ticket under its lock and writes it back
/// with a compare-and-set on the fee status it was read in.
#[derive(Clone)]
pub struct Lifecycle {
    services: Services,
}

fn echo(ctx: &RequestContext) -> Result<Box<serde_json::value::RawValue>> {
    serde_json::value::RawValue::from_string(ctx.body.clone())
        .map_err(|e| Error::bad_request(format!("invalid request body: {e}")))
}

fn parse<'a, T: serde::Deserialize<'a>>(ctx: &'a RequestContext) -> Result<T> {
    serde_json::from_str(&ctx.body)
        .map_err(|e| Error::bad_request(format!("invalid {} request: {e}", ctx.action)))
}

/// Move a ticket to `next`, refusing edges the fee lifecycle does not have.
fn advance(ticket: &mut Ticket, next: FeeStatus) -> Result<()> {
    if !ticket.fee_status.can_transition_to(next) {
        error!(
            "Refusing fee status change {} -> {next} for ticket {}",
            ticket.fee_status, ticket.hash
        );
        return Err(ErrorKind::InternalError.into());
    }
    ticket.fee_status = next;
    Ok(())
}

impl Lifecycle {
    pub(crate) fn new(services: Services) -> Self {
        Self { services }
    }

    /// Fail unless the ticket can vote now or in future.
    pub(crate) async fn ensure_can_vote(&self, raw: &RawTransaction) -> Result<()> {
        let network = &self.services.settings.network;
        if !self.services.node.can_ticket_vote(raw, network).await? {
            return Err(ErrorKind::TicketCannotVote.into());
        }
        Ok(())
    }

    /// Eligibility check for a ticket the store already knows.
    pub(crate) async fn ensure_known_can_vote(&self, hash: &TxHash) -> Result<()> {
        let raw = self.services.node.get_raw_transaction(hash).await?;
        self.ensure_can_vote(&raw).await
    }

    /// Re-read a ticket after taking its lock.
    async fn reload(&self, hash: &TxHash) -> Result<Ticket> {
        self.services
            .store
            .ticket(hash)
            .await?
            .ok_or_else(|| ErrorKind::UnknownTicket.into())
    }

    fn fee_response(&self, ctx: &RequestContext, ticket: &Ticket) -> Result<SignedResponse> {
        self.services.sign(&FeeAddressResponse {
            timestamp: now(),
            fee_address: ticket.fee_address.clone(),
            fee_amount: ticket.fee_amount,
            expiration: ticket.fee_expiration,
            request: echo(ctx)?,
        })
    }

    fn ack(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        self.services.sign(&AckResponse {
            timestamp: now(),
            request: echo(ctx)?,
        })
    }

    /// Register a new ticket and issue its fee details, or repeat them for a
    /// ticket already registered.
    pub async fn register_ticket(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        let settings = &self.services.settings;
        let hash = ctx.stamp.ticket_hash;

        let Some(ticket_tx) = &ctx.ticket_tx else {
            // Already registered.
            self.ensure_known_can_vote(&hash).await?;
            let _guard = self.services.locks.lock(&hash).await;
            let mut ticket = self.reload(&hash).await?;
            let now = now();
            if ticket.fee_status == FeeStatus::NoFee && ticket.fee_expired(now) {
                ticket.fee_expiration = now + settings.fee_expiry;
                self.services
                    .store
                    .update_ticket(&ticket, FeeStatus::NoFee, Some(&ctx.stamp))
                    .await?;
                info!("Renewed fee expiry for ticket {hash}");
            } else {
                self.services.store.record_timestamp(&ctx.stamp).await?;
            }
            return self.fee_response(ctx, &ticket);
        };

        if ticket_tx.needs_broadcast {
            if let Err(e) = self
                .services
                .node
                .broadcast_transaction(&ticket_tx.raw.hex)
                .await
            {
                error!("Failed to broadcast ticket {hash}: {e}");
                return Err(ErrorKind::CannotBroadcastTicket.into());
            }
            info!("Broadcast ticket {hash} on behalf of client");
        }
        self.ensure_can_vote(&ticket_tx.raw).await?;

        let (Some(price), Some(commitment)) = (
            ticket_tx.tx.ticket_price(),
            ticket_tx.tx.commitment_address(),
        ) else {
            return Err(ErrorKind::InvalidTicket.into());
        };
        let mut ticket = Ticket::new(
            hash,
            commitment.to_string(),
            settings.fee_address.to_string(),
            settings.network.vsp_fee(price, settings.fee_percent),
            now() + settings.fee_expiry,
        );
        ticket.confirmed = ticket_tx.raw.confirmations > 0;

        let _guard = self.services.locks.lock(&hash).await;
        match self.services.store.insert_ticket(&ticket, Some(&ctx.stamp)).await {
            Ok(()) => {
                info!("Registered ticket {hash}, fee {} atoms", ticket.fee_amount);
                self.fee_response(ctx, &ticket)
            }
            // Registered by another process between authentication and now.
            Err(StoreError::TicketExists(_)) => {
                let existing = self.reload(&hash).await?;
                self.services.store.record_timestamp(&ctx.stamp).await?;
                self.fee_response(ctx, &existing)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Accept a fee payment for a registered ticket.
    ///
    /// Repeating the payment that was already accepted succeeds without
    /// changing anything. Any other payment for a paid ticket is refused with
    /// [`ErrorKind::FeeAlreadyReceived`], even if its timestamp is stale.
    pub async fn pay_fee(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        let request: PayFeeRequest = parse(ctx)?;
        let hash = ctx.stamp.ticket_hash;
        let fee_tx = Transaction::from_hex(&request.fee_tx).map_err(|e| {
            Error::detail(ErrorKind::InvalidFeeTx, format!("cannot decode fee tx: {e}"))
        })?;
        let fee_hash = fee_tx.hash();
        self.services
            .settings
            .network
            .validate_vote_choices(&request.vote_choices)?;

        self.ensure_known_can_vote(&hash).await?;

        let _guard = self.services.locks.lock(&hash).await;
        let ticket = self.reload(&hash).await?;

        if ticket.fee_status.is_paid() {
            if ticket.fee_tx_hash == Some(fee_hash) {
                debug!("Fee tx {fee_hash} for ticket {hash} already accepted");
                self.services.store.record_timestamp(&ctx.stamp).await?;
                return self.ack(ctx);
            }
            return Err(ErrorKind::FeeAlreadyReceived.into());
        }
        ensure_fresh(&self.services, &ctx.stamp).await?;
        if ticket.fee_status == FeeStatus::Expired || ticket.fee_expired(now()) {
            return Err(ErrorKind::FeeExpired.into());
        }

        let fee_address = Address::decode(&ticket.fee_address, &self.services.settings.network)
            .map_err(|e| {
                error!("Stored fee address for ticket {hash} is unusable: {e}");
                Error::from(ErrorKind::InternalError)
            })?;
        let paid = match fee_tx.amount_paid_to(&fee_address) {
            Some(paid) if paid > 0 => paid,
            Some(_) => {
                return Err(Error::detail(
                    ErrorKind::InvalidFeeTx,
                    "fee tx does not pay the fee address",
                ))
            }
            None => {
                return Err(Error::detail(
                    ErrorKind::InvalidFeeTx,
                    "fee tx output values overflow",
                ))
            }
        };
        if paid < ticket.fee_amount {
            return Err(Error::detail(
                ErrorKind::FeeTooSmall,
                format!("fee too small: paid {paid} atoms, need {}", ticket.fee_amount),
            ));
        }

        let expected = ticket.fee_status;
        let mut updated = ticket;
        advance(&mut updated, FeeStatus::Received)?;
        updated.fee_tx_hash = Some(fee_hash);
        updated.fee_tx_hex = Some(request.fee_tx);
        updated.vote_choices.extend(request.vote_choices);
        match self
            .services
            .store
            .update_ticket(&updated, expected, Some(&ctx.stamp))
            .await
        {
            Ok(()) => {}
            Err(StoreError::Conflict { .. }) => return Err(ErrorKind::FeeAlreadyReceived.into()),
            Err(e) => return Err(e.into()),
        }
        info!("Fee tx {fee_hash} received for ticket {hash}");
        self.ack(ctx)
    }

    /// Update the vote choices of a ticket whose fee has been received.
    ///
    /// Choices are merged into the stored ones: agendas not named keep their
    /// previous choice.
    pub async fn set_vote_choices(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        let request: SetVoteChoicesRequest = parse(ctx)?;
        let hash = ctx.stamp.ticket_hash;
        let settings = &self.services.settings;
        settings.network.validate_vote_choices(&request.vote_choices)?;

        self.ensure_known_can_vote(&hash).await?;

        let _guard = self.services.locks.lock(&hash).await;
        let ticket = self.reload(&hash).await?;
        if !ticket.fee_status.is_paid() {
            return Err(ErrorKind::FeeNotReceived.into());
        }

        let response = self.ack(ctx)?;
        let record = VoteChangeRecord {
            ticket_hash: hash,
            request: ctx.body.clone(),
            request_sig: ctx.signature.clone(),
            response: response.body_str().to_string(),
            response_sig: response.signature.clone(),
        };
        let expected = ticket.fee_status;
        let mut updated = ticket;
        updated.vote_choices.extend(request.vote_choices);
        self.services
            .store
            .set_vote_choices(
                &updated,
                expected,
                &record,
                settings.max_vote_change_records,
                &ctx.stamp,
            )
            .await?;
        info!("Vote choices updated for ticket {hash}");
        Ok(response)
    }

    pub async fn ticket_status(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        let hash = ctx.stamp.ticket_hash;
        let ticket = self.reload(&hash).await?;
        let alt_sign_address = self
            .services
            .store
            .alt_sign_addr_history(&hash)
            .await?
            .pop()
            .map(|data| data.alt_sign_addr)
            .unwrap_or_default();
        self.services.store.record_timestamp(&ctx.stamp).await?;
        self.services.sign(&TicketStatusResponse {
            timestamp: now(),
            ticket_confirmed: ticket.confirmed,
            fee_tx_status: ticket.fee_status,
            fee_tx_hash: ticket
                .fee_tx_hash
                .map(|h| h.to_string())
                .unwrap_or_default(),
            alt_sign_address,
            vote_choices: ticket.vote_choices,
            request: echo(ctx)?,
        })
    }

    /// Broadcast a ticket's received fee and record the outcome.
    ///
    /// Unknown inputs leave the ticket in [`FeeStatus::UnknownOutputs`] and
    /// fail with [`ErrorKind::CannotBroadcastFeeUnknownOutputs`]; any other
    /// refusal leaves it in [`FeeStatus::BroadcastFailed`] and fails with
    /// [`ErrorKind::CannotBroadcastFee`]. Tickets with nothing to broadcast
    /// are left alone.
    pub async fn broadcast_fee(&self, hash: &TxHash) -> Result<()> {
        let _guard = self.services.locks.lock(hash).await;
        let ticket = self.reload(hash).await?;
        let expected = ticket.fee_status;
        if !matches!(
            expected,
            FeeStatus::Received | FeeStatus::BroadcastFailed | FeeStatus::UnknownOutputs
        ) {
            return Ok(());
        }
        let Some(fee_tx_hex) = ticket.fee_tx_hex.clone() else {
            error!("Ticket {hash} is in fee status {expected} without a fee tx");
            return Err(ErrorKind::InternalError.into());
        };

        let (next, outcome) = match self.services.node.broadcast_transaction(&fee_tx_hex).await {
            Ok(()) => (FeeStatus::Broadcast, Ok(())),
            Err(NodeError::UnknownOutputs(msg)) => {
                warn!("Fee tx for ticket {hash} spends unknown outputs: {msg}");
                (
                    FeeStatus::UnknownOutputs,
                    Err(ErrorKind::CannotBroadcastFeeUnknownOutputs.into()),
                )
            }
            Err(e) => {
                error!("Failed to broadcast fee tx for ticket {hash}: {e}");
                (
                    FeeStatus::BroadcastFailed,
                    Err(ErrorKind::CannotBroadcastFee.into()),
                )
            }
        };
        if next != expected {
            let mut updated = ticket;
            advance(&mut updated, next)?;
            self.services
                .store
                .update_ticket(&updated, expected, None)
                .await?;
        }
        if next == FeeStatus::Broadcast {
            info!("Fee tx for ticket {hash} broadcast");
        }
        outcome
    }

    /// One pass over every ticket with fee work outstanding. Failures on one
    /// ticket are logged and left for the next pass.
    pub async fn process_fees(&self) -> Result<FeeReport> {
        let mut report = FeeReport::default();
        let store = &self.services.store;

        // Unpaid fees past their deadline.
        for ticket in store.tickets_with_status(&[FeeStatus::NoFee]).await? {
            if ticket.fee_expired(now()) {
                self.tally_expiry(&ticket.hash, FeeStatus::NoFee, &mut report)
                    .await;
            }
        }

        // Received fees for tickets that can no longer vote are not worth
        // broadcasting; the rest are broadcast, as are earlier failures.
        let pending = store
            .tickets_with_status(&[FeeStatus::Received, FeeStatus::BroadcastFailed])
            .await?;
        for ticket in pending {
            if ticket.fee_status == FeeStatus::Received {
                match self.ensure_known_can_vote(&ticket.hash).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::TicketCannotVote => {
                        self.tally_expiry(&ticket.hash, FeeStatus::Received, &mut report)
                            .await;
                        continue;
                    }
                    Err(e) => {
                        warn!("Cannot check eligibility of ticket {}: {e}", ticket.hash);
                        continue;
                    }
                }
            }
            self.tally(self.broadcast_fee(&ticket.hash).await, &mut report);
        }

        // Unknown outputs are retried once every input's transaction is mined.
        for ticket in store.tickets_with_status(&[FeeStatus::UnknownOutputs]).await? {
            if self.inputs_confirmed(&ticket).await {
                self.tally(self.broadcast_fee(&ticket.hash).await, &mut report);
            }
        }

        // Broadcast fees with enough confirmations.
        for ticket in store.tickets_with_status(&[FeeStatus::Broadcast]).await? {
            match self.confirm_fee(&ticket).await {
                Ok(true) => report.confirmed += 1,
                Ok(false) => {}
                Err(e) => warn!("Cannot confirm fee for ticket {}: {e}", ticket.hash),
            }
        }

        // Ticket purchases that have been mined since registration.
        let live = store
            .tickets_with_status(&[
                FeeStatus::NoFee,
                FeeStatus::Received,
                FeeStatus::Broadcast,
                FeeStatus::Confirmed,
                FeeStatus::BroadcastFailed,
                FeeStatus::UnknownOutputs,
            ])
            .await?;
        for ticket in live.into_iter().filter(|t| !t.confirmed) {
            if let Err(e) = self.confirm_ticket(&ticket.hash).await {
                warn!("Cannot refresh confirmation of ticket {}: {e}", ticket.hash);
            }
        }

        if report != FeeReport::default() {
            info!("Fee processing: {report:?}");
        }
        Ok(report)
    }

    fn tally(&self, outcome: Result<()>, report: &mut FeeReport) {
        match outcome {
            Ok(()) => report.broadcast += 1,
            Err(_) => report.failed += 1,
        }
    }

    async fn tally_expiry(&self, hash: &TxHash, from: FeeStatus, report: &mut FeeReport) {
        match self.expire(hash, from).await {
            Ok(true) => report.expired += 1,
            Ok(false) => {}
            Err(e) => warn!("Cannot expire fee for ticket {hash}: {e}"),
        }
    }

    /// Move a ticket to [`FeeStatus::Expired`] if it is still in `from`.
    async fn expire(&self, hash: &TxHash, from: FeeStatus) -> Result<bool> {
        let _guard = self.services.locks.lock(hash).await;
        let mut ticket = self.reload(hash).await?;
        if ticket.fee_status != from {
            return Ok(false);
        }
        advance(&mut ticket, FeeStatus::Expired)?;
        self.services.store.update_ticket(&ticket, from, None).await?;
        info!("Fee for ticket {hash} expired");
        Ok(true)
    }

    async fn inputs_confirmed(&self, ticket: &Ticket) -> bool {
        let Some(tx) = ticket
            .fee_tx_hex
            .as_deref()
            .and_then(|hex| Transaction::from_hex(hex).ok())
        else {
            return false;
        };
        for input in &tx.inputs {
            match self.services.node.get_raw_transaction(&input.prev_hash).await {
                Ok(raw) if raw.confirmations > 0 => {}
                Ok(_) | Err(NodeError::NotFound(_)) => return false,
                Err(e) => {
                    warn!("Cannot look up fee input {}: {e}", input.prev_hash);
                    return false;
                }
            }
        }
        true
    }

    async fn confirm_fee(&self, ticket: &Ticket) -> Result<bool> {
        let Some(fee_hash) = ticket.fee_tx_hash else {
            return Ok(false);
        };
        let raw = self.services.node.get_raw_transaction(&fee_hash).await?;
        if raw.confirmations < self.services.settings.required_confirmations {
            return Ok(false);
        }
        let _guard = self.services.locks.lock(&ticket.hash).await;
        let mut current = self.reload(&ticket.hash).await?;
        if current.fee_status != FeeStatus::Broadcast {
            return Ok(false);
        }
        advance(&mut current, FeeStatus::Confirmed)?;
        self.services
            .store
            .update_ticket(&current, FeeStatus::Broadcast, None)
            .await?;
        info!("Fee for ticket {} confirmed", ticket.hash);
        Ok(true)
    }

    async fn confirm_ticket(&self, hash: &TxHash) -> Result<()> {
        let raw = self.services.node.get_raw_transaction(hash).await?;
        if raw.confirmations == 0 {
            return Ok(());
        }
        let _guard = self.services.locks.lock(hash).await;
        let mut ticket = self.reload(hash).await?;
        if ticket.confirmed {
            return Ok(());
        }
        let status = ticket.fee_status;
        ticket.confirmed = true;
        self.services.store.update_ticket(&ticket, status, None).await?;
        debug!("Ticket {hash} confirmed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rocket::serde::json::serde_json::json;
    use rocket::tokio::{spawn, time::sleep};

    use crate::model::tx::TxOutput;
    use crate::store::TicketStore;
    use crate::testing::{BroadcastFailure, Harness};

    use super::*;

    async fn stored(harness: &Harness, hash: &TxHash) -> Ticket {
        harness.store.ticket(hash).await.unwrap().unwrap()
    }

    async fn expire_fee_window(harness: &Harness, hash: &TxHash) {
        let mut ticket = stored(harness, hash).await;
        ticket.fee_expiration = now() - 1;
        harness
            .store
            .update_ticket(&ticket, FeeStatus::NoFee, None)
            .await
            .unwrap();
    }

    #[vsp_test]
    async fn registration_issues_fee(harness: Harness) {
        let (ticket, _) = harness.ticket(0);
        harness.register(&ticket).await;

        let current = stored(&harness, &ticket).await;
        assert_eq!(FeeStatus::NoFee, current.fee_status);
        assert_eq!(harness.fee_amount(), current.fee_amount);
        assert_eq!(harness.wallet.address().to_string(), current.commitment_address);
        assert!(!current.confirmed);
        assert!(current.fee_expiration > now());
    }

    #[vsp_test]
    async fn unknown_ticket_is_broadcast_from_hex(harness: Harness) {
        let tx = harness.wallet.buy_ticket();
        let hash = tx.hash();

        // Neither the node nor the client has it.
        let err = harness
            .vsp
            .fee_address(&harness.request(&hash, json!({})))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::UnknownTicket, err.kind());

        let request = harness.request(&hash, json!({ "tickethex": tx.to_hex() }));
        harness.vsp.fee_address(&request).await.unwrap();
        assert_eq!(vec![hash], harness.node.broadcasts());
        assert_eq!(FeeStatus::NoFee, stored(&harness, &hash).await.fee_status);
    }

    #[vsp_test]
    async fn ineligible_tickets_are_refused(harness: Harness) {
        // Too old.
        let (old, _) = harness.ticket(500);
        let err = harness
            .vsp
            .fee_address(&harness.request(&old, json!({})))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::TicketCannotVote, err.kind());

        // Mature but already voted or revoked.
        let (spent, _) = harness.ticket(20);
        harness.node.set_live(&spent, false);
        let err = harness
            .vsp
            .fee_address(&harness.request(&spent, json!({})))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::TicketCannotVote, err.kind());

        assert!(harness.store.ticket(&old).await.unwrap().is_none());
        assert!(harness.store.ticket(&spent).await.unwrap().is_none());
    }

    #[vsp_test]
    async fn fee_payment_is_idempotent(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        let fee_tx = harness.register_and_pay(&ticket).await;

        // The same payment again is accepted without change.
        let request = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        harness.vsp.pay_fee(&request).await.unwrap();
        let current = stored(&harness, &ticket).await;
        assert_eq!(FeeStatus::Received, current.fee_status);
        assert_eq!(Some(fee_tx.hash()), current.fee_tx_hash);

        // A different payment is not.
        let other = harness.fee_tx(harness.fee_amount());
        let request = harness.request(&ticket, json!({ "feetx": other.to_hex() }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::FeeAlreadyReceived, err.kind());
        assert_eq!(Some(fee_tx.hash()), stored(&harness, &ticket).await.fee_tx_hash);
    }

    #[vsp_test]
    async fn concurrent_fee_payments_accept_one(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let first = harness.fee_tx(harness.fee_amount());
        let second = harness.fee_tx(harness.fee_amount());
        let a = harness.request(&ticket, json!({ "feetx": first.to_hex() }));
        let b = harness.request(&ticket, json!({ "feetx": second.to_hex() }));

        // Both requests are authenticated and queued on the ticket before
        // either may proceed.
        let guard = harness.vsp.services.locks.lock(&ticket).await;
        let vsp = harness.vsp.clone();
        let a = spawn(async move { vsp.pay_fee(&a).await });
        let vsp = harness.vsp.clone();
        let b = spawn(async move { vsp.pay_fee(&b).await });
        sleep(Duration::from_millis(50)).await;
        drop(guard);
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        let (winner, loser) = match (a, b) {
            (Ok(_), Err(e)) => (first.hash(), e),
            (Err(e), Ok(_)) => (second.hash(), e),
            other => panic!("expected exactly one payment to succeed: {other:?}"),
        };
        assert_eq!(ErrorKind::FeeAlreadyReceived, loser.kind());
        assert_eq!(Some(winner), stored(&harness, &ticket).await.fee_tx_hash);
    }

    #[vsp_test]
    async fn older_conflicting_payment_is_already_received(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let first = harness.fee_tx(harness.fee_amount());
        let second = harness.fee_tx(harness.fee_amount());
        let older = harness.request(&ticket, json!({ "feetx": first.to_hex() }));
        let newer = harness.request(&ticket, json!({ "feetx": second.to_hex() }));

        harness.vsp.pay_fee(&newer).await.unwrap();
        let err = harness.vsp.pay_fee(&older).await.unwrap_err();
        assert_eq!(ErrorKind::FeeAlreadyReceived, err.kind());

        // Replaying the accepted payment is still caught by its timestamp.
        let err = harness.vsp.pay_fee(&newer).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTimestamp, err.kind());
        assert_eq!(Some(second.hash()), stored(&harness, &ticket).await.fee_tx_hash);
    }

    #[vsp_test]
    async fn refused_payments_record_no_timestamp(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let short = harness.fee_tx(harness.fee_amount() - 1);
        let older = harness.request(&ticket, json!({ "feetx": short.to_hex() }));
        let newer = harness.request(&ticket, json!({ "feetx": short.to_hex() }));
        let err = harness.vsp.pay_fee(&newer).await.unwrap_err();
        assert_eq!(ErrorKind::FeeTooSmall, err.kind());

        // Refused requests record nothing, so an older one is not a replay yet.
        let err = harness.vsp.pay_fee(&older).await.unwrap_err();
        assert_eq!(ErrorKind::FeeTooSmall, err.kind());

        let fee_tx = harness.fee_tx(harness.fee_amount());
        let stale = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        let accepted = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        harness.vsp.pay_fee(&accepted).await.unwrap();
        let err = harness.vsp.pay_fee(&stale).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidTimestamp, err.kind());
    }

    #[vsp_test]
    async fn overflowing_fee_outputs_are_invalid(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let mut fee_tx = harness.fee_tx(1);
        fee_tx.outputs = vec![
            TxOutput {
                value: i64::MAX,
                address: harness.settings.fee_address,
            };
            3
        ];
        let request = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidFeeTx, err.kind());
        assert_eq!(FeeStatus::NoFee, stored(&harness, &ticket).await.fee_status);
    }

    #[vsp_test]
    async fn fee_must_cover_amount(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let short = harness.fee_tx(harness.fee_amount() - 1);
        let request = harness.request(&ticket, json!({ "feetx": short.to_hex() }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::FeeTooSmall, err.kind());

        let elsewhere = harness
            .wallet
            .pay(&harness.wallet.address(), harness.fee_amount());
        let request = harness.request(&ticket, json!({ "feetx": elsewhere.to_hex() }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidFeeTx, err.kind());

        let request = harness.request(&ticket, json!({ "feetx": "zz" }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidFeeTx, err.kind());

        assert_eq!(FeeStatus::NoFee, stored(&harness, &ticket).await.fee_status);
    }

    #[vsp_test]
    async fn expired_fee_is_renewed_on_request(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;
        expire_fee_window(&harness, &ticket).await;

        let fee_tx = harness.fee_tx(harness.fee_amount());
        let request = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        let err = harness.vsp.pay_fee(&request).await.unwrap_err();
        assert_eq!(ErrorKind::FeeExpired, err.kind());

        // Asking for the fee address again opens a new window.
        harness.register(&ticket).await;
        assert!(stored(&harness, &ticket).await.fee_expiration > now());
        let request = harness.request(&ticket, json!({ "feetx": fee_tx.to_hex() }));
        harness.vsp.pay_fee(&request).await.unwrap();
    }

    #[vsp_test]
    async fn vote_choices_are_validated(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;
        let fee_tx = harness.fee_tx(harness.fee_amount());

        for choices in [json!({ "treasury": "maybe" }), json!({ "nosuchagenda": "yes" })] {
            let request = harness.request(
                &ticket,
                json!({ "feetx": fee_tx.to_hex(), "votechoices": choices }),
            );
            let err = harness.vsp.pay_fee(&request).await.unwrap_err();
            assert_eq!(ErrorKind::InvalidVoteChoices, err.kind());
        }
    }

    #[vsp_test]
    async fn vote_choices_need_fee_and_are_audited(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register(&ticket).await;

        let choices = json!({ "votechoices": { "treasury": "no" } });
        let err = harness
            .vsp
            .set_vote_choices(&harness.request(&ticket, choices.clone()))
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::FeeNotReceived, err.kind());

        let fee_tx = harness.fee_tx(harness.fee_amount());
        let request = harness.request(
            &ticket,
            json!({ "feetx": fee_tx.to_hex(), "votechoices": { "maxblocksize": "yes" } }),
        );
        harness.vsp.pay_fee(&request).await.unwrap();

        // Choices merge into what was set with the fee.
        let request = harness.request(&ticket, choices.clone());
        let response = harness.vsp.set_vote_choices(&request).await.unwrap();
        let choices_now = stored(&harness, &ticket).await.vote_choices;
        assert_eq!(Some("no"), choices_now.get("treasury").map(String::as_str));
        assert_eq!(Some("yes"), choices_now.get("maxblocksize").map(String::as_str));

        // Each change is kept verbatim, up to the configured number.
        let changes = harness.store.vote_changes(&ticket).await.unwrap();
        assert_eq!(1, changes.len());
        assert_eq!(request.body, changes[0].request.as_bytes());
        assert_eq!(request.signature.as_deref(), Some(changes[0].request_sig.as_str()));
        assert_eq!(response.signature, changes[0].response_sig);
        for _ in 0..5 {
            let request = harness.request(&ticket, choices.clone());
            harness.vsp.set_vote_choices(&request).await.unwrap();
        }
        let changes = harness.store.vote_changes(&ticket).await.unwrap();
        assert_eq!(harness.settings.max_vote_change_records, changes.len());

        // Unknown agendas leave the stored choices alone.
        let before = stored(&harness, &ticket).await.vote_choices;
        let choices = json!({ "votechoices": { "nosuchagenda": "yes" } });
        let request = harness.request(&ticket, choices);
        let err = harness.vsp.set_vote_choices(&request).await.unwrap_err();
        assert_eq!(ErrorKind::InvalidVoteChoices, err.kind());
        assert_eq!(before, stored(&harness, &ticket).await.vote_choices);
    }

    #[vsp_test]
    async fn broadcast_failures_are_classified(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        let fee_tx = harness.register_and_pay(&ticket).await;

        harness
            .node
            .fail_broadcasts(Some(BroadcastFailure::UnknownOutputs));
        let err = harness.vsp.broadcast_fee(&ticket).await.unwrap_err();
        assert_eq!(ErrorKind::CannotBroadcastFeeUnknownOutputs, err.kind());
        assert_eq!(428, err.kind().status().code);
        assert_eq!(FeeStatus::UnknownOutputs, stored(&harness, &ticket).await.fee_status);

        harness.node.fail_broadcasts(Some(BroadcastFailure::Rejected));
        let err = harness.vsp.broadcast_fee(&ticket).await.unwrap_err();
        assert_eq!(ErrorKind::CannotBroadcastFee, err.kind());
        assert_eq!(500, err.kind().status().code);
        assert_eq!(FeeStatus::BroadcastFailed, stored(&harness, &ticket).await.fee_status);

        harness.node.fail_broadcasts(None);
        harness.vsp.broadcast_fee(&ticket).await.unwrap();
        assert_eq!(FeeStatus::Broadcast, stored(&harness, &ticket).await.fee_status);
        assert_eq!(vec![fee_tx.hash()], harness.node.broadcasts());
    }

    #[vsp_test]
    async fn background_pass_drives_lifecycle(harness: Harness) {
        let (unpaid, _) = harness.ticket(5);
        harness.register(&unpaid).await;
        expire_fee_window(&harness, &unpaid).await;

        let (paid, _) = harness.ticket(0);
        let fee_tx = harness.register_and_pay(&paid).await;

        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(1, report.expired);
        assert_eq!(1, report.broadcast);
        assert_eq!(FeeStatus::Expired, stored(&harness, &unpaid).await.fee_status);
        assert_eq!(FeeStatus::Broadcast, stored(&harness, &paid).await.fee_status);

        // Not yet deep enough.
        harness.node.set_confirmations(&fee_tx.hash(), 1);
        harness.node.set_confirmations(&paid, 1);
        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(0, report.confirmed);
        assert!(stored(&harness, &paid).await.confirmed);

        harness.node.set_confirmations(&fee_tx.hash(), 6);
        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(1, report.confirmed);
        assert_eq!(FeeStatus::Confirmed, stored(&harness, &paid).await.fee_status);

        // Nothing left to do.
        assert_eq!(FeeReport::default(), harness.vsp.process_fees().await.unwrap());
    }

    #[vsp_test]
    async fn received_fee_expires_when_ticket_cannot_vote(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        harness.register_and_pay(&ticket).await;
        harness.node.set_confirmations(&ticket, 500);

        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(1, report.expired);
        assert_eq!(0, report.broadcast);
        assert_eq!(FeeStatus::Expired, stored(&harness, &ticket).await.fee_status);
        assert!(harness.node.broadcasts().is_empty());
    }

    #[vsp_test]
    async fn unknown_outputs_retried_once_inputs_mined(harness: Harness) {
        let (ticket, _) = harness.ticket(5);
        let fee_tx = harness.register_and_pay(&ticket).await;

        harness
            .node
            .fail_broadcasts(Some(BroadcastFailure::UnknownOutputs));
        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(1, report.failed);
        harness.node.fail_broadcasts(None);

        // The funding transaction is still unmined.
        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(0, report.broadcast);
        assert_eq!(FeeStatus::UnknownOutputs, stored(&harness, &ticket).await.fee_status);

        harness
            .node
            .set_confirmations(&fee_tx.inputs[0].prev_hash, 1);
        let report = harness.vsp.process_fees().await.unwrap();
        assert_eq!(1, report.broadcast);
        assert_eq!(FeeStatus::Broadcast, stored(&harness, &ticket).await.fee_status);
    }
}
