use log::info;

use super::{now, Lifecycle, RequestContext, Services};
use crate::crypto::SignedResponse;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    address::{Address, AddressError},
    alt_sign_addr::AltSignAddrData,
    request::{AckResponse, SetAltSignAddrRequest},
};

/// Registers alternate signing addresses for tickets.
///
/// Each accepted address becomes the ticket's signing key from the next
/// request on. History is append-only and bounded; once full, the ticket's
/// key can no longer change.
#[derive(Clone)]
pub struct AltSignManager {
    services: Services,
    lifecycle: Lifecycle,
}

impl AltSignManager {
    pub(crate) fn new(services: Services, lifecycle: Lifecycle) -> Self {
        Self {
            services,
            lifecycle,
        }
    }

    pub async fn register(&self, ctx: &RequestContext) -> Result<SignedResponse> {
        let settings = &self.services.settings;
        let request: SetAltSignAddrRequest = serde_json::from_str(&ctx.body)
            .map_err(|e| Error::bad_request(format!("invalid setaltsignaddr request: {e}")))?;
        let hash = ctx.stamp.ticket_hash;

        let address = Address::decode(&request.alt_sign_address, &settings.network)
            .map_err(|e| Error::bad_request(format!("invalid alternate signing address: {e}")))?;
        address.verifying_key().map_err(|e| match e {
            AddressError::NotPublicKey => Error::from(ErrorKind::NotPublicKey),
            e => Error::detail(
                ErrorKind::InvalidPrivKey,
                format!("invalid alternate signing key: {e}"),
            ),
        })?;

        self.lifecycle.ensure_known_can_vote(&hash).await?;

        let _guard = self.services.locks.lock(&hash).await;
        let history = self.services.store.alt_sign_addr_history(&hash).await?;
        if history.len() >= settings.max_alt_sign_addr_records {
            return Err(ErrorKind::AltSignAddrHistoryFull.into());
        }

        let response = self.services.sign(&AckResponse {
            timestamp: now(),
            request: serde_json::value::RawValue::from_string(ctx.body.clone())
                .map_err(|e| Error::bad_request(format!("invalid request body: {e}")))?,
        })?;
        let data = AltSignAddrData {
            ticket_hash: hash,
            alt_sign_addr: address.to_string(),
            req: ctx.body.clone(),
            req_sig: ctx.signature.clone(),
            resp: response.body_str().to_string(),
            resp_sig: response.signature.clone(),
        };
        self.services
            .store
            .insert_alt_sign_addr(&data, settings.max_alt_sign_addr_records, Some(&ctx.stamp))
            .await?;
        info!(
            "Alternate signing address {} set for ticket {hash} ({} of {})",
            data.alt_sign_addr,
            history.len() + 1,
            settings.max_alt_sign_addr_records
        );
        Ok(response)
    }
}
