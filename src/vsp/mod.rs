//! The request-facing core: authentication, the ticket fee lifecycle and
//! alternate signing addresses, behind one [`Vsp`] handle.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use log::{error, info, warn};
use serde::Serialize;

use crate::config::Settings;
use crate::crypto::SignedResponse;
use crate::error::{Error, ErrorKind, Result};
use crate::model::{
    hash::TxHash,
    request::{Action, ClientRequest, Envelope, VspInfoResponse},
};
use crate::node::Node;
use crate::store::TicketStore;

mod alt_sign;
mod auth;
mod lifecycle;
mod locks;

pub use self::alt_sign::AltSignManager;
pub use self::auth::{Authenticator, RequestContext};
pub use self::lifecycle::{FeeReport, Lifecycle};
pub use self::locks::{TicketGuard, TicketLocks};

/// Current unix time in seconds.
pub(crate) fn now() -> i64 {
    Utc::now().timestamp()
}

/// The process-wide open/closed flag. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct VspStatus(Arc<AtomicBool>);

impl VspStatus {
    pub fn new(closed: bool) -> Self {
        Self(Arc::new(AtomicBool::new(closed)))
    }

    pub fn is_closed(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn open(&self) {
        info!("VSP opened");
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn close(&self) {
        info!("VSP closed");
        self.0.store(true, Ordering::SeqCst);
    }
}

/// What every component is built from.
#[derive(Clone)]
pub(crate) struct Services {
    pub settings: Arc<Settings>,
    pub store: Arc<dyn TicketStore>,
    pub node: Arc<dyn Node>,
    pub locks: TicketLocks,
}

impl Services {
    /// Serialize and sign a response body.
    pub fn sign<T: Serialize>(&self, response: &T) -> Result<SignedResponse> {
        self.settings.signer.sign_json(response).map_err(|e| {
            error!("Failed to serialize response: {e}");
            Error::from(ErrorKind::InternalError)
        })
    }
}

/// The voting service.
#[derive(Clone)]
pub struct Vsp {
    services: Services,
    status: VspStatus,
    auth: Authenticator,
    lifecycle: Lifecycle,
    alt_sign: AltSignManager,
}

impl Vsp {
    pub fn new(
        settings: Arc<Settings>,
        store: Arc<dyn TicketStore>,
        node: Arc<dyn Node>,
        status: VspStatus,
    ) -> Self {
        let services = Services {
            settings,
            store,
            node,
            locks: TicketLocks::new(),
        };
        let lifecycle = Lifecycle::new(services.clone());
        Self {
            auth: Authenticator::new(services.clone()),
            alt_sign: AltSignManager::new(services.clone(), lifecycle.clone()),
            lifecycle,
            services,
            status,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.services.settings
    }

    pub fn status(&self) -> &VspStatus {
        &self.status
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Register a ticket, or look up its fee details if already registered.
    pub async fn fee_address(&self, request: &ClientRequest) -> Result<SignedResponse> {
        let result = async {
            let ctx = self.authenticate(request, Action::FeeAddress).await?;
            self.lifecycle.register_ticket(&ctx).await
        }
        .await;
        self.log_outcome(Action::FeeAddress, request, result)
    }

    pub async fn pay_fee(&self, request: &ClientRequest) -> Result<SignedResponse> {
        let result = async {
            let ctx = self.authenticate(request, Action::PayFee).await?;
            self.lifecycle.pay_fee(&ctx).await
        }
        .await;
        self.log_outcome(Action::PayFee, request, result)
    }

    pub async fn set_vote_choices(&self, request: &ClientRequest) -> Result<SignedResponse> {
        let result = async {
            let ctx = self.authenticate(request, Action::SetVoteChoices).await?;
            self.lifecycle.set_vote_choices(&ctx).await
        }
        .await;
        self.log_outcome(Action::SetVoteChoices, request, result)
    }

    pub async fn set_alt_sign_addr(&self, request: &ClientRequest) -> Result<SignedResponse> {
        let result = async {
            let ctx = self.authenticate(request, Action::SetAltSignAddr).await?;
            self.alt_sign.register(&ctx).await
        }
        .await;
        self.log_outcome(Action::SetAltSignAddr, request, result)
    }

    pub async fn ticket_status(&self, request: &ClientRequest) -> Result<SignedResponse> {
        let result = async {
            let ctx = self.authenticate(request, Action::TicketStatus).await?;
            self.lifecycle.ticket_status(&ctx).await
        }
        .await;
        self.log_outcome(Action::TicketStatus, request, result)
    }

    /// Public service information. Needs no authentication.
    pub async fn vsp_info(&self) -> Result<SignedResponse> {
        let settings = self.settings();
        let tickets: BTreeMap<String, u64> = self
            .services
            .store
            .count_by_status()
            .await?
            .into_iter()
            .map(|(status, count)| (status.to_string(), count))
            .collect();
        self.services.sign(&VspInfoResponse {
            api_versions: vec![3],
            timestamp: now(),
            pub_key: settings.signer.public_key_base64(),
            fee_percentage: settings.fee_percent,
            vsp_closed: self.status.is_closed(),
            vsp_closed_msg: settings.closed_msg.clone(),
            network: settings.network.name.clone(),
            tickets,
        })
    }

    /// One background pass over every ticket with fee work outstanding.
    pub async fn process_fees(&self) -> Result<FeeReport> {
        self.lifecycle.process_fees().await
    }

    /// Broadcast one ticket's fee now.
    pub async fn broadcast_fee(&self, hash: &TxHash) -> Result<()> {
        self.lifecycle.broadcast_fee(hash).await
    }

    async fn authenticate(&self, request: &ClientRequest, action: Action) -> Result<RequestContext> {
        if action.blocked_when_closed() && self.status.is_closed() {
            return Err(ErrorKind::VspClosed.into());
        }
        self.auth.authenticate(request, action).await
    }

    fn log_outcome(
        &self,
        action: Action,
        request: &ClientRequest,
        result: Result<SignedResponse>,
    ) -> Result<SignedResponse> {
        if let Err(err) = &result {
            let ticket = serde_json::from_slice::<Envelope>(&request.body)
                .map(|e| e.ticket_hash.to_string())
                .unwrap_or_else(|_| "<unparsed>".to_string());
            if err.is_internal() {
                error!("{action} failed for ticket {ticket}: {err}");
            } else {
                warn!("{action} rejected for ticket {ticket}: {err}");
            }
        }
        result
    }
}
