use std::fmt::{Display, Formatter};

use rocket::{
    http::Status,
    response::{self, Responder},
    serde::json::Json,
    Request, Response,
};
use serde::Serialize;
use serde_repr::Serialize_repr;
use thiserror::Error;

use crate::node::NodeError;
use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

/// Every way a request can be refused.
///
/// The set is closed: each kind is statically bound to one status code and one
/// canonical message, and two errors are "the same error" iff their kinds are
/// equal, whatever detail text was attached where they were raised. The
/// discriminant is the stable numeric identifier sent to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr)]
#[repr(u16)]
pub enum ErrorKind {
    BadRequest = 0,
    InternalError = 1,
    VspClosed = 2,
    FeeAlreadyReceived = 3,
    InvalidFeeTx = 4,
    FeeTooSmall = 5,
    UnknownTicket = 6,
    TicketCannotVote = 7,
    FeeExpired = 8,
    InvalidVoteChoices = 9,
    BadSignature = 10,
    InvalidPrivKey = 11,
    FeeNotReceived = 12,
    InvalidTicket = 13,
    CannotBroadcastTicket = 14,
    CannotBroadcastFee = 15,
    CannotBroadcastFeeUnknownOutputs = 16,
    InvalidTimestamp = 17,
    NotPublicKey = 18,
    AltSignAddrHistoryFull = 19,
    NoClientSignature = 20,
}

impl ErrorKind {
    /// The canonical, client-facing message for this kind.
    pub const fn message(self) -> &'static str {
        match self {
            Self::BadRequest => "bad request",
            Self::InternalError => "internal error",
            Self::VspClosed => "vsp is closed",
            Self::FeeAlreadyReceived => "fee tx already received for ticket",
            Self::InvalidFeeTx => "invalid fee tx",
            Self::FeeTooSmall => "fee too small",
            Self::UnknownTicket => "unknown ticket",
            Self::TicketCannotVote => "ticket not eligible to vote",
            Self::FeeExpired => "fee has expired",
            Self::InvalidVoteChoices => "invalid vote choices",
            Self::BadSignature => "bad request signature",
            Self::InvalidPrivKey => "invalid private key",
            Self::FeeNotReceived => "no fee tx received for ticket",
            Self::InvalidTicket => "not a valid ticket tx",
            Self::CannotBroadcastTicket => "ticket transaction could not be broadcast",
            Self::CannotBroadcastFee => "fee transaction could not be broadcast",
            Self::CannotBroadcastFeeUnknownOutputs => {
                "fee transaction could not be broadcast due to unknown outputs"
            }
            Self::InvalidTimestamp => "old or reused timestamp",
            Self::NotPublicKey => "alternate signing address is not a public key address",
            Self::AltSignAddrHistoryFull => "alternate signing address history at maximum",
            Self::NoClientSignature => "no VSP-Client-Signature header",
        }
    }

    /// The HTTP status this kind is reported with.
    pub const fn status(self) -> Status {
        match self {
            Self::InternalError | Self::CannotBroadcastTicket | Self::CannotBroadcastFee => {
                Status::InternalServerError
            }
            Self::CannotBroadcastFeeUnknownOutputs => Status::PreconditionRequired,
            _ => Status::BadRequest,
        }
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Kind(ErrorKind),
    #[error("{1}")]
    Detailed(ErrorKind, String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Node(#[from] NodeError),
}

impl Error {
    /// An error of the given kind carrying request-specific detail text.
    pub fn detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self::Detailed(kind, detail.into())
    }

    /// Convenience for `ErrorKind::BadRequest` with detail.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::detail(ErrorKind::BadRequest, detail)
    }

    /// Classify this error. Store and node failures are internal unless they
    /// were mapped to a more specific kind where they were raised, or are one
    /// of the store's own guards.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Kind(kind) | Self::Detailed(kind, _) => *kind,
            Self::Store(StoreError::StaleTimestamp { .. }) => ErrorKind::InvalidTimestamp,
            Self::Store(StoreError::HistoryFull(_)) => ErrorKind::AltSignAddrHistoryFull,
            Self::Store(_) | Self::Node(_) => ErrorKind::InternalError,
        }
    }

    /// Is this error a fault of the server rather than the client?
    pub fn is_internal(&self) -> bool {
        self.kind().status().code >= 500
    }

    /// The message that is safe to show the client. Internal causes are
    /// logged, never echoed.
    pub fn client_message(&self) -> String {
        match self {
            Self::Detailed(_, detail) if !self.is_internal() => detail.clone(),
            _ => self.kind().message().to_string(),
        }
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::Kind(kind)
    }
}

/// Body of every failure response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: ErrorKind,
    message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for Error {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let kind = self.kind();
        let body = ErrorBody {
            code: kind,
            message: self.client_message(),
        };
        Response::build_from(Json(body).respond_to(req)?)
            .status(kind.status())
            .ok()
    }
}
