use std::io::Cursor;

use log::warn;
use rocket::{
    data::{self, Data, FromData, Limits},
    http::{ContentType, Header},
    outcome::Outcome,
    response::{self, Responder},
    Request, Response,
};

use crate::crypto::SignedResponse;
use crate::model::request::{ClientRequest, CLIENT_SIGNATURE_HEADER, SERVER_SIGNATURE_HEADER};

/// Capture the body exactly as sent, together with the signature header.
///
/// Never fails: a missing header or an unreadable body is reported by the
/// authenticator with the proper error code, not by rocket.
#[rocket::async_trait]
impl<'r> FromData<'r> for ClientRequest {
    type Error = std::convert::Infallible;

    async fn from_data(req: &'r Request<'_>, data: Data<'r>) -> data::Outcome<'r, Self> {
        let limit = req.limits().get("json").unwrap_or(Limits::JSON);
        let body = match data.open(limit).into_bytes().await {
            Ok(bytes) if bytes.is_complete() => bytes.into_inner(),
            Ok(_) => {
                warn!("Request body exceeds limit of {limit}");
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to read request body: {e}");
                Vec::new()
            }
        };
        let signature = req
            .headers()
            .get_one(CLIENT_SIGNATURE_HEADER)
            .map(str::to_string);
        Outcome::Success(ClientRequest::new(body, signature))
    }
}

/// Send the signed bytes verbatim, with the signature in a header.
impl<'r> Responder<'r, 'static> for SignedResponse {
    fn respond_to(self, _: &'r Request<'_>) -> response::Result<'static> {
        Response::build()
            .header(ContentType::JSON)
            .header(Header::new(SERVER_SIGNATURE_HEADER, self.signature))
            .sized_body(self.body.len(), Cursor::new(self.body))
            .ok()
    }
}
