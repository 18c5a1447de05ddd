//! The client-facing HTTP API.
//!
//! Every response body, success or not, is JSON. Successful responses carry
//! the server's signature over the exact body bytes.

use rocket::{Route, State};

use crate::crypto::SignedResponse;
use crate::error::Result;
use crate::model::request::ClientRequest;
use crate::vsp::Vsp;

mod signed;

/// Where [`routes`] are mounted.
pub const API_BASE: &str = "/api/v3";

pub fn routes() -> Vec<Route> {
    routes![
        vsp_info,
        fee_address,
        pay_fee,
        set_vote_choices,
        set_alt_sign_addr,
        ticket_status,
    ]
}

#[get("/vspinfo")]
async fn vsp_info(vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.vsp_info().await
}

#[post("/feeaddress", data = "<request>")]
async fn fee_address(request: ClientRequest, vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.fee_address(&request).await
}

#[post("/payfee", data = "<request>")]
async fn pay_fee(request: ClientRequest, vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.pay_fee(&request).await
}

#[post("/setvotechoices", data = "<request>")]
async fn set_vote_choices(request: ClientRequest, vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.set_vote_choices(&request).await
}

#[post("/setaltsignaddr", data = "<request>")]
async fn set_alt_sign_addr(request: ClientRequest, vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.set_alt_sign_addr(&request).await
}

#[post("/ticketstatus", data = "<request>")]
async fn ticket_status(request: ClientRequest, vsp: &State<Vsp>) -> Result<SignedResponse> {
    vsp.ticket_status(&request).await
}
