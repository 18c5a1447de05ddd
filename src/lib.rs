#[macro_use]
extern crate rocket;

#[cfg(test)]
#[macro_use]
extern crate vsp_test;

use rocket::{Build, Rocket};

use crate::api::API_BASE;
use crate::background::FeeProcessorFairing;
use crate::config::{ConfigFairing, NodeFairing, StoreFairing, VspFairing};
use crate::logging::LoggerFairing;
use crate::vsp::Vsp;

pub mod api;
pub mod background;
pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod model;
pub mod node;
pub mod store;
pub mod vsp;

#[cfg(test)]
pub(crate) mod testing;

/// The server, configured from `Rocket.toml` and `ROCKET_*` environment
/// variables. Fairings run in attachment order, so each finds the state the
/// ones before it placed.
pub fn build() -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(StoreFairing)
        .attach(NodeFairing)
        .attach(VspFairing)
        .attach(FeeProcessorFairing)
        .mount(API_BASE, api::routes())
}

/// The API alone, around an already assembled service.
pub fn rocket_for(vsp: Vsp) -> Rocket<Build> {
    rocket::build().manage(vsp).mount(API_BASE, api::routes())
}
