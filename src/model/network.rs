use std::collections::HashMap;

use thiserror::Error;

use crate::error::{Error, ErrorKind};

/// A consensus agenda that tickets may vote on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agenda {
    pub id: String,
    pub choices: Vec<String>,
}

impl Agenda {
    fn new(id: &str, choices: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    #[error("unknown network '{0}', expected one of mainnet, testnet, simnet")]
    Unknown(String),
    #[error("network ticket pool size must be positive, found {0}")]
    ZeroTicketPoolSize(i64),
}

/// Chain parameters for the network the service runs against.
///
/// Built once at startup and shared immutably by every component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkParams {
    pub name: String,
    /// First character of every address on this network.
    pub addr_prefix: char,
    /// Target number of live tickets.
    pub ticket_pool_size: i64,
    /// Blocks before a mined ticket becomes live.
    pub ticket_maturity: u32,
    /// Blocks a live ticket stays live before it expires.
    pub ticket_expiry: u32,
    /// Smallest fee, in atoms, the service accepts for any ticket.
    pub min_fee: i64,
    pub agendas: Vec<Agenda>,
}

fn default_agendas() -> Vec<Agenda> {
    let choices = ["abstain", "yes", "no"];
    vec![
        Agenda::new("maxblocksize", &choices),
        Agenda::new("treasury", &choices),
        Agenda::new("autorevocations", &choices),
    ]
}

impl NetworkParams {
    pub fn mainnet() -> Self {
        Self {
            name: "mainnet".to_string(),
            addr_prefix: 'D',
            ticket_pool_size: 8192,
            ticket_maturity: 256,
            ticket_expiry: 40960,
            min_fee: 10_000,
            agendas: default_agendas(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            name: "testnet".to_string(),
            addr_prefix: 'T',
            ticket_pool_size: 1024,
            ticket_maturity: 16,
            ticket_expiry: 6144,
            min_fee: 10_000,
            agendas: default_agendas(),
        }
    }

    pub fn simnet() -> Self {
        Self {
            name: "simnet".to_string(),
            addr_prefix: 'S',
            ticket_pool_size: 64,
            ticket_maturity: 16,
            ticket_expiry: 384,
            min_fee: 1_000,
            agendas: default_agendas(),
        }
    }

    pub fn from_name(name: &str) -> Result<Self, NetworkError> {
        match name {
            "mainnet" => Ok(Self::mainnet()),
            "testnet" => Ok(Self::testnet()),
            "simnet" => Ok(Self::simnet()),
            other => Err(NetworkError::Unknown(other.to_string())),
        }
    }

    /// Reject parameters no ticket could ever vote under. Called once at
    /// startup; a failure here is fatal.
    pub fn validate(&self) -> Result<(), NetworkError> {
        if self.ticket_pool_size <= 0 {
            return Err(NetworkError::ZeroTicketPoolSize(self.ticket_pool_size));
        }
        Ok(())
    }

    /// Check every agenda and choice id against this network's agendas.
    pub fn validate_vote_choices(&self, choices: &HashMap<String, String>) -> Result<(), Error> {
        for (agenda_id, choice_id) in choices {
            let agenda = self
                .agendas
                .iter()
                .find(|a| &a.id == agenda_id)
                .ok_or_else(|| {
                    Error::detail(
                        ErrorKind::InvalidVoteChoices,
                        format!("agenda id {agenda_id:?} not found"),
                    )
                })?;
            if !agenda.choices.iter().any(|c| c == choice_id) {
                return Err(Error::detail(
                    ErrorKind::InvalidVoteChoices,
                    format!("choice id {choice_id:?} not found for agenda {agenda_id:?}"),
                ));
            }
        }
        Ok(())
    }

    /// The fee, in atoms, charged for a ticket bought at `ticket_price`.
    pub fn vsp_fee(&self, ticket_price: i64, fee_percent: f64) -> i64 {
        let fee = (ticket_price as f64 * fee_percent / 100.0) as i64;
        fee.max(self.min_fee)
    }

    /// Confirmations after which a ticket has certainly expired or voted.
    pub fn max_ticket_confirmations(&self) -> i64 {
        i64::from(self.ticket_maturity) + i64::from(self.ticket_expiry) + 1
    }
}
