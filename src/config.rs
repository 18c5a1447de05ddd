use std::sync::Arc;

use log::{error, info};
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;
use thiserror::Error;

use crate::crypto::{CryptoError, ServerSigner};
use crate::model::{
    address::{Address, AddressError},
    network::{NetworkError, NetworkParams},
};
use crate::node::{Node, RpcNode};
use crate::store::{MongoStore, TicketStore};
use crate::vsp::{Vsp, VspStatus};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables.
#[derive(Debug, Deserialize)]
pub struct Config {
    // non-secrets
    network: String,
    #[serde(default)]
    vsp_closed: bool,
    #[serde(default)]
    vsp_closed_msg: String,
    fee_percent: f64,
    fee_address: String,
    #[serde(default = "defaults::max_alt_sign_addr_records")]
    max_alt_sign_addr_records: usize,
    #[serde(default = "defaults::max_vote_change_records")]
    max_vote_change_records: usize,
    #[serde(default = "defaults::max_clock_skew")]
    max_clock_skew: i64,
    #[serde(default = "defaults::fee_expiry")]
    fee_expiry: i64,
    #[serde(default = "defaults::required_confirmations")]
    required_confirmations: i64,
    #[serde(default = "defaults::background_interval")]
    background_interval: u64,
    // secrets
    sign_key: String,
}

mod defaults {
    pub fn max_alt_sign_addr_records() -> usize {
        3
    }
    pub fn max_vote_change_records() -> usize {
        10
    }
    pub fn max_clock_skew() -> i64 {
        300
    }
    pub fn fee_expiry() -> i64 {
        3600
    }
    pub fn required_confirmations() -> i64 {
        6
    }
    pub fn background_interval() -> u64 {
        60
    }
}

/// Fatal faults in static configuration. Any of these stops the server
/// before it accepts a request.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error("invalid private key: {0}")]
    SignKey(#[from] CryptoError),
    #[error("invalid fee address: {0}")]
    FeeAddress(#[from] AddressError),
    #[error("fee percentage must be in (0, 100], found {0}")]
    FeePercent(f64),
}

/// The immutable settings every component is built with.
#[derive(Debug, Clone)]
pub struct Settings {
    pub network: NetworkParams,
    pub signer: ServerSigner,
    /// Address every fee is paid to.
    pub fee_address: Address,
    pub fee_percent: f64,
    pub closed_msg: String,
    pub max_alt_sign_addr_records: usize,
    pub max_vote_change_records: usize,
    /// Seconds a request timestamp may be ahead of the server clock.
    pub max_clock_skew: i64,
    /// Seconds a newly issued fee address stays payable.
    pub fee_expiry: i64,
    pub required_confirmations: i64,
    /// Seconds between background fee processing passes.
    pub background_interval: u64,
}

impl Settings {
    /// Settings with default limits. Fails on an unusable network or a fee
    /// address that cannot receive to a key on that network.
    pub fn new(
        network: NetworkParams,
        signer: ServerSigner,
        fee_address: Address,
    ) -> Result<Self, ConfigError> {
        network.validate()?;
        if fee_address.prefix() != network.addr_prefix {
            return Err(AddressError::Network {
                expected: network.addr_prefix,
                found: fee_address.prefix(),
            }
            .into());
        }
        fee_address.verifying_key()?;
        Ok(Self {
            network,
            signer,
            fee_address,
            fee_percent: 3.0,
            closed_msg: String::new(),
            max_alt_sign_addr_records: defaults::max_alt_sign_addr_records(),
            max_vote_change_records: defaults::max_vote_change_records(),
            max_clock_skew: defaults::max_clock_skew(),
            fee_expiry: defaults::fee_expiry(),
            required_confirmations: defaults::required_confirmations(),
            background_interval: defaults::background_interval(),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ConfigError> {
        let network = NetworkParams::from_name(&config.network)?;
        let signer = ServerSigner::from_hex_seed(&config.sign_key)?;
        let fee_address = Address::decode(&config.fee_address, &network)?;
        if !(config.fee_percent > 0.0 && config.fee_percent <= 100.0) {
            return Err(ConfigError::FeePercent(config.fee_percent));
        }
        Ok(Self {
            fee_percent: config.fee_percent,
            closed_msg: config.vsp_closed_msg.clone(),
            max_alt_sign_addr_records: config.max_alt_sign_addr_records,
            max_vote_change_records: config.max_vote_change_records,
            max_clock_skew: config.max_clock_skew,
            fee_expiry: config.fee_expiry,
            required_confirmations: config.required_confirmations,
            background_interval: config.background_interval,
            ..Self::new(network, signer, fee_address)?
        })
    }
}

/// A fairing that loads the application config, validates it, and puts the
/// resulting [`Settings`] and [`VspStatus`] into managed state.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        let settings = match Settings::from_config(&config) {
            Ok(settings) => settings,
            Err(e) => {
                error!("Invalid application config: {e}");
                return Err(rocket);
            }
        };
        info!(
            "Loaded config for {} with public key {}",
            settings.network.name,
            settings.signer.public_key_base64()
        );
        let status = VspStatus::new(config.vsp_closed);
        if status.is_closed() {
            info!("VSP is closed: {}", settings.closed_msg);
        }

        // Manage the state.
        rocket = rocket.manage(Arc::new(settings)).manage(status);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    #[serde(default = "default_db_name")]
    db_name: String,
    // secrets
    db_uri: String,
}

fn default_db_name() -> String {
    "vspd".to_string()
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures its indexes exist and places the store into managed state.
pub struct StoreFairing;

#[rocket::async_trait]
impl Fairing for StoreFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        let store = match MongoStore::connect(&config.db_uri, &config.db_name).await {
            Ok(store) => store,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        info!("...database connection online!");

        // Manage the state.
        let store: Arc<dyn TicketStore> = Arc::new(store);
        rocket = rocket.manage(store);
        Ok(rocket)
    }
}

/// Configuration for the node connection.
#[derive(Deserialize)]
struct NodeConfig {
    // non-secrets
    node_url: String,
    node_user: String,
    // secrets
    node_pass: String,
}

/// A fairing that loads the node config and places a JSON-RPC node client
/// into managed state.
pub struct NodeFairing;

#[rocket::async_trait]
impl Fairing for NodeFairing {
    fn info(&self) -> Info {
        Info {
            name: "Node RPC",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        let config = match rocket.figment().extract::<NodeConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load node config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Using node at {}", config.node_url);
        let node: Arc<dyn Node> = Arc::new(RpcNode::new(
            config.node_url,
            config.node_user,
            config.node_pass,
        ));
        rocket = rocket.manage(node);
        Ok(rocket)
    }
}

/// A fairing that assembles the [`Vsp`] from the settings, store and node
/// placed in managed state by the fairings attached before it.
pub struct VspFairing;

#[rocket::async_trait]
impl Fairing for VspFairing {
    fn info(&self) -> Info {
        Info {
            name: "VSP",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, rocket: Rocket<Build>) -> rocket::fairing::Result {
        let parts = (
            rocket.state::<Arc<Settings>>().cloned(),
            rocket.state::<VspStatus>().cloned(),
            rocket.state::<Arc<dyn TicketStore>>().cloned(),
            rocket.state::<Arc<dyn Node>>().cloned(),
        );
        let (Some(settings), Some(status), Some(store), Some(node)) = parts else {
            error!("VSP requires config, store and node fairings to be attached first");
            return Err(rocket);
        };
        let vsp = Vsp::new(settings, store, node, status);
        Ok(rocket.manage(vsp))
    }
}
