//! Test doubles: an in-memory chain, a client wallet, and a harness that wires
//! them into a service and a rocket instance.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use data_encoding::BASE64;
use ed25519_dalek::{Signer, SigningKey};
use rocket::{
    serde::json::serde_json::{json, Value},
    Build, Rocket,
};

use crate::config::Settings;
use crate::crypto::ServerSigner;
use crate::model::{
    address::Address,
    hash::TxHash,
    network::NetworkParams,
    request::ClientRequest,
    tx::{Transaction, TxInput, TxOutput, TxType},
};
use crate::node::{Node, NodeError, RawTransaction};
use crate::store::{MemoryStore, TicketStore};
use crate::vsp::{now, Vsp, VspStatus};

pub const TICKET_PRICE: i64 = 10_000_000;

/// How the fake node refuses broadcasts, when told to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastFailure {
    UnknownOutputs,
    Rejected,
}

#[derive(Debug, Default)]
struct Chain {
    txs: HashMap<TxHash, RawTransaction>,
    live: HashSet<TxHash>,
    broadcasts: Vec<TxHash>,
    failure: Option<BroadcastFailure>,
    lookups_fail: bool,
}

/// A node whose chain is whatever the test says it is.
#[derive(Debug, Default)]
pub struct FakeNode {
    chain: Mutex<Chain>,
}

impl FakeNode {
    fn chain(&self) -> MutexGuard<'_, Chain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Put a transaction on chain with the given depth.
    pub fn add(&self, tx: &Transaction, confirmations: i64) -> TxHash {
        let hash = tx.hash();
        self.chain().txs.insert(
            hash,
            RawTransaction {
                hash,
                hex: tx.to_hex(),
                confirmations,
            },
        );
        hash
    }

    /// Set the depth of a transaction. Unknown hashes are added with an
    /// empty body, enough to stand for a funding transaction.
    pub fn set_confirmations(&self, hash: &TxHash, confirmations: i64) {
        self.chain()
            .txs
            .entry(*hash)
            .or_insert_with(|| RawTransaction {
                hash: *hash,
                hex: String::new(),
                confirmations: 0,
            })
            .confirmations = confirmations;
    }

    pub fn set_live(&self, hash: &TxHash, live: bool) {
        let mut chain = self.chain();
        if live {
            chain.live.insert(*hash);
        } else {
            chain.live.remove(hash);
        }
    }

    pub fn fail_broadcasts(&self, failure: Option<BroadcastFailure>) {
        self.chain().failure = failure;
    }

    /// While set, transaction lookups fail as if the node were unhealthy.
    pub fn fail_lookups(&self, fail: bool) {
        self.chain().lookups_fail = fail;
    }

    /// Hashes of every transaction successfully broadcast, in order.
    pub fn broadcasts(&self) -> Vec<TxHash> {
        self.chain().broadcasts.clone()
    }
}

#[rocket::async_trait]
impl Node for FakeNode {
    async fn get_raw_transaction(&self, hash: &TxHash) -> Result<RawTransaction, NodeError> {
        let chain = self.chain();
        if chain.lookups_fail {
            return Err(NodeError::Rpc {
                code: -32603,
                message: "node is syncing".to_string(),
            });
        }
        chain
            .txs
            .get(hash)
            .cloned()
            .ok_or_else(|| NodeError::NotFound(hash.to_string()))
    }

    async fn exists_live_ticket(&self, hash: &TxHash) -> Result<bool, NodeError> {
        Ok(self.chain().live.contains(hash))
    }

    async fn broadcast_transaction(&self, hex: &str) -> Result<(), NodeError> {
        let mut chain = self.chain();
        match chain.failure {
            Some(BroadcastFailure::UnknownOutputs) => {
                return Err(NodeError::UnknownOutputs("input not found".to_string()))
            }
            Some(BroadcastFailure::Rejected) => {
                return Err(NodeError::Rpc {
                    code: -22,
                    message: "transaction rejected".to_string(),
                })
            }
            None => {}
        }
        let tx = Transaction::from_hex(hex).map_err(|e| NodeError::Malformed(e.to_string()))?;
        let hash = tx.hash();
        chain.txs.entry(hash).or_insert(RawTransaction {
            hash,
            hex: hex.to_string(),
            confirmations: 0,
        });
        chain.broadcasts.push(hash);
        Ok(())
    }
}

/// A client holding one ticket-owning key.
pub struct Wallet {
    key: SigningKey,
    params: NetworkParams,
    nonce: AtomicU32,
}

impl Wallet {
    pub fn new(seed: u8, params: NetworkParams) -> Self {
        Self {
            key: SigningKey::from_bytes(&[seed; 32]),
            params,
            nonce: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(&self.params, &self.key.verifying_key())
    }

    fn input(&self, value: i64) -> TxInput {
        let nonce = self.nonce.fetch_add(1, Ordering::SeqCst);
        TxInput {
            prev_hash: TxHash::of(self.key.verifying_key().as_bytes()),
            prev_index: nonce,
            value,
        }
    }

    /// A new ticket purchase committed to this wallet's address.
    pub fn buy_ticket(&self) -> Transaction {
        Transaction {
            version: 1,
            tx_type: TxType::Ticket,
            inputs: vec![self.input(TICKET_PRICE + 10_000)],
            outputs: vec![
                TxOutput {
                    value: TICKET_PRICE,
                    address: Address::from_script_hash(&self.params, [3; 32]),
                },
                TxOutput {
                    value: 0,
                    address: self.address(),
                },
            ],
            lock_time: 0,
        }
    }

    /// A regular transaction paying `amount` to `to`.
    pub fn pay(&self, to: &Address, amount: i64) -> Transaction {
        Transaction {
            version: 1,
            tx_type: TxType::Regular,
            inputs: vec![self.input(amount + 5_000)],
            outputs: vec![TxOutput {
                value: amount,
                address: *to,
            }],
            lock_time: 0,
        }
    }

    pub fn sign(&self, body: &str) -> String {
        BASE64.encode(&self.key.sign(body.as_bytes()).to_bytes())
    }

    /// A request carrying `body` signed by this wallet.
    pub fn request(&self, body: &Value) -> ClientRequest {
        let body = body.to_string();
        let signature = self.sign(&body);
        ClientRequest::new(body, Some(signature))
    }
}

/// Everything a test needs around one running service.
pub struct Harness {
    pub vsp: Vsp,
    pub node: Arc<FakeNode>,
    pub store: MemoryStore,
    pub settings: Arc<Settings>,
    pub wallet: Arc<Wallet>,
    clock: Arc<AtomicI64>,
}

impl Harness {
    pub fn new(closed: bool) -> Self {
        let params = NetworkParams::simnet();
        let signer = ServerSigner::new(SigningKey::from_bytes(&[7; 32]));
        let fee_key = SigningKey::from_bytes(&[9; 32]).verifying_key();
        let fee_address = Address::from_public_key(&params, &fee_key);
        let settings = Settings {
            max_alt_sign_addr_records: 2,
            max_vote_change_records: 3,
            ..Settings::new(params.clone(), signer, fee_address).unwrap()
        };
        let settings = Arc::new(settings);
        let node = Arc::new(FakeNode::default());
        let store = MemoryStore::new();
        Self {
            vsp: Self::vsp(&settings, &store, &node, VspStatus::new(closed)),
            node,
            store,
            settings,
            wallet: Arc::new(Wallet::new(1, params)),
            clock: Arc::new(AtomicI64::new(now() - 1_000)),
        }
    }

    fn vsp(
        settings: &Arc<Settings>,
        store: &MemoryStore,
        node: &Arc<FakeNode>,
        status: VspStatus,
    ) -> Vsp {
        let store: Arc<dyn TicketStore> = Arc::new(store.clone());
        let node: Arc<dyn Node> = node.clone();
        Vsp::new(settings.clone(), store, node, status)
    }

    /// The same service after a process restart: persisted state survives,
    /// everything held in memory does not.
    pub fn restart(&self) -> Self {
        let store = self.store.reopen();
        Self {
            vsp: Self::vsp(
                &self.settings,
                &store,
                &self.node,
                VspStatus::new(self.vsp.status().is_closed()),
            ),
            node: self.node.clone(),
            store,
            settings: self.settings.clone(),
            wallet: self.wallet.clone(),
            clock: self.clock.clone(),
        }
    }

    pub fn rocket(&self) -> Rocket<Build> {
        crate::rocket_for(self.vsp.clone())
    }

    /// A fresh timestamp, later than every one handed out before.
    pub fn timestamp(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    /// Buy a ticket and mine it to the given depth. Mature tickets are live.
    pub fn ticket(&self, confirmations: i64) -> (TxHash, Transaction) {
        let tx = self.wallet.buy_ticket();
        let hash = self.node.add(&tx, confirmations);
        if confirmations > i64::from(self.settings.network.ticket_maturity) {
            self.node.set_live(&hash, true);
        }
        (hash, tx)
    }

    /// A fee payment for `amount` to the service's fee address.
    pub fn fee_tx(&self, amount: i64) -> Transaction {
        self.wallet.pay(&self.settings.fee_address, amount)
    }

    /// A request about `ticket` signed by the harness wallet. `fields` must be
    /// an object; the timestamp and ticket hash are added to it.
    pub fn request(&self, ticket: &TxHash, mut fields: Value) -> ClientRequest {
        fields["timestamp"] = json!(self.timestamp());
        fields["tickethash"] = json!(ticket);
        self.wallet.request(&fields)
    }

    /// Register `ticket`, panicking on refusal.
    pub async fn register(&self, ticket: &TxHash) {
        self.vsp
            .fee_address(&self.request(ticket, json!({})))
            .await
            .unwrap();
    }

    /// Register `ticket` and pay its fee in full. Returns the fee tx.
    pub async fn register_and_pay(&self, ticket: &TxHash) -> Transaction {
        self.register(ticket).await;
        let fee_tx = self.fee_tx(self.fee_amount());
        let request = self.request(ticket, json!({ "feetx": fee_tx.to_hex() }));
        self.vsp.pay_fee(&request).await.unwrap();
        fee_tx
    }

    /// The fee the service charges for a harness ticket.
    pub fn fee_amount(&self) -> i64 {
        self.settings
            .network
            .vsp_fee(TICKET_PRICE, self.settings.fee_percent)
    }
}

pub fn init_logging() {
    log4rs_test_utils::test_logging::init_logging_once_for(["vspd"], None, None);
}
