use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, warn};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};

use super::{Node, NodeError, RawTransaction};
use crate::model::hash::TxHash;

/// Node error code for "no information available about transaction".
const RPC_NO_TX_INFO: i64 = -5;
const UNKNOWN_OUTPUTS_MSG: &str = "references outputs of unknown or fully-spent transaction";
const ALREADY_HAVE_MSG: &str = "already have transaction";

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct VerboseTx {
    hex: String,
    #[serde(default)]
    confirmations: i64,
}

/// JSON-RPC client for the node.
#[derive(Debug)]
pub struct RpcNode {
    client: Client,
    url: String,
    user: String,
    pass: String,
    next_id: AtomicU64,
}

impl RpcNode {
    pub fn new(url: String, user: String, pass: String) -> Self {
        Self {
            client: Client::new(),
            url,
            user,
            pass,
            next_id: AtomicU64::new(1),
        }
    }

    async fn call<T>(&self, method: &str, params: Value) -> Result<T, NodeError>
    where
        T: DeserializeOwned + Send,
    {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        debug!("Node rpc {method}");
        let response: RpcResponse<T> = self
            .client
            .post(&self.url)
            .basic_auth(&self.user, Some(&self.pass))
            .json(&request)
            .send()
            .await?
            .json()
            .await?;

        if let Some(err) = response.error {
            return Err(classify(err.code, err.message));
        }
        response
            .result
            .ok_or_else(|| NodeError::Malformed(format!("{method} returned no result")))
    }
}

/// Map a node error to the cases callers distinguish.
fn classify(code: i64, message: String) -> NodeError {
    if code == RPC_NO_TX_INFO {
        NodeError::NotFound(message)
    } else if message.contains(UNKNOWN_OUTPUTS_MSG) {
        NodeError::UnknownOutputs(message)
    } else {
        NodeError::Rpc { code, message }
    }
}

#[rocket::async_trait]
impl Node for RpcNode {
    async fn get_raw_transaction(&self, hash: &TxHash) -> Result<RawTransaction, NodeError> {
        let tx: VerboseTx = self
            .call("getrawtransaction", json!([hash.to_string(), 1]))
            .await?;
        Ok(RawTransaction {
            hash: *hash,
            hex: tx.hex,
            confirmations: tx.confirmations,
        })
    }

    async fn exists_live_ticket(&self, hash: &TxHash) -> Result<bool, NodeError> {
        self.call("existsliveticket", json!([hash.to_string()]))
            .await
    }

    async fn broadcast_transaction(&self, hex: &str) -> Result<(), NodeError> {
        match self
            .call::<String>("sendrawtransaction", json!([hex, false]))
            .await
        {
            Ok(_) => Ok(()),
            Err(NodeError::Rpc { message, .. }) if message.contains(ALREADY_HAVE_MSG) => {
                warn!("Node already has transaction, treating broadcast as done");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
