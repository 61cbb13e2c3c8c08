//! HTTP JSON-RPC transport, optionally tunnelled through an authenticated proxy.
//!
//! Lane 0 reads the protocol nonce (`eth_getTransactionCount`, pending tag);
//! lanes >= 1 call the nonce precompile. Node-side nonce complaints become
//! [`DispatchError::SequenceRejected`] so the scheduler can resync.

use crate::error::{DispatchError, is_sequence_rejection};
use crate::rpc::{
    Endpoint, NONCE_PRECOMPILE, RemoteRpc, TransportFactory, encode_lane_count_call,
    encode_nonce_call,
};
use crate::types::{EndpointId, Finality, Lane, Owner, PROTOCOL_LANE, SignedOperation, TxHash};
use alloy_primitives::U256;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<JsonRpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorObject {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ReceiptStatus {
    status: Option<String>,
}

/// Node-reported failure, before it is bound to an owner/lane.
enum CallError {
    Node(String),
    Dispatch(DispatchError),
}

pub struct JsonRpcTransport {
    endpoint: EndpointId,
    url: String,
    http: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl JsonRpcTransport {
    pub fn new(endpoint: &Endpoint, timeout: Duration) -> Result<Self, DispatchError> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(2);

        if let Some(proxy) = &endpoint.proxy {
            let mut proxy_config = reqwest::Proxy::all(&proxy.url)
                .map_err(|e| DispatchError::transport(endpoint.id, e))?;
            if let (Some(user), Some(pass)) = (&proxy.username, &proxy.password) {
                proxy_config = proxy_config.basic_auth(user, pass);
            }
            builder = builder.proxy(proxy_config);
        }

        url::Url::parse(&endpoint.rpc_url).map_err(|_| {
            DispatchError::Config(core_logic::ConfigError::InvalidRpcUrl {
                url: endpoint.rpc_url.clone(),
            })
        })?;

        let http = builder
            .build()
            .map_err(|e| DispatchError::transport(endpoint.id, e))?;

        Ok(Self {
            endpoint: endpoint.id,
            url: endpoint.rpc_url.clone(),
            http,
            timeout,
            next_id: AtomicU64::new(1),
        })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_reqwest(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CallError::Dispatch(DispatchError::transport(
                self.endpoint,
                format!("HTTP {}", status),
            )));
        }

        let parsed: JsonRpcResponse = response.json().await.map_err(|e| self.map_reqwest(e))?;
        if let Some(err) = parsed.error {
            debug!(
                endpoint = %self.endpoint,
                method,
                code = err.code,
                "RPC error: {}",
                err.message
            );
            return Err(CallError::Node(err.message));
        }
        Ok(parsed.result)
    }

    fn map_reqwest(&self, e: reqwest::Error) -> CallError {
        if e.is_timeout() {
            CallError::Dispatch(DispatchError::Timeout {
                timeout_ms: self.timeout.as_millis() as u64,
            })
        } else {
            // {:#} keeps the source chain, where "tunnel error" shows up
            CallError::Dispatch(DispatchError::transport(
                self.endpoint,
                format!("{:#}", anyhow::Error::new(e)),
            ))
        }
    }

    fn read_error(&self, err: CallError) -> DispatchError {
        match err {
            CallError::Dispatch(e) => e,
            CallError::Node(msg) => DispatchError::TaskLogic(msg),
        }
    }
}

fn parse_quantity(value: &Value) -> Result<U256, DispatchError> {
    let raw = value
        .as_str()
        .ok_or_else(|| DispatchError::TaskLogic(format!("expected hex quantity, got {}", value)))?;
    let digits = raw.trim_start_matches("0x");
    if digits.is_empty() {
        return Ok(U256::ZERO);
    }
    U256::from_str_radix(digits, 16)
        .map_err(|e| DispatchError::TaskLogic(format!("bad quantity {}: {}", raw, e)))
}

fn to_u64(value: U256) -> Result<u64, DispatchError> {
    u64::try_from(value).map_err(|_| DispatchError::TaskLogic(format!("{} overflows u64", value)))
}

#[async_trait]
impl RemoteRpc for JsonRpcTransport {
    async fn sequence(&self, owner: Owner, lane: Lane) -> Result<u64, DispatchError> {
        let response = if lane == PROTOCOL_LANE {
            self.call("eth_getTransactionCount", json!([owner, "pending"]))
                .await
        } else {
            let data = format!("0x{}", hex::encode(encode_nonce_call(owner, lane)));
            self.call(
                "eth_call",
                json!([{ "to": NONCE_PRECOMPILE, "data": data }, "latest"]),
            )
            .await
        };
        let result = response.map_err(|e| self.read_error(e))?;

        to_u64(parse_quantity(&result)?)
    }

    async fn authorized_lanes(&self, owner: Owner) -> Result<u64, DispatchError> {
        let data = format!("0x{}", hex::encode(encode_lane_count_call(owner)));
        let result = self
            .call(
                "eth_call",
                json!([{ "to": NONCE_PRECOMPILE, "data": data }, "latest"]),
            )
            .await
            .map_err(|e| self.read_error(e))?;

        to_u64(parse_quantity(&result)?)
    }

    async fn submit(&self, operation: &SignedOperation) -> Result<TxHash, DispatchError> {
        let raw = format!("0x{}", hex::encode(&operation.raw));
        let result = self
            .call("eth_sendRawTransaction", json!([raw]))
            .await
            .map_err(|e| match e {
                CallError::Node(msg) if is_sequence_rejection(&msg) => {
                    DispatchError::SequenceRejected {
                        owner: operation.owner,
                        lane: operation.lane,
                        reason: msg,
                    }
                }
                other => self.read_error(other),
            })?;

        let hash = result
            .as_str()
            .ok_or_else(|| DispatchError::TaskLogic(format!("unexpected tx hash {}", result)))?;
        hash.parse::<TxHash>()
            .map_err(|e| DispatchError::TaskLogic(format!("bad tx hash {}: {}", hash, e)))
    }

    async fn poll(&self, tx_hash: TxHash) -> Result<Option<Finality>, DispatchError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await
            .map_err(|e| self.read_error(e))?;

        if result.is_null() {
            return Ok(None);
        }

        let receipt: ReceiptStatus = serde_json::from_value(result)
            .map_err(|e| DispatchError::TaskLogic(format!("bad receipt: {}", e)))?;
        Ok(Some(match receipt.status.as_deref() {
            Some("0x1") => Finality::Success,
            _ => Finality::Reverted,
        }))
    }
}

/// Builds one [`JsonRpcTransport`] per endpoint.
pub struct JsonRpcFactory {
    pub request_timeout: Duration,
}

impl TransportFactory for JsonRpcFactory {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteRpc>, DispatchError> {
        Ok(Arc::new(JsonRpcTransport::new(
            endpoint,
            self.request_timeout,
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use alloy_primitives::{Address, Bytes};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serves one canned JSON-RPC body per connection, in order.
    async fn node(bodies: Vec<Value>) -> Endpoint {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                let body = body.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\n\
                     content-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(response.as_bytes()).await.unwrap();
                socket.shutdown().await.ok();
            }
        });

        Endpoint {
            id: EndpointId(0),
            name: "local".into(),
            rpc_url: format!("http://{}", addr),
            proxy: None,
        }
    }

    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            let text = String::from_utf8_lossy(&buf).to_lowercase();
            let Some(end) = text.find("\r\n\r\n") else {
                continue;
            };
            let length = text[..end]
                .lines()
                .find_map(|l| l.strip_prefix("content-length:"))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if buf.len() >= end + 4 + length {
                return;
            }
        }
    }

    fn signed(lane: Lane) -> SignedOperation {
        SignedOperation {
            owner: Address::repeat_byte(0x01),
            lane,
            sequence: 3,
            operation: Operation::transfer(Address::repeat_byte(0x02), U256::from(1)),
            raw: Bytes::from_static(&[0x76, 0xc0]),
        }
    }

    #[tokio::test]
    async fn stale_nonce_from_node_is_sequence_rejected() {
        let endpoint = node(vec![json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "nonce too low: next nonce 5, tx nonce 3" }
        })])
        .await;
        let rpc = JsonRpcTransport::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = rpc.submit(&signed(4)).await.unwrap_err();
        match err {
            DispatchError::SequenceRejected { owner, lane, .. } => {
                assert_eq!(owner, Address::repeat_byte(0x01));
                assert_eq!(lane, 4);
            }
            other => panic!("expected SequenceRejected, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn submit_then_poll_reads_receipt_status() {
        let hash = TxHash::repeat_byte(0xaa);
        let endpoint = node(vec![
            json!({ "jsonrpc": "2.0", "id": 1, "result": hash }),
            json!({ "jsonrpc": "2.0", "id": 2, "result": null }),
            json!({ "jsonrpc": "2.0", "id": 3, "result": { "status": "0x1" } }),
            json!({ "jsonrpc": "2.0", "id": 4, "result": { "status": "0x0" } }),
        ])
        .await;
        let rpc = JsonRpcTransport::new(&endpoint, Duration::from_secs(5)).unwrap();

        assert_eq!(rpc.submit(&signed(0)).await.unwrap(), hash);
        assert_eq!(rpc.poll(hash).await.unwrap(), None);
        assert_eq!(rpc.poll(hash).await.unwrap(), Some(Finality::Success));
        assert_eq!(rpc.poll(hash).await.unwrap(), Some(Finality::Reverted));
    }

    #[tokio::test]
    async fn other_node_errors_are_task_logic() {
        let endpoint = node(vec![json!({
            "jsonrpc": "2.0",
            "id": 1,
            "error": { "code": -32000, "message": "insufficient funds for gas" }
        })])
        .await;
        let rpc = JsonRpcTransport::new(&endpoint, Duration::from_secs(5)).unwrap();

        let err = rpc.submit(&signed(0)).await.unwrap_err();
        assert!(matches!(err, DispatchError::TaskLogic(_)));
    }

    #[test]
    fn quantities_parse_as_hex() {
        assert_eq!(parse_quantity(&json!("0x1a")).unwrap(), U256::from(26));
        assert_eq!(parse_quantity(&json!("0x")).unwrap(), U256::ZERO);
        assert!(parse_quantity(&json!(12)).is_err());
    }

    #[test]
    fn proxied_endpoint_builds() {
        let endpoint = Endpoint {
            id: EndpointId(0),
            name: "proxied".into(),
            rpc_url: "https://rpc.example.com".into(),
            proxy: Some(core_logic::ProxyConfig {
                url: "http://127.0.0.1:8080".into(),
                username: Some("user".into()),
                password: Some("pass".into()),
            }),
        };
        assert!(JsonRpcTransport::new(&endpoint, Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn bad_rpc_url_is_config_error() {
        let endpoint = Endpoint {
            id: EndpointId(1),
            name: "broken".into(),
            rpc_url: "not a url".into(),
            proxy: None,
        };
        let err = JsonRpcTransport::new(&endpoint, Duration::from_secs(5)).err();
        assert!(matches!(err, Some(DispatchError::Config(_))));
    }
}
