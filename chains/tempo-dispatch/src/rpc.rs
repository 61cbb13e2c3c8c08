//! Remote boundary consumed by the engine.
//!
//! The engine needs exactly four things from a chain: read an owner's
//! sequence for a lane, read how many lanes are authorized, submit a signed
//! operation, and poll for finality. [`RemoteRpc`] is that seam; the HTTP
//! implementation lives in [`crate::jsonrpc`] and the in-memory one in
//! [`crate::sim`].

use crate::error::DispatchError;
use crate::types::{EndpointId, Finality, Lane, Operation, Owner, SignedOperation, TxHash};
use alloy_primitives::{Address, U256};
use async_trait::async_trait;
use core_logic::ProxyConfig;
use std::sync::Arc;

#[async_trait]
pub trait RemoteRpc: Send + Sync {
    /// Next unused sequence of `owner` on `lane`, as the chain sees it.
    async fn sequence(&self, owner: Owner, lane: Lane) -> Result<u64, DispatchError>;

    /// Number of authorized lanes; lanes `1..=count` are usable.
    async fn authorized_lanes(&self, owner: Owner) -> Result<u64, DispatchError>;

    async fn submit(&self, operation: &SignedOperation) -> Result<TxHash, DispatchError>;

    /// `None` while the operation is still pending.
    async fn poll(&self, tx_hash: TxHash) -> Result<Option<Finality>, DispatchError>;
}

/// Holds an owner's key. Signing itself is outside the engine.
pub trait Signer: Send + Sync {
    fn address(&self) -> Owner;

    fn sign(
        &self,
        operation: &Operation,
        lane: Lane,
        sequence: u64,
    ) -> Result<SignedOperation, DispatchError>;
}

/// Builds a transport for an endpoint. Called once per endpoint, the pool
/// caches the result.
pub trait TransportFactory: Send + Sync {
    fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteRpc>, DispatchError>;
}

/// A route to the chain: an RPC URL, optionally behind a proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub id: EndpointId,
    pub name: String,
    pub rpc_url: String,
    pub proxy: Option<ProxyConfig>,
}

// ============================================================================
// Nonce precompile / account keychain encoding
// ============================================================================

/// Precompile exposing 2D nonces: `nonce(address,uint256)`.
pub const NONCE_PRECOMPILE: Address = Address::new([
    0x4E, 0x4F, 0x4E, 0x43, 0x45, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
]);

/// Account keychain, where extra nonce keys are authorized.
pub const ACCOUNT_KEYCHAIN: Address = Address::new([
    0x4B, 0x41, 0x43, 0x4F, 0x55, 0x4E, 0x54, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
]);

/// `nonce(address,uint256)`
pub const NONCE_SELECTOR: [u8; 4] = [0x27, 0xfc, 0xba, 0xcf];
/// `nonceKeyCount(address)`
pub const NONCE_KEY_COUNT_SELECTOR: [u8; 4] = [0x6a, 0x16, 0x65, 0x88];
/// `authorizeNonceKey(uint256)`
pub const AUTHORIZE_NONCE_KEY_SELECTOR: [u8; 4] = [0xc8, 0x84, 0x4e, 0x62];

fn push_address(data: &mut Vec<u8>, address: Address) {
    data.extend_from_slice(&[0u8; 12]);
    data.extend_from_slice(address.as_slice());
}

fn push_word(data: &mut Vec<u8>, value: u64) {
    data.extend_from_slice(&U256::from(value).to_be_bytes::<32>());
}

pub fn encode_nonce_call(owner: Owner, lane: Lane) -> Vec<u8> {
    let mut data = Vec::with_capacity(68);
    data.extend_from_slice(&NONCE_SELECTOR);
    push_address(&mut data, owner);
    push_word(&mut data, lane);
    data
}

pub fn encode_lane_count_call(owner: Owner) -> Vec<u8> {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&NONCE_KEY_COUNT_SELECTOR);
    push_address(&mut data, owner);
    data
}

/// The keychain call that authorizes `lane` for the signing owner.
pub fn authorize_lane_operation(lane: Lane) -> Operation {
    let mut data = Vec::with_capacity(36);
    data.extend_from_slice(&AUTHORIZE_NONCE_KEY_SELECTOR);
    push_word(&mut data, lane);
    Operation::call(ACCOUNT_KEYCHAIN, data)
}

/// Inverse of [`authorize_lane_operation`]; `None` for any other call.
pub fn decode_authorize_lane(operation: &Operation) -> Option<Lane> {
    let input = operation.input.as_ref();
    if operation.to != ACCOUNT_KEYCHAIN
        || input.len() != 36
        || input[..4] != AUTHORIZE_NONCE_KEY_SELECTOR
    {
        return None;
    }
    let word = U256::from_be_slice(&input[4..36]);
    u64::try_from(word).ok()
}
