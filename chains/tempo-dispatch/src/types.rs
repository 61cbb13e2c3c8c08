//! Shared data model: owners, lanes, operations and outcomes.

use crate::error::ErrorClass;
use alloy_primitives::{Address, B256, Bytes, U256};
use serde::Serialize;
use std::fmt;

/// A signing identity whose operations consume sequence numbers.
pub type Owner = Address;

/// Independent sequence stream of an owner. Lane 0 is the protocol nonce.
pub type Lane = u64;

/// Identifier of a submitted operation.
pub type TxHash = B256;

/// The canonical, chained sequence stream.
pub const PROTOCOL_LANE: Lane = 0;

/// Unsigned call payload handed to a [`Signer`](crate::rpc::Signer).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub to: Address,
    pub input: Bytes,
    pub value: U256,
}

impl Operation {
    pub fn call(to: Address, input: impl Into<Bytes>) -> Self {
        Self {
            to,
            input: input.into(),
            value: U256::ZERO,
        }
    }

    pub fn transfer(to: Address, value: U256) -> Self {
        Self {
            to,
            input: Bytes::new(),
            value,
        }
    }
}

/// An operation bound to its (owner, lane, sequence) slot and signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedOperation {
    pub owner: Owner,
    pub lane: Lane,
    pub sequence: u64,
    pub operation: Operation,
    /// Wire encoding submitted to the node.
    pub raw: Bytes,
}

/// Final state of a submitted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Finality {
    Success,
    Reverted,
}

/// Result of one task run or one dispatched submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Outcome {
    pub success: bool,
    pub message: String,
    pub tx_hash: Option<TxHash>,
    pub error: Option<ErrorClass>,
}

impl Outcome {
    pub fn success(message: impl Into<String>, tx_hash: Option<TxHash>) -> Self {
        Self {
            success: true,
            message: message.into(),
            tx_hash,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, class: ErrorClass) -> Self {
        Self {
            success: false,
            message: message.into(),
            tx_hash: None,
            error: Some(class),
        }
    }
}

/// Index of an endpoint in the configured endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EndpointId(pub usize);

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep-{:03}", self.0)
    }
}
