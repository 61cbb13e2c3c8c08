//! Local-key signer producing Tempo transactions (type `0x76`).
//!
//! The lane goes into the envelope's `nonce_key`, so lane 0 is the protocol
//! nonce and every other lane is an independent 2D nonce stream. Each
//! operation becomes a single-call transaction. Fees are fixed values from
//! `[signing]`; nothing here estimates gas.

use crate::config::SigningConfig;
use crate::error::DispatchError;
use crate::rpc::Signer;
use crate::types::{Lane, Operation, Owner, SignedOperation};
use alloy::rlp::{EMPTY_LIST_CODE, EMPTY_STRING_CODE, Encodable, Header};
use alloy::signers::SignerSync;
use alloy::signers::local::PrivateKeySigner;
use alloy_primitives::{Address, B256, U256, keccak256};
use core_logic::ConfigError;

pub const TEMPO_TX_TYPE: u8 = 0x76;

/// pathUSD, the default fee token on Tempo testnets.
pub const PATH_USD: Address = Address::new([
    0x20, 0xC0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00,
]);

/// Unsigned single-call Tempo transaction.
struct TempoEnvelope<'a> {
    chain_id: u64,
    signing: &'a SigningConfig,
    nonce_key: Lane,
    nonce: u64,
    call: &'a Operation,
}

impl TempoEnvelope<'_> {
    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.chain_id.encode(out);
        u128::from(self.signing.max_priority_fee_per_gas).encode(out);
        u128::from(self.signing.max_fee_per_gas).encode(out);
        self.signing.gas_limit.encode(out);

        let mut call = Vec::new();
        self.call.to.encode(&mut call);
        self.call.value.encode(&mut call);
        self.call.input.encode(&mut call);
        let mut calls = Vec::new();
        encode_list(&call, &mut calls);
        encode_list(&calls, out);

        out.push(EMPTY_LIST_CODE); // access list
        U256::from(self.nonce_key).encode(out);
        self.nonce.encode(out);
        out.push(EMPTY_STRING_CODE); // valid_before
        out.push(EMPTY_STRING_CODE); // valid_after
        match self.signing.fee_token {
            Some(token) => token.encode(out),
            None => out.push(EMPTY_STRING_CODE),
        }
        out.push(EMPTY_STRING_CODE); // fee payer signature
        out.push(EMPTY_LIST_CODE); // authorization list
    }

    fn signature_hash(&self) -> B256 {
        let mut fields = Vec::new();
        self.encode_fields(&mut fields);

        let mut buf = vec![TEMPO_TX_TYPE];
        encode_list(&fields, &mut buf);
        keccak256(&buf)
    }

    /// EIP-2718 bytes: type byte, then the fields followed by `r || s || v`.
    fn encode_signed(&self, signature: &[u8; 65]) -> Vec<u8> {
        let mut fields = Vec::new();
        self.encode_fields(&mut fields);
        signature.as_slice().encode(&mut fields);

        let mut buf = vec![TEMPO_TX_TYPE];
        encode_list(&fields, &mut buf);
        buf
    }
}

fn encode_list(payload: &[u8], out: &mut Vec<u8>) {
    Header {
        list: true,
        payload_length: payload.len(),
    }
    .encode(out);
    out.extend_from_slice(payload);
}

/// Signs with a private key held in memory.
pub struct LocalSigner {
    signer: PrivateKeySigner,
    chain_id: u64,
    signing: SigningConfig,
}

impl LocalSigner {
    pub fn new(
        private_key: &str,
        chain_id: u64,
        signing: SigningConfig,
    ) -> Result<Self, DispatchError> {
        let signer: PrivateKeySigner = private_key
            .trim()
            .parse()
            .map_err(|_| ConfigError::invalid("private key", "not a valid secp256k1 key"))?;
        Ok(Self {
            signer,
            chain_id,
            signing,
        })
    }

    /// One signer per comma-separated key, e.g. from `DISPATCH_PRIVATE_KEYS`.
    pub fn from_list(
        keys: &str,
        chain_id: u64,
        signing: &SigningConfig,
    ) -> Result<Vec<Self>, DispatchError> {
        keys.split(',')
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(|k| Self::new(k, chain_id, signing.clone()))
            .collect()
    }
}

impl std::fmt::Debug for LocalSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigner")
            .field("address", &self.signer.address())
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

impl Signer for LocalSigner {
    fn address(&self) -> Owner {
        self.signer.address()
    }

    fn sign(
        &self,
        operation: &Operation,
        lane: Lane,
        sequence: u64,
    ) -> Result<SignedOperation, DispatchError> {
        let envelope = TempoEnvelope {
            chain_id: self.chain_id,
            signing: &self.signing,
            nonce_key: lane,
            nonce: sequence,
            call: operation,
        };

        let signature = self
            .signer
            .sign_hash_sync(&envelope.signature_hash())
            .map_err(|e| DispatchError::TaskLogic(format!("signing failed: {}", e)))?;

        Ok(SignedOperation {
            owner: self.signer.address(),
            lane,
            sequence,
            operation: operation.clone(),
            raw: envelope.encode_signed(&signature.as_bytes()).into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::Signature;

    // Well-known development key
    const KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

    fn signer() -> LocalSigner {
        LocalSigner::new(KEY, 42431, SigningConfig::default()).unwrap()
    }

    fn transfer() -> Operation {
        Operation::transfer(Address::repeat_byte(0x42), U256::from(7))
    }

    #[test]
    fn address_comes_from_the_key() {
        let expected: Address = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266".parse().unwrap();
        assert_eq!(signer().address(), expected);
    }

    #[test]
    fn bad_key_is_config_error() {
        let err = LocalSigner::new("0x1234", 1, SigningConfig::default()).err();
        assert!(matches!(err, Some(DispatchError::Config(_))));
    }

    #[test]
    fn key_list_skips_blanks() {
        let keys = format!("{}, ,{}", KEY, KEY);
        let signers = LocalSigner::from_list(&keys, 1, &SigningConfig::default()).unwrap();
        assert_eq!(signers.len(), 2);
        assert!(LocalSigner::from_list("", 1, &SigningConfig::default()).unwrap().is_empty());
    }

    #[test]
    fn envelope_is_typed_and_recoverable() {
        let signer = signer();
        let op = transfer();
        let signed = signer.sign(&op, 3, 9).unwrap();
        let raw = signed.raw.as_ref();

        assert_eq!(raw[0], TEMPO_TX_TYPE);
        let mut body = &raw[1..];
        let header = Header::decode(&mut body).unwrap();
        assert!(header.list);
        assert_eq!(header.payload_length, body.len());

        // Trailing 65-byte string: r || s || v
        let sig_bytes = &raw[raw.len() - 65..];
        assert_eq!(raw[raw.len() - 66], 65);
        let signature = Signature::from_raw(sig_bytes).unwrap();

        let hash = TempoEnvelope {
            chain_id: 42431,
            signing: &SigningConfig::default(),
            nonce_key: 3,
            nonce: 9,
            call: &op,
        }
        .signature_hash();
        assert_eq!(
            signature.recover_address_from_prehash(&hash).unwrap(),
            signer.address()
        );
    }

    #[test]
    fn lane_and_chain_change_the_hash() {
        let op = transfer();
        let signing = SigningConfig::default();
        let hash = |chain_id, lane| {
            TempoEnvelope {
                chain_id,
                signing: &signing,
                nonce_key: lane,
                nonce: 0,
                call: &op,
            }
            .signature_hash()
        };

        assert_ne!(hash(42431, 0), hash(42431, 1));
        assert_ne!(hash(42431, 1), hash(1, 1));
        assert_eq!(hash(42431, 1), hash(42431, 1));
    }

    #[test]
    fn signed_operation_keeps_its_slot() {
        let signed = signer().sign(&transfer(), 0, 4).unwrap();
        assert_eq!(signed.lane, 0);
        assert_eq!(signed.sequence, 4);
        assert_eq!(signed.operation, transfer());
    }
}
