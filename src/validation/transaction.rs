//! Transaction structure and validation
//!
//! UTXO-based transactions with Schnorr signatures and per-sender nonces.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;

use crate::constants::{MAX_TX_SIZE, PROTOCOL_VERSION};
use crate::crypto::{hash_bytes, Address, Hash, PrivateKey, PublicKey, SchnorrSignature};
use crate::storage::UtxoView;
use crate::Amount;

/// Reasons a transaction is malformed or invalid against a ledger view
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TxError {
    #[error("unsupported transaction version {0}")]
    UnsupportedVersion(u32),
    #[error("transfer has no inputs")]
    NoInputs,
    #[error("transaction has no outputs")]
    NoOutputs,
    #[error("output {vout} has zero value")]
    ZeroValueOutput { vout: u32 },
    #[error("input {0} is referenced twice")]
    DuplicateInput(OutPoint),
    #[error("first output does not pay the declared recipient and amount")]
    RecipientMismatch,
    #[error("sender public key is not a valid curve point")]
    InvalidSenderKey,
    #[error("malformed coinbase: {0}")]
    MalformedCoinbase(&'static str),
    #[error("transaction is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("amount overflow")]
    Overflow,
    #[error("input {0} does not exist")]
    MissingInput(OutPoint),
    #[error("input {0} is not owned by the sender")]
    NotOwner(OutPoint),
    #[error("insufficient funds: inputs {available}, outputs plus fee {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("bad nonce: expected {expected}, got {got}")]
    BadNonce { expected: u64, got: u64 },
    #[error("invalid signature")]
    InvalidSignature,
}

/// Reference to an output of a previous transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub txid: Hash,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: Hash, vout: u32) -> Self {
        Self { txid, vout }
    }
}

impl fmt::Display for OutPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid.short(), self.vout)
    }
}

/// A transaction output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Owner of the output
    pub owner: Address,
    /// Amount in base units
    pub amount: Amount,
    /// Optional locking script, carried opaquely
    pub script: Option<Vec<u8>>,
}

impl TxOutput {
    pub fn new(owner: Address, amount: Amount) -> Self {
        Self {
            owner,
            amount,
            script: None,
        }
    }
}

/// Transaction kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    /// Block reward plus collected fees; the height keeps coinbase ids unique
    Coinbase { height: u64 },
    /// Spend of existing outputs
    Transfer,
}

/// A complete transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u32,
    pub kind: TxKind,
    /// Signing key of the spender (zero for coinbase)
    pub sender: PublicKey,
    pub recipient: Address,
    pub amount: Amount,
    pub fee: Amount,
    pub nonce: u64,
    pub inputs: Vec<OutPoint>,
    pub outputs: Vec<TxOutput>,
    pub signature: SchnorrSignature,
}

impl Transaction {
    /// Create a coinbase transaction (mining reward plus fees)
    pub fn coinbase(height: u64, recipient: Address, amount: Amount) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            kind: TxKind::Coinbase { height },
            sender: PublicKey::zero(),
            recipient: recipient.clone(),
            amount,
            fee: 0,
            nonce: 0,
            inputs: vec![],
            outputs: vec![TxOutput::new(recipient, amount)],
            signature: SchnorrSignature::empty(),
        }
    }

    /// Create an unsigned transfer. The first output is the payment; any
    /// further outputs are change or additional payees.
    pub fn transfer(
        sender: PublicKey,
        inputs: Vec<OutPoint>,
        outputs: Vec<TxOutput>,
        fee: Amount,
        nonce: u64,
    ) -> Self {
        let (recipient, amount) = outputs
            .first()
            .map(|o| (o.owner.clone(), o.amount))
            .unwrap_or_else(|| (Address::new(""), 0));

        Self {
            version: PROTOCOL_VERSION,
            kind: TxKind::Transfer,
            sender,
            recipient,
            amount,
            fee,
            nonce,
            inputs,
            outputs,
            signature: SchnorrSignature::empty(),
        }
    }

    /// Sign with the sender's key, consuming and returning the transaction
    pub fn signed(mut self, key: &PrivateKey) -> Self {
        self.signature = key.sign(&self.txid());
        self
    }

    /// Check if this is a coinbase transaction
    pub fn is_coinbase(&self) -> bool {
        matches!(self.kind, TxKind::Coinbase { .. })
    }

    /// Content hash over every field except the signature
    pub fn txid(&self) -> Hash {
        hash_bytes(&self.signing_bytes())
    }

    /// Address the spent inputs must belong to
    pub fn sender_address(&self) -> Address {
        self.sender.to_address()
    }

    fn signing_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(256);
        bytes.extend_from_slice(&self.version.to_le_bytes());
        match self.kind {
            TxKind::Coinbase { height } => {
                bytes.push(0);
                bytes.extend_from_slice(&height.to_le_bytes());
            }
            TxKind::Transfer => bytes.push(1),
        }
        bytes.extend_from_slice(&self.sender.0);
        put_str(&mut bytes, self.recipient.as_str());
        bytes.extend_from_slice(&self.amount.to_le_bytes());
        bytes.extend_from_slice(&self.fee.to_le_bytes());
        bytes.extend_from_slice(&self.nonce.to_le_bytes());

        bytes.extend_from_slice(&(self.inputs.len() as u32).to_le_bytes());
        for input in &self.inputs {
            bytes.extend_from_slice(&input.txid.0);
            bytes.extend_from_slice(&input.vout.to_le_bytes());
        }

        bytes.extend_from_slice(&(self.outputs.len() as u32).to_le_bytes());
        for output in &self.outputs {
            put_str(&mut bytes, output.owner.as_str());
            bytes.extend_from_slice(&output.amount.to_le_bytes());
            match &output.script {
                Some(script) => {
                    bytes.push(1);
                    bytes.extend_from_slice(&(script.len() as u32).to_le_bytes());
                    bytes.extend_from_slice(script);
                }
                None => bytes.push(0),
            }
        }
        bytes
    }

    /// Serialized size in bytes
    pub fn size(&self) -> usize {
        bincode::serialized_size(self)
            .map(|s| s as usize)
            .unwrap_or(usize::MAX)
    }

    /// Calculate total output value
    pub fn total_output_value(&self) -> Option<Amount> {
        self.outputs
            .iter()
            .try_fold(0u64, |acc, o| acc.checked_add(o.amount))
    }

    /// Verify the sender's signature over the txid
    pub fn verify_signature(&self) -> bool {
        if self.is_coinbase() {
            return true;
        }
        self.sender.verify(&self.txid(), &self.signature)
    }

    /// Context-free checks: shape, sizes, values, key validity
    pub fn check_structure(&self) -> Result<(), TxError> {
        if self.version != PROTOCOL_VERSION {
            return Err(TxError::UnsupportedVersion(self.version));
        }

        let size = self.size();
        if size > MAX_TX_SIZE {
            return Err(TxError::TooLarge {
                size,
                max: MAX_TX_SIZE,
            });
        }

        if self.outputs.is_empty() {
            return Err(TxError::NoOutputs);
        }
        for (vout, output) in self.outputs.iter().enumerate() {
            if output.amount == 0 && !self.is_coinbase() {
                return Err(TxError::ZeroValueOutput { vout: vout as u32 });
            }
        }
        self.total_output_value().ok_or(TxError::Overflow)?;

        let first = &self.outputs[0];
        if first.owner != self.recipient || first.amount != self.amount {
            return Err(TxError::RecipientMismatch);
        }

        match self.kind {
            TxKind::Coinbase { .. } => {
                if !self.inputs.is_empty() {
                    return Err(TxError::MalformedCoinbase("coinbase spends inputs"));
                }
                if self.outputs.len() != 1 {
                    return Err(TxError::MalformedCoinbase("coinbase must have one output"));
                }
                if self.fee != 0 || self.nonce != 0 || !self.sender.is_zero() {
                    return Err(TxError::MalformedCoinbase("coinbase carries sender fields"));
                }
            }
            TxKind::Transfer => {
                if self.inputs.is_empty() {
                    return Err(TxError::NoInputs);
                }
                let mut seen = HashSet::with_capacity(self.inputs.len());
                for input in &self.inputs {
                    if !seen.insert(*input) {
                        return Err(TxError::DuplicateInput(*input));
                    }
                }
                if !self.sender.is_valid() {
                    return Err(TxError::InvalidSenderKey);
                }
            }
        }
        Ok(())
    }

    /// Inputs not present in `view`
    pub fn missing_inputs<V: UtxoView + ?Sized>(&self, view: &V) -> Vec<OutPoint> {
        self.inputs
            .iter()
            .filter(|input| view.utxo(input).is_none())
            .copied()
            .collect()
    }

    /// Full contextual validation of a transfer against a ledger view.
    ///
    /// Returns the fee. Coinbase transactions are checked by the block
    /// validator, not here.
    pub fn validate_against<V: UtxoView + ?Sized>(&self, view: &V) -> Result<Amount, TxError> {
        self.check_structure()?;
        if self.is_coinbase() {
            return Err(TxError::MalformedCoinbase("coinbase outside block context"));
        }

        let sender_address = self.sender_address();
        let mut input_value: Amount = 0;
        for input in &self.inputs {
            let utxo = view.utxo(input).ok_or(TxError::MissingInput(*input))?;
            if utxo.owner != sender_address {
                return Err(TxError::NotOwner(*input));
            }
            input_value = input_value.checked_add(utxo.amount).ok_or(TxError::Overflow)?;
        }

        let required = self
            .total_output_value()
            .and_then(|v| v.checked_add(self.fee))
            .ok_or(TxError::Overflow)?;
        if input_value < required {
            return Err(TxError::InsufficientFunds {
                available: input_value,
                required,
            });
        }

        let expected = view.next_nonce(&sender_address);
        if self.nonce != expected {
            return Err(TxError::BadNonce {
                expected,
                got: self.nonce,
            });
        }

        if !self.verify_signature() {
            return Err(TxError::InvalidSignature);
        }

        Ok(self.fee)
    }
}

fn put_str(bytes: &mut Vec<u8>, s: &str) {
    bytes.extend_from_slice(&(s.len() as u32).to_le_bytes());
    bytes.extend_from_slice(s.as_bytes());
}
