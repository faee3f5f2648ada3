//! UTXO ledger
//!
//! The authoritative balance and supply source: every unspent output keyed by
//! `(txid, vout)`, an owner index for balance queries, and the next expected
//! nonce of every sender that has spent at least once.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::consensus::Block;
use crate::crypto::{Address, Hash};
use crate::validation::{OutPoint, Transaction};
use crate::Amount;

/// Ledger mutation failures. A failed mutation leaves the ledger unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("output {0} is not in the ledger")]
    MissingOutput(OutPoint),
    #[error("output {0} already exists")]
    DuplicateOutput(OutPoint),
    #[error("output {0} has zero value")]
    ZeroAmount(OutPoint),
    #[error("undo record does not match transaction {0}")]
    UndoMismatch(Hash),
}

/// Unspent Transaction Output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Utxo {
    pub owner: Address,
    pub amount: Amount,
    pub script: Option<Vec<u8>>,
}

/// Read access to spendable outputs and sender nonces.
///
/// Implemented by [`Ledger`] and by [`LedgerOverlay`], so transaction
/// validation runs the same code against committed state or a block in
/// progress.
pub trait UtxoView {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo>;

    /// Nonce the sender's next transfer must carry
    fn next_nonce(&self, address: &Address) -> u64;

    fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxo(outpoint).is_some()
    }
}

/// Everything needed to take one transaction back out of the ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxUndo {
    pub spent: Vec<(OutPoint, Utxo)>,
    pub previous_nonce: Option<u64>,
}

/// Undo records for every transaction of a block, in block order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockUndo {
    pub txs: Vec<TxUndo>,
}

/// Canonical, sorted copy of the ledger used by checkpoints and backups
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub utxos: Vec<(OutPoint, Utxo)>,
    pub nonces: Vec<(Address, u64)>,
}

impl LedgerSnapshot {
    /// Same digest [`Ledger::snapshot_digest`] yields for the restored ledger
    pub fn digest(&self) -> Hash {
        let mut utxos: Vec<(&OutPoint, &Utxo)> = self.utxos.iter().map(|(o, u)| (o, u)).collect();
        let mut nonces: Vec<(&Address, u64)> = self.nonces.iter().map(|(a, n)| (a, *n)).collect();
        utxos.sort_by(|a, b| a.0.cmp(b.0));
        nonces.sort_by(|a, b| a.0.cmp(b.0));
        digest_sorted(&utxos, &nonces)
    }

    pub fn total_value(&self) -> Amount {
        self.utxos
            .iter()
            .fold(0u64, |acc, (_, u)| acc.saturating_add(u.amount))
    }
}

/// The UTXO set
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    utxos: HashMap<OutPoint, Utxo>,
    by_owner: HashMap<Address, HashSet<OutPoint>>,
    nonces: HashMap<Address, u64>,
    total: Amount,
}

impl Ledger {
    /// Create a new empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an output. Returns false on a duplicate key or a zero amount.
    pub fn add_utxo(
        &mut self,
        owner: Address,
        txid: Hash,
        vout: u32,
        amount: Amount,
        script: Option<Vec<u8>>,
    ) -> bool {
        let outpoint = OutPoint::new(txid, vout);
        if amount == 0 || self.utxos.contains_key(&outpoint) {
            return false;
        }
        self.insert(outpoint, Utxo { owner, amount, script });
        true
    }

    /// Remove an output. Returns false if it is absent.
    pub fn remove_utxo(&mut self, txid: Hash, vout: u32) -> bool {
        self.take(&OutPoint::new(txid, vout)).is_some()
    }

    pub fn utxo_exists(&self, txid: Hash, vout: u32) -> bool {
        self.utxos.contains_key(&OutPoint::new(txid, vout))
    }

    pub fn get(&self, outpoint: &OutPoint) -> Option<&Utxo> {
        self.utxos.get(outpoint)
    }

    /// Sum over the address's unspent outputs
    pub fn get_balance(&self, address: &Address) -> Amount {
        self.by_owner
            .get(address)
            .map(|set| {
                set.iter()
                    .filter_map(|op| self.utxos.get(op))
                    .fold(0u64, |acc, u| acc.saturating_add(u.amount))
            })
            .unwrap_or(0)
    }

    /// Outputs owned by `address`, sorted by outpoint
    pub fn outputs_of(&self, address: &Address) -> Vec<(OutPoint, &Utxo)> {
        let mut outputs: Vec<(OutPoint, &Utxo)> = self
            .by_owner
            .get(address)
            .map(|set| {
                set.iter()
                    .filter_map(|op| self.utxos.get(op).map(|u| (*op, u)))
                    .collect()
            })
            .unwrap_or_default();
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        outputs
    }

    /// Circulating supply
    pub fn get_total_unspent_value(&self) -> Amount {
        self.total
    }

    /// Get total number of UTXOs
    pub fn len(&self) -> usize {
        self.utxos.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.utxos.is_empty()
    }

    /// Deterministic digest over a sorted serialization of every entry
    pub fn snapshot_digest(&self) -> Hash {
        let mut utxos: Vec<(&OutPoint, &Utxo)> = self.utxos.iter().collect();
        let mut nonces: Vec<(&Address, u64)> = self.nonces.iter().map(|(a, n)| (a, *n)).collect();
        utxos.sort_by(|a, b| a.0.cmp(b.0));
        nonces.sort_by(|a, b| a.0.cmp(b.0));
        digest_sorted(&utxos, &nonces)
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let mut utxos: Vec<(OutPoint, Utxo)> =
            self.utxos.iter().map(|(o, u)| (*o, u.clone())).collect();
        let mut nonces: Vec<(Address, u64)> =
            self.nonces.iter().map(|(a, n)| (a.clone(), *n)).collect();
        utxos.sort_by(|a, b| a.0.cmp(&b.0));
        nonces.sort_by(|a, b| a.0.cmp(&b.0));
        LedgerSnapshot { utxos, nonces }
    }

    pub fn from_snapshot(snapshot: &LedgerSnapshot) -> Result<Self, LedgerError> {
        let mut ledger = Ledger::new();
        for (outpoint, utxo) in &snapshot.utxos {
            if utxo.amount == 0 {
                return Err(LedgerError::ZeroAmount(*outpoint));
            }
            if ledger.utxos.contains_key(outpoint) {
                return Err(LedgerError::DuplicateOutput(*outpoint));
            }
            ledger.insert(*outpoint, utxo.clone());
        }
        for (address, nonce) in &snapshot.nonces {
            if *nonce > 0 {
                ledger.nonces.insert(address.clone(), *nonce);
            }
        }
        Ok(ledger)
    }

    /// Apply a transaction: spend its inputs (not for coinbase), create its
    /// outputs, bump the sender's nonce. All-or-nothing.
    pub fn apply_transaction(&mut self, tx: &Transaction) -> Result<TxUndo, LedgerError> {
        let txid = tx.txid();

        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if !self.utxos.contains_key(input) {
                    return Err(LedgerError::MissingOutput(*input));
                }
            }
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            let outpoint = OutPoint::new(txid, vout as u32);
            if self.utxos.contains_key(&outpoint) {
                return Err(LedgerError::DuplicateOutput(outpoint));
            }
            if output.amount == 0 && !tx.is_coinbase() {
                return Err(LedgerError::ZeroAmount(outpoint));
            }
        }

        let mut spent = Vec::with_capacity(tx.inputs.len());
        let mut previous_nonce = None;
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if let Some(utxo) = self.take(input) {
                    spent.push((*input, utxo));
                }
            }
            let sender = tx.sender_address();
            let current = self.next_nonce(&sender);
            previous_nonce = Some(current);
            self.nonces.insert(sender, current + 1);
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            // a zero-value coinbase (exhausted schedule, no fees) creates nothing
            if output.amount == 0 {
                continue;
            }
            self.insert(
                OutPoint::new(txid, vout as u32),
                Utxo {
                    owner: output.owner.clone(),
                    amount: output.amount,
                    script: output.script.clone(),
                },
            );
        }

        Ok(TxUndo {
            spent,
            previous_nonce,
        })
    }

    /// Revert a transaction: remove its outputs, restore spent outputs and
    /// the sender's nonce.
    pub fn revert_transaction(&mut self, tx: &Transaction, undo: &TxUndo) -> Result<(), LedgerError> {
        let txid = tx.txid();
        if undo.spent.len() != if tx.is_coinbase() { 0 } else { tx.inputs.len() } {
            return Err(LedgerError::UndoMismatch(txid));
        }
        for (outpoint, _) in &undo.spent {
            if self.utxos.contains_key(outpoint) {
                return Err(LedgerError::DuplicateOutput(*outpoint));
            }
        }

        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.amount > 0 {
                self.take(&OutPoint::new(txid, vout as u32));
            }
        }
        for (outpoint, utxo) in &undo.spent {
            self.insert(*outpoint, utxo.clone());
        }

        if let Some(previous) = undo.previous_nonce {
            let sender = tx.sender_address();
            if previous == 0 {
                self.nonces.remove(&sender);
            } else {
                self.nonces.insert(sender, previous);
            }
        }
        Ok(())
    }

    /// Apply every transaction of a block in order. On failure the already
    /// applied prefix is reverted and the ledger is left as it was.
    pub fn apply_block(&mut self, block: &Block) -> Result<BlockUndo, LedgerError> {
        let mut undo = BlockUndo::default();
        for tx in &block.transactions {
            match self.apply_transaction(tx) {
                Ok(tx_undo) => undo.txs.push(tx_undo),
                Err(err) => {
                    let applied = &block.transactions[..undo.txs.len()];
                    for (tx, tx_undo) in applied.iter().zip(undo.txs.iter()).rev() {
                        // reverting what we just applied cannot conflict
                        let _ = self.revert_transaction(tx, tx_undo);
                    }
                    return Err(err);
                }
            }
        }
        Ok(undo)
    }

    /// Undo a block previously applied with [`Ledger::apply_block`]
    pub fn revert_block(&mut self, block: &Block, undo: &BlockUndo) -> Result<(), LedgerError> {
        if undo.txs.len() != block.transactions.len() {
            return Err(LedgerError::UndoMismatch(block.hash()));
        }
        for (tx, tx_undo) in block.transactions.iter().zip(undo.txs.iter()).rev() {
            self.revert_transaction(tx, tx_undo)?;
        }
        Ok(())
    }

    fn insert(&mut self, outpoint: OutPoint, utxo: Utxo) {
        self.total = self.total.saturating_add(utxo.amount);
        self.by_owner
            .entry(utxo.owner.clone())
            .or_default()
            .insert(outpoint);
        self.utxos.insert(outpoint, utxo);
    }

    fn take(&mut self, outpoint: &OutPoint) -> Option<Utxo> {
        let utxo = self.utxos.remove(outpoint)?;
        self.total = self.total.saturating_sub(utxo.amount);
        if let Some(set) = self.by_owner.get_mut(&utxo.owner) {
            set.remove(outpoint);
            if set.is_empty() {
                self.by_owner.remove(&utxo.owner);
            }
        }
        Some(utxo)
    }
}

impl UtxoView for Ledger {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.utxos.get(outpoint).cloned()
    }

    fn next_nonce(&self, address: &Address) -> u64 {
        self.nonces.get(address).copied().unwrap_or(0)
    }

    fn contains(&self, outpoint: &OutPoint) -> bool {
        self.utxos.contains_key(outpoint)
    }
}

/// Copy-on-write view over a ledger.
///
/// Records the spends, creations and nonce bumps of transactions applied on
/// top of `base` without touching it.
#[derive(Debug)]
pub struct LedgerOverlay<'a> {
    base: &'a Ledger,
    spent: HashSet<OutPoint>,
    created: HashMap<OutPoint, Utxo>,
    nonces: HashMap<Address, u64>,
}

impl<'a> LedgerOverlay<'a> {
    pub fn new(base: &'a Ledger) -> Self {
        Self {
            base,
            spent: HashSet::new(),
            created: HashMap::new(),
            nonces: HashMap::new(),
        }
    }

    /// Record a transaction that has already been validated against `self`
    pub fn apply(&mut self, tx: &Transaction) {
        let txid = tx.txid();
        if !tx.is_coinbase() {
            for input in &tx.inputs {
                if self.created.remove(input).is_none() {
                    self.spent.insert(*input);
                }
            }
            let sender = tx.sender_address();
            let next = self.next_nonce(&sender) + 1;
            self.nonces.insert(sender, next);
        }
        for (vout, output) in tx.outputs.iter().enumerate() {
            if output.amount == 0 {
                continue;
            }
            self.created.insert(
                OutPoint::new(txid, vout as u32),
                Utxo {
                    owner: output.owner.clone(),
                    amount: output.amount,
                    script: output.script.clone(),
                },
            );
        }
    }
}

impl UtxoView for LedgerOverlay<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        if let Some(utxo) = self.created.get(outpoint) {
            return Some(utxo.clone());
        }
        if self.spent.contains(outpoint) {
            return None;
        }
        self.base.utxo(outpoint)
    }

    fn next_nonce(&self, address: &Address) -> u64 {
        self.nonces
            .get(address)
            .copied()
            .unwrap_or_else(|| self.base.next_nonce(address))
    }
}

fn digest_sorted(utxos: &[(&OutPoint, &Utxo)], nonces: &[(&Address, u64)]) -> Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"utxo");
    hasher.update(&(utxos.len() as u64).to_le_bytes());
    for (outpoint, utxo) in utxos {
        hasher.update(&outpoint.txid.0);
        hasher.update(&outpoint.vout.to_le_bytes());
        hasher.update(&(utxo.owner.as_str().len() as u32).to_le_bytes());
        hasher.update(utxo.owner.as_str().as_bytes());
        hasher.update(&utxo.amount.to_le_bytes());
        match &utxo.script {
            Some(script) => {
                hasher.update(&[1]);
                hasher.update(&(script.len() as u32).to_le_bytes());
                hasher.update(script);
            }
            None => {
                hasher.update(&[0]);
            }
        }
    }
    hasher.update(b"nonce");
    hasher.update(&(nonces.len() as u64).to_le_bytes());
    for (address, nonce) in nonces {
        hasher.update(&(address.as_str().len() as u32).to_le_bytes());
        hasher.update(address.as_str().as_bytes());
        hasher.update(&nonce.to_le_bytes());
    }
    Hash(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{hash_bytes, PrivateKey};
    use crate::validation::TxOutput;

    fn make_hash(s: &str) -> Hash {
        hash_bytes(s.as_bytes())
    }

    #[test]
    fn test_add_then_balance_then_remove() {
        let mut ledger = Ledger::new();
        let addr = Address::new("LNaddr");

        assert!(ledger.add_utxo(addr.clone(), make_hash("t1"), 0, 10, None));
        assert_eq!(ledger.get_balance(&addr), 10);

        assert!(ledger.remove_utxo(make_hash("t1"), 0));
        assert_eq!(ledger.get_balance(&addr), 0);
        assert_eq!(ledger.get_total_unspent_value(), 0);
    }

    #[test]
    fn test_duplicate_and_zero_rejected() {
        let mut ledger = Ledger::new();
        let addr = Address::new("LNaddr");

        assert!(ledger.add_utxo(addr.clone(), make_hash("t1"), 0, 10, None));
        let digest = ledger.snapshot_digest();

        assert!(!ledger.add_utxo(addr.clone(), make_hash("t1"), 0, 99, None));
        assert!(!ledger.add_utxo(addr.clone(), make_hash("t2"), 0, 0, None));
        assert!(!ledger.remove_utxo(make_hash("missing"), 0));

        assert_eq!(ledger.snapshot_digest(), digest);
        assert_eq!(ledger.get_balance(&addr), 10);
    }

    #[test]
    fn test_digest_is_order_independent() {
        let mut a = Ledger::new();
        let mut b = Ledger::new();
        for i in 0..20u32 {
            a.add_utxo(Address::new("LNx"), make_hash("t"), i, 1 + i as u64, None);
        }
        for i in (0..20u32).rev() {
            b.add_utxo(Address::new("LNx"), make_hash("t"), i, 1 + i as u64, None);
        }
        assert_eq!(a.snapshot_digest(), b.snapshot_digest());

        b.remove_utxo(make_hash("t"), 3);
        assert_ne!(a.snapshot_digest(), b.snapshot_digest());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let mut ledger = Ledger::new();
        ledger.add_utxo(Address::new("LNa"), make_hash("a"), 0, 5, Some(vec![1, 2]));
        ledger.add_utxo(Address::new("LNb"), make_hash("b"), 1, 7, None);

        let snapshot = ledger.snapshot();
        assert_eq!(snapshot.digest(), ledger.snapshot_digest());
        assert_eq!(snapshot.total_value(), 12);

        let restored = Ledger::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.snapshot_digest(), ledger.snapshot_digest());
        assert_eq!(restored.get_balance(&Address::new("LNb")), 7);
    }

    #[test]
    fn test_apply_coinbase() {
        let mut ledger = Ledger::new();
        let miner = Address::new("LNminer");
        let coinbase = Transaction::coinbase(1, miner.clone(), 5000);

        let undo = ledger.apply_transaction(&coinbase).unwrap();
        assert!(undo.spent.is_empty());
        assert!(ledger.utxo_exists(coinbase.txid(), 0));
        assert_eq!(ledger.get_balance(&miner), 5000);
    }

    #[test]
    fn test_apply_and_revert_transfer() {
        let key = PrivateKey::generate();
        let owner = key.public_key().to_address();
        let mut ledger = Ledger::new();
        ledger.add_utxo(owner.clone(), make_hash("fund"), 0, 1000, None);
        let before = ledger.snapshot_digest();

        let tx = Transaction::transfer(
            key.public_key(),
            vec![OutPoint::new(make_hash("fund"), 0)],
            vec![
                TxOutput::new(Address::new("LNdest"), 700),
                TxOutput::new(owner.clone(), 290),
            ],
            10,
            0,
        )
        .signed(&key);

        let undo = ledger.apply_transaction(&tx).unwrap();
        assert_eq!(ledger.get_balance(&owner), 290);
        assert_eq!(ledger.next_nonce(&owner), 1);
        assert_eq!(ledger.get_total_unspent_value(), 990);

        ledger.revert_transaction(&tx, &undo).unwrap();
        assert_eq!(ledger.snapshot_digest(), before);
        assert_eq!(ledger.next_nonce(&owner), 0);
    }

    #[test]
    fn test_failed_apply_leaves_ledger_unchanged() {
        let key = PrivateKey::generate();
        let mut ledger = Ledger::new();
        ledger.add_utxo(key.public_key().to_address(), make_hash("fund"), 0, 1000, None);
        let before = ledger.snapshot_digest();

        let tx = Transaction::transfer(
            key.public_key(),
            vec![OutPoint::new(make_hash("fund"), 0), OutPoint::new(make_hash("ghost"), 0)],
            vec![TxOutput::new(Address::new("LNdest"), 700)],
            10,
            0,
        );
        assert!(matches!(
            ledger.apply_transaction(&tx),
            Err(LedgerError::MissingOutput(_))
        ));
        assert_eq!(ledger.snapshot_digest(), before);
    }

    #[test]
    fn test_overlay_tracks_chained_spends() {
        let key = PrivateKey::generate();
        let owner = key.public_key().to_address();
        let mut ledger = Ledger::new();
        ledger.add_utxo(owner.clone(), make_hash("fund"), 0, 1000, None);

        let first = Transaction::transfer(
            key.public_key(),
            vec![OutPoint::new(make_hash("fund"), 0)],
            vec![TxOutput::new(owner.clone(), 990)],
            10,
            0,
        );
        let mut overlay = LedgerOverlay::new(&ledger);
        overlay.apply(&first);

        assert!(overlay.utxo(&OutPoint::new(make_hash("fund"), 0)).is_none());
        assert_eq!(overlay.utxo(&OutPoint::new(first.txid(), 0)).unwrap().amount, 990);
        assert_eq!(overlay.next_nonce(&owner), 1);

        // base untouched
        assert!(ledger.utxo_exists(make_hash("fund"), 0));
        assert_eq!(ledger.next_nonce(&owner), 0);
    }
}
