//! Pending transaction pool
//!
//! Admission runs every rule in a fixed order and answers with a typed
//! reason. Pending transactions may spend outputs of earlier pending
//! transactions; transactions whose inputs are unknown wait in the orphan
//! pool until a block or another admission supplies them.

use lru::LruCache;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::num::NonZeroUsize;
use thiserror::Error;
use tracing::{debug, info};

use crate::chain::ChainState;
use crate::config::MempoolConfig;
use crate::consensus::Block;
use crate::crypto::{Address, Hash};
use crate::mempool::OrphanTxPool;
use crate::storage::{Ledger, Utxo, UtxoView};
use crate::validation::{OutPoint, Transaction, TxError};
use crate::{unix_now, Amount};

/// Lifecycle of a transaction as seen by the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Pending,
    Orphan,
    Confirmed,
    Expired,
}

/// Accepted outcome of an admission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Pending,
    /// Held until these outputs become known
    Orphaned { missing: Vec<OutPoint> },
}

/// Why a transaction was turned away
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("transaction {0} is already known")]
    Duplicate(Hash),
    #[error("transaction {0} is already confirmed")]
    AlreadyConfirmed(Hash),
    #[error("coinbase transactions are only valid inside blocks")]
    Coinbase,
    #[error("transaction is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("malformed transaction: {0}")]
    Malformed(#[source] TxError),
    #[error("output {vout} pays {amount}, below the dust threshold {threshold}")]
    Dust { vout: u32, amount: Amount, threshold: Amount },
    #[error("sender {sender} already has {limit} pending transactions")]
    TooManyPending { sender: Address, limit: usize },
    #[error("input {outpoint} is already spent by pending transaction {claimed_by}")]
    DoubleSpend { outpoint: OutPoint, claimed_by: Hash },
    #[error("input {0} was already spent on chain")]
    SpentOnChain(OutPoint),
    #[error("input {0} is not owned by the sender")]
    NotOwner(OutPoint),
    #[error("insufficient funds: inputs {available}, outputs plus fee {required}")]
    InsufficientFunds { available: Amount, required: Amount },
    #[error("nonce {got} is below the next expected nonce {expected}")]
    NonceTooLow { expected: u64, got: u64 },
    #[error("nonce {got} is more than {max_gap} past the next expected nonce {expected}")]
    NonceTooHigh { expected: u64, got: u64, max_gap: u64 },
    #[error("nonce {nonce} is already used by pending transaction {by}")]
    NonceInUse { nonce: u64, by: Hash },
    #[error("invalid signature")]
    InvalidSignature,
    #[error("mempool is full ({capacity} transactions)")]
    PoolFull { capacity: usize },
}

/// Committed state admissions are checked against
pub trait ChainView {
    fn ledger(&self) -> &Ledger;

    /// Whether `txid` sits in a canonical block
    fn is_confirmed(&self, txid: &Hash) -> bool;
}

impl ChainView for Ledger {
    fn ledger(&self) -> &Ledger {
        self
    }

    // a bare ledger keeps no transaction history
    fn is_confirmed(&self, _txid: &Hash) -> bool {
        false
    }
}

impl ChainView for ChainState {
    fn ledger(&self) -> &Ledger {
        ChainState::ledger(self)
    }

    fn is_confirmed(&self, txid: &Hash) -> bool {
        self.find_transaction(txid).is_some()
    }
}

/// What a chain event did to the pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolRefresh {
    pub confirmed: usize,
    pub resurrected: usize,
    /// Pending transactions no longer valid against the new ledger
    pub evicted: usize,
    pub promoted: usize,
}

#[derive(Debug, Clone)]
struct PoolEntry {
    tx: Transaction,
    fee: Amount,
    received: u64,
    seq: u64,
}

/// Committed ledger plus the outputs pending transactions create
struct PoolView<'a> {
    ledger: &'a Ledger,
    created: &'a HashMap<OutPoint, Utxo>,
}

impl UtxoView for PoolView<'_> {
    fn utxo(&self, outpoint: &OutPoint) -> Option<Utxo> {
        self.ledger
            .utxo(outpoint)
            .or_else(|| self.created.get(outpoint).cloned())
    }

    fn next_nonce(&self, address: &Address) -> u64 {
        self.ledger.next_nonce(address)
    }
}

pub struct Mempool {
    config: MempoolConfig,
    pending: HashMap<Hash, PoolEntry>,
    /// Input -> pending transaction spending it
    spent_by: HashMap<OutPoint, Hash>,
    created: HashMap<OutPoint, Utxo>,
    by_sender: HashMap<Address, BTreeMap<u64, Hash>>,
    orphans: OrphanTxPool,
    history: LruCache<Hash, TxState>,
    next_seq: u64,
}

impl fmt::Debug for Mempool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mempool")
            .field("pending", &self.pending.len())
            .field("orphans", &self.orphans.len())
            .field("history", &self.history.len())
            .finish()
    }
}

impl Mempool {
    pub fn new(config: MempoolConfig) -> Self {
        let history = NonZeroUsize::new(config.history_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            orphans: OrphanTxPool::new(config.max_orphans, config.orphan_max_age_secs),
            history: LruCache::new(history),
            pending: HashMap::new(),
            spent_by: HashMap::new(),
            created: HashMap::new(),
            by_sender: HashMap::new(),
            next_seq: 0,
            config,
        }
    }

    pub fn add_transaction<C: ChainView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &C,
    ) -> Result<Admission, AdmissionError> {
        self.add_transaction_at(tx, chain, unix_now())
    }

    /// Admit `tx` received at `now`. A transaction that becomes pending
    /// releases any orphans waiting on it.
    pub fn add_transaction_at<C: ChainView + ?Sized>(
        &mut self,
        tx: Transaction,
        chain: &C,
        now: u64,
    ) -> Result<Admission, AdmissionError> {
        let txid = tx.txid();
        let admission = self.admit(txid, tx, chain, now).inspect_err(|err| {
            debug!(txid = %txid.short(), reason = %err, "transaction rejected");
        })?;
        if admission == Admission::Pending {
            self.promote_orphans(VecDeque::from([txid]), chain, now);
        }
        Ok(admission)
    }

    /// Confirmed according to the chain or to the pool's own history
    fn is_confirmed<C: ChainView + ?Sized>(&self, chain: &C, txid: &Hash) -> bool {
        chain.is_confirmed(txid) || self.history.peek(txid) == Some(&TxState::Confirmed)
    }

    fn admit<C: ChainView + ?Sized>(
        &mut self,
        txid: Hash,
        tx: Transaction,
        chain: &C,
        now: u64,
    ) -> Result<Admission, AdmissionError> {
        if self.pending.contains_key(&txid) || self.orphans.contains(&txid) {
            return Err(AdmissionError::Duplicate(txid));
        }
        if self.is_confirmed(chain, &txid) {
            return Err(AdmissionError::AlreadyConfirmed(txid));
        }
        if tx.is_coinbase() {
            return Err(AdmissionError::Coinbase);
        }
        tx.check_structure().map_err(|err| match err {
            TxError::TooLarge { size, max } => AdmissionError::TooLarge { size, max },
            other => AdmissionError::Malformed(other),
        })?;

        let threshold = self.config.dust_threshold;
        if let Some((vout, output)) = tx
            .outputs
            .iter()
            .enumerate()
            .find(|(_, o)| o.amount < threshold)
        {
            return Err(AdmissionError::Dust {
                vout: vout as u32,
                amount: output.amount,
                threshold,
            });
        }

        let sender = tx.sender_address();
        let limit = self.config.max_per_sender;
        if self.by_sender.get(&sender).map_or(0, BTreeMap::len) >= limit {
            return Err(AdmissionError::TooManyPending { sender, limit });
        }

        if let Some((outpoint, claimed_by)) = self.conflict(&tx) {
            return Err(AdmissionError::DoubleSpend { outpoint, claimed_by });
        }

        let view = PoolView {
            ledger: chain.ledger(),
            created: &self.created,
        };
        let missing = tx.missing_inputs(&view);
        // only an unknown parent can still arrive
        for input in &missing {
            if self.is_confirmed(chain, &input.txid) {
                return Err(AdmissionError::SpentOnChain(*input));
            }
            if self.pending.contains_key(&input.txid) {
                return Err(AdmissionError::Malformed(TxError::MissingInput(*input)));
            }
        }
        if !missing.is_empty() {
            if let Some(evicted) = self.orphans.insert(txid, tx, &missing, now) {
                debug!(txid = %evicted.short(), "orphan pool full, evicted oldest");
            }
            debug!(txid = %txid.short(), missing = missing.len(), "transaction orphaned");
            return Ok(Admission::Orphaned { missing });
        }
        self.check_context(&tx, &view)?;

        if self.pending.len() >= self.config.max_size {
            return Err(AdmissionError::PoolFull {
                capacity: self.config.max_size,
            });
        }
        let entry = PoolEntry {
            fee: tx.fee,
            tx,
            received: now,
            seq: self.bump_seq(),
        };
        self.insert_pending(txid, entry);
        debug!(txid = %txid.short(), pending = self.pending.len(), "transaction admitted");
        Ok(Admission::Pending)
    }

    /// Ownership, funds, nonce window and signature
    fn check_context(&self, tx: &Transaction, view: &PoolView<'_>) -> Result<(), AdmissionError> {
        let sender = tx.sender_address();
        let mut available: Amount = 0;
        for input in &tx.inputs {
            let utxo = view
                .utxo(input)
                .ok_or(AdmissionError::Malformed(TxError::MissingInput(*input)))?;
            if utxo.owner != sender {
                return Err(AdmissionError::NotOwner(*input));
            }
            available = available
                .checked_add(utxo.amount)
                .ok_or(AdmissionError::Malformed(TxError::Overflow))?;
        }
        let required = tx
            .total_output_value()
            .and_then(|v| v.checked_add(tx.fee))
            .ok_or(AdmissionError::Malformed(TxError::Overflow))?;
        if available < required {
            return Err(AdmissionError::InsufficientFunds { available, required });
        }

        let expected = view.next_nonce(&sender);
        if tx.nonce < expected {
            return Err(AdmissionError::NonceTooLow {
                expected,
                got: tx.nonce,
            });
        }
        let max_gap = self.config.max_nonce_gap;
        if tx.nonce - expected > max_gap {
            return Err(AdmissionError::NonceTooHigh {
                expected,
                got: tx.nonce,
                max_gap,
            });
        }
        if let Some(by) = self.by_sender.get(&sender).and_then(|n| n.get(&tx.nonce)) {
            return Err(AdmissionError::NonceInUse { nonce: tx.nonce, by: *by });
        }

        if !tx.verify_signature() {
            return Err(AdmissionError::InvalidSignature);
        }
        Ok(())
    }

    fn conflict(&self, tx: &Transaction) -> Option<(OutPoint, Hash)> {
        tx.inputs
            .iter()
            .find_map(|input| self.spent_by.get(input).map(|by| (*input, *by)))
    }

    fn bump_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn insert_pending(&mut self, txid: Hash, entry: PoolEntry) {
        for input in &entry.tx.inputs {
            self.spent_by.insert(*input, txid);
        }
        for (vout, output) in entry.tx.outputs.iter().enumerate() {
            self.created.insert(
                OutPoint::new(txid, vout as u32),
                Utxo {
                    owner: output.owner.clone(),
                    amount: output.amount,
                    script: output.script.clone(),
                },
            );
        }
        self.by_sender
            .entry(entry.tx.sender_address())
            .or_default()
            .insert(entry.tx.nonce, txid);
        self.history.pop(&txid);
        self.pending.insert(txid, entry);
    }

    fn remove_pending(&mut self, txid: &Hash) -> Option<PoolEntry> {
        let entry = self.pending.remove(txid)?;
        for input in &entry.tx.inputs {
            self.spent_by.remove(input);
        }
        for vout in 0..entry.tx.outputs.len() {
            self.created.remove(&OutPoint::new(*txid, vout as u32));
        }
        let sender = entry.tx.sender_address();
        if let Some(nonces) = self.by_sender.get_mut(&sender) {
            nonces.remove(&entry.tx.nonce);
            if nonces.is_empty() {
                self.by_sender.remove(&sender);
            }
        }
        Some(entry)
    }

    /// Retry orphans whose missing parents are in `ready`, cascading through
    /// any that become pending
    fn promote_orphans<C: ChainView + ?Sized>(&mut self, mut ready: VecDeque<Hash>, chain: &C, now: u64) -> usize {
        let mut promoted = 0;
        while let Some(parent) = ready.pop_front() {
            for (txid, tx) in self.orphans.take_waiting_on(&parent) {
                match self.admit(txid, tx, chain, now) {
                    Ok(Admission::Pending) => {
                        promoted += 1;
                        ready.push_back(txid);
                    }
                    Ok(Admission::Orphaned { .. }) => {}
                    Err(err) => {
                        debug!(txid = %txid.short(), reason = %err, "dropping orphan transaction");
                    }
                }
            }
        }
        promoted
    }

    /// Re-check every pending transaction (plus `extra`) against `ledger`,
    /// keeping arrival order. Returns how many were dropped.
    fn rebuild(&mut self, ledger: &Ledger, extra: Vec<(Hash, PoolEntry)>) -> usize {
        let mut candidates: Vec<(Hash, PoolEntry)> = self.pending.drain().chain(extra).collect();
        candidates.sort_by_key(|(_, entry)| entry.seq);
        self.spent_by.clear();
        self.created.clear();
        self.by_sender.clear();

        // a child may precede its resurrected parent, so retry until stable
        loop {
            let before = candidates.len();
            let mut deferred = Vec::new();
            for (txid, entry) in candidates {
                let admissible = self.conflict(&entry.tx).is_none() && {
                    let view = PoolView {
                        ledger,
                        created: &self.created,
                    };
                    entry.tx.missing_inputs(&view).is_empty() && self.check_context(&entry.tx, &view).is_ok()
                };
                if admissible {
                    self.insert_pending(txid, entry);
                } else {
                    deferred.push((txid, entry));
                }
            }
            let progressed = deferred.len() < before;
            candidates = deferred;
            if !progressed || candidates.is_empty() {
                break;
            }
        }

        for (txid, _) in &candidates {
            debug!(txid = %txid.short(), "pending transaction no longer valid");
        }
        candidates.len()
    }

    /// Re-check the whole pool against a replaced ledger
    pub fn revalidate(&mut self, ledger: &Ledger) -> usize {
        let evicted = self.rebuild(ledger, Vec::new());
        if evicted > 0 {
            info!(evicted, "mempool revalidated against new ledger");
        }
        evicted
    }

    /// Drop transactions the block confirmed, evict pending ones it
    /// invalidated, and promote orphans it unblocked. `chain` is the state
    /// after the block.
    pub fn on_block_connected<C: ChainView + ?Sized>(&mut self, block: &Block, chain: &C, now: u64) -> PoolRefresh {
        let mut refresh = PoolRefresh::default();
        let txids = block.txids();
        for txid in &txids {
            if self.remove_pending(txid).is_some() || self.orphans.remove(txid).is_some() {
                refresh.confirmed += 1;
            }
            self.history.put(*txid, TxState::Confirmed);
        }
        refresh.evicted = self.rebuild(chain.ledger(), Vec::new());
        refresh.promoted = self.promote_orphans(txids.into(), chain, now);
        if refresh != PoolRefresh::default() {
            debug!(height = block.height(), ?refresh, "mempool refreshed after block");
        }
        refresh
    }

    /// Return a reorged-out block's transfers to the pool. `chain` is the
    /// state after the disconnect.
    pub fn on_block_disconnected<C: ChainView + ?Sized>(&mut self, block: &Block, chain: &C, now: u64) -> PoolRefresh {
        let mut returned = Vec::new();
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            let txid = tx.txid();
            if self.pending.contains_key(&txid) {
                continue;
            }
            self.history.pop(&txid);
            let entry = PoolEntry {
                tx: tx.clone(),
                fee: tx.fee,
                received: now,
                seq: self.bump_seq(),
            };
            returned.push((txid, entry));
        }
        let txids: VecDeque<Hash> = returned.iter().map(|(txid, _)| *txid).collect();
        let offered = returned.len();

        let evicted = self.rebuild(chain.ledger(), returned);
        let refresh = PoolRefresh {
            confirmed: 0,
            resurrected: offered.saturating_sub(evicted),
            evicted,
            promoted: self.promote_orphans(txids, chain, now),
        };
        info!(height = block.height(), ?refresh, "returned disconnected transactions to mempool");
        refresh
    }

    /// Expire pending and orphan transactions older than their age limits.
    /// Returns how many expired.
    pub fn expire(&mut self, now: u64, ledger: &Ledger) -> usize {
        let max_age = self.config.max_age_secs;
        let stale: Vec<Hash> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.saturating_sub(entry.received) > max_age)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            self.remove_pending(txid);
            self.history.put(*txid, TxState::Expired);
        }
        let stale_orphans = self.orphans.prune(now);
        for txid in &stale_orphans {
            self.history.put(*txid, TxState::Expired);
        }

        let expired = stale.len() + stale_orphans.len();
        if !stale.is_empty() {
            // descendants of an expired transaction lose their inputs
            self.rebuild(ledger, Vec::new());
        }
        if expired > 0 {
            info!(pending = stale.len(), orphans = stale_orphans.len(), "expired transactions");
        }
        expired
    }

    /// Pending transactions by descending fee, earliest arrival first on ties
    pub fn get_pending_transactions(&self, limit: usize) -> Vec<Transaction> {
        let mut entries: Vec<&PoolEntry> = self.pending.values().collect();
        entries.sort_by(|a, b| {
            b.fee
                .cmp(&a.fee)
                .then(a.received.cmp(&b.received))
                .then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().take(limit).map(|e| e.tx.clone()).collect()
    }

    pub fn status(&self, txid: &Hash) -> Option<TxState> {
        if self.pending.contains_key(txid) {
            Some(TxState::Pending)
        } else if self.orphans.contains(txid) {
            Some(TxState::Orphan)
        } else {
            self.history.peek(txid).copied()
        }
    }

    pub fn get(&self, txid: &Hash) -> Option<&Transaction> {
        self.pending
            .get(txid)
            .map(|entry| &entry.tx)
            .or_else(|| self.orphans.get(txid))
    }

    /// Number of pending transactions
    pub fn size(&self) -> usize {
        self.pending.len()
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }
}
