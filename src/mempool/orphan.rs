//! Transactions waiting on inputs the node has not seen yet

use std::collections::HashMap;
use tracing::debug;

use crate::crypto::Hash;
use crate::validation::{OutPoint, Transaction};

#[derive(Debug, Clone)]
struct OrphanTx {
    tx: Transaction,
    received: u64,
    parents: Vec<Hash>,
}

/// Orphan transactions keyed by the txid of each missing parent
#[derive(Debug, Clone)]
pub struct OrphanTxPool {
    txs: HashMap<Hash, OrphanTx>,
    by_parent: HashMap<Hash, Vec<Hash>>,
    max_txs: usize,
    max_age_secs: u64,
}

impl OrphanTxPool {
    pub fn new(max_txs: usize, max_age_secs: u64) -> Self {
        Self {
            txs: HashMap::new(),
            by_parent: HashMap::new(),
            max_txs,
            max_age_secs,
        }
    }

    /// Hold `tx` until every output in `missing` exists. Evicts the oldest
    /// orphan when full; the evicted txid is returned.
    pub fn insert(&mut self, txid: Hash, tx: Transaction, missing: &[OutPoint], now: u64) -> Option<Hash> {
        if self.txs.contains_key(&txid) {
            return None;
        }
        let evicted = if self.txs.len() >= self.max_txs {
            self.oldest()
        } else {
            None
        };
        if let Some(oldest) = &evicted {
            self.remove(oldest);
        }

        let mut parents: Vec<Hash> = missing.iter().map(|o| o.txid).collect();
        parents.sort();
        parents.dedup();
        for parent in &parents {
            self.by_parent.entry(*parent).or_default().push(txid);
        }
        self.txs.insert(
            txid,
            OrphanTx {
                tx,
                received: now,
                parents,
            },
        );
        evicted
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&Transaction> {
        self.txs.get(txid).map(|o| &o.tx)
    }

    /// Remove and return every orphan that names `parent` as missing
    pub fn take_waiting_on(&mut self, parent: &Hash) -> Vec<(Hash, Transaction)> {
        let waiting = self.by_parent.get(parent).cloned().unwrap_or_default();
        waiting
            .into_iter()
            .filter_map(|txid| self.remove(&txid).map(|tx| (txid, tx)))
            .collect()
    }

    /// Remove an orphan and its parent links
    pub fn remove(&mut self, txid: &Hash) -> Option<Transaction> {
        let orphan = self.txs.remove(txid)?;
        for parent in &orphan.parents {
            if let Some(children) = self.by_parent.get_mut(parent) {
                children.retain(|h| h != txid);
                if children.is_empty() {
                    self.by_parent.remove(parent);
                }
            }
        }
        Some(orphan.tx)
    }

    /// Drop orphans older than the age limit, returning their ids
    pub fn prune(&mut self, now: u64) -> Vec<Hash> {
        let max_age = self.max_age_secs;
        let stale: Vec<Hash> = self
            .txs
            .iter()
            .filter(|(_, o)| now.saturating_sub(o.received) > max_age)
            .map(|(txid, _)| *txid)
            .collect();
        for txid in &stale {
            self.remove(txid);
        }
        if !stale.is_empty() {
            debug!(removed = stale.len(), "pruned orphan transactions");
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    fn oldest(&self) -> Option<Hash> {
        self.txs
            .iter()
            .min_by_key(|(txid, o)| (o.received, **txid))
            .map(|(txid, _)| *txid)
    }
}
