/*!
Managing lookup transaction IDs and timeouts.
*/

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;

use crate::time::*;

/// Generate a non-zero transaction id.
fn gen_tx_id<R: Rng>(rng: &mut R) -> u64 {
    let mut tx_id = 0;
    while tx_id == 0 {
        tx_id = rng.gen();
    }
    tx_id
}

/// Stores and manages lookup transaction IDs and timeouts. Every
/// transaction id stores generic companion data.
#[derive(Clone, Debug)]
pub struct RequestQueue<T> {
    requests: HashMap<u64, (Instant, T)>,
    timeout: Duration,
}

impl<T> RequestQueue<T> {
    /// Create a new `RequestQueue`.
    pub fn new(timeout: Duration) -> RequestQueue<T> {
        RequestQueue {
            requests: HashMap::new(),
            timeout,
        }
    }

    fn generate_tx_id<R: Rng>(&self, rng: &mut R) -> u64 {
        loop {
            let tx_id = gen_tx_id(rng);
            if !self.requests.contains_key(&tx_id) {
                return tx_id;
            }
        }
    }

    /// Generate and store a unique non-zero transaction id. Later this id
    /// can be claimed back with `check_tx_id`.
    pub fn new_tx_id<R: Rng>(&mut self, rng: &mut R, data: T) -> u64 {
        let tx_id = self.generate_tx_id(rng);
        self.requests.insert(tx_id, (clock_now(), data));
        tx_id
    }

    /// Check whether a transaction id is known and not timed out. When the
    /// stored data satisfies the condition, the entry is removed and its
    /// data returned, so an id can be claimed only once.
    pub fn check_tx_id<F: FnOnce(&T) -> bool>(&mut self, tx_id: u64, cond: F) -> Option<T> {
        if tx_id == 0 {
            return None;
        }

        if let Entry::Occupied(entry) = self.requests.entry(tx_id) {
            let (time, data) = entry.get();
            if clock_elapsed(*time) <= self.timeout && cond(data) {
                let (_tx_id, (_time, data)) = entry.remove_entry();
                Some(data)
            } else {
                None
            }
        } else {
            None
        }
    }

    /// Remove timed out transactions, returning their data so the caller
    /// can fail the pending work.
    pub fn clear_timed_out(&mut self) -> Vec<T> {
        let timeout = self.timeout;
        let expired: Vec<u64> = self
            .requests
            .iter()
            .filter(|(_, (time, _))| clock_elapsed(*time) > timeout)
            .map(|(tx_id, _)| *tx_id)
            .collect();
        expired
            .into_iter()
            .filter_map(|tx_id| self.requests.remove(&tx_id))
            .map(|(_, data)| data)
            .collect()
    }

    /// Outstanding requests that have not timed out yet.
    pub fn values(&self) -> impl Iterator<Item = &T> {
        let timeout = self.timeout;
        self.requests
            .values()
            .filter(move |(time, _)| clock_elapsed(*time) <= timeout)
            .map(|(_, data)| data)
    }

    /// Number of outstanding transactions.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Whether there are no outstanding transactions.
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
