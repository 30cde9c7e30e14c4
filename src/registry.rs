//! Address canonicalisation and the at-most-once fetch registry.

use std::collections::HashMap;
use std::sync::Mutex;

use url::Url;

use crate::downloader::DownloadResult;

/// Canonical key for an address.
///
/// The `url` crate already lower-cases scheme and host and drops default
/// ports; on top of that the fragment goes, an empty query goes, and a
/// trailing slash on a non-root path goes. The query itself is kept because
/// it may select different content.
pub fn normalize(url: &Url) -> String {
    let mut url = url.clone();
    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }
    let path = url.path();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        let trimmed = if trimmed.is_empty() { "/" } else { trimmed }.to_string();
        url.set_path(&trimmed);
    }
    url.to_string()
}

pub type WaiterId = u64;

#[derive(Debug)]
enum Slot {
    InFlight { waiters: Vec<WaiterId> },
    Done(DownloadResult),
}

/// Outcome of a claim attempt.
#[derive(Debug)]
pub enum Claim {
    /// The caller owns the fetch and must eventually call `complete`.
    Won,
    /// Someone else is fetching; the waiter will be returned by `complete`.
    Waiting,
    Done(DownloadResult),
}

/// Shared set of normalized addresses already scheduled for download,
/// together with their terminal results.
#[derive(Debug, Default)]
pub struct VisitedRegistry {
    slots: Mutex<HashMap<String, Slot>>,
}

impl VisitedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Atomic check-and-insert: `true` only for the first caller.
    pub fn try_claim(&self, key: &str) -> bool {
        let mut slots = self.lock();
        if slots.contains_key(key) {
            return false;
        }
        slots.insert(key.to_string(), Slot::InFlight { waiters: Vec::new() });
        true
    }

    /// Claim `key` for fetching or, failing that, register `waiter` to be
    /// handed back when the winner completes.
    pub fn claim(&self, key: &str, waiter: WaiterId) -> Claim {
        let mut slots = self.lock();
        match slots.get_mut(key) {
            None => {
                slots.insert(key.to_string(), Slot::InFlight { waiters: vec![waiter] });
                Claim::Won
            }
            Some(Slot::InFlight { waiters }) => {
                if !waiters.contains(&waiter) {
                    waiters.push(waiter);
                }
                Claim::Waiting
            }
            Some(Slot::Done(result)) => Claim::Done(result.clone()),
        }
    }

    /// Record the terminal result for `key` and return everyone waiting on it.
    /// A second completion for the same key is ignored.
    pub fn complete(&self, key: &str, result: DownloadResult) -> Vec<WaiterId> {
        let mut slots = self.lock();
        match slots.get_mut(key) {
            Some(Slot::Done(_)) => Vec::new(),
            Some(slot) => match std::mem::replace(slot, Slot::Done(result)) {
                Slot::InFlight { waiters } => waiters,
                Slot::Done(_) => Vec::new(),
            },
            None => {
                slots.insert(key.to_string(), Slot::Done(result));
                Vec::new()
            }
        }
    }

    pub fn result(&self, key: &str) -> Option<DownloadResult> {
        match self.lock().get(key) {
            Some(Slot::Done(result)) => Some(result.clone()),
            _ => None,
        }
    }

    pub fn is_claimed(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Keys claimed but never completed.
    pub fn unfinished(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::InFlight { .. }))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn results(&self) -> Vec<DownloadResult> {
        let mut results: Vec<DownloadResult> = self
            .lock()
            .values()
            .filter_map(|slot| match slot {
                Slot::Done(result) => Some(result.clone()),
                Slot::InFlight { .. } => None,
            })
            .collect();
        results.sort_by(|a, b| a.address.cmp(&b.address));
        results
    }
}
