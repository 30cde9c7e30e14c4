//! Board of documents (pages and stylesheets) awaiting their references.
//!
//! A document is registered with the set of references it owns. Each one is
//! resolved as its fetch becomes terminal. Once the claim loop has finished
//! (the document is *armed*) and nothing is pending, exactly one caller is
//! told to seal it.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use url::Url;

use crate::registry::WaiterId;
use crate::resolver::{DocumentKind, ResourceReference};

pub type DocumentId = WaiterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PageStatus {
    Pending,
    Sealed,
    Completed,
    Failed,
    Skipped,
}

impl PageStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PageStatus::Completed | PageStatus::Failed | PageStatus::Skipped)
    }
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub address: Url,
    /// Address the document was served from, the base for its references.
    pub final_address: Url,
    pub depth: usize,
    pub status: PageStatus,
    pub text: String,
    pub references: Vec<ResourceReference>,
    pub links: Vec<Url>,
    pub local_path: Option<PathBuf>,
    pub byte_size: u64,
    pub detail: Option<String>,
    pending: HashSet<String>,
    armed: bool,
}

impl DocumentRecord {
    pub fn new(kind: DocumentKind, address: Url, final_address: Url, depth: usize) -> Self {
        Self {
            id: 0,
            kind,
            address,
            final_address,
            depth,
            status: PageStatus::Pending,
            text: String::new(),
            references: Vec::new(),
            links: Vec::new(),
            local_path: None,
            byte_size: 0,
            detail: None,
            pending: HashSet::new(),
            armed: false,
        }
    }

    pub fn is_page(&self) -> bool {
        self.kind == DocumentKind::Html
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn ready(&self) -> bool {
        self.armed && self.pending.is_empty() && self.status == PageStatus::Pending
    }
}

#[derive(Debug, Default)]
struct BoardState {
    next_id: DocumentId,
    documents: HashMap<DocumentId, DocumentRecord>,
}

#[derive(Debug, Default)]
pub struct DocumentBoard {
    state: Mutex<BoardState>,
}

impl DocumentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, mut record: DocumentRecord) -> DocumentId {
        let mut state = self.lock();
        state.next_id += 1;
        let id = state.next_id;
        record.id = id;
        state.documents.insert(id, record);
        id
    }

    /// Add `key` to the document's pending set. Must happen before the key
    /// is claimed in the registry.
    pub fn add_pending(&self, id: DocumentId, key: &str) -> bool {
        match self.lock().documents.get_mut(&id) {
            Some(record) if !record.armed => record.pending.insert(key.to_string()),
            _ => false,
        }
    }

    /// Mark `key` terminal for document `id`. Returns `true` when the caller
    /// must seal the document.
    pub fn resolve(&self, id: DocumentId, key: &str) -> bool {
        let mut state = self.lock();
        let Some(record) = state.documents.get_mut(&id) else {
            return false;
        };
        record.pending.remove(key);
        take_seal(record)
    }

    /// The claim loop is over. Returns `true` when the caller must seal.
    pub fn arm(&self, id: DocumentId) -> bool {
        let mut state = self.lock();
        let Some(record) = state.documents.get_mut(&id) else {
            return false;
        };
        record.armed = true;
        take_seal(record)
    }

    pub fn get(&self, id: DocumentId) -> Option<DocumentRecord> {
        self.lock().documents.get(&id).cloned()
    }

    pub fn finish(&self, id: DocumentId, status: PageStatus, byte_size: u64, detail: Option<String>) {
        if let Some(record) = self.lock().documents.get_mut(&id) {
            record.status = status;
            record.byte_size = byte_size;
            record.detail = detail;
        }
    }

    /// Mark every document that never reached a terminal state as skipped,
    /// returning how many there were.
    pub fn skip_unfinished(&self, detail: &str) -> usize {
        let mut state = self.lock();
        let mut count = 0;
        for record in state.documents.values_mut() {
            if !record.status.is_terminal() {
                record.status = PageStatus::Skipped;
                record.detail = Some(detail.to_string());
                count += 1;
            }
        }
        count
    }

    pub fn pages(&self) -> Vec<DocumentRecord> {
        let mut pages: Vec<DocumentRecord> = self
            .lock()
            .documents
            .values()
            .filter(|record| record.is_page())
            .cloned()
            .collect();
        pages.sort_by(|a, b| a.address.as_str().cmp(b.address.as_str()));
        pages
    }
}

fn take_seal(record: &mut DocumentRecord) -> bool {
    if record.ready() {
        record.status = PageStatus::Sealed;
        true
    } else {
        false
    }
}
