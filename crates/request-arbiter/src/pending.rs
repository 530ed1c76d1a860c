use std::collections::HashMap;

use tokio::sync::oneshot;
use walletgate_core_types::RequestId;

use crate::error::ArbiterError;

/// Sender half owned by a table entry; fires exactly once with the outcome.
pub(crate) type Responder<O> = oneshot::Sender<Result<O, ArbiterError>>;

pub(crate) struct PendingEntry<R, O> {
    pub record: R,
    pub responder: Responder<O>,
}

/// In-memory table of in-flight requests awaiting an external decision.
///
/// Entries exist exactly until resolved, rejected or explicitly deleted;
/// an id is never duplicated. Dropping an entry's responder wakes the
/// suspended caller with a cancellation.
pub(crate) struct PendingTable<R, O> {
    entries: HashMap<RequestId, PendingEntry<R, O>>,
}

impl<R: Clone, O> PendingTable<R, O> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn insert(&mut self, id: RequestId, record: R, responder: Responder<O>) {
        self.entries.insert(id, PendingEntry { record, responder });
    }

    pub fn take(&mut self, id: &RequestId) -> Option<PendingEntry<R, O>> {
        self.entries.remove(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &R> {
        self.entries.values().map(|entry| &entry.record)
    }

    pub fn snapshot(&self) -> Vec<R> {
        self.records().cloned().collect()
    }
}

impl<R: Clone, O> Default for PendingTable<R, O> {
    fn default() -> Self {
        Self::new()
    }
}
