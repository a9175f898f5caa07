//! In-batch record merging.
//!
//! A batch may contain several records for the same client identity. They
//! collapse into a single update per key before the transaction, so each
//! flush issues at most one write per client row regardless of how chatty
//! the client was inside the window.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::record::{ClientKey, ClientUpdate, SessionRecord};

/// Collapse a drained batch into one [`ClientUpdate`] per client key.
///
/// Records may arrive out of session-timestamp order; the fold keeps the
/// newest record's field values and the widest first/last window, so the
/// result is the same as if the batch had been sorted first.
pub fn merge_batch(records: Vec<SessionRecord>) -> HashMap<ClientKey, ClientUpdate> {
    let mut merged: HashMap<ClientKey, ClientUpdate> = HashMap::with_capacity(records.len());
    for record in records {
        match merged.entry(record.key()) {
            Entry::Occupied(mut occupied) => occupied.get_mut().absorb(record),
            Entry::Vacant(vacant) => {
                vacant.insert(ClientUpdate::from_record(record));
            }
        }
    }
    merged
}
