//! Secondary index construction.
//!
//! In DN mode every subject DN is split at its `/CN=` markers and each
//! human-readable Common-Name token maps back to the owning record.  Tokens
//! that are purely numeric are certificate serials and are never indexed.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;

use super::{IdentityRecord, KeyMode, RegistrySnapshot, SecondaryIndex};

const CN_MARKER: &str = "/CN=";

/// Extract the indexable Common-Name tokens of a DN, in DN order.
///
/// Segments that still start with `/` (the part before the first CN, or a
/// malformed segment) are skipped, as are empty and all-digit segments.
pub fn dn_tokens(dn: &str) -> impl Iterator<Item = &str> {
    dn.split(CN_MARKER).filter(|segment| is_indexable(segment))
}

fn is_indexable(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('/')
        && !segment.bytes().all(|b| b.is_ascii_digit())
}

/// Build the lookup index for `snapshot`.
///
/// `Id` mode reuses the snapshot's primary keys.  `Dn` mode derives CN
/// tokens; when two records share a token the one visited last (snapshot
/// key order) wins.
pub fn build_index(snapshot: &RegistrySnapshot, mode: KeyMode) -> SecondaryIndex {
    match mode {
        KeyMode::Id => snapshot
            .iter()
            .map(|(key, record)| (key.clone(), Arc::clone(record)))
            .collect(),
        KeyMode::Dn => build_dn_index(snapshot),
    }
}

fn build_dn_index(snapshot: &RegistrySnapshot) -> SecondaryIndex {
    let mut index = SecondaryIndex::new();
    // A DN-keyed snapshot holds the same record under each of its DNs.
    let mut visited: HashSet<*const IdentityRecord> = HashSet::new();
    let mut collisions = 0usize;

    for record in snapshot.values() {
        if !visited.insert(Arc::as_ptr(record)) {
            continue;
        }
        for dn in record.subject_dns() {
            for token in dn_tokens(dn) {
                if let Some(previous) = index.insert(token.to_string(), Arc::clone(record)) {
                    if previous.id != record.id {
                        collisions += 1;
                        debug!(
                            token,
                            previous_id = previous.id,
                            id = record.id,
                            "index token collision, keeping later record"
                        );
                    }
                }
            }
        }
    }

    debug!(
        records = visited.len(),
        tokens = index.len(),
        collisions,
        "built DN index"
    );
    index
}
