//! Per-chunk-index descriptor lists and the algorithms that edit them.
//!
//! A [`ChunkIndexMap`] maps a chunk index to the descriptors written into it,
//! in ascending `chunk_id` order. Read in that order the list fully describes
//! the readable content of the chunk: later descriptors overwrite earlier ones
//! where they overlap. Every edit here is pure and in-memory; a contract
//! violation is reported as [`Error::Param`] and leaves the map untouched.
//!
//! The same code runs on both sides of a metadata sync: the client applies
//! its local edits with it and [`crate::meta::InMemoryMetaClient`] uses
//! [`ChunkIndexMap::apply`] to serve `get_or_modify_chunk_info`.

use super::slice::ChunkDescriptor;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{trace, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkIndexMap {
    entries: BTreeMap<u64, Vec<ChunkDescriptor>>,
}

impl ChunkIndexMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a map from whole lists; empty lists are skipped.
    pub fn from_lists(lists: impl IntoIterator<Item = (u64, Vec<ChunkDescriptor>)>) -> Self {
        let entries = lists
            .into_iter()
            .filter(|(_, list)| !list.is_empty())
            .collect();
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of chunk indices present.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn descriptor_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn get(&self, chunk_index: u64) -> Option<&[ChunkDescriptor]> {
        self.entries.get(&chunk_index).map(Vec::as_slice)
    }

    pub fn contains_index(&self, chunk_index: u64) -> bool {
        self.entries.contains_key(&chunk_index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &[ChunkDescriptor])> {
        self.entries.iter().map(|(k, v)| (*k, v.as_slice()))
    }

    /// Add `desc` at the end of the list for `chunk_index`, creating it if absent.
    pub fn append(&mut self, chunk_index: u64, desc: ChunkDescriptor) {
        self.entries.entry(chunk_index).or_default().push(desc);
    }

    /// Whether `add` looks already applied.
    ///
    /// Only the first descriptor of the first chunk index in `add` is checked
    /// against the existing list for that index. A batch is produced by a single
    /// sender and resent as a whole, so a hit on its head means the whole batch
    /// landed before.
    pub fn is_duplicate_add(&self, add: &ChunkIndexMap) -> bool {
        let Some((index, list)) = add.entries.iter().next() else {
            return false;
        };
        let Some(head) = list.first() else {
            return false;
        };
        self.entries
            .get(index)
            .is_some_and(|existing| existing.contains(head))
    }

    /// Append every list of `add` to the matching list here.
    ///
    /// Returns `false` and changes nothing when `add` was already merged.
    pub fn merge(&mut self, add: &ChunkIndexMap) -> bool {
        if self.is_duplicate_add(add) {
            trace!("skip duplicated merge of {} indices", add.len());
            return false;
        }
        self.extend(add);
        true
    }

    /// Append every list of `add` without the duplicate check.
    pub fn extend(&mut self, add: &ChunkIndexMap) {
        for (index, list) in &add.entries {
            self.entries
                .entry(*index)
                .or_default()
                .extend_from_slice(list);
        }
    }

    /// Drop every descriptor value-equal to one listed in `remove` for the same
    /// chunk index. A chunk index whose list becomes empty is dropped.
    pub fn remove(&mut self, remove: &ChunkIndexMap) {
        for (index, to_remove) in &remove.entries {
            if let Some(list) = self.entries.get_mut(index) {
                list.retain(|d| !to_remove.contains(d));
                if list.is_empty() {
                    self.entries.remove(index);
                }
            }
        }
    }

    /// Replace runs of descriptors by one compacted descriptor per chunk index.
    ///
    /// `add` must hold exactly one descriptor per chunk index, and `remove` must
    /// name the same chunk indices, all of which must exist here. For each index
    /// the listed descriptors are removed and the new one is inserted right before
    /// the first surviving descriptor with a larger `chunk_id`, so the list stays
    /// ascending.
    pub fn compact(&mut self, add: &ChunkIndexMap, remove: &ChunkIndexMap) -> Result<()> {
        if add.len() != remove.len() {
            return Err(param(format!(
                "compaction adds {} chunk indices but removes {}",
                add.len(),
                remove.len()
            )));
        }
        for (index, list) in &add.entries {
            if list.len() != 1 {
                return Err(param(format!(
                    "compaction of chunk index {index} adds {} descriptors, expected 1",
                    list.len()
                )));
            }
            if !remove.entries.contains_key(index) {
                return Err(param(format!(
                    "compaction of chunk index {index} has no removal list"
                )));
            }
            if !self.entries.contains_key(index) {
                return Err(param(format!("chunk index {index} does not exist")));
            }
        }

        for (index, list) in &add.entries {
            let compacted = list[0];
            let to_remove = &remove.entries[index];
            if let Some(orig) = self.entries.get_mut(index) {
                *orig = compact_list(orig, compacted, to_remove);
                trace!(
                    "compacted chunk index {index} into chunk {}, {} descriptors left",
                    compacted.chunk_id,
                    orig.len()
                );
            }
        }
        Ok(())
    }

    /// Apply a modification request the way the metadata service does.
    ///
    /// A duplicated `add` skips the whole request. Otherwise either the
    /// compaction variant runs, or `add` is merged and then `remove` applied.
    /// Returns whether anything was applied.
    pub fn apply(
        &mut self,
        add: &ChunkIndexMap,
        remove: &ChunkIndexMap,
        from_compaction: bool,
    ) -> Result<bool> {
        if add.is_empty() && remove.is_empty() {
            return Ok(false);
        }
        if self.is_duplicate_add(add) {
            trace!("skip duplicated modification of {} indices", add.len());
            return Ok(false);
        }
        if from_compaction {
            self.compact(add, remove)?;
        } else {
            self.extend(add);
            self.remove(remove);
        }
        Ok(true)
    }

    /// Put `earlier` in front of the current lists, index by index.
    pub fn prepend(&mut self, earlier: ChunkIndexMap) {
        for (index, mut list) in earlier.entries {
            let slot = self.entries.entry(index).or_default();
            list.append(slot);
            *slot = list;
        }
    }

    /// Remove and return every chunk index `>= first_index`.
    pub fn split_off(&mut self, first_index: u64) -> ChunkIndexMap {
        ChunkIndexMap {
            entries: self.entries.split_off(&first_index),
        }
    }

    /// Remove one chunk index, returning its list.
    pub fn remove_index(&mut self, chunk_index: u64) -> Option<Vec<ChunkDescriptor>> {
        self.entries.remove(&chunk_index)
    }

    pub fn take(&mut self) -> ChunkIndexMap {
        std::mem::take(self)
    }
}

fn compact_list(
    orig: &[ChunkDescriptor],
    compacted: ChunkDescriptor,
    to_remove: &[ChunkDescriptor],
) -> Vec<ChunkDescriptor> {
    let mut out = Vec::with_capacity(orig.len() + 1);
    let mut inserted = false;
    for desc in orig.iter().filter(|d| !to_remove.contains(d)) {
        if !inserted && desc.chunk_id > compacted.chunk_id {
            out.push(compacted);
            inserted = true;
        }
        out.push(*desc);
    }
    if !inserted {
        out.push(compacted);
    }
    out
}

fn param(msg: String) -> Error {
    warn!("bad chunk info modification: {msg}");
    Error::Param(msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desc(id: u64) -> ChunkDescriptor {
        ChunkDescriptor {
            chunk_id: id,
            compaction: 0,
            offset: id,
            len: 1,
            size: 1,
            zero: true,
        }
    }

    fn ids(map: &ChunkIndexMap, index: u64) -> Vec<u64> {
        map.get(index)
            .map(|l| l.iter().map(|d| d.chunk_id).collect())
            .unwrap_or_default()
    }

    #[test]
    fn test_append_keeps_allocation_order() {
        let mut map = ChunkIndexMap::new();
        map.append(1, desc(1));
        map.append(1, desc(2));
        map.append(2, desc(3));
        assert_eq!(map.len(), 2);
        assert_eq!(ids(&map, 1), vec![1, 2]);
        assert_eq!(ids(&map, 2), vec![3]);
        assert_eq!(map.descriptor_count(), 3);
    }

    #[test]
    fn test_merge_is_idempotent() {
        let add = ChunkIndexMap::from_lists(
            (0..10).map(|j| (j, (0..10).map(|k| desc(10 * j + k)).collect())),
        );
        let mut map = ChunkIndexMap::new();
        assert!(map.merge(&add));
        let once = map.clone();
        assert!(!map.merge(&add));
        assert_eq!(map, once);
        assert_eq!(map, add);
    }

    #[test]
    fn test_remove_drops_empty_index() {
        let mut map = ChunkIndexMap::from_lists([(0, vec![desc(1), desc(2)]), (5, vec![desc(3)])]);
        map.remove(&ChunkIndexMap::from_lists([(0, vec![desc(1)]), (5, vec![desc(3)])]));
        assert_eq!(ids(&map, 0), vec![2]);
        assert!(!map.contains_index(5));
        // removing something absent is harmless
        map.remove(&ChunkIndexMap::from_lists([(9, vec![desc(9)])]));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_remove_needs_full_value_equality() {
        let mut map = ChunkIndexMap::from_lists([(0, vec![desc(1)])]);
        let mut other = desc(1);
        other.len = 2;
        map.remove(&ChunkIndexMap::from_lists([(0, vec![other])]));
        assert_eq!(ids(&map, 0), vec![1]);
    }

    #[test]
    fn test_apply_add_then_remove_everything() {
        let lists = ChunkIndexMap::from_lists(
            (0..10).map(|j| (j, (0..10).map(|k| desc(10 * j + k)).collect())),
        );
        let empty = ChunkIndexMap::new();
        let mut map = ChunkIndexMap::new();
        assert!(map.apply(&lists, &empty, false).unwrap());
        assert!(!map.apply(&lists, &empty, false).unwrap());
        assert_eq!(map.len(), 10);

        assert!(map.apply(&empty, &lists, false).unwrap());
        assert!(map.is_empty());
        map.apply(&empty, &lists, false).unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_compaction_scenario() {
        let mut map = ChunkIndexMap::from_lists([(0, (0..10).map(desc).collect())]);
        let mut compacted = desc(7);
        compacted.compaction = 1;
        compacted.offset = 0;
        compacted.len = 8;
        let add = ChunkIndexMap::from_lists([(0, vec![compacted])]);
        let remove = ChunkIndexMap::from_lists([(0, (0..8).map(desc).collect())]);

        assert!(map.apply(&add, &remove, true).unwrap());
        assert_eq!(ids(&map, 0), vec![7, 8, 9]);
        assert_eq!(map.get(0).unwrap()[0], compacted);
    }

    #[test]
    fn test_compaction_count_and_order() {
        for total in 2..12u64 {
            for removed in 1..total {
                let mut map = ChunkIndexMap::from_lists([(3, (0..total).map(desc).collect())]);
                let mut new = desc(removed - 1);
                new.compaction = 1;
                let add = ChunkIndexMap::from_lists([(3, vec![new])]);
                let remove = ChunkIndexMap::from_lists([(3, (0..removed).map(desc).collect())]);
                map.compact(&add, &remove).unwrap();

                let got = ids(&map, 3);
                assert_eq!(got.len() as u64, total - removed + 1);
                assert!(got.windows(2).all(|w| w[0] < w[1]), "{got:?}");
            }
        }
    }

    #[test]
    fn test_compaction_appends_when_newest() {
        let mut map = ChunkIndexMap::from_lists([(0, vec![desc(1), desc(2)])]);
        let add = ChunkIndexMap::from_lists([(0, vec![desc(20)])]);
        let remove = ChunkIndexMap::from_lists([(0, vec![desc(1)])]);
        map.compact(&add, &remove).unwrap();
        assert_eq!(ids(&map, 0), vec![2, 20]);
    }

    #[test]
    fn test_compaction_rejects_bad_batches_untouched() {
        let orig = ChunkIndexMap::from_lists([(0, (0..4).map(desc).collect()), (1, vec![desc(9)])]);
        let one = ChunkIndexMap::from_lists([(0, vec![desc(3)])]);
        let two = ChunkIndexMap::from_lists([(0, vec![desc(3), desc(4)])]);
        let rm0 = ChunkIndexMap::from_lists([(0, vec![desc(0)])]);
        let rm_both = ChunkIndexMap::from_lists([(0, vec![desc(0)]), (1, vec![desc(9)])]);
        let rm_other = ChunkIndexMap::from_lists([(1, vec![desc(9)])]);
        let missing = ChunkIndexMap::from_lists([(7, vec![desc(3)])]);
        let rm_missing = ChunkIndexMap::from_lists([(7, vec![desc(0)])]);

        let cases = [
            (&one, &rm_both),
            (&two, &rm0),
            (&one, &rm_other),
            (&missing, &rm_missing),
        ];
        for (add, remove) in cases {
            let mut map = orig.clone();
            let err = map.compact(add, remove).unwrap_err();
            assert!(matches!(err, Error::Param(_)));
            assert_eq!(map, orig);
        }
    }

    #[test]
    fn test_duplicate_detection_checks_batch_head() {
        let mut map = ChunkIndexMap::from_lists([(0, vec![desc(1)])]);
        let batch = ChunkIndexMap::from_lists([(0, vec![desc(1), desc(2)])]);
        assert!(map.is_duplicate_add(&batch));
        assert!(!map.merge(&batch));
        assert_eq!(ids(&map, 0), vec![1]);
        assert!(!map.is_duplicate_add(&ChunkIndexMap::new()));
    }

    #[test]
    fn test_prepend_and_split_off() {
        let mut map = ChunkIndexMap::from_lists([(0, vec![desc(5)]), (2, vec![desc(6)])]);
        map.prepend(ChunkIndexMap::from_lists([(0, vec![desc(1), desc(2)]), (1, vec![desc(3)])]));
        assert_eq!(ids(&map, 0), vec![1, 2, 5]);
        assert_eq!(ids(&map, 1), vec![3]);

        let mut tail = map.split_off(1);
        assert_eq!(map.len(), 1);
        assert_eq!(tail.len(), 2);
        assert_eq!(ids(&tail, 2), vec![6]);
        assert_eq!(tail.remove_index(1), Some(vec![desc(3)]));
        assert!(tail.remove_index(1).is_none());
    }
}
