use std::hash::BuildHasher;

use hashbrown::hash_table::{self, HashTable};
use slab::Slab;

use super::entry::PageEntry;
use crate::layout::PageKey;

macro_rules! remove_lookup {
    ($lookup:expr, $hash_key:expr, $eq_check:expr, $hasher:expr $(,)?) => {{
        let maybe_occupied = $lookup.entry($hash_key, $eq_check, $hasher);
        if let hash_table::Entry::Occupied(entry) = maybe_occupied {
            let (idx, _) = entry.remove();
            Some(idx)
        } else {
            None
        }
    }};
}

/// The set of page entries indexed by their [PageKey].
///
/// Entries live in a slab and are addressed by their slab index, which
/// stays stable for as long as the entry exists.
pub(crate) struct PageTable {
    hasher: foldhash::fast::RandomState,
    lookup: HashTable<u32>,
    entries: Slab<PageEntry>,
    limit: usize,
}

impl PageTable {
    /// Create a new table holding at most `limit` entries.
    pub(crate) fn with_limit(limit: usize) -> Self {
        Self {
            hasher: foldhash::fast::RandomState::default(),
            lookup: HashTable::with_capacity(limit),
            entries: Slab::with_capacity(limit),
            limit,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub(crate) fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    /// Find the entry of a page.
    pub(crate) fn find(&self, key: PageKey) -> Option<u32> {
        let hash_key = self.hasher.hash_one(key);
        self.lookup
            .find(hash_key, |idx| self.entries[*idx as usize].key == key)
            .copied()
    }

    /// Insert a new entry for the page.
    ///
    /// Returns `None` if the table is full, the key must not be present.
    pub(crate) fn insert(&mut self, key: PageKey) -> Option<u32> {
        if self.is_full() {
            return None;
        }
        debug_assert!(self.find(key).is_none(), "duplicate page entry {key:?}");

        let hash_key = self.hasher.hash_one(key);
        let idx = self.entries.insert(PageEntry::new(key, hash_key)) as u32;
        let entries = &self.entries;
        self.lookup.insert_unique(hash_key, idx, |idx| {
            entries[*idx as usize].hash_key
        });
        Some(idx)
    }

    /// Remove an entry from the table.
    pub(crate) fn remove(&mut self, id: u32) -> PageEntry {
        let entry = self.entries.remove(id as usize);
        let hasher = |idx: &u32| {
            if *idx == id {
                entry.hash_key
            } else {
                self.entries[*idx as usize].hash_key
            }
        };
        let eq_check = |idx: &u32| *idx == id;
        let removed = remove_lookup!(self.lookup, entry.hash_key, eq_check, hasher);
        debug_assert_eq!(removed, Some(id));
        entry
    }

    #[inline]
    pub(crate) fn get(&self, id: u32) -> &PageEntry {
        &self.entries[id as usize]
    }

    #[inline]
    pub(crate) fn get_mut(&mut self, id: u32) -> &mut PageEntry {
        &mut self.entries[id as usize]
    }

    #[inline]
    pub(crate) fn entries(&self) -> &Slab<PageEntry> {
        &self.entries
    }

    #[inline]
    pub(crate) fn entries_mut(&mut self) -> &mut Slab<PageEntry> {
        &mut self.entries
    }

    /// The first entry ID at or after `from` in slab order.
    ///
    /// Used to walk every entry across several loop iterations while entries
    /// are added and removed.
    pub(crate) fn next_id_from(&self, from: u32) -> Option<u32> {
        (from as usize..self.entries.capacity())
            .find(|idx| self.entries.contains(*idx))
            .map(|idx| idx as u32)
    }

    /// Iterate the IDs of all entries.
    pub(crate) fn ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.iter().map(|(idx, _)| idx as u32)
    }
}

#[cfg(all(test, not(feature = "test-miri")))]
mod tests {
    use super::*;

    #[test]
    fn test_insert_find_remove() {
        let mut table = PageTable::with_limit(4);
        let a = table.insert(PageKey::new(1, 1)).unwrap();
        let b = table.insert(PageKey::new(1, 2)).unwrap();
        let c = table.insert(PageKey::new(2, 1)).unwrap();

        assert_eq!(table.find(PageKey::new(1, 1)), Some(a));
        assert_eq!(table.find(PageKey::new(1, 2)), Some(b));
        assert_eq!(table.find(PageKey::new(2, 1)), Some(c));
        assert_eq!(table.find(PageKey::new(2, 2)), None);

        let removed = table.remove(b);
        assert_eq!(removed.key, PageKey::new(1, 2));
        assert_eq!(table.find(PageKey::new(1, 2)), None);
        assert_eq!(table.find(PageKey::new(2, 1)), Some(c));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_limit() {
        let mut table = PageTable::with_limit(2);
        table.insert(PageKey::new(1, 1)).unwrap();
        let id = table.insert(PageKey::new(1, 2)).unwrap();
        assert!(table.is_full());
        assert!(table.insert(PageKey::new(1, 3)).is_none());

        table.remove(id);
        assert!(table.insert(PageKey::new(1, 3)).is_some());
    }

    #[test]
    fn test_next_id_from_skips_vacant() {
        let mut table = PageTable::with_limit(8);
        let ids: Vec<_> = (1..=4)
            .map(|page| table.insert(PageKey::new(1, page)).unwrap())
            .collect();
        table.remove(ids[1]);
        table.remove(ids[2]);

        assert_eq!(table.next_id_from(0), Some(ids[0]));
        assert_eq!(table.next_id_from(ids[0] + 1), Some(ids[3]));
        assert_eq!(table.next_id_from(ids[3] + 1), None);
        assert_eq!(table.ids().count(), 2);
    }

    #[test]
    fn test_many_keys() {
        let mut table = PageTable::with_limit(10_000);
        for page in 0..10_000 {
            table.insert(PageKey::new(page % 7, page)).unwrap();
        }
        for page in (0..10_000).step_by(3) {
            let id = table.find(PageKey::new(page % 7, page)).unwrap();
            table.remove(id);
        }
        for page in 0..10_000 {
            let found = table.find(PageKey::new(page % 7, page)).is_some();
            assert_eq!(found, page % 3 != 0, "page {page}");
        }
    }
}
