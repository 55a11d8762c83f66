//! Stateless cursor scan.
//!
//! The cursor is a bucket index incremented on its *reversed* bits. Because
//! the high bits are advanced first, a bucket index of a small table maps to a
//! contiguous run of indices in any larger power-of-two table (its
//! "expansions"), and the walk never revisits a prefix it already covered.
//!
//! ```text
//!   size 8 (mask 0b111):   000 -> 100 -> 010 -> 110 -> 001 -> 101 -> 011 -> 111 -> 000
//!   size 16 expansions of 010:  0010, 1010
//! ```
//!
//! Guarantee: every entry present for the whole duration of a full scan is
//! reported at least once, as long as the table does not shrink below the
//! size it had when the scan started. Entries may be reported more than once.

use super::policy::DictType;
use super::table::{HashTable, Link};

impl<K, V, T: DictType<K, V>> HashTable<K, V, T> {
    /// Visits one bucket (and, while rehashing, all of its expansions in the
    /// larger array) and returns the next cursor. Start with 0; a returned 0
    /// means the scan is complete.
    ///
    /// # Example
    ///
    /// ```
    /// use emberkv::dict::HashTable;
    ///
    /// let mut table: HashTable<u32, u32> = HashTable::new();
    /// for i in 0..100 {
    ///     table.insert(i, i).unwrap();
    /// }
    ///
    /// let mut seen = std::collections::HashSet::new();
    /// let mut cursor = 0;
    /// loop {
    ///     cursor = table.scan(cursor, |k, _| {
    ///         seen.insert(*k);
    ///     });
    ///     if cursor == 0 {
    ///         break;
    ///     }
    /// }
    /// assert_eq!(seen.len(), 100);
    /// ```
    pub fn scan<F>(&self, cursor: u64, mut visit: F) -> u64
    where
        F: FnMut(&K, &V),
    {
        if self.is_empty() {
            return 0;
        }
        let mut v = cursor;

        match self.target() {
            None => {
                let m0 = self.main.mask() as u64;
                visit_chain(&self.main.buckets[(v & m0) as usize], &mut visit);
                v |= !m0;
            }
            Some(target) => {
                let (small, large) = if self.main.size() <= target.size() {
                    (&self.main, target)
                } else {
                    (target, &self.main)
                };
                let m0 = small.mask() as u64;
                let m1 = large.mask() as u64;

                visit_chain(&small.buckets[(v & m0) as usize], &mut visit);

                // Every expansion of the small bucket in the large table.
                loop {
                    visit_chain(&large.buckets[(v & m1) as usize], &mut visit);
                    v = ((v | m0).wrapping_add(1) & !m0) | (v & m0);
                    if v & (m0 ^ m1) == 0 {
                        break;
                    }
                }
                v |= !m0;
            }
        }

        v.reverse_bits().wrapping_add(1).reverse_bits()
    }
}

fn visit_chain<K, V, F: FnMut(&K, &V)>(link: &Link<K, V>, visit: &mut F) {
    let mut cur = link.as_deref();
    while let Some(entry) = cur {
        visit(&entry.key, &entry.value);
        cur = entry.next.as_deref();
    }
}
