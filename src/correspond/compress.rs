// Part-index compression
//
// Search nodes store part sets and mappings as small integers instead of
// the long string ids the structure graphs use. The two tables (source
// and target side) are created when the first root is explored and shared
// read-mostly across trial workers; topological operations append the
// synthetic ids they introduce.

use std::collections::HashMap;
use std::sync::RwLock;

/// The distinguished target meaning "this source part maps to nothing"
pub const NULL_PART: &str = "<null>";

#[derive(Debug, Default)]
struct TableInner {
    ids: Vec<String>,
    lookup: HashMap<String, u32>,
}

/// Write-once-read-many bijection between part ids and small integers.
/// Interning an id that is already present returns its existing index,
/// so the mapping stays a bijection.
#[derive(Debug, Default)]
pub struct PartIndexTable {
    inner: RwLock<TableInner>,
}

impl PartIndexTable {
    pub fn new() -> PartIndexTable {
        PartIndexTable::default()
    }

    pub fn from_ids<'a, I: IntoIterator<Item = &'a str>>(ids: I) -> PartIndexTable {
        let table = PartIndexTable::new();
        for id in ids {
            table.intern(id);
        }
        table
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("table lock").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of an id, allocating a new one on first sight
    pub fn intern(&self, id: &str) -> u32 {
        if let Some(idx) = self.get(id) {
            return idx;
        }
        let mut inner = self.inner.write().expect("table lock");
        // Re-check under the write lock
        if let Some(&idx) = inner.lookup.get(id) {
            return idx;
        }
        let idx = inner.ids.len() as u32;
        inner.ids.push(id.to_string());
        inner.lookup.insert(id.to_string(), idx);
        idx
    }

    pub fn get(&self, id: &str) -> Option<u32> {
        self.inner.read().expect("table lock").lookup.get(id).copied()
    }

    /// Id for a compressed index. Panics on an index the table never
    /// produced, which would be a bookkeeping bug, not input data.
    pub fn resolve(&self, idx: u32) -> String {
        self.inner.read().expect("table lock").ids[idx as usize].clone()
    }

    pub fn compress(&self, ids: &[String]) -> Vec<u32> {
        ids.iter().map(|id| self.intern(id)).collect()
    }

    pub fn decompress(&self, indices: &[u32]) -> Vec<String> {
        indices.iter().map(|&i| self.resolve(i)).collect()
    }
}

/// The source and target tables of one correspondence session
#[derive(Debug, Default)]
pub struct CompressionTables {
    pub source: PartIndexTable,
    pub target: PartIndexTable,
}

impl CompressionTables {
    pub fn for_graphs(
        source: &crate::correspond::structure_graph::StructureGraph,
        target: &crate::correspond::structure_graph::StructureGraph,
    ) -> CompressionTables {
        let tables = CompressionTables {
            source: PartIndexTable::new(),
            target: PartIndexTable::new(),
        };
        for p in &source.parts {
            tables.source.intern(&p.id);
        }
        for p in &target.parts {
            tables.target.intern(&p.id);
        }
        tables
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compress_decompress_round_trip() {
        let ids: Vec<String> = ["seat", "back", "leg-front-left", "leg-front-right"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let table = PartIndexTable::new();

        let compressed = table.compress(&ids);
        let decompressed = table.decompress(&compressed);
        assert_eq!(ids, decompressed);
    }

    #[test]
    fn test_interning_is_stable() {
        let table = PartIndexTable::new();
        let a = table.intern("seat");
        let b = table.intern("back");
        assert_eq!(table.intern("seat"), a);
        assert_eq!(table.intern("back"), b);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_indices_are_dense() {
        let table = PartIndexTable::from_ids(["a", "b", "c"]);
        for i in 0..3u32 {
            let id = table.resolve(i);
            assert_eq!(table.get(&id), Some(i));
        }
    }

    #[test]
    fn test_shared_across_threads() {
        use std::sync::Arc;

        let table = Arc::new(PartIndexTable::from_ids(["x", "y"]));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let t = Arc::clone(&table);
                std::thread::spawn(move || t.intern(&format!("part{}", i % 2)))
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        // Two pre-seeded + two distinct new ids
        assert_eq!(table.len(), 4);
    }
}
