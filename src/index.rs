//! In-memory BK-tree index over 64-bit perceptual hashes.
//!
//! Hamming distance on 64-bit values is a metric, so a node's subtree at
//! edge distance `e` can be skipped whenever |e - d| > radius for the
//! query's distance `d` at that node. The index is never persisted; it is
//! rebuilt from the store and discarded when it grows past twice its
//! built size.

use crate::db::{Database, FeatureRow};
use crate::error::Result;
use crate::features::hashing::hamming_distance;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashKind {
    PHash,
    DHash,
    AHash,
}

struct Node {
    hash: u64,
    file_id: i64,
    /// (edge distance to parent key, child node index), unordered.
    children: Vec<(u32, usize)>,
}

#[derive(Default)]
pub struct BkTree {
    nodes: Vec<Node>,
}

impl BkTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// One root-to-leaf descent; equal hashes chain through distance-0
    /// edges so duplicates coexist.
    pub fn insert(&mut self, hash: u64, file_id: i64) {
        if self.nodes.is_empty() {
            self.nodes.push(Node {
                hash,
                file_id,
                children: Vec::new(),
            });
            return;
        }

        let mut current = 0;
        loop {
            let distance = hamming_distance(self.nodes[current].hash, hash);
            match self.nodes[current]
                .children
                .iter()
                .find(|&&(edge, _)| edge == distance)
            {
                Some(&(_, child)) => current = child,
                None => {
                    let new_index = self.nodes.len();
                    self.nodes.push(Node {
                        hash,
                        file_id,
                        children: Vec::new(),
                    });
                    self.nodes[current].children.push((distance, new_index));
                    return;
                }
            }
        }
    }

    /// Every stored (file_id, distance) with Hamming distance <= radius.
    pub fn query(&self, hash: u64, radius: u32) -> Vec<(i64, u32)> {
        let mut results = Vec::new();
        if self.nodes.is_empty() {
            return results;
        }

        let mut stack = vec![0usize];
        while let Some(index) = stack.pop() {
            let node = &self.nodes[index];
            let distance = hamming_distance(node.hash, hash);
            if distance <= radius {
                results.push((node.file_id, distance));
            }
            for &(edge, child) in &node.children {
                if edge.abs_diff(distance) <= radius {
                    stack.push(child);
                }
            }
        }
        results
    }
}

/// One BK-tree per hash kind, built from the store's feature rows.
#[derive(Default)]
pub struct SearchIndex {
    phash: BkTree,
    dhash: BkTree,
    ahash: BkTree,
    built_len: usize,
}

impl SearchIndex {
    pub fn build_from_store(db: &Database) -> Result<Self> {
        let mut index = SearchIndex::default();
        for feature in db.features_for_index()? {
            index.insert_feature(&feature);
        }
        index.built_len = index.phash.len();
        tracing::info!(
            phash = index.phash.len(),
            dhash = index.dhash.len(),
            ahash = index.ahash.len(),
            "search index built"
        );
        Ok(index)
    }

    pub fn insert_feature(&mut self, feature: &FeatureRow) {
        if let Some(hash) = feature.phash {
            self.phash.insert(hash, feature.file_id);
        }
        if let Some(hash) = feature.dhash {
            self.dhash.insert(hash, feature.file_id);
        }
        if let Some(hash) = feature.ahash {
            self.ahash.insert(hash, feature.file_id);
        }
    }

    pub fn query(&self, kind: HashKind, hash: u64, radius: u32) -> Vec<(i64, u32)> {
        self.tree(kind).query(hash, radius)
    }

    fn tree(&self, kind: HashKind) -> &BkTree {
        match kind {
            HashKind::PHash => &self.phash,
            HashKind::DHash => &self.dhash,
            HashKind::AHash => &self.ahash,
        }
    }

    /// Incremental inserts are fine until the tree has doubled since the
    /// last full build; after that the insertion order has likely degraded
    /// its shape and a rebuild is cheaper than living with it.
    pub fn needs_rebuild(&self) -> bool {
        self.built_len == 0 || self.phash.len() > self.built_len * 2
    }
}
