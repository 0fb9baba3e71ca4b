use serde::{Deserialize, Serialize};

use crate::crypto::digest;
use crate::types::Digest;

pub fn hash_pair(left: &Digest, right: &Digest) -> Digest {
    let mut data = Vec::with_capacity(64);
    data.extend_from_slice(&left.0);
    data.extend_from_slice(&right.0);
    digest(&data)
}

/// Root of a binary merkle tree over `leaves`. An odd leaf at any layer is
/// paired with itself, so both sides of the network reduce the same layers.
pub fn merkle_root(leaves: &[Digest]) -> Digest {
    if leaves.is_empty() {
        return digest(&[]);
    }
    let mut layer = leaves.to_vec();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for chunk in layer.chunks(2) {
            let left = &chunk[0];
            let right = if chunk.len() == 2 { &chunk[1] } else { &chunk[0] };
            next.push(hash_pair(left, right));
        }
        layer = next;
    }
    layer[0]
}

/// Accumulator over the stream of block ids. Keeps one node per filled tree
/// level; appending is O(log n) and the root folds the live peaks together
/// from the highest level down.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncrementalMerkle {
    peaks: Vec<Option<Digest>>,
    leaf_count: u64,
}

impl IncrementalMerkle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    pub fn append(&mut self, leaf: Digest) {
        let mut node = leaf;
        let mut level = 0;
        loop {
            if level == self.peaks.len() {
                self.peaks.push(None);
            }
            match self.peaks[level].take() {
                None => {
                    self.peaks[level] = Some(node);
                    break;
                }
                Some(existing) => {
                    node = hash_pair(&existing, &node);
                    level += 1;
                }
            }
        }
        self.leaf_count += 1;
    }

    pub fn root(&self) -> Digest {
        let mut accumulated: Option<Digest> = None;
        for peak in self.peaks.iter().rev().flatten() {
            accumulated = Some(match accumulated {
                None => *peak,
                Some(acc) => hash_pair(&acc, peak),
            });
        }
        accumulated.unwrap_or_else(|| digest(&[]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf(tag: u8) -> Digest {
        digest(&[tag])
    }

    #[test]
    fn empty_and_single_leaf_roots() {
        assert_eq!(merkle_root(&[]), digest(&[]));
        assert_eq!(merkle_root(&[leaf(1)]), leaf(1));
    }

    #[test]
    fn odd_leaf_is_paired_with_itself() {
        let leaves = [leaf(1), leaf(2), leaf(3)];
        let left = hash_pair(&leaf(1), &leaf(2));
        let right = hash_pair(&leaf(3), &leaf(3));
        assert_eq!(merkle_root(&leaves), hash_pair(&left, &right));
    }

    #[test]
    fn incremental_append_tracks_leaf_count() {
        let mut tree = IncrementalMerkle::new();
        assert_eq!(tree.root(), digest(&[]));
        for i in 0..5u8 {
            tree.append(leaf(i));
        }
        assert_eq!(tree.leaf_count(), 5);
    }

    #[test]
    fn incremental_root_matches_power_of_two_reduction() {
        let leaves = [leaf(1), leaf(2), leaf(3), leaf(4)];
        let mut tree = IncrementalMerkle::new();
        for l in &leaves {
            tree.append(*l);
        }
        assert_eq!(tree.root(), merkle_root(&leaves));
    }

    #[test]
    fn incremental_root_changes_with_each_append() {
        let mut tree = IncrementalMerkle::new();
        let mut seen = Vec::new();
        for i in 0..8u8 {
            tree.append(leaf(i));
            let root = tree.root();
            assert!(!seen.contains(&root));
            seen.push(root);
        }
    }
}
