//! Merkle tree over canonical-JSON leaves, RFC 6962 layout.
//!
//! Leaves are hashed as `SHA-256(0x00 ‖ leaf)`, interior nodes as
//! `SHA-256(0x01 ‖ left ‖ right)`, and a subtree of `n > 1` leaves splits
//! at the largest power of two smaller than `n`. Audit paths follow the
//! RFC's `PATH(m, D[n])` recursion, so a third party can replay a single
//! transaction's inclusion against a published root.

use sha2::{Digest, Sha256};

pub type Hash = [u8; 32];

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

pub fn leaf_hash(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([LEAF_PREFIX]);
    hasher.update(data);
    hasher.finalize().into()
}

fn node_hash(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([NODE_PREFIX]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Largest power of two strictly less than `n`. Requires `n >= 2`.
fn split_point(n: usize) -> usize {
    let mut k = 1usize;
    while k * 2 < n {
        k *= 2;
    }
    k
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MerkleTree {
    leaves: Vec<Hash>,
}

impl MerkleTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_leaves(leaves: Vec<Hash>) -> Self {
        Self { leaves }
    }

    pub fn push(&mut self, leaf: Hash) {
        self.leaves.push(leaf);
    }

    pub fn len(&self) -> usize {
        self.leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    /// Root of the whole tree. The empty tree hashes to `SHA-256("")`.
    pub fn root(&self) -> Hash {
        if self.leaves.is_empty() {
            return Sha256::digest([]).into();
        }
        subtree_root(&self.leaves)
    }

    pub fn root_hex(&self) -> String {
        hex::encode(self.root())
    }

    /// Audit path for the leaf at `index` (0-based), ordered
    /// leaf-to-root. `None` when the index is out of range.
    pub fn audit_path(&self, index: usize) -> Option<Vec<Hash>> {
        if index >= self.leaves.len() {
            return None;
        }
        let mut path = Vec::new();
        collect_path(index, &self.leaves, &mut path);
        Some(path)
    }
}

fn subtree_root(leaves: &[Hash]) -> Hash {
    match leaves.len() {
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&subtree_root(&leaves[..k]), &subtree_root(&leaves[k..]))
        }
    }
}

fn collect_path(m: usize, leaves: &[Hash], path: &mut Vec<Hash>) {
    if leaves.len() <= 1 {
        return;
    }
    let k = split_point(leaves.len());
    if m < k {
        collect_path(m, &leaves[..k], path);
        path.push(subtree_root(&leaves[k..]));
    } else {
        collect_path(m - k, &leaves[k..], path);
        path.push(subtree_root(&leaves[..k]));
    }
}
