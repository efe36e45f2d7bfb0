use sha2::{Digest, Sha256};

use microledger_consensus::merkle::{Hash, MerkleTree, leaf_hash};

fn node(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Replays an audit path bottom-up, mirroring the RFC 6962 PATH
/// recursion to decide sibling sides.
fn root_from_path(index: usize, size: usize, leaf: Hash, path: &[Hash]) -> Hash {
    if size == 1 {
        assert!(path.is_empty());
        return leaf;
    }
    let mut k = 1usize;
    while k * 2 < size {
        k *= 2;
    }
    let (rest, last) = path.split_at(path.len() - 1);
    if index < k {
        node(&root_from_path(index, k, leaf, rest), &last[0])
    } else {
        node(&last[0], &root_from_path(index - k, size - k, leaf, rest))
    }
}

#[test]
fn empty_tree_root_is_hash_of_nothing() {
    let tree = MerkleTree::new();
    assert_eq!(
        tree.root_hex(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}

#[test]
fn single_leaf_root_is_the_leaf_hash() {
    let leaf = leaf_hash(b"only");
    let tree = MerkleTree::from_leaves(vec![leaf]);
    assert_eq!(tree.root(), leaf);
}

#[test]
fn small_trees_follow_rfc6962_shape() {
    let leaves: Vec<Hash> = (0u8..3).map(|i| leaf_hash(&[i])).collect();

    let two = MerkleTree::from_leaves(leaves[..2].to_vec());
    assert_eq!(two.root(), node(&leaves[0], &leaves[1]));

    // Three leaves split 2 + 1.
    let three = MerkleTree::from_leaves(leaves.clone());
    assert_eq!(
        three.root(),
        node(&node(&leaves[0], &leaves[1]), &leaves[2])
    );
}

#[test]
fn audit_paths_replay_to_the_root() {
    for size in 1..=9usize {
        let leaves: Vec<Hash> = (0..size).map(|i| leaf_hash(&[i as u8])).collect();
        let tree = MerkleTree::from_leaves(leaves.clone());
        let root = tree.root();
        for (index, leaf) in leaves.iter().enumerate() {
            let path = tree.audit_path(index).expect("index in range");
            assert_eq!(
                root_from_path(index, size, *leaf, &path),
                root,
                "audit path for leaf {index} of {size} must replay"
            );
        }
    }
}

#[test]
fn audit_path_out_of_range_is_none() {
    let tree = MerkleTree::from_leaves(vec![leaf_hash(b"a")]);
    assert!(tree.audit_path(1).is_none());
}

#[test]
fn incremental_push_matches_bulk_construction() {
    let leaves: Vec<Hash> = (0u8..6).map(|i| leaf_hash(&[i])).collect();
    let mut incremental = MerkleTree::new();
    for leaf in &leaves {
        incremental.push(*leaf);
    }
    assert_eq!(incremental.root(), MerkleTree::from_leaves(leaves).root());
}
