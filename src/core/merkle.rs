// Binary Merkle tree over transaction ids
//
// Odd levels duplicate their last element before pairing. Nodes are
// hash256(left || right).

use crate::core::{Hash256, hash_pair};

/// Which side a proof sibling sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

/// One step of an inclusion proof, from leaf towards the root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProofStep {
    pub sibling: Hash256,
    pub side: Side,
}

/// Merkle root of a list of leaves; zero hash for an empty list
pub fn merkle_root(leaves: &[Hash256]) -> Hash256 {
    if leaves.is_empty() {
        return Hash256::zero();
    }

    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = next_level(&level);
    }
    level[0]
}

fn next_level(level: &[Hash256]) -> Vec<Hash256> {
    level
        .chunks(2)
        .map(|pair| {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            hash_pair(left, right)
        })
        .collect()
}

/// Inclusion proof for `leaves[index]`
pub fn merkle_proof(leaves: &[Hash256], index: usize) -> Option<Vec<ProofStep>> {
    if index >= leaves.len() {
        return None;
    }

    let mut proof = Vec::new();
    let mut level = leaves.to_vec();
    let mut position = index;

    while level.len() > 1 {
        let step = if position % 2 == 0 {
            // duplicated last element pairs with itself
            let sibling = level.get(position + 1).copied().unwrap_or(level[position]);
            ProofStep { sibling, side: Side::Right }
        } else {
            ProofStep { sibling: level[position - 1], side: Side::Left }
        };
        proof.push(step);

        level = next_level(&level);
        position /= 2;
    }

    Some(proof)
}

/// Fold a proof from `leaf` and compare with `root`
pub fn verify_merkle_proof(leaf: &Hash256, proof: &[ProofStep], root: &Hash256) -> bool {
    let computed = proof.iter().fold(*leaf, |acc, step| match step.side {
        Side::Right => hash_pair(&acc, &step.sibling),
        Side::Left => hash_pair(&step.sibling, &acc),
    });
    computed == *root
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::hash256;

    fn leaves(n: u8) -> Vec<Hash256> {
        (0..n).map(|i| hash256(&[i])).collect()
    }

    #[test]
    fn test_empty_and_single() {
        assert_eq!(merkle_root(&[]), Hash256::zero());
        let one = leaves(1);
        assert_eq!(merkle_root(&one), one[0]);
    }

    #[test]
    fn test_two_leaves() {
        let l = leaves(2);
        assert_eq!(merkle_root(&l), hash_pair(&l[0], &l[1]));
    }

    #[test]
    fn test_odd_count_duplicates_last() {
        let l = leaves(3);
        let expected = hash_pair(&hash_pair(&l[0], &l[1]), &hash_pair(&l[2], &l[2]));
        assert_eq!(merkle_root(&l), expected);

        // [a, b, c] and [a, b, c, c] commit to the same root
        let mut padded = l.clone();
        padded.push(l[2]);
        assert_eq!(merkle_root(&l), merkle_root(&padded));
    }

    #[test]
    fn test_order_sensitive() {
        let l = leaves(4);
        let mut swapped = l.clone();
        swapped.swap(1, 2);
        assert_ne!(merkle_root(&l), merkle_root(&swapped));
        assert_eq!(merkle_root(&l), merkle_root(&l.clone()));
    }

    #[test]
    fn test_proofs_verify_for_every_leaf() {
        for n in 1..=9u8 {
            let l = leaves(n);
            let root = merkle_root(&l);
            for (i, leaf) in l.iter().enumerate() {
                let proof = merkle_proof(&l, i).unwrap();
                assert!(verify_merkle_proof(leaf, &proof, &root), "n={} i={}", n, i);
            }
        }
    }

    #[test]
    fn test_proof_rejects_wrong_leaf() {
        let l = leaves(5);
        let root = merkle_root(&l);
        let proof = merkle_proof(&l, 2).unwrap();
        assert!(!verify_merkle_proof(&l[3], &proof, &root));
        assert!(merkle_proof(&l, 5).is_none());
    }
}
