//! Canonical interning of disjunctions.
//!
//! Two disjunctions with the same provider set are the same disjunction; the
//! trie maps a provider set, walked as its sorted ascending id sequence, to
//! the first node that was offered for it. Later offers of the same set get
//! the winner back and are forwarded to it by the caller.

use std::collections::BTreeSet;

use ahash::HashMap;

use crate::internal::id::NodeId;

#[derive(Default)]
struct TrieNode {
    /// The winning node for the set ending at this trie node, if any set
    /// ends here.
    winner: Option<NodeId>,
    children: HashMap<NodeId, TrieNode>,
}

/// Prefix tree keyed by sorted provider-id sequences.
#[derive(Default)]
pub struct DisjunctionTrie {
    root: TrieNode,
}

impl DisjunctionTrie {
    pub fn new() -> Self {
        Self::default()
    }

    /// Offers `candidate` as the disjunction over `providers`. Returns the
    /// id canonically representing that provider set: `candidate` itself if
    /// the set was never seen, the earlier winner otherwise.
    pub fn intern(&mut self, candidate: NodeId, providers: &BTreeSet<NodeId>) -> NodeId {
        let mut current = &mut self.root;
        for &p in providers {
            current = current.children.entry(p).or_default();
        }
        *current.winner.get_or_insert(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[u32]) -> BTreeSet<NodeId> {
        ids.iter().map(|&i| NodeId(i)).collect()
    }

    #[test]
    fn first_offer_wins() {
        let mut trie = DisjunctionTrie::new();
        assert_eq!(trie.intern(NodeId(7), &set(&[1, 2, 3])), NodeId(7));
        assert_eq!(trie.intern(NodeId(9), &set(&[1, 2, 3])), NodeId(7));
        // A prefix of an interned set is a different set.
        assert_eq!(trie.intern(NodeId(11), &set(&[1, 2])), NodeId(11));
        // And so is an extension.
        assert_eq!(trie.intern(NodeId(13), &set(&[1, 2, 3, 4])), NodeId(13));
    }

    #[test]
    fn singleton_sets_collide_with_their_seed() {
        let mut trie = DisjunctionTrie::new();
        // A concrete node seeds the trie with the set containing only
        // itself, so its self-disjunction collapses onto it.
        assert_eq!(trie.intern(NodeId(0), &set(&[0])), NodeId(0));
        assert_eq!(trie.intern(NodeId(5), &set(&[0])), NodeId(0));
    }

    #[test]
    fn the_empty_set_is_a_set_too() {
        let mut trie = DisjunctionTrie::new();
        assert_eq!(trie.intern(NodeId(3), &set(&[])), NodeId(3));
        assert_eq!(trie.intern(NodeId(4), &set(&[])), NodeId(3));
    }
}
