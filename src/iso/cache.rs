//! Incremental isomorphism cache.
//!
//! Results for a rule pair are organized as a trie keyed by the ordered
//! reaction-center prefix. The root holds the sampled witnesses; the
//! node for prefix `[v0..vk]` holds only the isomorphisms newly produced
//! by permuting its parent's accumulated results over `vk`'s automorphism
//! orbit. A query walks the trie, yielding each node's values before
//! expanding the next level, so callers that stop early never pay for
//! deeper expansion, and branches sharing a reaction-center prefix share
//! the work.
//!
//! Correctness of the sharing relies on every call site presenting its
//! reaction center in the one global ascending atom-id order.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tracing::{debug, trace};

use super::matching::MatchContext;
use super::Isomorphism;
use crate::types::graph::AtomId;
use crate::types::rule::{Rule, RuleId};

// One trie node: values new at this prefix, parent link for cheap
// accumulation of everything known above.
#[derive(Debug)]
struct CacheNode {
    values: Vec<Isomorphism>,
    parent: Option<usize>,
    children: BTreeMap<AtomId, usize>,
}

/// Cursor into one rule pair's trie; plain data, so search frames can
/// hold it without borrowing the cache.
#[derive(Debug, Clone, Copy, Default)]
pub struct IsoCursor {
    node: usize,
    position: usize,
    depth: usize,
    started: bool,
}

#[derive(Debug)]
struct PairCache {
    context: MatchContext,
    nodes: Vec<CacheNode>,
}

impl PairCache {
    fn new(first: &Rule, second: &Rule, reaction_center: &BTreeSet<AtomId>) -> Self {
        let mut context = MatchContext::new(first, second);
        let values = context.sample_isomorphisms(reaction_center);
        debug!(
            first = %first.id(),
            second = %second.id(),
            witnesses = values.len(),
            "isomorphism cache pair seeded"
        );
        Self {
            context,
            nodes: vec![CacheNode {
                values,
                parent: None,
                children: BTreeMap::new(),
            }],
        }
    }

    fn next(&mut self, reaction_center: &[AtomId], cursor: &mut IsoCursor) -> Option<Isomorphism> {
        if !cursor.started {
            *cursor = IsoCursor {
                node: 0,
                position: 0,
                depth: 0,
                started: true,
            };
        }

        loop {
            let node = &self.nodes[cursor.node];
            if cursor.position < node.values.len() {
                cursor.position += 1;
                return Some(node.values[cursor.position - 1].clone());
            }

            if cursor.depth >= reaction_center.len() {
                return None;
            }

            let vertex = reaction_center[cursor.depth];
            cursor.node = self.ensure_child(cursor.node, vertex);
            cursor.position = 0;
            cursor.depth += 1;
        }
    }

    // Everything known at a node: its values plus all ancestors'.
    fn accumulated(&self, node: usize) -> Vec<Isomorphism> {
        let mut values = Vec::new();
        let mut current = Some(node);
        while let Some(index) = current {
            values.extend(self.nodes[index].values.iter().cloned());
            current = self.nodes[index].parent;
        }
        values
    }

    fn ensure_child(&mut self, node: usize, vertex: AtomId) -> usize {
        if let Some(&child) = self.nodes[node].children.get(&vertex) {
            return child;
        }

        trace!(%vertex, "expanding isomorphism cache trie");

        let known = self.accumulated(node);
        let mut seen: HashSet<Vec<(AtomId, AtomId)>> =
            known.iter().map(Isomorphism::key).collect();

        let mut new_values = Vec::new();
        for isomorphism in &known {
            for variant in self.context.permutations(isomorphism, vertex) {
                if seen.insert(variant.key()) {
                    new_values.push(variant);
                }
            }
        }

        trace!(
            known = known.len(),
            discovered = new_values.len(),
            "trie node expanded"
        );

        let child = self.nodes.len();
        self.nodes.push(CacheNode {
            values: new_values,
            parent: Some(node),
            children: BTreeMap::new(),
        });
        self.nodes[node].children.insert(vertex, child);
        child
    }
}

/// Process-lifetime cache of boundary isomorphisms, keyed by rule-pair
/// identity. Owned by one overlay-construction run; entries are never
/// evicted.
#[derive(Debug, Default)]
pub struct IsomorphismCache {
    pairs: HashMap<(RuleId, RuleId), PairCache>,
}

impl IsomorphismCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance a cursor over the isomorphisms for (first, second)
    /// restricted to the given reaction center.
    ///
    /// `reaction_center` must be sorted ascending, and every call site
    /// for the same rule pair must use that same order, or prefix
    /// sharing returns wrong results.
    pub fn next_isomorphism(
        &mut self,
        first: &Rule,
        second: &Rule,
        reaction_center: &[AtomId],
        cursor: &mut IsoCursor,
    ) -> Option<Isomorphism> {
        debug_assert!(
            reaction_center.windows(2).all(|pair| pair[0] < pair[1]),
            "reaction center must be sorted ascending"
        );

        let pair = self
            .pairs
            .entry((first.id(), second.id()))
            .or_insert_with(|| {
                let center: BTreeSet<AtomId> = reaction_center.iter().copied().collect();
                PairCache::new(first, second, &center)
            });
        pair.next(reaction_center, cursor)
    }

    /// Iterator over all isomorphisms for a reaction center. Lazy: each
    /// `next` expands at most one trie level.
    pub fn get_isomorphisms<'a>(
        &'a mut self,
        first: &'a Rule,
        second: &'a Rule,
        reaction_center: Vec<AtomId>,
    ) -> Isomorphisms<'a> {
        Isomorphisms {
            cache: self,
            first,
            second,
            reaction_center,
            cursor: IsoCursor::default(),
        }
    }
}

/// Lazy iterator over a rule pair's isomorphisms.
pub struct Isomorphisms<'a> {
    cache: &'a mut IsomorphismCache,
    first: &'a Rule,
    second: &'a Rule,
    reaction_center: Vec<AtomId>,
    cursor: IsoCursor,
}

impl Iterator for Isomorphisms<'_> {
    type Item = Isomorphism;

    fn next(&mut self) -> Option<Self::Item> {
        self.cache.next_isomorphism(
            self.first,
            self.second,
            &self.reaction_center,
            &mut self.cursor,
        )
    }
}
