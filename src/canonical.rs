//! Canonical forms for graphs and rules.
//!
//! Deduplication throughout the kernel compares canonical forms, never
//! object identity: two graphs get the same [`CanonicalForm`] exactly
//! when they are isomorphic under vertex-label-exact matching.
//!
//! ## Determinism Guarantees
//!
//! - Structural edge labels are replaced by a fixed sentinel: only vertex
//!   labels and topology distinguish graphs here.
//! - Each distinct vertex label is assigned a surrogate token the first
//!   time one canonicalizer instance sees it; the token table is
//!   append-only and instance-owned. Forms from two different
//!   canonicalizer instances are not comparable.
//! - A disconnected graph's form is the sorted tuple of per-component
//!   labels, so whole-graph comparison is multiset comparison.
//!
//! The per-component label is computed by color refinement plus
//! individualization backtracking, taking the lexicographically smallest
//! encoding over the refinement tree.

use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use xxhash_rust::xxh64::xxh64;

use crate::types::graph::{AtomId, MolGraph};
use crate::types::rule::Rule;

const DEFAULT_MEMO_ENTRIES: usize = 4096;

/// Isomorphism-invariant representative of a graph: the sorted tuple of
/// its components' canonical labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct CanonicalForm(Vec<String>);

impl CanonicalForm {
    /// Per-component labels, sorted.
    pub fn labels(&self) -> &[String] {
        &self.0
    }

    /// Compact digest of the form.
    pub fn digest(&self) -> u64 {
        xxh64(self.0.join("\u{1f}").as_bytes(), 0)
    }

    /// Digest as a hex string.
    pub fn digest_hex(&self) -> String {
        format!("{:016x}", self.digest())
    }
}

impl fmt::Display for CanonicalForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join(" . "))
    }
}

/// A graph together with its canonical form.
///
/// Equality, ordering and hashing consider the form only.
#[derive(Debug, Clone)]
pub struct CanonicalGraph {
    graph: MolGraph,
    form: CanonicalForm,
}

impl CanonicalGraph {
    /// The underlying graph.
    pub fn graph(&self) -> &MolGraph {
        &self.graph
    }

    /// The canonical form.
    pub fn form(&self) -> &CanonicalForm {
        &self.form
    }
}

impl PartialEq for CanonicalGraph {
    fn eq(&self, other: &Self) -> bool {
        self.form == other.form
    }
}

impl Eq for CanonicalGraph {}

impl PartialOrd for CanonicalGraph {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalGraph {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.form.cmp(&other.form)
    }
}

impl std::hash::Hash for CanonicalGraph {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.form.hash(state);
    }
}

/// A rule together with the canonical forms of its combined graph and of
/// its two sides. Equality and hashing consider the combined form only.
#[derive(Debug, Clone)]
pub struct CanonicalRule {
    rule: Rule,
    form: CanonicalForm,
    left: CanonicalForm,
    right: CanonicalForm,
}

impl CanonicalRule {
    /// The underlying rule.
    pub fn rule(&self) -> &Rule {
        &self.rule
    }

    /// Canonical form of the combined left+right graph.
    pub fn form(&self) -> &CanonicalForm {
        &self.form
    }

    /// Canonical form of the reactant side.
    pub fn left_form(&self) -> &CanonicalForm {
        &self.left
    }

    /// Canonical form of the product side.
    pub fn right_form(&self) -> &CanonicalForm {
        &self.right
    }
}

impl PartialEq for CanonicalRule {
    fn eq(&self, other: &Self) -> bool {
        self.form == other.form
    }
}

impl Eq for CanonicalRule {}

impl std::hash::Hash for CanonicalRule {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.form.hash(state);
    }
}

struct CanonState {
    // Append-only label -> surrogate token table, first-seen order.
    tokens: HashMap<String, usize>,
    memo: LruCache<u64, String>,
}

/// Instance-scoped canonicalizer.
///
/// Owns the surrogate-token table and a memo of already-canonicalized
/// components. One instance serves one mechanism-processing session;
/// never compare forms across instances.
pub struct GraphCanonicalizer {
    state: Mutex<CanonState>,
}

impl GraphCanonicalizer {
    /// Create a canonicalizer with the default memo capacity.
    pub fn new() -> Self {
        Self::with_memo_entries(DEFAULT_MEMO_ENTRIES)
    }

    /// Create a canonicalizer with a custom memo capacity.
    pub fn with_memo_entries(entries: usize) -> Self {
        let entries = NonZeroUsize::new(entries.max(1)).expect("clamped to at least one");
        Self {
            state: Mutex::new(CanonState {
                tokens: HashMap::new(),
                memo: LruCache::new(entries),
            }),
        }
    }

    /// Canonical form of a (possibly disconnected) graph.
    pub fn canonical_form(&self, graph: &MolGraph) -> CanonicalForm {
        let mut labels: Vec<String> = graph
            .components()
            .iter()
            .map(|component| self.component_label(component))
            .collect();
        labels.sort();
        CanonicalForm(labels)
    }

    /// Canonical form of a rule: the form of its combined graph.
    pub fn canonical_rule_form(&self, rule: &Rule) -> CanonicalForm {
        self.canonical_form(&rule.combined_graph())
    }

    /// Wrap a graph with its canonical form.
    pub fn canonicalize_graph(&self, graph: MolGraph) -> CanonicalGraph {
        let form = self.canonical_form(&graph);
        CanonicalGraph { graph, form }
    }

    /// Wrap a rule with its canonical forms.
    pub fn canonicalize_rule(&self, rule: Rule) -> CanonicalRule {
        let form = self.canonical_rule_form(&rule);
        let left = self.canonical_form(&rule.left());
        let right = self.canonical_form(&rule.right());
        CanonicalRule {
            rule,
            form,
            left,
            right,
        }
    }

    // Canonical label of one connected component.
    fn component_label(&self, component: &MolGraph) -> String {
        let mut state = self.state.lock();

        let memo_key = xxh64(Self::encoding(component).as_bytes(), 0);
        if let Some(label) = state.memo.get(&memo_key) {
            return label.clone();
        }

        // Resolve surrogate tokens first so the canonical search sees
        // label-independent colors.
        let atoms: Vec<(AtomId, usize)> = component
            .atoms()
            .map(|(id, label)| {
                let next = state.tokens.len() + 1;
                let token = *state.tokens.entry(label.to_string()).or_insert(next);
                (id, token)
            })
            .collect();

        let label = Self::canonical_string(component, &atoms);
        state.memo.put(memo_key, label.clone());
        label
    }

    // Exact structural encoding used as the memo key.
    fn encoding(graph: &MolGraph) -> String {
        let atoms: Vec<String> = graph
            .atoms()
            .map(|(id, label)| format!("{id}={label}"))
            .collect();
        let bonds: Vec<String> = graph
            .bonds()
            .iter()
            .map(|(key, label)| format!("{key}={label}"))
            .collect();
        format!("a[{}]b[{}]", atoms.join(","), bonds.join(","))
    }

    fn canonical_string(component: &MolGraph, atoms: &[(AtomId, usize)]) -> String {
        let count = atoms.len();
        let position: BTreeMap<AtomId, usize> = atoms
            .iter()
            .enumerate()
            .map(|(index, &(id, _))| (id, index))
            .collect();

        let tokens: Vec<usize> = atoms.iter().map(|&(_, token)| token).collect();

        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); count];
        for (key, _) in component.bonds() {
            let u = position[&key.source()];
            let v = position[&key.target()];
            adjacency[u].push(v);
            adjacency[v].push(u);
        }

        // Initial colors are token ranks.
        let mut sorted_tokens: Vec<usize> = tokens.clone();
        sorted_tokens.sort_unstable();
        sorted_tokens.dedup();
        let colors: Vec<usize> = tokens
            .iter()
            .map(|token| {
                sorted_tokens
                    .binary_search(token)
                    .expect("token present in its own sorted set")
            })
            .collect();

        Self::search(&tokens, &adjacency, colors)
    }

    // Color refinement to a stable partition.
    fn refine(adjacency: &[Vec<usize>], mut colors: Vec<usize>) -> Vec<usize> {
        loop {
            let mut signatures: Vec<(usize, Vec<usize>, usize)> = colors
                .iter()
                .enumerate()
                .map(|(node, &color)| {
                    let mut neighbor_colors: Vec<usize> =
                        adjacency[node].iter().map(|&n| colors[n]).collect();
                    neighbor_colors.sort_unstable();
                    (color, neighbor_colors, node)
                })
                .collect();

            let mut ranking: Vec<(usize, Vec<usize>)> = signatures
                .iter()
                .map(|(color, neighbors, _)| (*color, neighbors.clone()))
                .collect();
            ranking.sort();
            ranking.dedup();

            let before = colors.iter().collect::<BTreeSet<_>>().len();

            signatures.sort();
            let mut new_colors = vec![0usize; colors.len()];
            for (color, neighbors, node) in &signatures {
                let rank = ranking
                    .binary_search(&(*color, neighbors.clone()))
                    .expect("signature present in ranking");
                new_colors[*node] = rank;
            }

            let after = new_colors.iter().collect::<BTreeSet<_>>().len();
            colors = new_colors;
            if after == before {
                return colors;
            }
        }
    }

    // Individualization-refinement search for the minimal encoding.
    fn search(tokens: &[usize], adjacency: &[Vec<usize>], colors: Vec<usize>) -> String {
        let colors = Self::refine(adjacency, colors);
        let distinct = colors.iter().collect::<BTreeSet<_>>().len();

        if distinct == colors.len() {
            return Self::encode(tokens, adjacency, &colors);
        }

        // Smallest non-singleton color class, by color value.
        let mut classes: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (node, &color) in colors.iter().enumerate() {
            classes.entry(color).or_default().push(node);
        }
        let cell = classes
            .values()
            .find(|members| members.len() > 1)
            .expect("a non-discrete coloring has a non-singleton cell")
            .clone();

        cell.iter()
            .map(|&candidate| {
                let branched: Vec<usize> = colors
                    .iter()
                    .enumerate()
                    .map(|(node, &color)| 2 * color + usize::from(node != candidate))
                    .collect();
                Self::search(tokens, adjacency, branched)
            })
            .min()
            .expect("cell has at least two candidates")
    }

    // Encoding under a discrete coloring: nodes ordered by color.
    fn encode(tokens: &[usize], adjacency: &[Vec<usize>], colors: &[usize]) -> String {
        let mut order: Vec<usize> = (0..colors.len()).collect();
        order.sort_by_key(|&node| colors[node]);

        let mut rank = vec![0usize; colors.len()];
        for (index, &node) in order.iter().enumerate() {
            rank[node] = index;
        }

        let vertex_part: Vec<String> = order
            .iter()
            .map(|&node| format!("{}C", tokens[node]))
            .collect();

        let mut edge_part: Vec<(usize, usize)> = Vec::new();
        for (node, neighbors) in adjacency.iter().enumerate() {
            for &neighbor in neighbors {
                if rank[node] < rank[neighbor] {
                    edge_part.push((rank[node], rank[neighbor]));
                }
            }
        }
        edge_part.sort_unstable();

        let edges: Vec<String> = edge_part
            .iter()
            .map(|(u, v)| format!("{u}-{v}"))
            .collect();

        format!("{}|{}", vertex_part.join(","), edges.join(","))
    }
}

impl Default for GraphCanonicalizer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn labeled_graph(atoms: &[(u32, &str)], bonds: &[(u32, u32)]) -> MolGraph {
        let mut graph = MolGraph::new();
        for &(id, label) in atoms {
            graph.add_atom(AtomId(id), label);
        }
        for &(u, v) in bonds {
            graph.add_bond(AtomId(u), AtomId(v), "-").unwrap();
        }
        graph
    }

    #[test]
    fn test_relabeling_invariance() {
        let canonicalizer = GraphCanonicalizer::new();

        let a = labeled_graph(&[(0, "C"), (1, "O"), (2, "H")], &[(0, 1), (1, 2)]);
        let b = labeled_graph(&[(7, "O"), (3, "H"), (9, "C")], &[(9, 7), (7, 3)]);

        assert_eq!(
            canonicalizer.canonical_form(&a),
            canonicalizer.canonical_form(&b)
        );
    }

    #[test]
    fn test_distinguishes_topology() {
        let canonicalizer = GraphCanonicalizer::new();

        let path = labeled_graph(&[(0, "C"), (1, "C"), (2, "C")], &[(0, 1), (1, 2)]);
        let triangle = labeled_graph(&[(0, "C"), (1, "C"), (2, "C")], &[(0, 1), (1, 2), (0, 2)]);

        assert_ne!(
            canonicalizer.canonical_form(&path),
            canonicalizer.canonical_form(&triangle)
        );
    }

    #[test]
    fn test_distinguishes_vertex_labels() {
        let canonicalizer = GraphCanonicalizer::new();

        let water = labeled_graph(&[(0, "H"), (1, "O"), (2, "H")], &[(0, 1), (1, 2)]);
        let sulfide = labeled_graph(&[(0, "H"), (1, "S"), (2, "H")], &[(0, 1), (1, 2)]);

        assert_ne!(
            canonicalizer.canonical_form(&water),
            canonicalizer.canonical_form(&sulfide)
        );
    }

    #[test]
    fn test_edge_labels_are_sentineled() {
        let canonicalizer = GraphCanonicalizer::new();

        let mut single = MolGraph::new();
        single.add_atom(AtomId(0), "C");
        single.add_atom(AtomId(1), "O");
        single.add_bond(AtomId(0), AtomId(1), "-").unwrap();

        let mut double = MolGraph::new();
        double.add_atom(AtomId(0), "C");
        double.add_atom(AtomId(1), "O");
        double.add_bond(AtomId(0), AtomId(1), "=").unwrap();

        assert_eq!(
            canonicalizer.canonical_form(&single),
            canonicalizer.canonical_form(&double)
        );
    }

    #[test]
    fn test_component_order_independent() {
        let canonicalizer = GraphCanonicalizer::new();

        let a = labeled_graph(&[(0, "O"), (1, "H"), (5, "C"), (6, "H")], &[(0, 1), (5, 6)]);
        let b = labeled_graph(&[(0, "C"), (1, "H"), (5, "O"), (6, "H")], &[(0, 1), (5, 6)]);

        assert_eq!(
            canonicalizer.canonical_form(&a),
            canonicalizer.canonical_form(&b)
        );
    }

    #[test]
    fn test_symmetric_ring() {
        let canonicalizer = GraphCanonicalizer::new();

        let ring_a = labeled_graph(
            &[(0, "C"), (1, "C"), (2, "C"), (3, "C"), (4, "C"), (5, "C")],
            &[(0, 1), (1, 2), (2, 3), (3, 4), (4, 5), (5, 0)],
        );
        let ring_b = labeled_graph(
            &[(10, "C"), (11, "C"), (12, "C"), (13, "C"), (14, "C"), (15, "C")],
            &[(10, 11), (11, 12), (12, 13), (13, 14), (14, 15), (15, 10)],
        );

        assert_eq!(
            canonicalizer.canonical_form(&ring_a),
            canonicalizer.canonical_form(&ring_b)
        );
    }

    #[test]
    fn test_rule_canonical_identity_under_relabeling() {
        let canonicalizer = GraphCanonicalizer::new();

        let rule_a = Rule::builder("shift")
            .atom(0, "O")
            .atom(1, "H")
            .atom_change(2, "N", "N+")
            .bond_left(0, 1, "-")
            .bond_right(1, 2, "-")
            .build()
            .unwrap();

        let rule_b = Rule::builder("shift_relabeled")
            .atom(10, "O")
            .atom(21, "H")
            .atom_change(32, "N", "N+")
            .bond_left(10, 21, "-")
            .bond_right(21, 32, "-")
            .build()
            .unwrap();

        assert_eq!(
            canonicalizer.canonical_rule_form(&rule_a),
            canonicalizer.canonical_rule_form(&rule_b)
        );
    }

    #[test]
    fn test_canonical_graph_dedup() {
        let canonicalizer = GraphCanonicalizer::new();

        let a = labeled_graph(&[(0, "C"), (1, "O")], &[(0, 1)]);
        let b = labeled_graph(&[(4, "O"), (9, "C")], &[(4, 9)]);

        let mut seen = std::collections::HashSet::new();
        seen.insert(canonicalizer.canonicalize_graph(a));
        seen.insert(canonicalizer.canonicalize_graph(b));

        assert_eq!(seen.len(), 1);
    }

    proptest! {
        // Relabeling a fixed molecule by any permutation of fresh ids
        // cannot change its canonical form.
        #[test]
        fn prop_permutation_invariance(order in Just(vec![0u32, 1, 2, 3, 4, 5]).prop_shuffle()) {
            let atoms = ["C", "C", "O", "H", "H", "N"];
            let bonds = [(0usize, 1usize), (1, 2), (0, 3), (1, 4), (2, 5)];

            let canonicalizer = GraphCanonicalizer::new();

            let mut base = MolGraph::new();
            for (index, label) in atoms.iter().enumerate() {
                base.add_atom(AtomId(index as u32), *label);
            }
            for &(u, v) in &bonds {
                base.add_bond(AtomId(u as u32), AtomId(v as u32), "-").unwrap();
            }

            let mut permuted = MolGraph::new();
            for (index, label) in atoms.iter().enumerate() {
                permuted.add_atom(AtomId(order[index] + 100), *label);
            }
            for &(u, v) in &bonds {
                permuted.add_bond(AtomId(order[u] + 100), AtomId(order[v] + 100), "-").unwrap();
            }

            prop_assert_eq!(
                canonicalizer.canonical_form(&base),
                canonicalizer.canonical_form(&permuted)
            );
        }
    }
}
