//! Labeled undirected graphs keyed by external atom identity.
//!
//! Every graph in the kernel (rule sides, overlay hosts, product graphs,
//! connected components) is a [`MolGraph`]: vertices carry opaque string
//! labels and are addressed by the [`AtomId`] they were created with, so a
//! vertex keeps its identity across a rule's two sides and across the
//! whole mechanism. Bonds are unordered pairs ([`BondKey`]).
//!
//! Isomorphism and automorphism enumeration is label-exact (vertex and
//! edge labels must match) and delegates to petgraph's VF2.

use petgraph::algo::{is_isomorphic_matching, subgraph_isomorphisms_iter};
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Error type for graph construction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GraphError {
    /// A bond referenced an atom that is not in the graph.
    #[error("Unknown atom {0} referenced by a bond")]
    UnknownAtom(AtomId),
}

/// External vertex identity, shared by a rule's left/right sides and the
/// host graph it is matched onto.
///
/// Implements `Ord`: all reaction-center orderings in the kernel follow
/// this single ascending order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct AtomId(pub u32);

impl AtomId {
    /// Create an atom id.
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw integer value.
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AtomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unordered atom pair denoting a bond, stored normalized (min, max).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BondKey {
    a: AtomId,
    b: AtomId,
}

impl BondKey {
    /// Create a bond key; endpoint order does not matter.
    pub fn new(u: AtomId, v: AtomId) -> Self {
        if u <= v {
            Self { a: u, b: v }
        } else {
            Self { a: v, b: u }
        }
    }

    /// Smaller endpoint.
    pub fn source(&self) -> AtomId {
        self.a
    }

    /// Larger endpoint.
    pub fn target(&self) -> AtomId {
        self.b
    }

    /// Whether the bond touches the given atom.
    pub fn contains(&self, atom: AtomId) -> bool {
        self.a == atom || self.b == atom
    }
}

impl fmt::Display for BondKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.a, self.b)
    }
}

/// An element a marking can act on: a single atom or a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Element {
    /// A vertex element.
    Atom(AtomId),
    /// An edge element.
    Bond(BondKey),
}

impl Element {
    /// Bond element from an unordered endpoint pair.
    pub fn bond(u: AtomId, v: AtomId) -> Self {
        Self::Bond(BondKey::new(u, v))
    }

    /// Atom ids touched by this element (one for atoms, two for bonds).
    pub fn atoms(&self) -> Vec<AtomId> {
        match self {
            Self::Atom(id) => vec![*id],
            Self::Bond(key) => vec![key.source(), key.target()],
        }
    }
}

impl From<AtomId> for Element {
    fn from(id: AtomId) -> Self {
        Self::Atom(id)
    }
}

impl From<BondKey> for Element {
    fn from(key: BondKey) -> Self {
        Self::Bond(key)
    }
}

/// Labeled undirected graph with atom-id addressed vertices.
#[derive(Debug, Clone, Default)]
pub struct MolGraph {
    graph: UnGraph<String, String>,
    index: BTreeMap<AtomId, NodeIndex>,
    ids: Vec<AtomId>,
}

impl MolGraph {
    /// Create an empty graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an atom, or relabel it if already present.
    pub fn add_atom(&mut self, id: AtomId, label: impl Into<String>) {
        let label = label.into();
        match self.index.get(&id) {
            Some(&node) => self.graph[node] = label,
            None => {
                let node = self.graph.add_node(label);
                self.index.insert(id, node);
                self.ids.push(id);
            }
        }
    }

    /// Insert a bond between two existing atoms, or relabel it.
    pub fn add_bond(
        &mut self,
        u: AtomId,
        v: AtomId,
        label: impl Into<String>,
    ) -> Result<BondKey, GraphError> {
        let nu = *self.index.get(&u).ok_or(GraphError::UnknownAtom(u))?;
        let nv = *self.index.get(&v).ok_or(GraphError::UnknownAtom(v))?;
        let label = label.into();

        match self.graph.find_edge(nu, nv) {
            Some(edge) => self.graph[edge] = label,
            None => {
                self.graph.add_edge(nu, nv, label);
            }
        }
        Ok(BondKey::new(u, v))
    }

    /// Number of atoms.
    pub fn num_atoms(&self) -> usize {
        self.graph.node_count()
    }

    /// Number of bonds.
    pub fn num_bonds(&self) -> usize {
        self.graph.edge_count()
    }

    /// Whether the graph has no atoms.
    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    /// Whether the atom is present.
    pub fn contains_atom(&self, id: AtomId) -> bool {
        self.index.contains_key(&id)
    }

    /// Whether the bond is present.
    pub fn contains_bond(&self, key: &BondKey) -> bool {
        self.bond_edge(key).is_some()
    }

    /// Label of an atom.
    pub fn atom_label(&self, id: AtomId) -> Option<&str> {
        self.index.get(&id).map(|&node| self.graph[node].as_str())
    }

    /// Label of a bond.
    pub fn bond_label(&self, key: &BondKey) -> Option<&str> {
        self.bond_edge(key)
            .map(|edge| self.graph[edge].as_str())
    }

    fn bond_edge(&self, key: &BondKey) -> Option<petgraph::graph::EdgeIndex> {
        let nu = *self.index.get(&key.source())?;
        let nv = *self.index.get(&key.target())?;
        self.graph.find_edge(nu, nv)
    }

    /// Atom ids in ascending order.
    pub fn atom_ids(&self) -> impl Iterator<Item = AtomId> + '_ {
        self.index.keys().copied()
    }

    /// (id, label) pairs in ascending id order.
    pub fn atoms(&self) -> impl Iterator<Item = (AtomId, &str)> + '_ {
        self.index
            .iter()
            .map(|(&id, &node)| (id, self.graph[node].as_str()))
    }

    /// (key, label) pairs in ascending key order.
    pub fn bonds(&self) -> Vec<(BondKey, &str)> {
        let mut bonds: Vec<(BondKey, &str)> = self
            .graph
            .edge_references()
            .map(|edge| {
                let key = BondKey::new(
                    self.ids[edge.source().index()],
                    self.ids[edge.target().index()],
                );
                (key, edge.weight().as_str())
            })
            .collect();
        bonds.sort_by_key(|(key, _)| *key);
        bonds
    }

    /// Neighbors of an atom, ascending.
    pub fn neighbors(&self, id: AtomId) -> Vec<AtomId> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut neighbors: Vec<AtomId> = self
            .graph
            .neighbors(node)
            .map(|n| self.ids[n.index()])
            .collect();
        neighbors.sort();
        neighbors
    }

    /// Bonds incident to an atom with their labels, ascending by key.
    pub fn incident_bonds(&self, id: AtomId) -> Vec<(BondKey, &str)> {
        let Some(&node) = self.index.get(&id) else {
            return Vec::new();
        };
        let mut bonds: Vec<(BondKey, &str)> = self
            .graph
            .edges(node)
            .map(|edge| {
                let key = BondKey::new(
                    self.ids[edge.source().index()],
                    self.ids[edge.target().index()],
                );
                (key, edge.weight().as_str())
            })
            .collect();
        bonds.sort_by_key(|(key, _)| *key);
        bonds
    }

    /// Smallest atom id, if any. Components sort by this.
    pub fn min_atom_id(&self) -> Option<AtomId> {
        self.index.keys().next().copied()
    }

    /// Induced subgraph on the given atom set.
    pub fn subgraph(&self, atoms: &BTreeSet<AtomId>) -> MolGraph {
        let mut sub = MolGraph::new();
        for &id in atoms {
            if let Some(label) = self.atom_label(id) {
                sub.add_atom(id, label);
            }
        }
        for (key, label) in self.bonds() {
            if atoms.contains(&key.source()) && atoms.contains(&key.target()) {
                sub.add_bond(key.source(), key.target(), label)
                    .expect("endpoints inserted above");
            }
        }
        sub
    }

    /// Copy of the graph keeping only bonds whose label passes the filter.
    /// All atoms are kept; atoms left without bonds become singleton
    /// components.
    pub fn filter_bonds(&self, keep: impl Fn(&str) -> bool) -> MolGraph {
        let mut filtered = MolGraph::new();
        for (id, label) in self.atoms() {
            filtered.add_atom(id, label);
        }
        for (key, label) in self.bonds() {
            if keep(label) {
                filtered
                    .add_bond(key.source(), key.target(), label)
                    .expect("endpoints inserted above");
            }
        }
        filtered
    }

    /// Connected components, sorted by smallest contained atom id.
    pub fn components(&self) -> Vec<MolGraph> {
        if self.is_empty() {
            return Vec::new();
        }

        let mut union_find = UnionFind::new(self.graph.node_count());
        for edge in self.graph.edge_references() {
            union_find.union(edge.source().index(), edge.target().index());
        }

        let mut groups: BTreeMap<usize, BTreeSet<AtomId>> = BTreeMap::new();
        for (&id, &node) in &self.index {
            let root = union_find.find(node.index());
            groups.entry(root).or_default().insert(id);
        }

        let mut components: Vec<MolGraph> =
            groups.values().map(|atoms| self.subgraph(atoms)).collect();
        components.sort_by_key(|c| c.min_atom_id());
        components
    }

    fn label_profile(&self) -> (BTreeMap<&str, usize>, BTreeMap<&str, usize>) {
        let mut atom_labels: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, label) in self.atoms() {
            *atom_labels.entry(label).or_default() += 1;
        }
        let mut bond_labels: BTreeMap<&str, usize> = BTreeMap::new();
        for (_, label) in self.bonds() {
            *bond_labels.entry(label).or_default() += 1;
        }
        (atom_labels, bond_labels)
    }

    fn could_match(&self, other: &MolGraph) -> bool {
        self.num_atoms() == other.num_atoms()
            && self.num_bonds() == other.num_bonds()
            && self.label_profile() == other.label_profile()
    }

    /// Label-exact isomorphism predicate.
    pub fn is_isomorphic(&self, other: &MolGraph) -> bool {
        if !self.could_match(other) {
            return false;
        }
        if self.is_empty() {
            return true;
        }
        is_isomorphic_matching(
            &self.graph,
            &other.graph,
            |a: &String, b: &String| a == b,
            |a: &String, b: &String| a == b,
        )
    }

    /// One witness isomorphism onto `other`, as an atom-id map.
    ///
    /// Deterministic for a fixed pair of graphs (VF2 explores vertices in
    /// insertion order, and insertion follows ascending atom id).
    pub fn first_isomorphism(&self, other: &MolGraph) -> Option<BTreeMap<AtomId, AtomId>> {
        self.isomorphism_mappings(other, Some(1)).into_iter().next()
    }

    /// All label-exact isomorphisms onto `other`, as atom-id maps.
    pub fn isomorphisms(&self, other: &MolGraph) -> Vec<BTreeMap<AtomId, AtomId>> {
        self.isomorphism_mappings(other, None)
    }

    fn isomorphism_mappings(
        &self,
        other: &MolGraph,
        limit: Option<usize>,
    ) -> Vec<BTreeMap<AtomId, AtomId>> {
        if !self.could_match(other) {
            return Vec::new();
        }
        if self.is_empty() {
            return vec![BTreeMap::new()];
        }

        let g0 = &self.graph;
        let g1 = &other.graph;
        let mut node_match = |a: &String, b: &String| a == b;
        let mut edge_match = |a: &String, b: &String| a == b;

        let Some(iter) = subgraph_isomorphisms_iter(&g0, &g1, &mut node_match, &mut edge_match)
        else {
            return Vec::new();
        };

        let mappings = iter.map(|mapping| {
            mapping
                .iter()
                .enumerate()
                .map(|(i, &j)| (self.ids[i], other.ids[j]))
                .collect::<BTreeMap<AtomId, AtomId>>()
        });

        match limit {
            Some(n) => mappings.take(n).collect(),
            None => mappings.collect(),
        }
    }

    /// Non-identity automorphisms as sparse maps (moved atoms only).
    pub fn automorphisms(&self) -> Vec<BTreeMap<AtomId, AtomId>> {
        self.isomorphisms(self)
            .into_iter()
            .map(|mapping| {
                mapping
                    .into_iter()
                    .filter(|(source, target)| source != target)
                    .collect::<BTreeMap<AtomId, AtomId>>()
            })
            .filter(|sparse| !sparse.is_empty())
            .collect()
    }
}

impl PartialEq for MolGraph {
    fn eq(&self, other: &Self) -> bool {
        self.atoms().collect::<Vec<_>>() == other.atoms().collect::<Vec<_>>()
            && self.bonds() == other.bonds()
    }
}

impl Eq for MolGraph {}
