//! Transformation rules.
//!
//! A rule rewrites its left (reactant) side into its right (product)
//! side. Both sides share one vertex identity space: a vertex may carry a
//! label only on the left (deleted), only on the right (added), or on
//! both (context, possibly relabeled). Edges work the same way.
//!
//! Rules are consumed read-only by the overlay search; they are expected
//! to arrive already sanitized, i.e. consecutive steps carry matching
//! molecular context. Construction goes through [`RuleBuilder`], which
//! validates referential consistency.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use super::graph::{AtomId, BondKey, MolGraph};
use super::label::AtomLabel;

/// Error type for rule construction.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    /// A bond referenced a vertex the rule does not declare.
    #[error("Bond {bond} references undeclared vertex {atom}")]
    UnknownBondAtom {
        /// The offending bond.
        bond: BondKey,
        /// The missing endpoint.
        atom: AtomId,
    },
    /// A bond carries a side label but an endpoint is absent on that side.
    #[error("Bond {bond} exists on the {side} side but vertex {atom} does not")]
    DanglingBond {
        /// The offending bond.
        bond: BondKey,
        /// The endpoint missing on that side.
        atom: AtomId,
        /// `"left"` or `"right"`.
        side: &'static str,
    },
    /// A vertex carries no label on either side.
    #[error("Vertex {0} has no label on either side")]
    EmptyVertex(AtomId),
    /// An edge carries no label on either side.
    #[error("Bond {0} has no label on either side")]
    EmptyBond(BondKey),
}

static NEXT_RULE_ID: AtomicU64 = AtomicU64::new(1);

/// Stable process-local rule identity, usable as a cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RuleId(u64);

impl RuleId {
    /// Allocate a fresh id.
    pub fn fresh() -> Self {
        Self(NEXT_RULE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::fresh()
    }
}

impl fmt::Display for RuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}", self.0)
    }
}

/// Per-vertex left/right labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleVertex {
    /// Reactant-side label, if the vertex exists there.
    pub left: Option<String>,
    /// Product-side label, if the vertex exists there.
    pub right: Option<String>,
}

impl RuleVertex {
    /// Whether the vertex is unchanged context.
    pub fn is_context(&self) -> bool {
        self.left == self.right
    }

    /// Formal charge of the left label (0 if absent).
    pub fn left_charge(&self) -> i32 {
        self.left
            .as_deref()
            .map(|label| AtomLabel::parse(label).charge)
            .unwrap_or(0)
    }

    /// Formal charge of the right label (0 if absent).
    pub fn right_charge(&self) -> i32 {
        self.right
            .as_deref()
            .map(|label| AtomLabel::parse(label).charge)
            .unwrap_or(0)
    }
}

/// Per-edge left/right labels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleEdge {
    /// Reactant-side bond label, if the bond exists there.
    pub left: Option<String>,
    /// Product-side bond label, if the bond exists there.
    pub right: Option<String>,
}

/// A validated transformation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "RuleRecord", try_from = "RuleRecord")]
pub struct Rule {
    id: RuleId,
    name: String,
    vertices: BTreeMap<AtomId, RuleVertex>,
    edges: BTreeMap<BondKey, RuleEdge>,
}

impl Rule {
    /// Start building a rule.
    pub fn builder(name: impl Into<String>) -> RuleBuilder {
        RuleBuilder {
            name: name.into(),
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
        }
    }

    /// Stable identity for cache keying.
    pub fn id(&self) -> RuleId {
        self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Vertices with their side labels, ascending by id.
    pub fn vertices(&self) -> impl Iterator<Item = (AtomId, &RuleVertex)> + '_ {
        self.vertices.iter().map(|(&id, vertex)| (id, vertex))
    }

    /// Edges with their side labels, ascending by key.
    pub fn edges(&self) -> impl Iterator<Item = (BondKey, &RuleEdge)> + '_ {
        self.edges.iter().map(|(&key, edge)| (key, edge))
    }

    /// Reactant-side projection.
    pub fn left(&self) -> MolGraph {
        self.side(|vertex| vertex.left.as_deref(), |edge| edge.left.as_deref())
    }

    /// Product-side projection.
    pub fn right(&self) -> MolGraph {
        self.side(|vertex| vertex.right.as_deref(), |edge| edge.right.as_deref())
    }

    fn side<'a>(
        &'a self,
        vertex_label: impl Fn(&'a RuleVertex) -> Option<&'a str>,
        edge_label: impl Fn(&'a RuleEdge) -> Option<&'a str>,
    ) -> MolGraph {
        let mut graph = MolGraph::new();
        for (id, vertex) in &self.vertices {
            if let Some(label) = vertex_label(vertex) {
                graph.add_atom(*id, label);
            }
        }
        for (key, edge) in &self.edges {
            if let Some(label) = edge_label(edge) {
                graph
                    .add_bond(key.source(), key.target(), label)
                    .expect("builder validated side endpoints");
            }
        }
        graph
    }

    /// Union of both sides in one graph.
    ///
    /// A vertex or edge whose two sides agree keeps the shared label; one
    /// whose sides differ gets the composite `left>right` label (absence
    /// rendered empty). Relabeling a rule's atom ids therefore cannot
    /// change the combined graph up to isomorphism, which is what rule
    /// canonicalization keys on.
    pub fn combined_graph(&self) -> MolGraph {
        fn composite(left: Option<&str>, right: Option<&str>) -> String {
            match (left, right) {
                (Some(l), Some(r)) if l == r => l.to_string(),
                (l, r) => format!("{}>{}", l.unwrap_or(""), r.unwrap_or("")),
            }
        }

        let mut graph = MolGraph::new();
        for (id, vertex) in &self.vertices {
            graph.add_atom(*id, composite(vertex.left.as_deref(), vertex.right.as_deref()));
        }
        for (key, edge) in &self.edges {
            graph
                .add_bond(
                    key.source(),
                    key.target(),
                    composite(edge.left.as_deref(), edge.right.as_deref()),
                )
                .expect("builder validated endpoints");
        }
        graph
    }
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Rule {}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

/// Builder for [`Rule`] with referential validation at `build`.
#[derive(Debug, Clone)]
pub struct RuleBuilder {
    name: String,
    vertices: BTreeMap<AtomId, RuleVertex>,
    edges: BTreeMap<BondKey, RuleEdge>,
}

impl RuleBuilder {
    /// Context vertex: same label on both sides.
    pub fn atom(self, id: u32, label: &str) -> Self {
        self.atom_change(id, label, label)
    }

    /// Vertex whose label changes.
    pub fn atom_change(mut self, id: u32, left: &str, right: &str) -> Self {
        self.vertices.insert(
            AtomId(id),
            RuleVertex {
                left: Some(left.to_string()),
                right: Some(right.to_string()),
            },
        );
        self
    }

    /// Vertex present only on the left (deleted).
    pub fn atom_left(mut self, id: u32, label: &str) -> Self {
        self.vertices.insert(
            AtomId(id),
            RuleVertex {
                left: Some(label.to_string()),
                right: None,
            },
        );
        self
    }

    /// Vertex present only on the right (added).
    pub fn atom_right(mut self, id: u32, label: &str) -> Self {
        self.vertices.insert(
            AtomId(id),
            RuleVertex {
                left: None,
                right: Some(label.to_string()),
            },
        );
        self
    }

    /// Context bond: same label on both sides.
    pub fn bond(self, u: u32, v: u32, label: &str) -> Self {
        self.bond_change(u, v, label, label)
    }

    /// Bond whose order changes.
    pub fn bond_change(mut self, u: u32, v: u32, left: &str, right: &str) -> Self {
        self.edges.insert(
            BondKey::new(AtomId(u), AtomId(v)),
            RuleEdge {
                left: Some(left.to_string()),
                right: Some(right.to_string()),
            },
        );
        self
    }

    /// Bond present only on the left (broken).
    pub fn bond_left(mut self, u: u32, v: u32, label: &str) -> Self {
        self.edges.insert(
            BondKey::new(AtomId(u), AtomId(v)),
            RuleEdge {
                left: Some(label.to_string()),
                right: None,
            },
        );
        self
    }

    /// Bond present only on the right (formed).
    pub fn bond_right(mut self, u: u32, v: u32, label: &str) -> Self {
        self.edges.insert(
            BondKey::new(AtomId(u), AtomId(v)),
            RuleEdge {
                left: None,
                right: Some(label.to_string()),
            },
        );
        self
    }

    /// Validate and build.
    pub fn build(self) -> Result<Rule, RuleError> {
        for (&id, vertex) in &self.vertices {
            if vertex.left.is_none() && vertex.right.is_none() {
                return Err(RuleError::EmptyVertex(id));
            }
        }

        for (&bond, edge) in &self.edges {
            if edge.left.is_none() && edge.right.is_none() {
                return Err(RuleError::EmptyBond(bond));
            }
            for atom in [bond.source(), bond.target()] {
                let Some(vertex) = self.vertices.get(&atom) else {
                    return Err(RuleError::UnknownBondAtom { bond, atom });
                };
                if edge.left.is_some() && vertex.left.is_none() {
                    return Err(RuleError::DanglingBond {
                        bond,
                        atom,
                        side: "left",
                    });
                }
                if edge.right.is_some() && vertex.right.is_none() {
                    return Err(RuleError::DanglingBond {
                        bond,
                        atom,
                        side: "right",
                    });
                }
            }
        }

        Ok(Rule {
            id: RuleId::fresh(),
            name: self.name,
            vertices: self.vertices,
            edges: self.edges,
        })
    }
}

// Wire record: maps with non-string keys do not serialize to JSON, so
// vertices and edges flatten to id-addressed lists.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RuleRecord {
    name: String,
    vertices: Vec<VertexRecord>,
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VertexRecord {
    id: AtomId,
    left: Option<String>,
    right: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRecord {
    src: AtomId,
    tar: AtomId,
    left: Option<String>,
    right: Option<String>,
}

impl From<Rule> for RuleRecord {
    fn from(rule: Rule) -> Self {
        Self {
            name: rule.name,
            vertices: rule
                .vertices
                .into_iter()
                .map(|(id, vertex)| VertexRecord {
                    id,
                    left: vertex.left,
                    right: vertex.right,
                })
                .collect(),
            edges: rule
                .edges
                .into_iter()
                .map(|(key, edge)| EdgeRecord {
                    src: key.source(),
                    tar: key.target(),
                    left: edge.left,
                    right: edge.right,
                })
                .collect(),
        }
    }
}

impl TryFrom<RuleRecord> for Rule {
    type Error = RuleError;

    fn try_from(record: RuleRecord) -> Result<Self, Self::Error> {
        let mut builder = Rule::builder(record.name);
        for vertex in record.vertices {
            builder.vertices.insert(
                vertex.id,
                RuleVertex {
                    left: vertex.left,
                    right: vertex.right,
                },
            );
        }
        for edge in record.edges {
            builder.edges.insert(
                BondKey::new(edge.src, edge.tar),
                RuleEdge {
                    left: edge.left,
                    right: edge.right,
                },
            );
        }
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proton_transfer() -> Rule {
        // O-H ... N  ->  O- ... H-N+
        Rule::builder("proton_transfer")
            .atom(0, "O")
            .atom(1, "H")
            .atom_change(2, "N", "N+")
            .bond_left(0, 1, "-")
            .bond_right(1, 2, "-")
            .build()
            .unwrap()
    }

    #[test]
    fn test_side_projections() {
        let rule = proton_transfer();

        let left = rule.left();
        assert_eq!(left.num_atoms(), 3);
        assert_eq!(left.bond_label(&BondKey::new(AtomId(0), AtomId(1))), Some("-"));
        assert_eq!(left.bond_label(&BondKey::new(AtomId(1), AtomId(2))), None);

        let right = rule.right();
        assert_eq!(right.atom_label(AtomId(2)), Some("N+"));
        assert_eq!(right.bond_label(&BondKey::new(AtomId(1), AtomId(2))), Some("-"));
    }

    #[test]
    fn test_combined_graph_labels() {
        let rule = proton_transfer();
        let combined = rule.combined_graph();

        assert_eq!(combined.atom_label(AtomId(0)), Some("O"));
        assert_eq!(combined.atom_label(AtomId(2)), Some("N>N+"));
        assert_eq!(
            combined.bond_label(&BondKey::new(AtomId(0), AtomId(1))),
            Some("->")
        );
        assert_eq!(
            combined.bond_label(&BondKey::new(AtomId(1), AtomId(2))),
            Some(">-")
        );
    }

    #[test]
    fn test_charges() {
        let rule = proton_transfer();
        let (_, vertex) = rule.vertices().nth(2).unwrap();
        assert_eq!(vertex.left_charge(), 0);
        assert_eq!(vertex.right_charge(), 1);
    }

    #[test]
    fn test_dangling_bond_rejected() {
        let result = Rule::builder("broken")
            .atom_left(0, "O")
            .atom(1, "H")
            .bond(0, 1, "-")
            .build();

        assert!(matches!(result, Err(RuleError::DanglingBond { .. })));
    }

    #[test]
    fn test_unknown_bond_atom_rejected() {
        let result = Rule::builder("broken")
            .atom(0, "O")
            .bond(0, 9, "-")
            .build();

        assert!(matches!(result, Err(RuleError::UnknownBondAtom { .. })));
    }

    #[test]
    fn test_serde_round_trip_assigns_fresh_id() {
        let rule = proton_transfer();
        let json = serde_json::to_string(&rule).unwrap();
        let back: Rule = serde_json::from_str(&json).unwrap();

        assert_ne!(rule.id(), back.id());
        assert_eq!(rule.left(), back.left());
        assert_eq!(rule.right(), back.right());
    }
}
