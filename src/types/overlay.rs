//! Immutable overlay snapshots.
//!
//! An [`OverlayGraph`] is the result of a completed search path: a host
//! graph plus the sparse electron marking accumulated across the whole
//! mechanism. From it derive the product graph (the chemistry after all
//! net electron shifts), the catalytic-vertex detection, and the
//! labelled/GML export views used for deduplication and inspection.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::OnceLock;

use super::graph::{AtomId, BondKey, Element, GraphError, MolGraph};
use super::label::{overlay_bond_index, AtomLabel, OVERLAY_BOND_ORDER, UNKNOWN_BOND};

/// Error type for overlay derivations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum OverlayError {
    /// A host bond label was not on the overlay bond-order scale.
    #[error("Bond {bond} label '{label}' is not on the bond-order scale")]
    InvalidBondOrder {
        /// The offending bond.
        bond: BondKey,
        /// Its label.
        label: String,
    },
    /// A net electron balance pushed a bond off the ends of the scale.
    #[error("Bond {bond} balance {balance} shifts '{label}' off the bond-order scale")]
    ValenceShift {
        /// The offending bond.
        bond: BondKey,
        /// Its host label.
        label: String,
        /// Net received minus donated.
        balance: i64,
    },
    /// A serialized record was internally inconsistent.
    #[error("Overlay record error: {0}")]
    Record(#[from] GraphError),
}

/// Policy for classifying a recurring component pair as catalytic.
///
/// A matched (host component, product component) pair counts as a
/// catalytic residue when more than `min_recurring_fraction` of the host
/// component's atoms recur, or, with `accept_any_heavy_atom`, when any
/// recurring atom is not a hydrogen. The second arm rejects leftover free
/// hydrogens masquerading as catalytic residues while keeping real
/// scaffolds with low atom overlap.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CatalyticPolicy {
    /// Fraction of a host component's atoms that must recur.
    pub min_recurring_fraction: f64,
    /// Accept a pairing on any recurring non-hydrogen atom.
    pub accept_any_heavy_atom: bool,
}

impl Default for CatalyticPolicy {
    fn default() -> Self {
        Self {
            min_recurring_fraction: 0.5,
            accept_any_heavy_atom: true,
        }
    }
}

/// A labeled graph annotated with per-element electron transfer counts.
///
/// Immutable once constructed. Equality compares host graph and sparse
/// marking structurally; deduplication across symmetric search branches
/// goes through canonical forms instead.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "OverlayGraphRecord", try_from = "OverlayGraphRecord")]
pub struct OverlayGraph {
    host: MolGraph,
    marking: BTreeMap<Element, (u32, u32)>,
    product: OnceLock<Result<MolGraph, OverlayError>>,
}

impl OverlayGraph {
    /// Create a snapshot; zero-count marking entries are dropped.
    pub fn new(host: MolGraph, marking: BTreeMap<Element, (u32, u32)>) -> Self {
        let marking = marking
            .into_iter()
            .filter(|(_, (received, donated))| *received > 0 || *donated > 0)
            .collect();
        Self {
            host,
            marking,
            product: OnceLock::new(),
        }
    }

    /// The host graph.
    pub fn host_graph(&self) -> &MolGraph {
        &self.host
    }

    /// The sparse marking: (received, donated) per acted-on element.
    pub fn marking(&self) -> &BTreeMap<Element, (u32, u32)> {
        &self.marking
    }

    /// Elements with a non-zero marking.
    pub fn action(&self) -> impl Iterator<Item = Element> + '_ {
        self.marking.keys().copied()
    }

    /// Electrons received by an element.
    pub fn electrons_received(&self, element: impl Into<Element>) -> u32 {
        self.marking
            .get(&element.into())
            .map(|&(received, _)| received)
            .unwrap_or(0)
    }

    /// Electrons donated by an element.
    pub fn electrons_donated(&self, element: impl Into<Element>) -> u32 {
        self.marking
            .get(&element.into())
            .map(|&(_, donated)| donated)
            .unwrap_or(0)
    }

    fn balance(&self, element: Element) -> i64 {
        i64::from(self.electrons_received(element)) - i64::from(self.electrons_donated(element))
    }

    /// The graph after applying every net electron shift: atom charges
    /// adjusted by the balance, bond labels shifted along the bond-order
    /// scale. Computed once and cached.
    pub fn product_graph(&self) -> Result<&MolGraph, OverlayError> {
        self.product
            .get_or_init(|| self.compute_product())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn compute_product(&self) -> Result<MolGraph, OverlayError> {
        let mut product = MolGraph::new();

        for (id, label) in self.host.atoms() {
            let parsed = AtomLabel::parse(label);
            let balance = self.balance(Element::Atom(id));
            let charge = i64::from(parsed.charge) - balance;
            product.add_atom(id, parsed.with_charge(charge as i32));
        }

        for (key, label) in self.host.bonds() {
            let index =
                overlay_bond_index(label).ok_or_else(|| OverlayError::InvalidBondOrder {
                    bond: key,
                    label: label.to_string(),
                })?;
            let balance = self.balance(Element::Bond(key));
            let shifted = index as i64 + balance;
            if !(0..OVERLAY_BOND_ORDER.len() as i64).contains(&shifted) {
                return Err(OverlayError::ValenceShift {
                    bond: key,
                    label: label.to_string(),
                    balance,
                });
            }
            product
                .add_bond(
                    key.source(),
                    key.target(),
                    OVERLAY_BOND_ORDER[shifted as usize],
                )
                .expect("endpoints inserted above");
        }

        Ok(product)
    }

    // Substitute one element's counts into a label template. `L` stands
    // for the original label, `-` for donated, `+` for received, `b` for
    // the balance; all other template characters pass through. The
    // substituted label is never re-scanned.
    fn apply_label_pattern(
        &self,
        pattern: &str,
        original: &str,
        element: Element,
        include_blue: bool,
    ) -> String {
        let (mut received, mut donated) = (
            self.electrons_received(element),
            self.electrons_donated(element),
        );
        if !include_blue && received == donated {
            received = 0;
            donated = 0;
        }
        let balance = i64::from(received) - i64::from(donated);

        let mut label = String::new();
        for c in pattern.chars() {
            match c {
                'L' => label.push_str(original),
                '-' => label.push_str(&donated.to_string()),
                '+' => label.push_str(&received.to_string()),
                'b' => label.push_str(&balance.to_string()),
                other => label.push(other),
            }
        }
        label
    }

    /// Host graph with every label rewritten through the given
    /// templates. This is the view the canonical deduplication keys on.
    pub fn to_labelled_graph(&self, vertex_pattern: &str, edge_pattern: &str) -> MolGraph {
        let mut labelled = MolGraph::new();
        for (id, label) in self.host.atoms() {
            labelled.add_atom(
                id,
                self.apply_label_pattern(vertex_pattern, label, Element::Atom(id), true),
            );
        }
        for (key, label) in self.host.bonds() {
            labelled
                .add_bond(
                    key.source(),
                    key.target(),
                    self.apply_label_pattern(edge_pattern, label, Element::Bond(key), true),
                )
                .expect("endpoints inserted above");
        }
        labelled
    }

    /// GML text of the acted-on subgraph: marked atoms, marked bonds and
    /// their endpoints. With `include_blue` false, elements whose
    /// donated and received counts cancel are left out entirely.
    pub fn to_gml(&self, vertex_pattern: &str, edge_pattern: &str, include_blue: bool) -> String {
        let mut vertices: BTreeSet<AtomId> = BTreeSet::new();
        let mut edges: BTreeSet<BondKey> = BTreeSet::new();

        for (key, _) in self.host.bonds() {
            let element = Element::Bond(key);
            if self.marking.contains_key(&element)
                && (include_blue
                    || self.electrons_donated(element) != self.electrons_received(element))
            {
                vertices.insert(key.source());
                vertices.insert(key.target());
                edges.insert(key);
            }
        }

        for (id, _) in self.host.atoms() {
            let element = Element::Atom(id);
            if self.marking.contains_key(&element)
                && (include_blue
                    || self.electrons_donated(element) != self.electrons_received(element))
            {
                vertices.insert(id);
            }
        }

        let mut out = vec!["graph".to_string(), "[".to_string()];
        for &id in &vertices {
            let label = self.apply_label_pattern(
                vertex_pattern,
                self.host.atom_label(id).unwrap_or(""),
                Element::Atom(id),
                include_blue,
            );
            out.push(format!("\tnode [ id {id} label \"{label}\" ]"));
        }
        for &key in &edges {
            let label = self.apply_label_pattern(
                edge_pattern,
                self.host.bond_label(&key).unwrap_or(""),
                Element::Bond(key),
                include_blue,
            );
            out.push(format!(
                "\tedge [ source {} target {} label \"{label}\" ]",
                key.source(),
                key.target()
            ));
        }
        out.push("]".to_string());
        out.join("\n")
    }

    /// Structurally equal snapshot with atom ids renumbered densely from
    /// zero, in ascending original-id order. Used to normalize ids
    /// before canonicalization or export.
    pub fn reindex(&self) -> OverlayGraph {
        let mapping: BTreeMap<AtomId, AtomId> = self
            .host
            .atom_ids()
            .enumerate()
            .map(|(index, id)| (id, AtomId(index as u32)))
            .collect();

        let mut host = MolGraph::new();
        for (id, label) in self.host.atoms() {
            host.add_atom(mapping[&id], label);
        }
        for (key, label) in self.host.bonds() {
            host.add_bond(mapping[&key.source()], mapping[&key.target()], label)
                .expect("endpoints inserted above");
        }

        let marking = self
            .marking
            .iter()
            .map(|(&element, &counts)| {
                let element = match element {
                    Element::Atom(id) => Element::Atom(mapping[&id]),
                    Element::Bond(key) => {
                        Element::bond(mapping[&key.source()], mapping[&key.target()])
                    }
                };
                (element, counts)
            })
            .collect();

        OverlayGraph::new(host, marking)
    }

    /// Atoms recurring unchanged across the whole transformation: the
    /// putative catalytic scaffold.
    ///
    /// Host and product graphs are split into components (unknown-label
    /// bonds ignored); isomorphic pairs sharing atoms are claimed
    /// greedily by descending overlap, subject to the policy, and the
    /// result is the atom-id intersection of the claimed sides.
    pub fn catalytic_vertices(
        &self,
        policy: &CatalyticPolicy,
    ) -> Result<BTreeSet<AtomId>, OverlayError> {
        let left = self.host.filter_bonds(|label| label != UNKNOWN_BOND);
        let right = self
            .product_graph()?
            .filter_bonds(|label| label != UNKNOWN_BOND);

        let left_components = left.components();
        let right_components = right.components();

        let mut claimed_left: Vec<usize> = Vec::new();
        let mut claimed_right: HashSet<usize> = HashSet::new();

        for (left_index, left_component) in left_components.iter().enumerate() {
            let left_atoms: BTreeSet<AtomId> = left_component.atom_ids().collect();

            let mut candidates: Vec<(Vec<AtomId>, usize)> = right_components
                .iter()
                .enumerate()
                .filter(|(right_index, right_component)| {
                    !claimed_right.contains(right_index)
                        && right_component.is_isomorphic(left_component)
                })
                .map(|(right_index, right_component)| {
                    let overlap: Vec<AtomId> = right_component
                        .atom_ids()
                        .filter(|id| left_atoms.contains(id))
                        .collect();
                    (overlap, right_index)
                })
                .filter(|(overlap, _)| !overlap.is_empty())
                .collect();

            if candidates.is_empty() {
                continue;
            }

            candidates.sort_by(|(overlap_a, index_a), (overlap_b, index_b)| {
                overlap_b
                    .len()
                    .cmp(&overlap_a.len())
                    .then(index_a.cmp(index_b))
            });

            for (overlap, right_index) in candidates {
                let majority = overlap.len() as f64
                    > policy.min_recurring_fraction * left_component.num_atoms() as f64;
                let heavy = policy.accept_any_heavy_atom
                    && overlap
                        .iter()
                        .any(|id| left_component.atom_label(*id) != Some("H"));
                if majority || heavy {
                    claimed_left.push(left_index);
                    claimed_right.insert(right_index);
                    break;
                }
            }
        }

        let left_vertices: BTreeSet<AtomId> = claimed_left
            .iter()
            .flat_map(|&index| left_components[index].atom_ids())
            .collect();
        let right_vertices: BTreeSet<AtomId> = claimed_right
            .iter()
            .flat_map(|&index| right_components[index].atom_ids())
            .collect();

        Ok(left_vertices.intersection(&right_vertices).copied().collect())
    }
}

impl PartialEq for OverlayGraph {
    fn eq(&self, other: &Self) -> bool {
        self.host == other.host && self.marking == other.marking
    }
}

impl Eq for OverlayGraph {}

// Wire format: id-addressed node and edge records carrying labels and
// counts. Round trip reproduces host graph and non-zero marking.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct OverlayGraphRecord {
    nodes: Vec<NodeRecord>,
    edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    id: AtomId,
    label: String,
    electrons_donated: u32,
    electrons_received: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EdgeRecord {
    src: AtomId,
    tar: AtomId,
    label: String,
    electrons_donated: u32,
    electrons_received: u32,
}

impl From<OverlayGraph> for OverlayGraphRecord {
    fn from(overlay: OverlayGraph) -> Self {
        let nodes = overlay
            .host
            .atoms()
            .map(|(id, label)| NodeRecord {
                id,
                label: label.to_string(),
                electrons_donated: overlay.electrons_donated(id),
                electrons_received: overlay.electrons_received(id),
            })
            .collect();
        let edges = overlay
            .host
            .bonds()
            .iter()
            .map(|&(key, label)| EdgeRecord {
                src: key.source(),
                tar: key.target(),
                label: label.to_string(),
                electrons_donated: overlay.electrons_donated(key),
                electrons_received: overlay.electrons_received(key),
            })
            .collect();
        Self { nodes, edges }
    }
}

impl TryFrom<OverlayGraphRecord> for OverlayGraph {
    type Error = OverlayError;

    fn try_from(record: OverlayGraphRecord) -> Result<Self, Self::Error> {
        let mut host = MolGraph::new();
        let mut marking = BTreeMap::new();

        for node in &record.nodes {
            host.add_atom(node.id, node.label.clone());
            if node.electrons_donated > 0 || node.electrons_received > 0 {
                marking.insert(
                    Element::Atom(node.id),
                    (node.electrons_received, node.electrons_donated),
                );
            }
        }

        for edge in &record.edges {
            let key = host.add_bond(edge.src, edge.tar, edge.label.clone())?;
            if edge.electrons_donated > 0 || edge.electrons_received > 0 {
                marking.insert(
                    Element::Bond(key),
                    (edge.electrons_received, edge.electrons_donated),
                );
            }
        }

        Ok(OverlayGraph::new(host, marking))
    }
}
