//! The electron-flow accumulator threaded through the overlay search.
//!
//! A [`Marking`] tracks, per atom and per unordered bond pair, how many
//! electrons the mechanism has donated from and received into that
//! element so far, together with the live host graph the counts overlay.
//! The search owns one marking per branch: branching copies, siblings
//! never share.
//!
//! ## Invariants
//!
//! - Counters never go below zero; a decrement that would is a caller
//!   bug and panics rather than returning an error.
//! - The externally visible host view omits components the mechanism has
//!   not touched: chemistry that only ever rode along as context must
//!   not leak into results.

use std::collections::{BTreeMap, BTreeSet};

use crate::types::graph::{AtomId, Element, GraphError, MolGraph};
use crate::types::label::{rule_bond_index, COORDINATION_BOND, DATIVE_BOND, UNKNOWN_BOND};
use crate::types::rule::Rule;

/// Error type for marking updates.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MarkingError {
    /// A rule vertex participating in the action had no image in the
    /// atom map. The upstream sanitizer guarantees full coverage, so
    /// this indicates an inconsistent rule sequence.
    #[error("Rule vertex {0} participates in the action but is not mapped to a host atom")]
    UnmappedVertex(AtomId),
    /// A bond label was not on the rule-side bond-order scale.
    #[error("Bond label '{label}' is not on the bond-order scale")]
    InvalidBondOrder {
        /// The label that failed to parse.
        label: String,
    },
    /// Host graph update failed.
    #[error("Host graph update failed: {0}")]
    Graph(#[from] GraphError),
}

/// Mutable electron donation/reception counts over a host graph.
#[derive(Debug, Clone, Default)]
pub struct Marking {
    host: MolGraph,
    received: BTreeMap<Element, u32>,
    donated: BTreeMap<Element, u32>,
}

impl Marking {
    /// Create a marking over a host graph with all counters at zero.
    pub fn new(host: MolGraph) -> Self {
        Self {
            host,
            received: BTreeMap::new(),
            donated: BTreeMap::new(),
        }
    }

    /// Electrons received by an element so far.
    pub fn electrons_received(&self, element: impl Into<Element>) -> u32 {
        self.received.get(&element.into()).copied().unwrap_or(0)
    }

    /// Electrons donated by an element so far.
    pub fn electrons_donated(&self, element: impl Into<Element>) -> u32 {
        self.donated.get(&element.into()).copied().unwrap_or(0)
    }

    // A bond element marked before the host carries the bond gets a
    // provisional "?" edge; the product derivation shifts it from there.
    fn ensure_element(&mut self, element: Element) -> Result<(), MarkingError> {
        if let Element::Bond(key) = element {
            if !self.host.contains_bond(&key) {
                self.host
                    .add_bond(key.source(), key.target(), UNKNOWN_BOND)?;
            }
        }
        Ok(())
    }

    /// Record one electron received into an element.
    pub fn add_received(&mut self, element: impl Into<Element>) -> Result<(), MarkingError> {
        let element = element.into();
        self.ensure_element(element)?;
        *self.received.entry(element).or_insert(0) += 1;
        Ok(())
    }

    /// Record one electron donated from an element.
    pub fn add_donated(&mut self, element: impl Into<Element>) -> Result<(), MarkingError> {
        let element = element.into();
        self.ensure_element(element)?;
        *self.donated.entry(element).or_insert(0) += 1;
        Ok(())
    }

    /// Undo one received electron.
    ///
    /// # Panics
    ///
    /// Panics if the element's received count is already zero.
    pub fn remove_received(&mut self, element: impl Into<Element>) {
        let element = element.into();
        let count = self.received.entry(element).or_insert(0);
        assert!(
            *count > 0,
            "electron-received counter underflow on {element:?}"
        );
        *count -= 1;
    }

    /// Undo one donated electron.
    ///
    /// # Panics
    ///
    /// Panics if the element's donated count is already zero.
    pub fn remove_donated(&mut self, element: impl Into<Element>) {
        let element = element.into();
        let count = self.donated.entry(element).or_insert(0);
        assert!(
            *count > 0,
            "electron-donated counter underflow on {element:?}"
        );
        *count -= 1;
    }

    /// Atoms touched by any non-zero count: marked atoms plus the
    /// endpoints of marked bonds.
    pub fn action(&self) -> BTreeSet<AtomId> {
        let mut atoms = BTreeSet::new();
        for element in self.marked_elements() {
            atoms.extend(element.atoms());
        }
        atoms
    }

    fn marked_elements(&self) -> impl Iterator<Item = Element> + '_ {
        self.received
            .iter()
            .filter(|(_, &count)| count > 0)
            .map(|(&element, _)| element)
            .chain(
                self.donated
                    .iter()
                    .filter(|(_, &count)| count > 0)
                    .map(|(&element, _)| element),
            )
    }

    /// Derive a new marking by applying a rule's left/right differences.
    ///
    /// `atom_map` maps the rule's vertex ids to host atom ids; only
    /// vertices and edges whose two sides differ need an image. Charge
    /// drops record receptions, charge gains record donations; bond-order
    /// moves record a reception (up) or donation (down), with
    /// coordination bonds treated as context. The receiver is never
    /// mutated.
    pub fn update_from_rule(
        &self,
        rule: &Rule,
        atom_map: &BTreeMap<AtomId, AtomId>,
    ) -> Result<Marking, MarkingError> {
        let map = |id: AtomId| {
            atom_map
                .get(&id)
                .copied()
                .ok_or(MarkingError::UnmappedVertex(id))
        };
        let order = |label: &str| {
            rule_bond_index(label).ok_or_else(|| MarkingError::InvalidBondOrder {
                label: label.to_string(),
            })
        };

        let mut result = self.clone();

        for (id, vertex) in rule.vertices() {
            if vertex.left == vertex.right {
                continue;
            }

            let left_charge = vertex.left_charge();
            let right_charge = vertex.right_charge();
            if left_charge > right_charge {
                result.add_received(map(id)?)?;
            } else if left_charge < right_charge {
                result.add_donated(map(id)?)?;
            }
        }

        for (key, edge) in rule.edges() {
            match (edge.left.as_deref(), edge.right.as_deref()) {
                (None, Some(right)) => {
                    if right == COORDINATION_BOND {
                        continue;
                    }
                    result.add_received(Element::bond(map(key.source())?, map(key.target())?))?;
                }
                (Some(left), None) => {
                    if left == COORDINATION_BOND {
                        continue;
                    }
                    result.add_donated(Element::bond(map(key.source())?, map(key.target())?))?;
                }
                (Some(left), Some(right)) => {
                    if left == COORDINATION_BOND || right == COORDINATION_BOND {
                        continue;
                    }
                    let left_order = order(left)?;
                    let right_order = order(right)?;
                    if left_order < right_order {
                        result
                            .add_received(Element::bond(map(key.source())?, map(key.target())?))?;
                    } else if left_order > right_order {
                        result
                            .add_donated(Element::bond(map(key.source())?, map(key.target())?))?;
                    }
                }
                (None, None) => {}
            }
        }

        Ok(result)
    }

    /// Externally visible host graph.
    ///
    /// Components with no acted-on atom and no marked bond are omitted;
    /// coordination bonds render as dative (`>`).
    pub fn host_graph(&self) -> MolGraph {
        let action = self.action();
        let mut clean = MolGraph::new();

        for component in self.host.components() {
            let untouched = component.atom_ids().all(|id| !action.contains(&id))
                && component.bonds().iter().all(|(key, _)| {
                    self.electrons_donated(*key) == 0 && self.electrons_received(*key) == 0
                });
            if untouched {
                continue;
            }

            for (id, label) in component.atoms() {
                clean.add_atom(id, label);
            }
            for (key, label) in component.bonds() {
                let label = if label == COORDINATION_BOND {
                    DATIVE_BOND
                } else {
                    label
                };
                clean
                    .add_bond(key.source(), key.target(), label)
                    .expect("endpoints inserted above");
            }
        }

        clean
    }

    /// Sparse export: elements with at least one non-zero count, as
    /// (received, donated) pairs.
    pub fn to_dictionary(&self) -> BTreeMap<Element, (u32, u32)> {
        let mut dictionary = BTreeMap::new();
        for element in self.marked_elements() {
            dictionary.insert(
                element,
                (
                    self.electrons_received(element),
                    self.electrons_donated(element),
                ),
            );
        }
        dictionary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::graph::BondKey;
    use proptest::prelude::*;

    fn water_host() -> MolGraph {
        let mut host = MolGraph::new();
        host.add_atom(AtomId(0), "H");
        host.add_atom(AtomId(1), "O");
        host.add_atom(AtomId(2), "H");
        host.add_bond(AtomId(0), AtomId(1), "-").unwrap();
        host.add_bond(AtomId(1), AtomId(2), "-").unwrap();
        host
    }

    #[test]
    fn test_counts_default_zero() {
        let marking = Marking::new(water_host());
        assert_eq!(marking.electrons_received(AtomId(1)), 0);
        assert_eq!(marking.electrons_donated(Element::bond(AtomId(0), AtomId(1))), 0);
    }

    #[test]
    fn test_add_and_remove() {
        let mut marking = Marking::new(water_host());
        marking.add_received(AtomId(1)).unwrap();
        marking.add_received(AtomId(1)).unwrap();
        marking.add_donated(AtomId(1)).unwrap();
        marking.remove_received(AtomId(1));

        assert_eq!(marking.electrons_received(AtomId(1)), 1);
        assert_eq!(marking.electrons_donated(AtomId(1)), 1);
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_remove_below_zero_panics() {
        let mut marking = Marking::new(water_host());
        marking.remove_donated(AtomId(0));
    }

    #[test]
    fn test_marking_unknown_bond_creates_edge() {
        let mut marking = Marking::new(water_host());
        marking
            .add_received(Element::bond(AtomId(0), AtomId(2)))
            .unwrap();

        let host = marking.host_graph();
        assert_eq!(
            host.bond_label(&BondKey::new(AtomId(0), AtomId(2))),
            Some("?")
        );
    }

    #[test]
    fn test_action_includes_bond_endpoints() {
        let mut marking = Marking::new(water_host());
        marking
            .add_donated(Element::bond(AtomId(0), AtomId(1)))
            .unwrap();

        let action = marking.action();
        assert!(action.contains(&AtomId(0)));
        assert!(action.contains(&AtomId(1)));
        assert!(!action.contains(&AtomId(2)));
    }

    #[test]
    fn test_host_graph_prunes_untouched_components() {
        let mut host = water_host();
        // A spectator nitrogen molecule.
        host.add_atom(AtomId(10), "N");
        host.add_atom(AtomId(11), "N");
        host.add_bond(AtomId(10), AtomId(11), "#").unwrap();

        let mut marking = Marking::new(host);
        marking.add_received(AtomId(1)).unwrap();

        let visible = marking.host_graph();
        assert!(visible.contains_atom(AtomId(1)));
        assert!(!visible.contains_atom(AtomId(10)));
    }

    #[test]
    fn test_host_graph_renders_coordination_as_dative() {
        let mut host = MolGraph::new();
        host.add_atom(AtomId(0), "O");
        host.add_atom(AtomId(1), "Mg2+");
        host.add_bond(AtomId(0), AtomId(1), ":").unwrap();

        let mut marking = Marking::new(host);
        marking.add_received(AtomId(0)).unwrap();

        let visible = marking.host_graph();
        assert_eq!(
            visible.bond_label(&BondKey::new(AtomId(0), AtomId(1))),
            Some(">")
        );
    }

    #[test]
    fn test_update_from_rule_charge_and_bond() {
        // O-H + N -> O(-) + H-N(+): proton transfer.
        let rule = Rule::builder("proton_transfer")
            .atom_change(0, "O", "O-")
            .atom(1, "H")
            .atom_change(2, "N", "N+")
            .bond_left(0, 1, "-")
            .bond_right(1, 2, "-")
            .build()
            .unwrap();

        let mut host = MolGraph::new();
        host.add_atom(AtomId(0), "O");
        host.add_atom(AtomId(1), "H");
        host.add_atom(AtomId(2), "N");
        host.add_bond(AtomId(0), AtomId(1), "-").unwrap();

        let atom_map: BTreeMap<AtomId, AtomId> =
            [(AtomId(0), AtomId(0)), (AtomId(1), AtomId(1)), (AtomId(2), AtomId(2))]
                .into_iter()
                .collect();

        let marking = Marking::new(host)
            .update_from_rule(&rule, &atom_map)
            .unwrap();

        // O went 0 -> -1: the charge drop records a reception.
        assert_eq!(marking.electrons_received(AtomId(0)), 1);
        // N went 0 -> +1: the charge gain records a donation.
        assert_eq!(marking.electrons_donated(AtomId(2)), 1);
        // Broken O-H bond donates, formed H-N bond receives.
        assert_eq!(marking.electrons_donated(Element::bond(AtomId(0), AtomId(1))), 1);
        assert_eq!(marking.electrons_received(Element::bond(AtomId(1), AtomId(2))), 1);
    }

    #[test]
    fn test_update_from_rule_charge_drop_receives() {
        let rule = Rule::builder("reduction")
            .atom_change(0, "Fe3+", "Fe2+")
            .build()
            .unwrap();

        let mut host = MolGraph::new();
        host.add_atom(AtomId(5), "Fe3+");

        let atom_map: BTreeMap<AtomId, AtomId> = [(AtomId(0), AtomId(5))].into_iter().collect();
        let marking = Marking::new(host)
            .update_from_rule(&rule, &atom_map)
            .unwrap();

        assert_eq!(marking.electrons_received(AtomId(5)), 1);
        assert_eq!(marking.electrons_donated(AtomId(5)), 0);
    }

    #[test]
    fn test_update_from_rule_ignores_coordination() {
        let rule = Rule::builder("coordination_shuffle")
            .atom(0, "O")
            .atom(1, "Mg2+")
            .bond_right(0, 1, ":")
            .build()
            .unwrap();

        let mut host = MolGraph::new();
        host.add_atom(AtomId(0), "O");
        host.add_atom(AtomId(1), "Mg2+");

        let atom_map: BTreeMap<AtomId, AtomId> =
            [(AtomId(0), AtomId(0)), (AtomId(1), AtomId(1))].into_iter().collect();
        let marking = Marking::new(host)
            .update_from_rule(&rule, &atom_map)
            .unwrap();

        assert!(marking.to_dictionary().is_empty());
    }

    #[test]
    fn test_update_requires_mapped_action_vertices() {
        let rule = Rule::builder("charge")
            .atom_change(0, "N", "N+")
            .build()
            .unwrap();

        let marking = Marking::new(MolGraph::new());
        let result = marking.update_from_rule(&rule, &BTreeMap::new());
        assert!(matches!(result, Err(MarkingError::UnmappedVertex(_))));
    }

    #[test]
    fn test_to_dictionary_is_sparse() {
        let mut marking = Marking::new(water_host());
        marking.add_received(AtomId(1)).unwrap();
        marking.add_received(AtomId(0)).unwrap();
        marking.remove_received(AtomId(0));

        let dictionary = marking.to_dictionary();
        assert_eq!(dictionary.len(), 1);
        assert_eq!(dictionary[&Element::Atom(AtomId(1))], (1, 0));
    }

    proptest! {
        // Any interleaving of adds and removes that keeps the running
        // totals non-negative lands on exactly the net counts.
        #[test]
        fn prop_counter_netting(operations in proptest::collection::vec(0u8..4, 0..40)) {
            let mut marking = Marking::new(water_host());
            let mut received: i64 = 0;
            let mut donated: i64 = 0;

            for operation in operations {
                match operation {
                    0 => {
                        marking.add_received(AtomId(1)).unwrap();
                        received += 1;
                    }
                    1 => {
                        marking.add_donated(AtomId(1)).unwrap();
                        donated += 1;
                    }
                    2 if received > 0 => {
                        marking.remove_received(AtomId(1));
                        received -= 1;
                    }
                    3 if donated > 0 => {
                        marking.remove_donated(AtomId(1));
                        donated -= 1;
                    }
                    _ => {}
                }
            }

            prop_assert_eq!(marking.electrons_received(AtomId(1)) as i64, received);
            prop_assert_eq!(marking.electrons_donated(AtomId(1)) as i64, donated);
        }
    }
}
