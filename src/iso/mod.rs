//! Symmetry-aware isomorphism search between consecutive rules.
//!
//! Chaining two steps means matching the first rule's product side onto
//! the second rule's reactant side, component by component, under exact
//! label matching. One witness per matched component pair is enough
//! structurally; the full match set is recovered lazily by expanding
//! witnesses through each component's automorphism group, but only for
//! the atoms the downstream mechanism actually pins down (the reaction
//! center). Results are memoized in a per-rule-pair trie keyed by the
//! ordered reaction-center prefix ([`cache::IsomorphismCache`]).

pub mod cache;
pub mod matching;

pub use cache::{IsoCursor, IsomorphismCache, Isomorphisms};

use std::collections::{BTreeMap, BTreeSet};

use crate::types::graph::AtomId;

/// Index of a component graph in a rule pair's match context arena.
pub(crate) type ComponentId = usize;

/// A (partial) atom correspondence between the first rule's product side
/// and the second rule's reactant side.
///
/// Tracks which component graphs each side has consumed so that partial
/// matches combine without double-use, and the reaction center whose
/// restriction defines identity: equality and hashing consider only the
/// atom map restricted to the reaction center, sorted. Atoms outside the
/// center may map arbitrarily without producing a different isomorphism.
#[derive(Debug, Clone)]
pub struct Isomorphism {
    reaction_center: BTreeSet<AtomId>,
    first: BTreeSet<ComponentId>,
    second: BTreeSet<ComponentId>,
    atom_map: BTreeMap<AtomId, AtomId>,
}

impl Isomorphism {
    /// The empty match over a reaction center.
    pub fn new(reaction_center: BTreeSet<AtomId>) -> Self {
        Self {
            reaction_center,
            first: BTreeSet::new(),
            second: BTreeSet::new(),
            atom_map: BTreeMap::new(),
        }
    }

    pub(crate) fn from_match(
        reaction_center: BTreeSet<AtomId>,
        first: ComponentId,
        second: ComponentId,
        atom_map: BTreeMap<AtomId, AtomId>,
    ) -> Self {
        let mut isomorphism = Self::new(reaction_center);
        isomorphism.first.insert(first);
        isomorphism.second.insert(second);
        isomorphism.atom_map = atom_map;
        isomorphism
    }

    /// Image of a first-side atom, if mapped.
    pub fn get(&self, atom: AtomId) -> Option<AtomId> {
        self.atom_map.get(&atom).copied()
    }

    /// The full atom map.
    pub fn atom_map(&self) -> &BTreeMap<AtomId, AtomId> {
        &self.atom_map
    }

    /// The reaction center the match was built against.
    pub fn reaction_center(&self) -> &BTreeSet<AtomId> {
        &self.reaction_center
    }

    /// Whether this is the empty-match sentinel (no atoms mapped).
    pub fn is_empty_match(&self) -> bool {
        self.atom_map.is_empty()
    }

    pub(crate) fn first(&self) -> &BTreeSet<ComponentId> {
        &self.first
    }

    pub(crate) fn second(&self) -> &BTreeSet<ComponentId> {
        &self.second
    }

    /// Union of two partial matches.
    pub(crate) fn merge(&self, other: &Isomorphism) -> Isomorphism {
        let mut result = Isomorphism::new(
            self.reaction_center
                .union(&other.reaction_center)
                .copied()
                .collect(),
        );
        result.first = self.first.union(&other.first).copied().collect();
        result.second = self.second.union(&other.second).copied().collect();
        result.atom_map = self.atom_map.clone();
        result.atom_map.extend(&other.atom_map);
        result
    }

    /// Whether the two partial matches consume disjoint components.
    pub(crate) fn compatible(&self, other: &Isomorphism) -> bool {
        self.first.is_disjoint(&other.first) && self.second.is_disjoint(&other.second)
    }

    /// Whether the match covers exactly the given vertex set.
    pub(crate) fn is_complete(&self, vertex_ids: &BTreeSet<AtomId>) -> bool {
        self.atom_map.keys().copied().collect::<BTreeSet<_>>() == *vertex_ids
    }

    /// Rewrite the match through automorphisms of the first and/or
    /// second side. Sparse automorphism maps list moved atoms only.
    pub(crate) fn apply(
        &self,
        first_automorphism: Option<&BTreeMap<AtomId, AtomId>>,
        second_automorphism: Option<&BTreeMap<AtomId, AtomId>>,
    ) -> Isomorphism {
        let mut result = Isomorphism::new(self.reaction_center.clone());
        result.first = self.first.clone();
        result.second = self.second.clone();

        for (&source, &target) in &self.atom_map {
            let source = first_automorphism
                .and_then(|auto| auto.get(&source).copied())
                .unwrap_or(source);
            let target = second_automorphism
                .and_then(|auto| auto.get(&target).copied())
                .unwrap_or(target);
            result.atom_map.insert(source, target);
        }

        result
    }

    /// Identity key: the reaction-center restriction of the atom map.
    pub fn key(&self) -> Vec<(AtomId, AtomId)> {
        self.atom_map
            .iter()
            .filter(|(source, _)| self.reaction_center.contains(source))
            .map(|(&source, &target)| (source, target))
            .collect()
    }
}

impl PartialEq for Isomorphism {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Isomorphism {}

impl std::hash::Hash for Isomorphism {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.key().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn center(ids: &[u32]) -> BTreeSet<AtomId> {
        ids.iter().map(|&id| AtomId(id)).collect()
    }

    fn mapping(pairs: &[(u32, u32)]) -> BTreeMap<AtomId, AtomId> {
        pairs
            .iter()
            .map(|&(a, b)| (AtomId(a), AtomId(b)))
            .collect()
    }

    #[test]
    fn test_key_restricted_to_reaction_center() {
        let iso = Isomorphism::from_match(center(&[0]), 0, 0, mapping(&[(0, 5), (1, 6)]));
        assert_eq!(iso.key(), vec![(AtomId(0), AtomId(5))]);
    }

    #[test]
    fn test_equality_ignores_atoms_outside_center() {
        let a = Isomorphism::from_match(center(&[0]), 0, 0, mapping(&[(0, 5), (1, 6)]));
        let b = Isomorphism::from_match(center(&[0]), 0, 0, mapping(&[(0, 5), (1, 7)]));
        let c = Isomorphism::from_match(center(&[0]), 0, 0, mapping(&[(0, 6), (1, 6)]));

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_merge_unions_everything() {
        let a = Isomorphism::from_match(center(&[0]), 0, 10, mapping(&[(0, 5)]));
        let b = Isomorphism::from_match(center(&[1]), 1, 11, mapping(&[(1, 6)]));

        let merged = a.merge(&b);
        assert_eq!(merged.get(AtomId(0)), Some(AtomId(5)));
        assert_eq!(merged.get(AtomId(1)), Some(AtomId(6)));
        assert!(merged.first().contains(&0) && merged.first().contains(&1));
        assert!(merged.second().contains(&10) && merged.second().contains(&11));
    }

    #[test]
    fn test_compatible_requires_disjoint_components() {
        let a = Isomorphism::from_match(center(&[]), 0, 10, mapping(&[(0, 5)]));
        let b = Isomorphism::from_match(center(&[]), 1, 11, mapping(&[(1, 6)]));
        let clash = Isomorphism::from_match(center(&[]), 0, 12, mapping(&[(2, 7)]));

        assert!(a.compatible(&b));
        assert!(!a.compatible(&clash));
    }

    #[test]
    fn test_is_complete() {
        let iso = Isomorphism::from_match(center(&[]), 0, 0, mapping(&[(0, 5), (1, 6)]));
        assert!(iso.is_complete(&center(&[0, 1])));
        assert!(!iso.is_complete(&center(&[0, 1, 2])));
    }

    #[test]
    fn test_apply_automorphisms() {
        let iso = Isomorphism::from_match(center(&[0, 2]), 0, 0, mapping(&[(0, 5), (2, 7)]));

        let swap_first = mapping(&[(0, 2), (2, 0)]);
        let applied = iso.apply(Some(&swap_first), None);
        assert_eq!(applied.get(AtomId(0)), Some(AtomId(7)));
        assert_eq!(applied.get(AtomId(2)), Some(AtomId(5)));

        let swap_second = mapping(&[(5, 7), (7, 5)]);
        let applied = iso.apply(None, Some(&swap_second));
        assert_eq!(applied.get(AtomId(0)), Some(AtomId(7)));
        assert_eq!(applied.get(AtomId(2)), Some(AtomId(5)));
    }
}
