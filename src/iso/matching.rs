//! Component matching between a rule pair's shared boundary.
//!
//! The first rule's product side and the second rule's reactant side are
//! decomposed into connected components. Non-metal components match
//! directly by label-exact component isomorphism, one witness each.
//! Components that only connect through metal-coordination bonds match
//! in two stages: a constraint-satisfaction search pairs metal-ion
//! multisets across the sides, then the coordination-free fragments of
//! the paired components match like ordinary components. A top-level
//! match is only valid if it covers every vertex of the first rule's
//! full product side.
//!
//! Witnesses expand to their symmetric variants through each component's
//! automorphism group; the expansion is restricted to the orbit of the
//! reaction-center atom being pinned.

use regex_lite::Regex;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::OnceLock;
use tracing::trace;

use super::{ComponentId, Isomorphism};
use crate::types::graph::{AtomId, MolGraph};
use crate::types::label::COORDINATION_BOND;
use crate::types::rule::Rule;

type Counter = BTreeMap<String, usize>;

// Labels starting with N, O or S (and no lowercase continuation) are the
// coordinating non-metals; anything else on a coordination bond is
// treated as a metal center.
fn coordinating_nonmetals() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[NOS][^a-z]*$").expect("coordinating-nonmetal pattern is valid")
    })
}

fn counter_sub(a: &Counter, b: &Counter) -> Counter {
    let mut result = Counter::new();
    for (label, &count) in a {
        let remaining = count.saturating_sub(b.get(label).copied().unwrap_or(0));
        if remaining > 0 {
            result.insert(label.clone(), remaining);
        }
    }
    result
}

// One side's component arena. Top-level components come first; lazy
// coordination-free decompositions append their fragments.
#[derive(Debug)]
struct ComponentSet {
    arena: Vec<MolGraph>,
    top: Vec<ComponentId>,
    decompositions: HashMap<ComponentId, Vec<ComponentId>>,
    automorphisms: HashMap<ComponentId, Vec<BTreeMap<AtomId, AtomId>>>,
}

impl ComponentSet {
    fn new(graph: &MolGraph) -> Self {
        let arena: Vec<MolGraph> = graph.components();
        let top: Vec<ComponentId> = (0..arena.len()).collect();
        Self {
            arena,
            top,
            decompositions: HashMap::new(),
            automorphisms: HashMap::new(),
        }
    }

    fn graph(&self, id: ComponentId) -> &MolGraph {
        &self.arena[id]
    }

    // Fragments left after removing coordination bonds. A component with
    // no coordination bonds decomposes into itself.
    fn decomposition(&mut self, id: ComponentId) -> Vec<ComponentId> {
        if let Some(fragments) = self.decompositions.get(&id) {
            return fragments.clone();
        }

        let stripped = self.arena[id].filter_bonds(|label| label != COORDINATION_BOND);
        let fragments: Vec<ComponentId> = if stripped.num_bonds() == self.arena[id].num_bonds() {
            vec![id]
        } else {
            stripped
                .components()
                .into_iter()
                .map(|fragment| {
                    self.arena.push(fragment);
                    self.arena.len() - 1
                })
                .collect()
        };

        self.decompositions.insert(id, fragments.clone());
        fragments
    }

    // Metal labels free to act as coordination ligands in a component.
    fn metal_ions(&self, id: ComponentId) -> Counter {
        let graph = self.graph(id);
        let mut ions = Counter::new();
        for (atom, label) in graph.atoms() {
            if coordinating_nonmetals().is_match(label) {
                continue;
            }
            let coordinated = graph
                .incident_bonds(atom)
                .iter()
                .any(|(_, bond_label)| *bond_label == COORDINATION_BOND);
            if coordinated {
                *ions.entry(label.to_string()).or_insert(0) += 1;
            }
        }
        ions
    }

    fn automorphisms(&mut self, id: ComponentId) -> &[BTreeMap<AtomId, AtomId>] {
        if !self.automorphisms.contains_key(&id) {
            let autos = self.arena[id].automorphisms();
            self.automorphisms.insert(id, autos);
        }
        &self.automorphisms[&id]
    }

    fn component_containing(
        &self,
        consumed: &BTreeSet<ComponentId>,
        vertex: AtomId,
    ) -> Option<ComponentId> {
        consumed
            .iter()
            .copied()
            .find(|&id| self.arena[id].contains_atom(vertex))
    }
}

/// Match state for one (first rule, second rule) boundary.
#[derive(Debug)]
pub(crate) struct MatchContext {
    first: ComponentSet,
    second: ComponentSet,
    first_vertex_ids: BTreeSet<AtomId>,
}

impl MatchContext {
    /// Build the context from the first rule's product side and the
    /// second rule's reactant side.
    pub(crate) fn new(first: &Rule, second: &Rule) -> Self {
        let product = first.right();
        let reactant = second.left();
        let first_vertex_ids = product.atom_ids().collect();
        Self {
            first: ComponentSet::new(&product),
            second: ComponentSet::new(&reactant),
            first_vertex_ids,
        }
    }

    /// One representative isomorphism per structurally distinct way of
    /// pairing the two sides' components, deduplicated by reaction-center
    /// key. Yields the empty-match sentinel when nothing matches.
    pub(crate) fn sample_isomorphisms(
        &mut self,
        reaction_center: &BTreeSet<AtomId>,
    ) -> Vec<Isomorphism> {
        let first_top = self.first.top.clone();
        let second_top = self.second.top.clone();

        let mut seen: HashSet<Vec<(AtomId, AtomId)>> = HashSet::new();
        let mut results = Vec::new();

        for global_match in self.compute_matches(&first_top, &second_top, reaction_center) {
            for candidate in self.complete_match(global_match, reaction_center) {
                if !candidate.is_complete(&self.first_vertex_ids) {
                    continue;
                }
                if seen.insert(candidate.key()) {
                    results.push(candidate);
                }
            }
        }

        trace!(count = results.len(), "sample isomorphisms computed");

        if results.is_empty() {
            // No structural match: callers proceed with the atom map they
            // already hold rather than treating this as an error.
            results.push(Isomorphism::new(reaction_center.clone()));
        }
        results
    }

    // Direct component-by-component matching. Components of the first
    // side are visited in ascending order; the first one that matches
    // anything anchors this level, alternatives branch over the second
    // side, and the remainder recurses. First-side components that match
    // nothing are left for the coordination-aware completion.
    fn compute_matches(
        &mut self,
        first: &[ComponentId],
        second: &[ComponentId],
        reaction_center: &BTreeSet<AtomId>,
    ) -> Vec<Isomorphism> {
        let mut results = Vec::new();
        let mut matched = false;

        for (index, &first_component) in first.iter().enumerate() {
            matched = false;

            for (position, &second_component) in second.iter().enumerate() {
                if !self
                    .first
                    .graph(first_component)
                    .is_isomorphic(self.second.graph(second_component))
                {
                    continue;
                }

                matched = true;
                let witness = self
                    .first
                    .graph(first_component)
                    .first_isomorphism(self.second.graph(second_component))
                    .expect("isomorphic components have a witness");
                let isomorphism = Isomorphism::from_match(
                    reaction_center.clone(),
                    first_component,
                    second_component,
                    witness,
                );

                let remaining_first = &first[index + 1..];
                let mut remaining_second = second.to_vec();
                remaining_second.remove(position);

                for remainder in
                    self.compute_matches(remaining_first, &remaining_second, reaction_center)
                {
                    results.push(isomorphism.merge(&remainder));
                }
            }

            if matched {
                break;
            }
        }

        if !matched {
            results.push(Isomorphism::new(reaction_center.clone()));
        }
        results
    }

    // Metal-ion multiset pairing: which left components can cover their
    // coordination ligands from which right components. Backtracking
    // over choice order; one left component may claim several right
    // components.
    fn match_metal_ions(
        first: &BTreeMap<ComponentId, Counter>,
        second: &BTreeMap<ComponentId, Counter>,
    ) -> Vec<BTreeMap<ComponentId, Vec<ComponentId>>> {
        if first.values().all(Counter::is_empty) || second.values().all(Counter::is_empty) {
            return vec![BTreeMap::new()];
        }

        let mut results = Vec::new();
        let first_ids: Vec<ComponentId> = first.keys().copied().collect();

        for (index, &first_component) in first_ids.iter().enumerate() {
            let first_ions = &first[&first_component];
            if first_ions.is_empty() {
                continue;
            }

            for (&second_component, second_ions) in second {
                if counter_sub(first_ions, second_ions) == *first_ions {
                    continue;
                }

                let mut remaining_first: BTreeMap<ComponentId, Counter> = first_ids[index + 1..]
                    .iter()
                    .map(|&id| (id, first[&id].clone()))
                    .collect();
                remaining_first.insert(first_component, counter_sub(first_ions, second_ions));

                let mut remaining_second = second.clone();
                remaining_second.insert(second_component, counter_sub(second_ions, first_ions));

                for ion_match in Self::match_metal_ions(&remaining_first, &remaining_second) {
                    let mut extended = ion_match;
                    extended
                        .entry(first_component)
                        .or_default()
                        .push(second_component);
                    results.push(extended);
                }
            }
        }

        results
    }

    // Coordination-aware completion of a partial match: pair leftover
    // components through their metal ions, match their coordination-free
    // fragments, then sweep up whatever is still unmatched.
    fn complete_match(
        &mut self,
        partial: Isomorphism,
        reaction_center: &BTreeSet<AtomId>,
    ) -> Vec<Isomorphism> {
        let unmatched_first: Vec<ComponentId> = self
            .first
            .top
            .iter()
            .copied()
            .filter(|id| !partial.first().contains(id))
            .collect();
        let unmatched_second: Vec<ComponentId> = self
            .second
            .top
            .iter()
            .copied()
            .filter(|id| !partial.second().contains(id))
            .collect();

        if unmatched_first.is_empty() && unmatched_second.is_empty() {
            return vec![partial];
        }

        let first_ions: BTreeMap<ComponentId, Counter> = unmatched_first
            .iter()
            .map(|&id| (id, self.first.metal_ions(id)))
            .collect();
        let second_ions: BTreeMap<ComponentId, Counter> = unmatched_second
            .iter()
            .map(|&id| (id, self.second.metal_ions(id)))
            .collect();

        for &id in &unmatched_first {
            self.first.decomposition(id);
        }
        for &id in &unmatched_second {
            self.second.decomposition(id);
        }

        let mut results = Vec::new();

        for ion_match in Self::match_metal_ions(&first_ions, &second_ions) {
            let mut ion_aware = vec![partial.clone()];

            for (first_component, paired_second) in &ion_match {
                let first_fragments = self.first.decomposition(*first_component);
                let second_fragments: Vec<ComponentId> = paired_second
                    .iter()
                    .flat_map(|&id| self.second.decomposition(id))
                    .collect();

                let submatches =
                    self.compute_matches(&first_fragments, &second_fragments, reaction_center);

                let mut extended = Vec::new();
                for submatch in &submatches {
                    for candidate in &ion_aware {
                        if candidate.compatible(submatch) {
                            extended.push(candidate.merge(submatch));
                        }
                    }
                }
                if !extended.is_empty() {
                    ion_aware = extended;
                }
            }

            for candidate in ion_aware {
                let still_first: Vec<ComponentId> = unmatched_first
                    .iter()
                    .flat_map(|&id| self.first.decomposition(id))
                    .filter(|fragment| !candidate.first().contains(fragment))
                    .collect();
                let still_second: Vec<ComponentId> = unmatched_second
                    .iter()
                    .flat_map(|&id| self.second.decomposition(id))
                    .filter(|fragment| !candidate.second().contains(fragment))
                    .collect();

                for remainder in
                    self.compute_matches(&still_first, &still_second, reaction_center)
                {
                    results.push(candidate.merge(&remainder));
                }
            }
        }

        results
    }

    /// All symmetric variants of an isomorphism obtainable by permuting
    /// the given pinned atom through its automorphism orbit, on either
    /// side, applied to a fixed point.
    pub(crate) fn permutations(
        &mut self,
        isomorphism: &Isomorphism,
        vertex: AtomId,
    ) -> Vec<Isomorphism> {
        let first_autos = match self
            .first
            .component_containing(isomorphism.first(), vertex)
        {
            Some(component) => Self::relevant_automorphisms(&mut self.first, component, vertex),
            None => Vec::new(),
        };
        let second_autos = match self
            .second
            .component_containing(isomorphism.second(), vertex)
        {
            Some(component) => Self::relevant_automorphisms(&mut self.second, component, vertex),
            None => Vec::new(),
        };

        let mut results = Vec::new();
        let mut seen: HashSet<Vec<(AtomId, AtomId)>> = HashSet::new();
        for intermediate in Self::apply_to_fixed_point(isomorphism, &first_autos, true) {
            for variant in Self::apply_to_fixed_point(&intermediate, &second_autos, false) {
                if seen.insert(variant.key()) {
                    results.push(variant);
                }
            }
        }
        results
    }

    // Automorphisms of the component that can move the given atom,
    // directly or through a chain of overlapping generators: close the
    // orbit with a worklist, then keep the generators touching it.
    fn relevant_automorphisms(
        side: &mut ComponentSet,
        component: ComponentId,
        vertex: AtomId,
    ) -> Vec<BTreeMap<AtomId, AtomId>> {
        let automorphisms = side.automorphisms(component).to_vec();

        let mut orbit: BTreeSet<AtomId> = BTreeSet::new();
        orbit.insert(vertex);
        let mut grew = true;
        while grew {
            grew = false;
            for automorphism in &automorphisms {
                if automorphism.keys().any(|moved| orbit.contains(moved)) {
                    let before = orbit.len();
                    orbit.extend(automorphism.keys().copied());
                    if orbit.len() > before {
                        grew = true;
                    }
                }
            }
        }

        automorphisms
            .into_iter()
            .filter(|automorphism| automorphism.keys().any(|moved| orbit.contains(moved)))
            .collect()
    }

    // Apply a generator set to one side of the mapping until no new
    // variant appears.
    fn apply_to_fixed_point(
        seed: &Isomorphism,
        automorphisms: &[BTreeMap<AtomId, AtomId>],
        first_side: bool,
    ) -> Vec<Isomorphism> {
        let mut seen: HashSet<Vec<(AtomId, AtomId)>> = HashSet::new();
        seen.insert(seed.key());
        let mut variants = vec![seed.clone()];

        let mut frontier = variants.clone();
        while !frontier.is_empty() {
            let mut next = Vec::new();
            for variant in &frontier {
                for automorphism in automorphisms {
                    let applied = if first_side {
                        variant.apply(Some(automorphism), None)
                    } else {
                        variant.apply(None, Some(automorphism))
                    };
                    if seen.insert(applied.key()) {
                        next.push(applied);
                    }
                }
            }
            variants.extend(next.iter().cloned());
            frontier = next;
        }

        variants
    }
}
