//! The recursive extension driver.
//!
//! Walks a mechanism step by step: the marking seeded from step 1's
//! reactant side is extended through each subsequent step by composing
//! the running atom map with a boundary isomorphism from the cache,
//! pruning against externally supplied atom-map hints, and deduplicating
//! sibling branches by canonical form. Every path that survives to the
//! last step emits one [`OverlayGraph`].
//!
//! The search is an explicit work stack of frames rather than recursion,
//! and it is lazy: pulling the first N overlay graphs from the iterator
//! only pays for the branches those N needed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, trace, warn};

use crate::canonical::{CanonicalForm, GraphCanonicalizer};
use crate::iso::{IsoCursor, IsomorphismCache};
use crate::marking::{Marking, MarkingError};
use crate::types::graph::AtomId;
use crate::types::mechanism::Mechanism;
use crate::types::overlay::OverlayGraph;
use crate::types::rule::Rule;

// Label templates of the canonical-dedup view: original label plus
// received and donated counts.
const DEDUP_VERTEX_PATTERN: &str = "L_+_-";
const DEDUP_EDGE_PATTERN: &str = "L_+_-";

/// Error type for the extension driver.
#[derive(Debug, Clone, thiserror::Error)]
pub enum DriverError {
    /// The mechanism has no steps to process.
    #[error("Mechanism {entry}_{number} has no steps")]
    EmptyMechanism {
        /// Mechanism entry.
        entry: i32,
        /// Mechanism proposal number.
        number: i32,
    },
    /// A step had no rule; the mechanism cannot be processed.
    #[error("Step {step} of mechanism {entry}_{number} has no rule")]
    MissingRule {
        /// Mechanism entry.
        entry: i32,
        /// Mechanism proposal number.
        number: i32,
        /// Zero-based step index.
        step: usize,
    },
    /// Marking update failed (sanitizer contract violation).
    #[error("Marking update failed: {0}")]
    Marking(#[from] MarkingError),
    /// A boundary isomorphism did not cover an atom the running map
    /// needs; consecutive rules do not share their full boundary.
    #[error("Boundary isomorphism does not cover atom {0}")]
    IncompleteComposition(AtomId),
}

/// Externally supplied atom-map constraints, per mechanism and step.
///
/// Each entry pins a set of rule atoms to original-mechanism atoms for
/// one step; a search branch whose running atom map contradicts a pin is
/// discarded. Hints are hard constraints, not preferences.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(from = "Vec<HintRecord>", into = "Vec<HintRecord>")]
pub struct AtomMapHints {
    by_mechanism: HashMap<(i32, i32), Vec<(i32, BTreeMap<AtomId, AtomId>)>>,
}

impl AtomMapHints {
    /// No hints.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `atom -> original` mappings for one step (1-based, as in the
    /// source records) of one mechanism.
    pub fn insert(
        &mut self,
        entry: i32,
        mechanism: i32,
        step: i32,
        map: BTreeMap<AtomId, AtomId>,
    ) {
        self.by_mechanism
            .entry((entry, mechanism))
            .or_default()
            .push((step, map));
    }

    /// Per-step hint maps for a mechanism, one per step, empty where
    /// nothing is pinned.
    pub fn for_mechanism(&self, mechanism: &Mechanism) -> Vec<BTreeMap<AtomId, AtomId>> {
        let mut hints = vec![BTreeMap::new(); mechanism.len()];
        if let Some(entries) = self
            .by_mechanism
            .get(&(mechanism.entry(), mechanism.number()))
        {
            for (step, map) in entries {
                let index = (step - 1) as usize;
                if index < hints.len() {
                    hints[index] = map.clone();
                }
            }
        }
        hints
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HintRecord {
    entry: i32,
    mechanism: i32,
    atom_maps: Vec<StepHintRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepHintRecord {
    step: i32,
    map: Vec<HintPair>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HintPair {
    atom: AtomId,
    original: AtomId,
}

impl From<Vec<HintRecord>> for AtomMapHints {
    fn from(records: Vec<HintRecord>) -> Self {
        let mut hints = AtomMapHints::new();
        for record in records {
            for step_hint in record.atom_maps {
                let map = step_hint
                    .map
                    .into_iter()
                    .map(|pair| (pair.atom, pair.original))
                    .collect();
                hints.insert(record.entry, record.mechanism, step_hint.step, map);
            }
        }
        hints
    }
}

impl From<AtomMapHints> for Vec<HintRecord> {
    fn from(hints: AtomMapHints) -> Self {
        let mut records: Vec<HintRecord> = hints
            .by_mechanism
            .into_iter()
            .map(|((entry, mechanism), steps)| HintRecord {
                entry,
                mechanism,
                atom_maps: steps
                    .into_iter()
                    .map(|(step, map)| StepHintRecord {
                        step,
                        map: map
                            .into_iter()
                            .map(|(atom, original)| HintPair { atom, original })
                            .collect(),
                    })
                    .collect(),
            })
            .collect();
        records.sort_by_key(|record| (record.entry, record.mechanism));
        records
    }
}

// One branch of the search: the marking accumulated so far, the running
// atom map (original id -> current rule id), and this branch's position
// in the isomorphism enumeration for the next step.
#[derive(Debug)]
struct Frame {
    marking: Marking,
    atom_map: BTreeMap<AtomId, AtomId>,
    next_step: usize,
    reaction_center: Vec<AtomId>,
    cursor: IsoCursor,
    seen: HashSet<CanonicalForm>,
}

/// Lazy enumerator of a mechanism's overlay graphs.
pub struct OverlayGraphs<'a> {
    canonicalizer: &'a GraphCanonicalizer,
    cache: &'a mut IsomorphismCache,
    rules: Vec<&'a Rule>,
    hints: Vec<BTreeMap<AtomId, AtomId>>,
    stack: Vec<Frame>,
    done: bool,
}

impl<'a> OverlayGraphs<'a> {
    fn new(
        canonicalizer: &'a GraphCanonicalizer,
        cache: &'a mut IsomorphismCache,
        mechanism: &'a Mechanism,
        hints: Vec<BTreeMap<AtomId, AtomId>>,
    ) -> Result<Self, DriverError> {
        if mechanism.is_empty() {
            return Err(DriverError::EmptyMechanism {
                entry: mechanism.entry(),
                number: mechanism.number(),
            });
        }

        let mut rules = Vec::with_capacity(mechanism.len());
        for (index, step) in mechanism.steps().iter().enumerate() {
            let rule = step.rule.as_ref().ok_or(DriverError::MissingRule {
                entry: mechanism.entry(),
                number: mechanism.number(),
                step: index,
            })?;
            rules.push(rule);
        }

        let mut hints = hints;
        hints.resize(rules.len(), BTreeMap::new());

        let mut enumerator = Self {
            canonicalizer,
            cache,
            rules,
            hints,
            stack: Vec::new(),
            done: false,
        };
        enumerator.seed()?;
        Ok(enumerator)
    }

    // Initial marking: step 1's reactant side under the identity atom
    // map, with step 1's own action already applied.
    fn seed(&mut self) -> Result<(), DriverError> {
        let first = self.rules[0];
        let host = first.left();
        let atom_map: BTreeMap<AtomId, AtomId> =
            host.atom_ids().map(|id| (id, id)).collect();

        let marking = Marking::new(host).update_from_rule(first, &atom_map)?;
        debug!(atoms = atom_map.len(), "seeded initial marking");

        self.push_frame(marking, atom_map, 1)?;
        Ok(())
    }

    fn push_frame(
        &mut self,
        marking: Marking,
        atom_map: BTreeMap<AtomId, AtomId>,
        next_step: usize,
    ) -> Result<(), DriverError> {
        let mut reaction_center = Vec::new();
        for original in marking.action() {
            let atom = atom_map
                .get(&original)
                .copied()
                .ok_or(DriverError::IncompleteComposition(original))?;
            reaction_center.push(atom);
        }
        reaction_center.sort();
        reaction_center.dedup();

        self.stack.push(Frame {
            marking,
            atom_map,
            next_step,
            reaction_center,
            cursor: IsoCursor::default(),
            seen: HashSet::new(),
        });
        Ok(())
    }

    fn advance(&mut self) -> Result<Option<OverlayGraph>, DriverError> {
        loop {
            let Some(frame) = self.stack.last_mut() else {
                return Ok(None);
            };

            // Terminal frame: the whole mechanism is applied.
            if frame.next_step >= self.rules.len() {
                let frame = self.stack.pop().expect("frame checked above");
                let overlay =
                    OverlayGraph::new(frame.marking.host_graph(), frame.marking.to_dictionary());
                return Ok(Some(overlay));
            }

            let next_step = frame.next_step;
            let last_rule = self.rules[next_step - 1];
            let next_rule = self.rules[next_step];

            let Some(isomorphism) = self.cache.next_isomorphism(
                last_rule,
                next_rule,
                &frame.reaction_center,
                &mut frame.cursor,
            ) else {
                self.stack.pop();
                continue;
            };

            // Compose the running atom map with the boundary match. The
            // empty-match sentinel means no structural constraint: keep
            // the map the caller already holds.
            let new_atom_map: BTreeMap<AtomId, AtomId> = if isomorphism.is_empty_match() {
                frame.atom_map.clone()
            } else {
                let mut composed = BTreeMap::new();
                for (&original, &last) in &frame.atom_map {
                    let target = isomorphism
                        .get(last)
                        .ok_or(DriverError::IncompleteComposition(last))?;
                    composed.insert(original, target);
                }
                composed
            };

            // Hints are hard constraints on this step's atom identities.
            let hint = &self.hints[next_step];
            let violated = hint.iter().any(|(&atom, &original)| {
                new_atom_map.get(&original).copied() != Some(atom)
            });
            if violated {
                trace!(step = next_step, "branch violates prescribed atom map");
                continue;
            }

            let inverted: BTreeMap<AtomId, AtomId> = new_atom_map
                .iter()
                .map(|(&original, &current)| (current, original))
                .collect();
            let new_marking = frame.marking.update_from_rule(next_rule, &inverted)?;

            // Symmetric matches frequently produce identical overlays;
            // discard a branch canonically equal to an emitted sibling.
            let intermediate =
                OverlayGraph::new(new_marking.host_graph(), new_marking.to_dictionary());
            let form = self.canonicalizer.canonical_form(
                &intermediate.to_labelled_graph(DEDUP_VERTEX_PATTERN, DEDUP_EDGE_PATTERN),
            );
            if !frame.seen.insert(form) {
                trace!(step = next_step, "branch isomorphic to explored sibling");
                continue;
            }

            debug!(step = next_step, "extending overlay graph");
            self.push_frame(new_marking, new_atom_map, next_step + 1)?;
        }
    }
}

impl Iterator for OverlayGraphs<'_> {
    type Item = Result<OverlayGraph, DriverError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.advance() {
            Ok(Some(overlay)) => Some(Ok(overlay)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(error) => {
                self.done = true;
                Some(Err(error))
            }
        }
    }
}

/// Lazily enumerate a mechanism's overlay graphs.
///
/// `hints` holds one (rule atom -> original atom) pin map per step;
/// pass an empty vector for an unconstrained search.
pub fn compute_overlay_graphs<'a>(
    canonicalizer: &'a GraphCanonicalizer,
    cache: &'a mut IsomorphismCache,
    mechanism: &'a Mechanism,
    hints: Vec<BTreeMap<AtomId, AtomId>>,
) -> Result<OverlayGraphs<'a>, DriverError> {
    OverlayGraphs::new(canonicalizer, cache, mechanism, hints)
}

/// One mechanism's deduplicated overlay graphs, ready for export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MechanismResult {
    /// The mechanism the overlays were computed for.
    pub mechanism: Mechanism,
    /// Canonically distinct overlay graphs, in discovery order.
    pub overlay_graphs: Vec<OverlayGraph>,
}

/// Compute overlay graphs for a batch of mechanisms.
///
/// Unprocessable mechanisms (no steps, or a step without a rule) and
/// mechanisms whose search fails a consistency contract are skipped with
/// a warning rather than aborting the batch. Each mechanism gets a fresh
/// isomorphism cache; the canonicalizer is shared across the whole run.
pub fn overlay_graphs_for_mechanisms(
    mechanisms: &[Mechanism],
    hints: &AtomMapHints,
) -> Vec<MechanismResult> {
    let canonicalizer = GraphCanonicalizer::new();
    let mut results = Vec::new();

    for mechanism in mechanisms {
        if !mechanism.is_processable() {
            warn!(%mechanism, "skipping unprocessable mechanism");
            continue;
        }

        info!(%mechanism, "computing overlay graphs");
        let mut cache = IsomorphismCache::new();
        let step_hints = hints.for_mechanism(mechanism);

        let enumerator =
            match compute_overlay_graphs(&canonicalizer, &mut cache, mechanism, step_hints) {
                Ok(enumerator) => enumerator,
                Err(error) => {
                    warn!(%mechanism, %error, "skipping mechanism");
                    continue;
                }
            };

        let mut seen: HashSet<CanonicalForm> = HashSet::new();
        let mut overlay_graphs = Vec::new();
        let mut failed = false;

        for overlay in enumerator {
            let overlay = match overlay {
                Ok(overlay) => overlay,
                Err(error) => {
                    warn!(%mechanism, %error, "skipping mechanism");
                    failed = true;
                    break;
                }
            };

            let form = canonicalizer.canonical_form(
                &overlay.to_labelled_graph(DEDUP_VERTEX_PATTERN, DEDUP_EDGE_PATTERN),
            );
            if seen.insert(form) {
                overlay_graphs.push(overlay);
            }
        }

        if failed {
            continue;
        }

        info!(
            %mechanism,
            count = overlay_graphs.len(),
            "found unique overlay graphs"
        );
        results.push(MechanismResult {
            mechanism: mechanism.clone(),
            overlay_graphs,
        });
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::mechanism::Step;

    // A linear two-step mechanism on an asymmetric substrate: exactly
    // one way to chain.
    fn linear_mechanism() -> Mechanism {
        // Step 1: C-O single bond gains an electron pair (order up).
        let step_one = Rule::builder("order_up")
            .atom(0, "C")
            .atom(1, "O")
            .atom(2, "N")
            .bond_change(0, 1, "-", "=")
            .bond(1, 2, "-")
            .build()
            .unwrap();
        // Step 2: the same bond drops back down.
        let step_two = Rule::builder("order_down")
            .atom(0, "C")
            .atom(1, "O")
            .atom(2, "N")
            .bond_change(0, 1, "=", "-")
            .bond(1, 2, "-")
            .build()
            .unwrap();

        Mechanism::new(
            1,
            1,
            vec![
                Step::new(1, 1, 1, Some(step_one)),
                Step::new(1, 1, 2, Some(step_two)),
            ],
        )
    }

    #[test]
    fn test_single_step_mechanism() {
        let rule = Rule::builder("charge_up")
            .atom_change(0, "N", "N+")
            .atom(1, "H")
            .bond(0, 1, "-")
            .build()
            .unwrap();
        let mechanism = Mechanism::new(2, 1, vec![Step::new(2, 1, 1, Some(rule))]);

        let canonicalizer = GraphCanonicalizer::new();
        let mut cache = IsomorphismCache::new();
        let overlays: Vec<_> =
            compute_overlay_graphs(&canonicalizer, &mut cache, &mechanism, vec![])
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap();

        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays[0].electrons_donated(AtomId(0)), 1);
    }

    #[test]
    fn test_two_step_round_trip_marking() {
        let mechanism = linear_mechanism();
        let canonicalizer = GraphCanonicalizer::new();
        let mut cache = IsomorphismCache::new();

        let overlays: Vec<_> =
            compute_overlay_graphs(&canonicalizer, &mut cache, &mechanism, vec![])
                .unwrap()
                .collect::<Result<Vec<_>, _>>()
                .unwrap();

        assert_eq!(overlays.len(), 1);
        let overlay = &overlays[0];

        // The bond went up then back down: one received, one donated.
        let bond = crate::types::graph::Element::bond(AtomId(0), AtomId(1));
        assert_eq!(overlay.electrons_received(bond), 1);
        assert_eq!(overlay.electrons_donated(bond), 1);
    }

    #[test]
    fn test_missing_rule_is_an_error() {
        let mechanism = Mechanism::new(3, 1, vec![Step::new(3, 1, 1, None)]);
        let canonicalizer = GraphCanonicalizer::new();
        let mut cache = IsomorphismCache::new();

        let result = compute_overlay_graphs(&canonicalizer, &mut cache, &mechanism, vec![]);
        assert!(matches!(result, Err(DriverError::MissingRule { .. })));
    }

    #[test]
    fn test_batch_skips_unprocessable() {
        let broken = Mechanism::new(3, 1, vec![Step::new(3, 1, 1, None)]);
        let mechanisms = vec![broken, linear_mechanism()];

        let results = overlay_graphs_for_mechanisms(&mechanisms, &AtomMapHints::new());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].mechanism.entry(), 1);
        assert_eq!(results[0].overlay_graphs.len(), 1);
    }

    #[test]
    fn test_hint_pruning_discards_all_branches() {
        let mechanism = linear_mechanism();
        let canonicalizer = GraphCanonicalizer::new();
        let mut cache = IsomorphismCache::new();

        // Step 2 (1-based) pins rule atom 0 to original atom 1, which no
        // valid chaining can satisfy: every branch is discarded.
        let mut hints = AtomMapHints::new();
        hints.insert(
            1,
            1,
            2,
            [(AtomId(0), AtomId(1))].into_iter().collect(),
        );

        let overlays: Vec<_> = compute_overlay_graphs(
            &canonicalizer,
            &mut cache,
            &mechanism,
            hints.for_mechanism(&mechanism),
        )
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

        assert!(overlays.is_empty());
    }

    #[test]
    fn test_hint_consistent_branch_survives() {
        let mechanism = linear_mechanism();
        let canonicalizer = GraphCanonicalizer::new();
        let mut cache = IsomorphismCache::new();

        let mut hints = AtomMapHints::new();
        hints.insert(
            1,
            1,
            2,
            [(AtomId(0), AtomId(0))].into_iter().collect(),
        );

        let overlays: Vec<_> = compute_overlay_graphs(
            &canonicalizer,
            &mut cache,
            &mechanism,
            hints.for_mechanism(&mechanism),
        )
        .unwrap()
        .collect::<Result<Vec<_>, _>>()
        .unwrap();

        assert_eq!(overlays.len(), 1);
    }

    #[test]
    fn test_hints_serde_record_shape() {
        let json = r#"[
            {
                "entry": 1,
                "mechanism": 1,
                "atom_maps": [
                    { "step": 2, "map": [ { "atom": 0, "original": 0 } ] }
                ]
            }
        ]"#;

        let hints: AtomMapHints = serde_json::from_str(json).unwrap();
        let per_step = hints.for_mechanism(&linear_mechanism());

        assert_eq!(per_step.len(), 2);
        assert!(per_step[0].is_empty());
        assert_eq!(per_step[1].get(&AtomId(0)), Some(&AtomId(0)));
    }
}
