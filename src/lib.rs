//! # overlay-kernel
//!
//! Overlay-graph reconstruction for multi-step reaction mechanisms.
//!
//! A mechanism is an ordered sequence of transformation rules, each
//! rewriting a labeled graph's left side into its right side. The kernel
//! answers one question:
//!
//! > What is the net transformation of the whole mechanism, atom by atom
//! > and bond by bond?
//!
//! ## Core Contract
//!
//! 1. Chain consecutive rules by enumerating the label-exact
//!    isomorphisms between step *i*'s product boundary and step
//!    *i+1*'s reactant boundary, symmetric variants included
//! 2. Propagate one consistent atom identity through the whole chain,
//!    accumulating electron donation/reception per atom and bond
//! 3. Deduplicate mechanistically equivalent results by canonical form
//!
//! ## Architecture
//!
//! ```text
//! Mechanism (Steps ⟶ Rules)
//!      │ seed from step 1's reactant side
//!      ▼
//! OverlayGraphs driver ⟷ IsomorphismCache (per rule pair, trie by
//!      │                  reaction-center prefix, automorphism orbits)
//!      │ Marking per branch (copy-on-branch)
//!      ▼
//! OverlayGraph results ⟶ GraphCanonicalizer (dedup by canonical form)
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Component and reaction-center orderings follow ascending atom id
//! - Witness isomorphisms are deterministic for a fixed rule pair
//! - Same mechanism + same hints → identical overlay graphs, in order
//!
//! The search is lazy end to end: pulling the first N overlay graphs
//! never pays for branches those N did not need.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod canonical;
pub mod driver;
pub mod iso;
pub mod marking;
pub mod types;

// Re-exports
pub use types::graph::{AtomId, BondKey, Element, GraphError, MolGraph};
pub use types::label::{AtomLabel, OVERLAY_BOND_ORDER, RULE_BOND_ORDER};
pub use types::mechanism::{ECNumber, Mechanism, MechanismError, Step};
pub use types::overlay::{CatalyticPolicy, OverlayError, OverlayGraph};
pub use types::rule::{Rule, RuleBuilder, RuleEdge, RuleError, RuleId, RuleVertex};

pub use canonical::{CanonicalForm, CanonicalGraph, CanonicalRule, GraphCanonicalizer};
pub use driver::{
    compute_overlay_graphs, overlay_graphs_for_mechanisms, AtomMapHints, DriverError,
    MechanismResult, OverlayGraphs,
};
pub use iso::{IsoCursor, Isomorphism, IsomorphismCache, Isomorphisms};
pub use marking::{Marking, MarkingError};

/// Schema version for all overlay kernel types.
/// Increment on breaking changes to any serialized type.
pub const OVERLAY_KERNEL_SCHEMA_VERSION: &str = "1.0.0";
