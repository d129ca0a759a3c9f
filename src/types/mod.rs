//! Core types for the overlay kernel.

pub mod graph;
pub mod label;
pub mod mechanism;
pub mod overlay;
pub mod rule;

pub use graph::{AtomId, BondKey, Element, GraphError, MolGraph};
pub use label::{
    overlay_bond_index, rule_bond_index, AtomLabel, COORDINATION_BOND, DATIVE_BOND,
    OVERLAY_BOND_ORDER, RULE_BOND_ORDER, UNKNOWN_BOND,
};
pub use mechanism::{ECNumber, Mechanism, MechanismError, Step};
pub use overlay::{CatalyticPolicy, OverlayError, OverlayGraph};
pub use rule::{Rule, RuleBuilder, RuleEdge, RuleError, RuleId, RuleVertex};
