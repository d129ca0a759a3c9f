//! Atom and bond label semantics.
//!
//! Labels are treated as opaque strings almost everywhere; this module is
//! the one place that reads chemistry out of them: the formal charge
//! suffix of an atom label and the ordered bond-order (valence) scales.

use regex_lite::Regex;
use std::sync::OnceLock;

/// Bond-order scale used when diffing a rule's left and right sides.
pub const RULE_BOND_ORDER: [&str; 4] = ["?", "-", "=", "#"];

/// Full bond-order scale of overlay host and product graphs.
///
/// Extends the rule scale with the coordination (`:`) and dative (`>`)
/// symbols so product-graph derivation can shift along one ordered axis.
pub const OVERLAY_BOND_ORDER: [&str; 6] = ["?", "-", "=", "#", ":", ">"];

/// Label of a metal-coordination bond.
pub const COORDINATION_BOND: &str = ":";

/// Dative rendering of a coordination bond in overlay host graphs.
pub const DATIVE_BOND: &str = ">";

/// Label of a provisional bond created by marking an element that the
/// host graph does not carry yet.
pub const UNKNOWN_BOND: &str = "?";

fn atom_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([a-zA-Z]+)([0-9]*)([+-]*)\s*$").expect("atom label pattern is valid")
    })
}

/// An atom label split into its element type and formal charge.
///
/// Labels that do not follow the `type`/`magnitude`/`sign` shape parse as
/// an uncharged opaque type and compose back unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtomLabel {
    /// Element type, e.g. `"N"` or `"Fe"`.
    pub atom_type: String,
    /// Formal charge; `0` for neutral or unparseable labels.
    pub charge: i32,
}

impl AtomLabel {
    /// Parse an atom label such as `"O"`, `"N+"` or `"Fe2+"`.
    pub fn parse(label: &str) -> Self {
        let Some(captures) = atom_pattern().captures(label) else {
            return Self {
                atom_type: label.to_string(),
                charge: 0,
            };
        };

        let atom_type = captures[1].to_string();
        let digits = &captures[2];
        let sign = &captures[3];

        let charge = if sign.is_empty() {
            0
        } else {
            let magnitude: i32 = if digits.is_empty() {
                1
            } else {
                digits.parse().unwrap_or(1)
            };
            if sign == "-" {
                -magnitude
            } else {
                magnitude
            }
        };

        Self { atom_type, charge }
    }

    /// Compose the label back from type and charge.
    pub fn compose(&self) -> String {
        if self.charge == 0 {
            return self.atom_type.clone();
        }

        let sign = if self.charge < 0 { "-" } else { "+" };
        let magnitude = self.charge.abs();

        if magnitude > 1 {
            format!("{}{}{}", self.atom_type, magnitude, sign)
        } else {
            format!("{}{}", self.atom_type, sign)
        }
    }

    /// Compose with a shifted charge.
    pub fn with_charge(&self, charge: i32) -> String {
        Self {
            atom_type: self.atom_type.clone(),
            charge,
        }
        .compose()
    }
}

/// Position of a bond label on the rule-side scale, if it is on it.
pub fn rule_bond_index(label: &str) -> Option<usize> {
    RULE_BOND_ORDER.iter().position(|s| *s == label)
}

/// Position of a bond label on the full overlay scale, if it is on it.
pub fn overlay_bond_index(label: &str) -> Option<usize> {
    OVERLAY_BOND_ORDER.iter().position(|s| *s == label)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_neutral() {
        let label = AtomLabel::parse("O");
        assert_eq!(label.atom_type, "O");
        assert_eq!(label.charge, 0);
    }

    #[test]
    fn test_parse_single_charge() {
        assert_eq!(AtomLabel::parse("N+").charge, 1);
        assert_eq!(AtomLabel::parse("Cl-").charge, -1);
    }

    #[test]
    fn test_parse_magnitude_charge() {
        assert_eq!(AtomLabel::parse("Fe2+").charge, 2);
        assert_eq!(AtomLabel::parse("O2-").charge, -2);
    }

    #[test]
    fn test_parse_opaque_label() {
        let label = AtomLabel::parse("Amino(R, C, 4)");
        assert_eq!(label.atom_type, "Amino(R, C, 4)");
        assert_eq!(label.charge, 0);
        assert_eq!(label.compose(), "Amino(R, C, 4)");
    }

    #[test]
    fn test_compose_round_trip() {
        for raw in ["O", "N+", "Cl-", "Fe2+", "Mg", "O2-"] {
            assert_eq!(AtomLabel::parse(raw).compose(), raw);
        }
    }

    #[test]
    fn test_charge_shift() {
        let label = AtomLabel::parse("N");
        assert_eq!(label.with_charge(1), "N+");
        assert_eq!(label.with_charge(-1), "N-");
        assert_eq!(label.with_charge(2), "N2+");
    }

    #[test]
    fn test_bond_scales() {
        assert_eq!(rule_bond_index("-"), Some(1));
        assert_eq!(rule_bond_index(":"), None);
        assert_eq!(overlay_bond_index(":"), Some(4));
        assert_eq!(overlay_bond_index(">"), Some(5));
    }
}
