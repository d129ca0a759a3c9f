//! Mechanisms: ordered step sequences with an (entry, proposal) identity.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use super::rule::Rule;

/// Error type for mechanism records.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MechanismError {
    /// An EC number did not have exactly four dot-separated levels.
    #[error("Invalid EC number '{0}': expected four dot-separated levels")]
    InvalidEcNumber(String),
}

/// Enzyme Commission number with `-` wildcards, e.g. `3.2.1.-`.
///
/// Ordered level-wise: wildcard first, then numeric levels by value, then
/// alphabetic levels lexically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ECNumber {
    levels: [String; 4],
}

impl ECNumber {
    /// Parse a four-level EC id.
    pub fn parse(ec_id: &str) -> Result<Self, MechanismError> {
        let parts: Vec<String> = ec_id.split('.').map(str::to_string).collect();
        let levels: [String; 4] = parts
            .try_into()
            .map_err(|_| MechanismError::InvalidEcNumber(ec_id.to_string()))?;
        Ok(Self { levels })
    }

    /// Level at position 0..4.
    pub fn level(&self, index: usize) -> &str {
        &self.levels[index]
    }

    /// Whether `other` falls under this number's wildcards.
    pub fn contains(&self, other: &ECNumber) -> bool {
        self.levels
            .iter()
            .zip(&other.levels)
            .all(|(own, theirs)| own == theirs || own == "-")
    }

    /// Keep the first `level` levels, wildcard the rest.
    pub fn abstracted(&self, level: usize) -> ECNumber {
        let mut levels = self.levels.clone();
        for entry in levels.iter_mut().skip(level) {
            *entry = "-".to_string();
        }
        Self { levels }
    }

    fn cmp_level(a: &str, b: &str) -> Ordering {
        if a == b {
            return Ordering::Equal;
        }
        if a == "-" {
            return Ordering::Less;
        }
        if b == "-" {
            return Ordering::Greater;
        }
        match (a.parse::<u32>(), b.parse::<u32>()) {
            (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
            (Ok(_), Err(_)) => Ordering::Less,
            (Err(_), Ok(_)) => Ordering::Greater,
            (Err(_), Err(_)) => a.cmp(b),
        }
    }
}

impl PartialOrd for ECNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ECNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        self.levels
            .iter()
            .zip(&other.levels)
            .map(|(a, b)| Self::cmp_level(a, b))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl fmt::Display for ECNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.levels.join("."))
    }
}

impl From<ECNumber> for String {
    fn from(ec: ECNumber) -> Self {
        ec.to_string()
    }
}

impl TryFrom<String> for ECNumber {
    type Error = MechanismError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// One step of a mechanism proposal.
///
/// `rule` is absent when the source record could not be parsed upstream;
/// any mechanism containing such a step is unprocessable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Database entry the mechanism belongs to.
    pub entry: i32,
    /// Proposal number within the entry.
    pub proposal: i32,
    /// Step number within the proposal.
    pub step: i32,
    /// The transformation applied by this step, if it loaded.
    pub rule: Option<Rule>,
}

impl Step {
    /// Create a step.
    pub fn new(entry: i32, proposal: i32, step: i32, rule: Option<Rule>) -> Self {
        Self {
            entry,
            proposal,
            step,
            rule,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule_name = self
            .rule
            .as_ref()
            .map(|rule| rule.name())
            .unwrap_or("None");
        write!(
            f,
            "entry: {}, mechanism: {}, step: {}, rule: {}",
            self.entry, self.proposal, self.step, rule_name
        )
    }
}

/// An ordered mechanism proposal.
///
/// Identity (equality, hashing) is the (entry, proposal number) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "MechanismRecord", into = "MechanismRecord")]
pub struct Mechanism {
    entry: i32,
    number: i32,
    steps: Vec<Step>,
    ec: Option<ECNumber>,
}

impl Mechanism {
    /// Create a mechanism; steps are sorted by step number.
    pub fn new(entry: i32, number: i32, steps: impl IntoIterator<Item = Step>) -> Self {
        let mut steps: Vec<Step> = steps.into_iter().collect();
        steps.sort_by_key(|step| step.step);
        Self {
            entry,
            number,
            steps,
            ec: None,
        }
    }

    /// Database entry.
    pub fn entry(&self) -> i32 {
        self.entry
    }

    /// Proposal number within the entry.
    pub fn number(&self) -> i32 {
        self.number
    }

    /// EC classification, if known.
    pub fn ec(&self) -> Option<&ECNumber> {
        self.ec.as_ref()
    }

    /// Attach an EC classification.
    pub fn set_ec(&mut self, ec: ECNumber) {
        self.ec = Some(ec);
    }

    /// Steps in order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Step at the given position.
    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether there are no steps.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Whether the overlay search can run on this mechanism: at least one
    /// step, and every step carries a rule.
    pub fn is_processable(&self) -> bool {
        !self.steps.is_empty() && self.steps.iter().all(|step| step.rule.is_some())
    }
}

impl PartialEq for Mechanism {
    fn eq(&self, other: &Self) -> bool {
        self.entry == other.entry && self.number == other.number
    }
}

impl Eq for Mechanism {}

impl std::hash::Hash for Mechanism {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        (self.entry, self.number).hash(state);
    }
}

impl fmt::Display for Mechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Proposal(entry: {}, mechanism: {}, #steps: {})",
            self.entry,
            self.number,
            self.steps.len()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MechanismRecord {
    entry: i32,
    proposal: i32,
    steps: Vec<Step>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ec: Option<ECNumber>,
}

impl From<MechanismRecord> for Mechanism {
    fn from(record: MechanismRecord) -> Self {
        let mut mechanism = Mechanism::new(record.entry, record.proposal, record.steps);
        mechanism.ec = record.ec;
        mechanism
    }
}

impl From<Mechanism> for MechanismRecord {
    fn from(mechanism: Mechanism) -> Self {
        Self {
            entry: mechanism.entry,
            proposal: mechanism.number,
            steps: mechanism.steps,
            ec: mechanism.ec,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ec_parse_and_display() {
        let ec = ECNumber::parse("3.2.1.-").unwrap();
        assert_eq!(ec.to_string(), "3.2.1.-");
        assert!(ECNumber::parse("3.2.1").is_err());
    }

    #[test]
    fn test_ec_ordering() {
        let a = ECNumber::parse("1.2.3.4").unwrap();
        let b = ECNumber::parse("1.2.3.10").unwrap();
        let wildcard = ECNumber::parse("1.2.3.-").unwrap();
        let alpha = ECNumber::parse("1.2.3.n4").unwrap();

        // Numeric levels compare by value, not lexically.
        assert!(a < b);
        // Wildcards sort first, alphabetic levels after numerics.
        assert!(wildcard < a);
        assert!(b < alpha);
    }

    #[test]
    fn test_ec_contains() {
        let abstracted = ECNumber::parse("3.2.-.-").unwrap();
        let concrete = ECNumber::parse("3.2.1.4").unwrap();

        assert!(abstracted.contains(&concrete));
        assert!(!concrete.contains(&abstracted));
    }

    #[test]
    fn test_ec_abstracted() {
        let concrete = ECNumber::parse("3.2.1.4").unwrap();
        assert_eq!(concrete.abstracted(2).to_string(), "3.2.-.-");
    }

    #[test]
    fn test_mechanism_sorts_steps() {
        let mechanism = Mechanism::new(
            7,
            1,
            vec![
                Step::new(7, 1, 2, None),
                Step::new(7, 1, 1, None),
            ],
        );
        assert_eq!(mechanism.step(0).unwrap().step, 1);
        assert_eq!(mechanism.step(1).unwrap().step, 2);
    }

    #[test]
    fn test_mechanism_identity() {
        let a = Mechanism::new(7, 1, vec![Step::new(7, 1, 1, None)]);
        let b = Mechanism::new(7, 1, vec![]);
        let c = Mechanism::new(7, 2, vec![]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_processable_requires_rules() {
        let missing = Mechanism::new(7, 1, vec![Step::new(7, 1, 1, None)]);
        assert!(!missing.is_processable());
        assert!(!Mechanism::new(7, 1, vec![]).is_processable());
    }

    #[test]
    fn test_serde_round_trip() {
        let mut mechanism = Mechanism::new(7, 1, vec![Step::new(7, 1, 1, None)]);
        mechanism.set_ec(ECNumber::parse("1.1.1.1").unwrap());

        let json = serde_json::to_string(&mechanism).unwrap();
        let back: Mechanism = serde_json::from_str(&json).unwrap();

        assert_eq!(back, mechanism);
        assert_eq!(back.ec().unwrap().to_string(), "1.1.1.1");
        assert_eq!(back.len(), 1);
    }
}
