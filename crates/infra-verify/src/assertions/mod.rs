//! Assertion engine.
//!
//! Evaluates declarative expectations against the serialized form of a
//! snapshot (or any other JSON value, such as an output set or plan
//! result). Every expectation is evaluated, so a result set always carries
//! the complete diff even when an early expectation fails.

pub mod path;

pub use path::FieldPath;

use crate::errors::{Result, VerifyError};
use crate::inspector::ResourceSnapshot;
use path::Resolved;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Comparison applied to the value at a field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    Equals(Value),
    NonEmpty,
    GreaterThan(f64),
    LessThan(f64),
    LengthEquals(usize),
    /// Array element or substring.
    Contains(Value),
    /// Regular expression over a string value.
    Matches(String),
}

impl Predicate {
    /// Reject predicates that can never be evaluated.
    pub fn validate(&self) -> Result<()> {
        match self {
            Predicate::Matches(pattern) => Regex::new(pattern).map(|_| ()).map_err(|e| {
                VerifyError::Configuration(format!("invalid regex '{pattern}': {e}"))
            }),
            Predicate::GreaterThan(n) | Predicate::LessThan(n) if !n.is_finite() => Err(
                VerifyError::Configuration(format!("numeric bound must be finite, got {n}")),
            ),
            _ => Ok(()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Predicate::Equals(_) => "equals",
            Predicate::NonEmpty => "non_empty",
            Predicate::GreaterThan(_) => "greater_than",
            Predicate::LessThan(_) => "less_than",
            Predicate::LengthEquals(_) => "length_equals",
            Predicate::Contains(_) => "contains",
            Predicate::Matches(_) => "matches",
        }
    }

    /// Expected value as recorded in results, if the predicate has one.
    pub fn expected(&self) -> Option<Value> {
        match self {
            Predicate::Equals(v) | Predicate::Contains(v) => Some(v.clone()),
            Predicate::NonEmpty => None,
            Predicate::GreaterThan(n) | Predicate::LessThan(n) => number(*n),
            Predicate::LengthEquals(n) => Some(Value::from(*n)),
            Predicate::Matches(p) => Some(Value::String(p.clone())),
        }
    }

    /// Apply to an observed value. `Err` carries the failure detail.
    fn check(&self, observed: &Value) -> std::result::Result<(), String> {
        match self {
            Predicate::Equals(expected) => {
                if json_eq(observed, expected) {
                    Ok(())
                } else {
                    Err(format!("expected {expected}, observed {observed}"))
                }
            }
            Predicate::NonEmpty => {
                let empty = match observed {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    Value::Bool(_) | Value::Number(_) => false,
                };
                if empty {
                    Err(format!("value is empty ({observed})"))
                } else {
                    Ok(())
                }
            }
            Predicate::GreaterThan(bound) => match observed.as_f64() {
                Some(n) if n > *bound => Ok(()),
                Some(n) => Err(format!("{n} is not greater than {bound}")),
                None => Err(format!("{observed} is not a number")),
            },
            Predicate::LessThan(bound) => match observed.as_f64() {
                Some(n) if n < *bound => Ok(()),
                Some(n) => Err(format!("{n} is not less than {bound}")),
                None => Err(format!("{observed} is not a number")),
            },
            Predicate::LengthEquals(expected) => {
                let len = match observed {
                    Value::Array(a) => a.len(),
                    Value::Object(o) => o.len(),
                    Value::String(s) => s.chars().count(),
                    other => return Err(format!("{other} has no length")),
                };
                if len == *expected {
                    Ok(())
                } else {
                    Err(format!("length is {len}, expected {expected}"))
                }
            }
            Predicate::Contains(needle) => {
                let found = match (observed, needle) {
                    (Value::Array(items), _) => items.iter().any(|item| json_eq(item, needle)),
                    (Value::String(s), Value::String(sub)) => s.contains(sub.as_str()),
                    (other, _) => {
                        return Err(format!("cannot search {other} for {needle}"));
                    }
                };
                if found {
                    Ok(())
                } else {
                    Err(format!("{needle} not found"))
                }
            }
            Predicate::Matches(pattern) => {
                let re = Regex::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
                match observed.as_str() {
                    Some(s) if re.is_match(s) => Ok(()),
                    Some(s) => Err(format!("'{s}' does not match /{pattern}/")),
                    None => Err(format!("{observed} is not a string")),
                }
            }
        }
    }
}

impl fmt::Display for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.expected() {
            Some(expected) => write!(f, "{} {expected}", self.name()),
            None => f.write_str(self.name()),
        }
    }
}

/// Numbers compare by value regardless of integer/float representation.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn number(n: f64) -> Option<Value> {
    // Integral bounds display as integers ("greater_than 0", not "0.0").
    if n.fract() == 0.0 && n.abs() < 9.0e15 {
        return Some(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n).map(Value::Number)
}

/// One declarative check: a field path and a predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expectation {
    pub path: FieldPath,
    pub predicate: Predicate,
}

impl Expectation {
    pub fn new(path: &str, predicate: Predicate) -> Result<Self> {
        predicate.validate()?;
        Ok(Self {
            path: FieldPath::parse(path)?,
            predicate,
        })
    }

    pub fn validate(&self) -> Result<()> {
        self.predicate.validate()
    }
}

/// Outcome of one expectation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssertionResult {
    /// What was inspected, e.g. `security_group sg-0abc`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub path: String,
    pub predicate: String,
    pub passed: bool,
    /// `None` when the path ran past the end of an array.
    pub observed: Option<Value>,
    pub expected: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AssertionResult {
    /// A failed result for an expectation that could not be evaluated.
    pub fn failed(expectation: &Expectation, detail: impl Into<String>) -> Self {
        Self {
            subject: None,
            path: expectation.path.to_string(),
            predicate: expectation.predicate.to_string(),
            passed: false,
            observed: None,
            expected: expectation.predicate.expected(),
            detail: Some(detail.into()),
        }
    }

    #[must_use]
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    /// `subject: path` or just `path`.
    pub fn label(&self) -> String {
        match &self.subject {
            Some(subject) => format!("{subject}: {}", self.path),
            None => self.path.clone(),
        }
    }
}

/// Evaluate one expectation.
pub fn check(value: &Value, expectation: &Expectation) -> Result<AssertionResult> {
    check_within(value, &[], expectation)
}

/// Evaluate one expectation, treating `map_fields` as free-form maps.
pub fn check_within(
    value: &Value,
    map_fields: &[&str],
    expectation: &Expectation,
) -> Result<AssertionResult> {
    let (observed, outcome) = match expectation.path.resolve_within(value, map_fields)? {
        Resolved::Present(observed) => (
            Some(observed.clone()),
            expectation.predicate.check(observed),
        ),
        Resolved::OutOfBounds { prefix, index, len } => (
            None,
            Err(format!("{prefix}[{index}] is absent ({prefix} has {len} elements)")),
        ),
        Resolved::Absent { prefix, key } => (None, Err(format!("{prefix}.{key} is absent"))),
    };

    Ok(AssertionResult {
        subject: None,
        path: expectation.path.to_string(),
        predicate: expectation.predicate.to_string(),
        passed: outcome.is_ok(),
        observed,
        expected: expectation.predicate.expected(),
        detail: outcome.err(),
    })
}

/// Evaluate every expectation against `value`.
///
/// A path that cannot exist in `value` aborts with `SchemaMismatch`; every
/// other failure is recorded and evaluation continues.
pub fn evaluate(value: &Value, expectations: &[Expectation]) -> Result<Vec<AssertionResult>> {
    expectations.iter().map(|e| check(value, e)).collect()
}

/// Evaluate against a snapshot's serialized form.
pub fn evaluate_snapshot(
    snapshot: &ResourceSnapshot,
    expectations: &[Expectation],
) -> Result<Vec<AssertionResult>> {
    let json = snapshot.to_json()?;
    let map_fields = snapshot.map_fields();
    expectations
        .iter()
        .map(|e| check_within(&json, map_fields, e))
        .collect()
}

/// True iff every result passed.
pub fn all_passed(results: &[AssertionResult]) -> bool {
    results.iter().all(|r| r.passed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]

    use super::*;
    use crate::inspector::snapshot::{IpPermission, SecurityGroupSnapshot, VpcSnapshot};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn vpc(cidr: &str) -> ResourceSnapshot {
        ResourceSnapshot::Vpc(VpcSnapshot {
            vpc_id: "vpc-0abc".to_string(),
            cidr_block: cidr.to_string(),
            state: "available".to_string(),
            is_default: false,
            tags: BTreeMap::new(),
        })
    }

    fn tcp_rule(port: i64) -> IpPermission {
        IpPermission {
            ip_protocol: "tcp".to_string(),
            from_port: Some(port),
            to_port: Some(port),
            cidr_ranges: vec!["10.0.0.0/16".to_string()],
            source_group_ids: vec![],
        }
    }

    fn expect(path: &str, predicate: Predicate) -> Expectation {
        Expectation::new(path, predicate).unwrap()
    }

    #[test]
    fn test_vpc_cidr_passes() {
        let expectations = [expect("cidr_block", Predicate::Equals(json!("10.0.0.0/16")))];

        let results = evaluate_snapshot(&vpc("10.0.0.0/16"), &expectations).unwrap();

        assert_eq!(results.len(), 1);
        assert!(results[0].passed);
        assert_eq!(results[0].observed, Some(json!("10.0.0.0/16")));
    }

    #[test]
    fn test_vpc_cidr_fails_with_observed_and_expected() {
        let expectations = [expect("cidr_block", Predicate::Equals(json!("10.0.0.0/16")))];

        let results = evaluate_snapshot(&vpc("10.0.0.0/24"), &expectations).unwrap();

        assert!(!results[0].passed);
        assert_eq!(results[0].observed, Some(json!("10.0.0.0/24")));
        assert_eq!(results[0].expected, Some(json!("10.0.0.0/16")));
        assert!(!all_passed(&results));
    }

    #[test]
    fn test_security_group_length_and_port_both_evaluated() {
        let sg = ResourceSnapshot::SecurityGroup(SecurityGroupSnapshot {
            group_id: "sg-1".to_string(),
            group_name: "rds".to_string(),
            vpc_id: Some("vpc-0abc".to_string()),
            ip_permissions: vec![tcp_rule(5432), tcp_rule(6379)],
            ip_permissions_egress: vec![],
        });
        let expectations = [
            expect("ip_permissions", Predicate::LengthEquals(1)),
            expect("ip_permissions[0].from_port", Predicate::Equals(json!(5432))),
        ];

        let results = evaluate_snapshot(&sg, &expectations).unwrap();

        assert_eq!(results.len(), 2);
        assert!(!results[0].passed);
        assert_eq!(results[0].detail.as_deref(), Some("length is 2, expected 1"));
        assert!(results[1].passed);
    }

    #[test]
    fn test_no_short_circuit() {
        let expectations = [
            expect("cidr_block", Predicate::Equals(json!("192.168.0.0/16"))),
            expect("state", Predicate::Equals(json!("available"))),
            expect("vpc_id", Predicate::NonEmpty),
        ];

        let results = evaluate_snapshot(&vpc("10.0.0.0/16"), &expectations).unwrap();

        assert_eq!(results.len(), 3);
        assert!(!results[0].passed);
        assert!(results[1].passed && results[2].passed);
    }

    #[test]
    fn test_unknown_path_is_schema_mismatch() {
        let expectations = [
            expect("cidr_block", Predicate::NonEmpty),
            expect("cidr", Predicate::NonEmpty),
        ];

        let err = evaluate_snapshot(&vpc("10.0.0.0/16"), &expectations).unwrap_err();
        assert!(matches!(err, VerifyError::SchemaMismatch(_)));
    }

    #[test]
    fn test_missing_tag_is_a_failed_assertion() {
        let expectations = [
            expect("cidr_block", Predicate::Equals(json!("10.0.0.0/16"))),
            expect("tags.Name", Predicate::Equals(json!("main"))),
        ];

        let results = evaluate_snapshot(&vpc("10.0.0.0/16"), &expectations).unwrap();

        assert_eq!(results.len(), 2);
        assert!(results[0].passed);
        assert!(!results[1].passed);
        assert_eq!(results[1].observed, None);
        assert_eq!(results[1].detail.as_deref(), Some("tags.Name is absent"));
    }

    #[test]
    fn test_index_past_end_is_a_failed_assertion() {
        let value = json!({"ip_permissions": []});
        let results = evaluate(
            &value,
            &[expect("ip_permissions[0].from_port", Predicate::Equals(json!(5432)))],
        )
        .unwrap();

        assert!(!results[0].passed);
        assert_eq!(results[0].observed, None);
        assert!(results[0].detail.as_ref().unwrap().contains("absent"));
    }

    #[test]
    fn test_numeric_predicates() {
        let value = json!({"backup_retention_period": 7, "retention": 30.0, "name": "x"});

        let results = evaluate(
            &value,
            &[
                expect("backup_retention_period", Predicate::GreaterThan(0.0)),
                expect("backup_retention_period", Predicate::LessThan(7.0)),
                expect("retention", Predicate::Equals(json!(30))),
                expect("name", Predicate::GreaterThan(1.0)),
            ],
        )
        .unwrap();

        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, [true, false, true, false]);
        assert_eq!(results[0].predicate, "greater_than 0");
    }

    #[test]
    fn test_non_empty() {
        let value = json!({"s": "", "a": [], "o": {}, "n": null, "z": 0, "t": "x"});
        let results = evaluate(
            &value,
            &["s", "a", "o", "n", "z", "t"].map(|p| expect(p, Predicate::NonEmpty)),
        )
        .unwrap();

        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, [false, false, false, false, true, true]);
    }

    #[test]
    fn test_contains_and_matches() {
        let value = json!({
            "attached_vpc_ids": ["vpc-0abc"],
            "endpoint": "app-db.abc123.us-east-1.rds.amazonaws.com",
            "port": 5432
        });

        let results = evaluate(
            &value,
            &[
                expect("attached_vpc_ids", Predicate::Contains(json!("vpc-0abc"))),
                expect("attached_vpc_ids", Predicate::Contains(json!("vpc-other"))),
                expect("endpoint", Predicate::Contains(json!("rds.amazonaws.com"))),
                expect("endpoint", Predicate::Matches(r"^app-db\.".to_string())),
                expect("port", Predicate::Matches(r"\d+".to_string())),
            ],
        )
        .unwrap();

        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, [true, false, true, true, false]);
    }

    #[test]
    fn test_invalid_regex_rejected_up_front() {
        let err = Expectation::new("name", Predicate::Matches("(".to_string())).unwrap_err();
        assert!(matches!(err, VerifyError::Configuration(_)));
    }

    #[test]
    fn test_predicate_wire_format() {
        let e: Expectation = serde_json::from_value(json!({
            "path": "ip_permissions[0].from_port",
            "predicate": {"op": "equals", "value": 5432}
        }))
        .unwrap();
        assert_eq!(e.predicate, Predicate::Equals(json!(5432)));

        let p: Predicate = serde_json::from_value(json!({"op": "non_empty"})).unwrap();
        assert_eq!(p, Predicate::NonEmpty);

        let p: Predicate =
            serde_json::from_value(json!({"op": "length_equals", "value": 2})).unwrap();
        assert_eq!(p, Predicate::LengthEquals(2));
    }

    #[test]
    fn test_failed_result_carries_subject() {
        let e = expect("status", Predicate::Equals(json!("available")));
        let result = AssertionResult::failed(&e, "database_instance 'app-db' not found")
            .with_subject("database_instance app-db");

        assert!(!result.passed);
        assert_eq!(result.label(), "database_instance app-db: status");
        assert_eq!(result.expected, Some(json!("available")));
    }
}
