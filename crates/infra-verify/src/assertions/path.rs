//! Field paths into a snapshot's serialized form.
//!
//! Grammar: dotted keys with optional bracketed indices, e.g.
//! `ip_permissions[0].from_port` or `routes[1].gateway_id`.

use crate::errors::{Result, VerifyError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed field path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FieldPath {
    raw: String,
    segments: Vec<Segment>,
}

/// Outcome of walking a path through a value.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolved<'a> {
    Present(&'a Value),
    /// An index ran past the end of an array that exists.
    OutOfBounds { prefix: String, index: usize, len: usize },
    /// A key missing from a free-form map field such as `tags`.
    Absent { prefix: String, key: String },
}

impl FieldPath {
    pub fn parse(raw: &str) -> Result<Self> {
        let invalid =
            |why: &str| VerifyError::Configuration(format!("invalid field path '{raw}': {why}"));

        if raw.trim().is_empty() {
            return Err(invalid("empty path"));
        }

        let mut segments = Vec::new();
        for part in raw.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (
                    part.get(..pos).unwrap_or_default(),
                    part.get(pos..).unwrap_or_default(),
                ),
                None => (part, ""),
            };

            if key.is_empty() && (segments.is_empty() || rest.is_empty()) {
                return Err(invalid("empty key"));
            }
            if !key.is_empty() {
                if !key
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
                {
                    return Err(invalid("keys may only contain letters, digits, '_' and '-'"));
                }
                segments.push(Segment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| invalid("unclosed '['"))?;
                let index = rest
                    .get(1..close)
                    .and_then(|digits| digits.parse::<usize>().ok())
                    .ok_or_else(|| invalid("index must be a non-negative integer"))?;
                segments.push(Segment::Index(index));
                rest = rest.get(close + 1..).unwrap_or_default();
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(invalid("unexpected text after ']'"));
                }
            }
        }

        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Walk the path through `root`.
    ///
    /// Unknown keys, indices on non-arrays and keys on non-objects are
    /// `SchemaMismatch`: the path cannot exist for this shape of value.
    pub fn resolve<'a>(&self, root: &'a Value) -> Result<Resolved<'a>> {
        self.resolve_within(root, &[])
    }

    /// Like [`FieldPath::resolve`], but keys missing under one of
    /// `map_fields` (dotted prefixes such as `tags`) resolve to
    /// [`Resolved::Absent`].
    pub fn resolve_within<'a>(
        &self,
        root: &'a Value,
        map_fields: &[&str],
    ) -> Result<Resolved<'a>> {
        let mut current = root;
        let mut walked = String::new();

        for segment in &self.segments {
            match segment {
                Segment::Key(key) => {
                    let object = current.as_object().ok_or_else(|| {
                        self.mismatch(format!("'{walked}' is {}, not an object", type_name(current)))
                    })?;
                    current = match object.get(key) {
                        Some(value) => value,
                        None if map_fields.contains(&walked.as_str()) => {
                            return Ok(Resolved::Absent {
                                prefix: walked,
                                key: key.clone(),
                            })
                        }
                        None => return Err(self.mismatch(format!("no field '{key}'"))),
                    };
                    if !walked.is_empty() {
                        walked.push('.');
                    }
                    walked.push_str(key);
                }
                Segment::Index(index) => {
                    let array = current.as_array().ok_or_else(|| {
                        self.mismatch(format!("'{walked}' is {}, not an array", type_name(current)))
                    })?;
                    match array.get(*index) {
                        Some(item) => current = item,
                        None => {
                            return Ok(Resolved::OutOfBounds {
                                prefix: walked,
                                index: *index,
                                len: array.len(),
                            })
                        }
                    }
                    walked.push_str(&format!("[{index}]"));
                }
            }
        }

        Ok(Resolved::Present(current))
    }

    fn mismatch(&self, why: String) -> VerifyError {
        VerifyError::SchemaMismatch(format!("path '{}': {why}", self.raw))
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl FromStr for FieldPath {
    type Err = VerifyError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FieldPath {
    type Error = VerifyError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self {
        path.raw
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_keys_and_indices() {
        let path = FieldPath::parse("ip_permissions[0].from_port").unwrap();
        assert_eq!(
            path.segments(),
            [
                Segment::Key("ip_permissions".to_string()),
                Segment::Index(0),
                Segment::Key("from_port".to_string()),
            ]
        );

        let nested = FieldPath::parse("matrix[1][2]").unwrap();
        assert_eq!(nested.segments().len(), 3);
    }

    #[test]
    fn test_parse_rejects_malformed_paths() {
        for raw in ["", "a..b", "a[", "a[x]", "a[-1]", "a[0]b", "a b", ".a"] {
            let err = FieldPath::parse(raw).unwrap_err();
            assert!(
                matches!(err, VerifyError::Configuration(_)),
                "expected configuration error for {raw:?}"
            );
        }
    }

    #[test]
    fn test_resolve_present_and_null() {
        let value = json!({"ip_permissions": [{"from_port": 5432, "to_port": null}]});

        let port = FieldPath::parse("ip_permissions[0].from_port").unwrap();
        assert_eq!(port.resolve(&value).unwrap(), Resolved::Present(&json!(5432)));

        let to = FieldPath::parse("ip_permissions[0].to_port").unwrap();
        assert_eq!(to.resolve(&value).unwrap(), Resolved::Present(&Value::Null));
    }

    #[test]
    fn test_index_past_end_is_out_of_bounds() {
        let value = json!({"routes": [{"gateway_id": "local"}]});
        let path = FieldPath::parse("routes[3].gateway_id").unwrap();

        assert_eq!(
            path.resolve(&value).unwrap(),
            Resolved::OutOfBounds {
                prefix: "routes".to_string(),
                index: 3,
                len: 1
            }
        );
    }

    #[test]
    fn test_unknown_key_is_schema_mismatch() {
        let value = json!({"cidr_block": "10.0.0.0/16"});

        let err = FieldPath::parse("cidr").unwrap().resolve(&value).unwrap_err();
        assert!(matches!(err, VerifyError::SchemaMismatch(ref m) if m.contains("no field 'cidr'")));

        let err = FieldPath::parse("cidr_block[0]")
            .unwrap()
            .resolve(&value)
            .unwrap_err();
        assert!(matches!(err, VerifyError::SchemaMismatch(_)));

        let err = FieldPath::parse("cidr_block.prefix")
            .unwrap()
            .resolve(&value)
            .unwrap_err();
        assert!(matches!(err, VerifyError::SchemaMismatch(_)));
    }

    #[test]
    fn test_missing_map_key_is_absent() {
        let value = json!({"cidr_block": "10.0.0.0/16", "tags": {}});
        let path = FieldPath::parse("tags.Name").unwrap();

        assert_eq!(
            path.resolve_within(&value, &["tags"]).unwrap(),
            Resolved::Absent {
                prefix: "tags".to_string(),
                key: "Name".to_string()
            }
        );
        // Without the map declaration the key is outside the schema.
        assert!(matches!(
            path.resolve(&value).unwrap_err(),
            VerifyError::SchemaMismatch(_)
        ));
        // Map fields do not loosen the top-level schema.
        assert!(FieldPath::parse("name")
            .unwrap()
            .resolve_within(&value, &["tags"])
            .is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let path: FieldPath = serde_json::from_str("\"routes[1].state\"").unwrap();
        assert_eq!(path.to_string(), "routes[1].state");
        assert_eq!(serde_json::to_string(&path).unwrap(), "\"routes[1].state\"");
        assert!(serde_json::from_str::<FieldPath>("\"routes[\"").is_err());
    }
}
