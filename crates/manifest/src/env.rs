//! Profile environment declarations.
//!
//! Three input shapes are accepted at the parser boundary and normalised to
//! one `Vec<EnvVarSpec>` immediately:
//!
//! - a list of names: `["API_KEY", "DEBUG"]`
//! - a list of objects: `[{"name":"KEY","varName":"SRC","required":true}]`
//! - a mapping: `{"KEY": "literal", "OTHER": {"varName":"SRC"}}`
//!
//! String values in object/map positions are literal defaults.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Normalised env declaration: where the value comes from and whether the
/// agent can start without it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVarSpec {
    /// Name exported into the container.
    pub name: String,
    /// Source key looked up in the variable store; defaults to `name`.
    pub source: String,
    pub required: bool,
    /// Literal fallback when the source resolves to nothing.
    pub default: Option<String>,
}

impl EnvVarSpec {
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            source: name.clone(),
            name,
            required: false,
            default: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvObject {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    var_name: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default, alias = "value")]
    default: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvListEntry {
    Name(String),
    Object(EnvObject),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvMapValue {
    Literal(String),
    Object(EnvObject),
}

/// The three accepted input shapes. Kept only at the parser boundary;
/// call [`EnvShape::normalize`] before doing anything with it.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EnvShape {
    List(Vec<EnvListEntry>),
    Map(BTreeMap<String, EnvMapValue>),
}

impl Default for EnvShape {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl EnvShape {
    /// Normalise to the single internal representation. List shapes keep
    /// declaration order; the map shape iterates in name order.
    pub fn normalize(&self) -> Result<Vec<EnvVarSpec>> {
        match self {
            Self::List(entries) => entries
                .iter()
                .map(|entry| match entry {
                    EnvListEntry::Name(name) => Ok(EnvVarSpec::named(name.clone())),
                    EnvListEntry::Object(obj) => {
                        let name = obj.name.clone().ok_or_else(|| Error::Message {
                            message: "env object entry is missing 'name'".to_string(),
                        })?;
                        Ok(spec_from_object(name, obj))
                    },
                })
                .collect(),
            Self::Map(map) => Ok(map
                .iter()
                .map(|(name, value)| match value {
                    EnvMapValue::Literal(literal) => EnvVarSpec {
                        name: name.clone(),
                        source: name.clone(),
                        required: false,
                        default: Some(literal.clone()),
                    },
                    EnvMapValue::Object(obj) => spec_from_object(name.clone(), obj),
                })
                .collect()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::List(entries) => entries.is_empty(),
            Self::Map(map) => map.is_empty(),
        }
    }
}

fn spec_from_object(name: String, obj: &EnvObject) -> EnvVarSpec {
    EnvVarSpec {
        source: obj.var_name.clone().unwrap_or_else(|| name.clone()),
        name,
        required: obj.required,
        default: obj.default.clone(),
    }
}

/// A resolved env entry, ready for injection into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEnvVar {
    pub name: String,
    pub value: String,
}

/// Resolve env specs against a variable source (the secret store supplies
/// `lookup`). A spec whose source resolves to nothing falls back to its
/// literal default; a required spec with neither fails.
pub fn resolve_env<F>(specs: &[EnvVarSpec], lookup: F) -> Result<Vec<ResolvedEnvVar>>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolved = Vec::with_capacity(specs.len());
    for spec in specs {
        let value = lookup(&spec.source)
            .filter(|v| !v.is_empty())
            .or_else(|| spec.default.clone());
        match value {
            Some(value) => resolved.push(ResolvedEnvVar {
                name: spec.name.clone(),
                value,
            }),
            None if spec.required => {
                return Err(Error::MissingVar {
                    name: spec.source.clone(),
                });
            },
            None => {},
        }
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> EnvShape {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_list_of_names() {
        let specs = parse(r#"["API_KEY","DEBUG"]"#).normalize().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0], EnvVarSpec::named("API_KEY"));
        assert_eq!(specs[1].source, "DEBUG");
    }

    #[test]
    fn test_list_of_objects() {
        let specs = parse(r#"[{"name":"KEY","varName":"SRC","required":true,"value":"dflt"}]"#)
            .normalize()
            .unwrap();
        assert_eq!(specs[0].name, "KEY");
        assert_eq!(specs[0].source, "SRC");
        assert!(specs[0].required);
        assert_eq!(specs[0].default.as_deref(), Some("dflt"));
    }

    #[test]
    fn test_map_shape_with_literals_and_objects() {
        let specs = parse(r#"{"B":{"varName":"OTHER"},"A":"literal"}"#)
            .normalize()
            .unwrap();
        // Map shape iterates in name order.
        assert_eq!(specs[0].name, "A");
        assert_eq!(specs[0].default.as_deref(), Some("literal"));
        assert_eq!(specs[1].name, "B");
        assert_eq!(specs[1].source, "OTHER");
    }

    #[test]
    fn test_object_entry_without_name_rejected() {
        let err = parse(r#"[{"varName":"SRC"}]"#).normalize().unwrap_err();
        assert!(err.to_string().contains("missing 'name'"));
    }

    #[test]
    fn test_resolve_prefers_lookup_over_default() {
        let specs = vec![EnvVarSpec {
            name: "KEY".into(),
            source: "SRC".into(),
            required: false,
            default: Some("fallback".into()),
        }];
        let resolved = resolve_env(&specs, |name| {
            (name == "SRC").then(|| "live".to_string())
        })
        .unwrap();
        assert_eq!(resolved[0].value, "live");

        let resolved = resolve_env(&specs, |_| None).unwrap();
        assert_eq!(resolved[0].value, "fallback");
    }

    #[test]
    fn test_resolve_required_missing_fails() {
        let specs = vec![EnvVarSpec {
            name: "KEY".into(),
            source: "SRC".into(),
            required: true,
            default: None,
        }];
        let err = resolve_env(&specs, |_| None).unwrap_err();
        assert_eq!(err.code(), "secret_missing");
    }

    #[test]
    fn test_resolve_skips_optional_missing() {
        let specs = vec![EnvVarSpec::named("GONE")];
        let resolved = resolve_env(&specs, |_| None).unwrap();
        assert!(resolved.is_empty());
    }

    #[test]
    fn test_empty_lookup_value_falls_through() {
        let specs = vec![EnvVarSpec {
            name: "K".into(),
            source: "K".into(),
            required: false,
            default: Some("d".into()),
        }];
        let resolved = resolve_env(&specs, |_| Some(String::new())).unwrap();
        assert_eq!(resolved[0].value, "d");
    }
}
