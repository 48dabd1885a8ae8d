// Schema Registry
// Structural subset checks and upstream schema unions

use crate::schema::types::{FieldType, Schema};

use indexmap::IndexMap;
use std::fmt;

/// One reason a required schema is not satisfied by an available one
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaMismatch {
    /// A required subset without declared fields is absent
    MissingSubset { subset: String },
    /// A required field is absent (its subset may be absent as well)
    MissingField {
        subset: String,
        field: String,
        expected: FieldType,
    },
    /// The field exists with a different type
    TypeMismatch {
        subset: String,
        field: String,
        expected: FieldType,
        actual: FieldType,
    },
}

impl SchemaMismatch {
    pub fn subset(&self) -> &str {
        match self {
            SchemaMismatch::MissingSubset { subset }
            | SchemaMismatch::MissingField { subset, .. }
            | SchemaMismatch::TypeMismatch { subset, .. } => subset,
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            SchemaMismatch::MissingSubset { .. } => None,
            SchemaMismatch::MissingField { field, .. }
            | SchemaMismatch::TypeMismatch { field, .. } => Some(field),
        }
    }

    pub fn expected(&self) -> Option<&FieldType> {
        match self {
            SchemaMismatch::MissingSubset { .. } => None,
            SchemaMismatch::MissingField { expected, .. }
            | SchemaMismatch::TypeMismatch { expected, .. } => Some(expected),
        }
    }

    /// The available type, or `None` when the field is missing
    pub fn actual(&self) -> Option<&FieldType> {
        match self {
            SchemaMismatch::TypeMismatch { actual, .. } => Some(actual),
            _ => None,
        }
    }
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaMismatch::MissingSubset { subset } => write!(f, "missing subset '{}'", subset),
            SchemaMismatch::MissingField {
                subset,
                field,
                expected,
            } => write!(f, "missing field {}.{} ({})", subset, field, expected),
            SchemaMismatch::TypeMismatch {
                subset,
                field,
                expected,
                actual,
            } => write!(
                f,
                "field {}.{} expected {}, found {}",
                subset, field, expected, actual
            ),
        }
    }
}

/// True iff every field of `required` exists in `available` with an identical type
pub fn is_subset(required: &Schema, available: &Schema) -> bool {
    check_subset(required, available).is_empty()
}

/// Structured list of everything `available` lacks to satisfy `required`
///
/// Types must match exactly; there is no coercion between types.
pub fn check_subset(required: &Schema, available: &Schema) -> Vec<SchemaMismatch> {
    let mut mismatches = Vec::new();

    for (subset_name, required_subset) in required.subsets() {
        let available_subset = available.subset(subset_name);

        if available_subset.is_none() && required_subset.is_empty() {
            mismatches.push(SchemaMismatch::MissingSubset {
                subset: subset_name.to_string(),
            });
            continue;
        }

        for (field, expected) in required_subset.fields() {
            match available_subset.and_then(|s| s.get(field)) {
                None => mismatches.push(SchemaMismatch::MissingField {
                    subset: subset_name.to_string(),
                    field: field.to_string(),
                    expected: expected.clone(),
                }),
                Some(actual) if actual != expected => {
                    mismatches.push(SchemaMismatch::TypeMismatch {
                        subset: subset_name.to_string(),
                        field: field.to_string(),
                        expected: expected.clone(),
                        actual: actual.clone(),
                    })
                }
                Some(_) => {}
            }
        }
    }

    mismatches
}

/// Union of several upstream schemas with first-provider-wins binding
#[derive(Debug, Clone, Default)]
pub struct SchemaUnion {
    /// Combined schema; each subset comes from its first provider
    pub schema: Schema,
    /// Every provider of each subset, in edge-declaration order
    providers: IndexMap<String, Vec<String>>,
}

impl SchemaUnion {
    /// The upstream whose subset is bound (the first provider)
    pub fn provider(&self, subset: &str) -> Option<&str> {
        self.providers
            .get(subset)
            .and_then(|p| p.first())
            .map(String::as_str)
    }

    pub fn providers(&self, subset: &str) -> &[String] {
        self.providers.get(subset).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn is_ambiguous(&self, subset: &str) -> bool {
        self.providers(subset).len() > 1
    }

    /// Subsets produced by more than one upstream
    pub fn ambiguous(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.providers
            .iter()
            .filter(|(_, p)| p.len() > 1)
            .map(|(s, p)| (s.as_str(), p.as_slice()))
    }
}

/// Combine upstream `produces` schemas in the given (edge-declaration) order
pub fn union_of<'a, I>(upstreams: I) -> SchemaUnion
where
    I: IntoIterator<Item = (&'a str, &'a Schema)>,
{
    let mut union = SchemaUnion::default();

    for (stage, produces) in upstreams {
        for (subset_name, subset) in produces.subsets() {
            union.schema.insert_subset_if_absent(subset_name, subset);
            union
                .providers
                .entry(subset_name.to_string())
                .or_default()
                .push(stage.to_string());
        }
    }

    union
}
