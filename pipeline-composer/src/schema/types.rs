// Schema Types
// Field types, subsets and dataset schemas exchanged between stages

use crate::error::SchemaError;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Closed set of logical field types
///
/// Serialized as the lower-case type name (`string`), `{list: <type>}` or
/// `{struct: {<member>: <type>, ...}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FieldTypeRepr", into = "FieldTypeRepr")]
pub enum FieldType {
    Boolean,
    Integer,
    Float,
    String,
    Binary,
    /// Homogeneous list of the inner type
    List(Box<FieldType>),
    /// Nested record with ordered, uniquely named members
    Struct(IndexMap<String, FieldType>),
}

impl FieldType {
    pub fn list_of(inner: FieldType) -> Self {
        FieldType::List(Box::new(inner))
    }

    pub fn struct_of<I, S>(members: I) -> Self
    where
        I: IntoIterator<Item = (S, FieldType)>,
        S: Into<String>,
    {
        FieldType::Struct(members.into_iter().map(|(n, t)| (n.into(), t)).collect())
    }

    fn primitive_name(&self) -> Option<&'static str> {
        match self {
            FieldType::Boolean => Some("boolean"),
            FieldType::Integer => Some("integer"),
            FieldType::Float => Some("float"),
            FieldType::String => Some("string"),
            FieldType::Binary => Some("binary"),
            FieldType::List(_) | FieldType::Struct(_) => None,
        }
    }

    fn from_primitive_name(name: &str) -> Option<Self> {
        match name {
            "boolean" => Some(FieldType::Boolean),
            "integer" => Some(FieldType::Integer),
            "float" => Some(FieldType::Float),
            "string" => Some(FieldType::String),
            "binary" => Some(FieldType::Binary),
            _ => None,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::List(inner) => write!(f, "list<{}>", inner),
            FieldType::Struct(members) => {
                write!(f, "struct<")?;
                for (i, (name, ty)) in members.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", name, ty)?;
                }
                write!(f, ">")
            }
            primitive => write!(f, "{}", primitive.primitive_name().unwrap_or("unknown")),
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FieldTypeRepr {
    Name(String),
    List {
        list: Box<FieldType>,
    },
    Struct {
        #[serde(rename = "struct")]
        members: IndexMap<String, FieldType>,
    },
}

impl TryFrom<FieldTypeRepr> for FieldType {
    type Error = String;

    fn try_from(repr: FieldTypeRepr) -> Result<Self, Self::Error> {
        match repr {
            FieldTypeRepr::Name(name) => FieldType::from_primitive_name(&name).ok_or_else(|| {
                format!(
                    "unknown field type '{}', expected one of: boolean, integer, float, string, binary, list, struct",
                    name
                )
            }),
            FieldTypeRepr::List { list } => Ok(FieldType::List(list)),
            FieldTypeRepr::Struct { members } => Ok(FieldType::Struct(members)),
        }
    }
}

impl From<FieldType> for FieldTypeRepr {
    fn from(ty: FieldType) -> Self {
        match ty {
            FieldType::List(list) => FieldTypeRepr::List { list },
            FieldType::Struct(members) => FieldTypeRepr::Struct { members },
            primitive => FieldTypeRepr::Name(
                primitive.primitive_name().unwrap_or_default().to_string(),
            ),
        }
    }
}

/// A named, typed leaf of a dataset schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
}

impl Field {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// A named group of fields (e.g. "images", "captions")
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Subset {
    fields: IndexMap<String, FieldType>,
}

impl Subset {
    /// Build a subset, rejecting a field name repeated with a different type
    pub fn from_fields<I>(subset: &str, fields: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = Field>,
    {
        let mut built = Subset::default();
        for field in fields {
            match built.fields.get(&field.name) {
                Some(existing) if *existing != field.field_type => {
                    return Err(SchemaError::FieldRedefined {
                        subset: subset.to_string(),
                        field: field.name,
                        existing: existing.clone(),
                        requested: field.field_type,
                    })
                }
                Some(_) => {}
                None => {
                    built.fields.insert(field.name, field.field_type);
                }
            }
        }
        Ok(built)
    }

    pub fn get(&self, field: &str) -> Option<&FieldType> {
        self.fields.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldType)> {
        self.fields.iter().map(|(name, ty)| (name.as_str(), ty))
    }
}

/// Mapping from subset name to an ordered set of fields
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Schema {
    subsets: IndexMap<String, Subset>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a field to a subset, creating the subset on first use
    ///
    /// Re-adding a field with the same type is a no-op; a different type is
    /// rejected.
    pub fn add_field(&mut self, subset: &str, field: Field) -> Result<(), SchemaError> {
        let entry = self.subsets.entry(subset.to_string()).or_default();
        match entry.fields.get(&field.name) {
            Some(existing) if *existing != field.field_type => Err(SchemaError::FieldRedefined {
                subset: subset.to_string(),
                field: field.name,
                existing: existing.clone(),
                requested: field.field_type,
            }),
            Some(_) => Ok(()),
            None => {
                entry.fields.insert(field.name, field.field_type);
                Ok(())
            }
        }
    }

    /// Declare a subset, possibly without fields
    pub fn add_subset(&mut self, subset: &str) {
        self.subsets.entry(subset.to_string()).or_default();
    }

    /// Builder-style variant of [`Schema::add_field`] for a whole subset
    pub fn with_subset<I>(mut self, subset: &str, fields: I) -> Result<Self, SchemaError>
    where
        I: IntoIterator<Item = Field>,
    {
        self.add_subset(subset);
        for field in fields {
            self.add_field(subset, field)?;
        }
        Ok(self)
    }

    pub fn subset(&self, name: &str) -> Option<&Subset> {
        self.subsets.get(name)
    }

    pub fn contains_subset(&self, name: &str) -> bool {
        self.subsets.contains_key(name)
    }

    pub fn subsets(&self) -> impl Iterator<Item = (&str, &Subset)> {
        self.subsets.iter().map(|(name, s)| (name.as_str(), s))
    }

    pub fn subset_names(&self) -> Vec<String> {
        self.subsets.keys().cloned().collect()
    }

    /// Number of subsets
    pub fn len(&self) -> usize {
        self.subsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subsets.is_empty()
    }

    pub fn field_count(&self) -> usize {
        self.subsets.values().map(Subset::len).sum()
    }

    /// All `(subset, field, type)` triples in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &str, &FieldType)> {
        self.subsets.iter().flat_map(|(subset, s)| {
            s.fields
                .iter()
                .map(move |(field, ty)| (subset.as_str(), field.as_str(), ty))
        })
    }

    /// Copy a whole subset from another schema unless it is already present
    pub(crate) fn insert_subset_if_absent(&mut self, name: &str, subset: &Subset) -> bool {
        if self.subsets.contains_key(name) {
            return false;
        }
        self.subsets.insert(name.to_string(), subset.clone());
        true
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.subsets.is_empty() {
            return write!(f, "{{}}");
        }
        for (i, (name, subset)) in self.subsets.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}(", name)?;
            for (j, (field, ty)) in subset.fields.iter().enumerate() {
                if j > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}: {}", field, ty)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redefining_field_with_other_type_fails() {
        let mut schema = Schema::new();
        schema
            .add_field("images", Field::new("data", FieldType::Binary))
            .unwrap();

        let err = schema
            .add_field("images", Field::new("data", FieldType::String))
            .unwrap_err();
        assert!(matches!(err, SchemaError::FieldRedefined { .. }));

        // Same type again is accepted and does not duplicate the field
        schema
            .add_field("images", Field::new("data", FieldType::Binary))
            .unwrap();
        assert_eq!(schema.field_count(), 1);
    }

    #[test]
    fn test_same_field_name_in_different_subsets() {
        let schema = Schema::new()
            .with_subset("images", [Field::new("id", FieldType::String)])
            .unwrap()
            .with_subset("captions", [Field::new("id", FieldType::Integer)])
            .unwrap();

        assert_eq!(schema.len(), 2);
        assert_eq!(
            schema.subset("captions").and_then(|s| s.get("id")),
            Some(&FieldType::Integer)
        );
    }

    #[test]
    fn test_field_type_display() {
        let ty = FieldType::struct_of([
            ("width", FieldType::Integer),
            ("tags", FieldType::list_of(FieldType::String)),
        ]);
        assert_eq!(ty.to_string(), "struct<width: integer, tags: list<string>>");
    }

    #[test]
    fn test_parse_schema_yaml() {
        let yaml = r#"
images:
  data: binary
  width: integer
  tags:
    list: string
  meta:
    struct:
      source: string
      score: float
"#;
        let schema: Schema = serde_yaml::from_str(yaml).unwrap();
        let images = schema.subset("images").unwrap();
        let names: Vec<_> = images.fields().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["data", "width", "tags", "meta"]);
        assert_eq!(
            images.get("tags"),
            Some(&FieldType::list_of(FieldType::String))
        );
        assert!(matches!(images.get("meta"), Some(FieldType::Struct(_))));
    }

    #[test]
    fn test_unknown_field_type_rejected() {
        let yaml = "images:\n  data: blob\n";
        let result: Result<Schema, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_schema_json_round_trip_keeps_order() {
        let schema = Schema::new()
            .with_subset(
                "captions",
                [
                    Field::new("text", FieldType::String),
                    Field::new("score", FieldType::Float),
                ],
            )
            .unwrap();

        let json = serde_json::to_string(&schema).unwrap();
        assert_eq!(json, r#"{"captions":{"text":"string","score":"float"}}"#);
        let parsed: Schema = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, schema);
    }
}
