//! Field mapping between record types

use crate::format::Row;
use crate::schema::Schema;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

type ValueFn = Arc<dyn Fn(Value) -> Result<Value, String> + Send + Sync>;

#[derive(Clone)]
struct Mapping {
    source: String,
    target: String,
    transform: Option<ValueFn>,
}

/// Declares how source fields populate the target record.
///
/// Targets may be given as field or header names. Target columns left
/// unmapped take their default value, or null.
#[derive(Clone, Default)]
pub struct FieldMapping {
    mappings: Vec<Mapping>,
    copy_matching: bool,
}

impl fmt::Debug for FieldMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pairs: Vec<String> = self
            .mappings
            .iter()
            .map(|m| format!("{} -> {}", m.source, m.target))
            .collect();
        f.debug_struct("FieldMapping")
            .field("mappings", &pairs)
            .field("copy_matching", &self.copy_matching)
            .finish()
    }
}

impl FieldMapping {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn map(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.mappings.push(Mapping {
            source: source.into(),
            target: target.into(),
            transform: None,
        });
        self
    }

    /// Map a field through a value conversion
    pub fn map_with<F>(mut self, source: impl Into<String>, target: impl Into<String>, transform: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.mappings.push(Mapping {
            source: source.into(),
            target: target.into(),
            transform: Some(Arc::new(transform)),
        });
        self
    }

    /// Also copy source fields whose names match target fields
    pub fn copy_matching(mut self, enabled: bool) -> Self {
        self.copy_matching = enabled;
        self
    }

    pub fn len(&self) -> usize {
        self.mappings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappings.is_empty()
    }

    /// Build a target row from a source row
    pub fn apply(&self, source: &Row, schema: &Schema) -> Result<Row, String> {
        let mut row = Row::new();

        if self.copy_matching {
            for column in schema.columns() {
                if let Some(value) = source.get(&column.field_name) {
                    row.insert(column.field_name.clone(), value.clone());
                }
            }
        }

        for mapping in &self.mappings {
            let value = source.get(&mapping.source).cloned().unwrap_or(Value::Null);
            let value = match &mapping.transform {
                Some(transform) => {
                    transform(value).map_err(|e| format!("mapping '{}': {}", mapping.source, e))?
                }
                None => value,
            };
            let target = schema
                .resolve(&mapping.target)
                .map(|c| c.field_name.clone())
                .unwrap_or_else(|| mapping.target.clone());
            row.insert(target, value);
        }

        for column in schema.columns() {
            if !row.contains_key(&column.field_name) {
                row.insert(column.field_name.clone(), column.parse("")?);
            }
        }
        Ok(row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, RecordDescriptor};
    use serde_json::json;

    fn schema() -> Schema {
        let descriptor = RecordDescriptor::new("target")
            .column("code", ColumnDef::new(1))
            .column("count", ColumnDef::new(2).kind(ColumnType::Integer).default_value("0"))
            .column("note", ColumnDef::new(3).name("Note"));
        Schema::from_descriptor("Target", &descriptor).unwrap()
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_unmapped_targets_get_defaults() {
        let mapping = FieldMapping::new().map("c", "code");
        let out = mapping.apply(&row(json!({"c": "A1", "count": 5})), &schema()).unwrap();
        assert_eq!(Value::Object(out), json!({"code": "A1", "count": 0, "note": null}));
    }

    #[test]
    fn test_copy_matching_and_header_targets() {
        let mapping = FieldMapping::new().copy_matching(true).map("remark", "Note");
        let out = mapping
            .apply(&row(json!({"code": "B", "count": 3, "remark": "x"})), &schema())
            .unwrap();
        assert_eq!(Value::Object(out), json!({"code": "B", "count": 3, "note": "x"}));
    }

    #[test]
    fn test_transform_error_names_field() {
        let mapping = FieldMapping::new().map_with("c", "code", |_| Err("unsupported".into()));
        let err = mapping.apply(&row(json!({"c": 1})), &schema()).unwrap_err();
        assert!(err.contains("mapping 'c'"));
    }
}
