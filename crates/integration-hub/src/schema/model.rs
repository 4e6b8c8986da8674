//! Immutable, validated schema derived from a [`RecordDescriptor`]

use super::descriptor::{ColumnType, FileRecord, RecordDescriptor};
use super::value;
use crate::error::{IntegrationError, Result};
use parking_lot::RwLock;
use serde::de::value::MapDeserializer;
use serde::de::{DeserializeOwned, Deserializer, IntoDeserializer, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use tracing::debug;

/// Schemas derived so far, keyed by record type
static SCHEMA_CACHE: LazyLock<RwLock<HashMap<TypeId, Arc<Schema>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// A single column of a schema
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Serialized field name of the record
    pub field_name: String,
    /// Header / element name in files
    pub name: String,
    pub order: u32,
    pub nullable: bool,
    pub format: Option<String>,
    /// Fixed-width length
    pub length: Option<usize>,
    pub default_value: Option<String>,
    pub kind: ColumnType,
}

impl ColumnSchema {
    /// Parse a raw cell. Empty cells (or the format's null marker, already
    /// mapped to `""` by the caller) become the default value or null.
    pub(crate) fn parse(&self, raw: &str) -> std::result::Result<Value, String> {
        if raw.is_empty() {
            return match &self.default_value {
                Some(default) => value::parse_cell(self, default),
                None => Ok(Value::Null),
            };
        }
        value::parse_cell(self, raw)
    }

    pub(crate) fn render(&self, value: &Value) -> Option<String> {
        value::render_cell(self, value)
    }
}

/// An identity field, part of a possibly composite key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdColumn {
    pub field_name: String,
    pub order: u32,
}

/// Column and identity layout of a record type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    type_name: String,
    name: String,
    description: Option<String>,
    version: Option<String>,
    columns: Vec<ColumnSchema>,
    id_columns: Vec<IdColumn>,
}

impl Schema {
    /// Schema of a record type, derived on first use and cached afterwards.
    ///
    /// Invalid descriptors are never cached; every call reports the same
    /// [`IntegrationError::SchemaValidation`].
    pub fn of<T: FileRecord>() -> Result<Arc<Schema>> {
        let type_id = TypeId::of::<T>();
        if let Some(schema) = SCHEMA_CACHE.read().get(&type_id) {
            return Ok(schema.clone());
        }

        let schema = Arc::new(Self::from_descriptor(
            std::any::type_name::<T>(),
            &T::descriptor(),
        )?);
        debug!(
            "Derived schema '{}' for {} ({} columns)",
            schema.name,
            schema.type_name,
            schema.columns.len()
        );

        let mut cache = SCHEMA_CACHE.write();
        Ok(cache.entry(type_id).or_insert(schema).clone())
    }

    /// Validate a descriptor and build a schema from it.
    ///
    /// All violations are collected before failing.
    pub fn from_descriptor(type_name: &str, descriptor: &RecordDescriptor) -> Result<Schema> {
        let mut violations = Vec::new();

        match descriptor.file_types.len() {
            0 => violations.push("missing type-level file declaration".to_string()),
            1 => {}
            n => violations.push(format!("expected one type-level file declaration, found {}", n)),
        }
        if let Some(decl) = descriptor.file_types.first() {
            if decl.name.trim().is_empty() {
                violations.push("type-level file name must not be blank".to_string());
            }
        }

        let mut columns = Vec::with_capacity(descriptor.columns.len());
        let mut seen_orders: HashMap<u32, &str> = HashMap::new();
        let mut seen_fields: HashMap<&str, ()> = HashMap::new();

        for (field, def) in &descriptor.columns {
            if seen_fields.insert(field.as_str(), ()).is_some() {
                violations.push(format!("field '{}' is declared more than once", field));
            }
            if def.length == Some(0) {
                violations.push(format!("column '{}' has invalid fixed-width length 0", field));
            }
            let Some(order) = def.order else {
                violations.push(format!("column '{}' has no order", field));
                continue;
            };
            if let Some(other) = seen_orders.insert(order, field.as_str()) {
                violations.push(format!(
                    "columns '{}' and '{}' share order {}",
                    other, field, order
                ));
            }
            columns.push(ColumnSchema {
                field_name: field.clone(),
                name: def.name.clone().unwrap_or_else(|| field.clone()),
                order,
                nullable: def.nullable,
                format: def.format.clone(),
                length: def.length,
                default_value: def.default_value.clone(),
                kind: def.kind,
            });
        }
        columns.sort_by_key(|c| c.order);

        let mut ids: Vec<(usize, &String, Option<u32>)> = descriptor
            .ids
            .iter()
            .enumerate()
            .map(|(i, (field, order))| (i, field, *order))
            .collect();
        for (_, field, _) in &ids {
            if !descriptor.columns.iter().any(|(f, _)| f == *field) {
                violations.push(format!("identity field '{}' is not a declared column", field));
            }
        }
        ids.sort_by_key(|(i, _, order)| (order.unwrap_or(u32::MAX), *i));
        let id_columns = ids
            .into_iter()
            .map(|(i, field, order)| IdColumn {
                field_name: field.clone(),
                order: order.unwrap_or(i as u32),
            })
            .collect();

        if !violations.is_empty() {
            return Err(IntegrationError::SchemaValidation {
                type_name: type_name.to_string(),
                violations,
            });
        }

        let decl = &descriptor.file_types[0];
        Ok(Schema {
            type_name: type_name.to_string(),
            name: decl.name.clone(),
            description: decl.description.clone(),
            version: decl.version.clone(),
            columns,
            id_columns,
        })
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Columns sorted by order
    pub fn columns(&self) -> &[ColumnSchema] {
        &self.columns
    }

    /// Identity columns sorted by composite order
    pub fn id_columns(&self) -> &[IdColumn] {
        &self.id_columns
    }

    pub fn has_id_columns(&self) -> bool {
        !self.id_columns.is_empty()
    }

    /// Column by serialized field name
    pub fn column(&self, field_name: &str) -> Option<&ColumnSchema> {
        self.columns.iter().find(|c| c.field_name == field_name)
    }

    /// Column by field name or header name
    pub fn resolve(&self, key: &str) -> Option<&ColumnSchema> {
        self.column(key)
            .or_else(|| self.columns.iter().find(|c| c.name == key))
            .or_else(|| {
                self.columns
                    .iter()
                    .find(|c| c.name.eq_ignore_ascii_case(key.trim()))
            })
    }

    /// Total line width when every column has a fixed-width length
    pub fn record_width(&self) -> Option<usize> {
        self.columns.iter().map(|c| c.length).sum()
    }

    /// Identity values of a row in composite order, `None` without identity columns
    pub fn identity_key(&self, row: &Map<String, Value>) -> Option<Vec<Value>> {
        if self.id_columns.is_empty() {
            return None;
        }
        Some(
            self.id_columns
                .iter()
                .map(|id| row.get(&id.field_name).cloned().unwrap_or(Value::Null))
                .collect(),
        )
    }

    /// Serialize a record into a field map
    pub fn to_row<T: Serialize>(&self, record: &T) -> std::result::Result<Map<String, Value>, String> {
        match serde_json::to_value(record) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(format!(
                "record of '{}' serialized to {} instead of an object",
                self.name,
                json_type(&other)
            )),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Deserialize a field map into a record.
    ///
    /// Textual formats cannot tell an empty string from a missing value: a
    /// null cell reads as `None` for `Option` fields and as `""` for strings.
    pub fn from_row<T: DeserializeOwned>(&self, row: Map<String, Value>) -> std::result::Result<T, String> {
        let cells = MapDeserializer::<_, serde_json::Error>::new(row.into_iter().map(|(k, v)| (k, Cell(v))));
        T::deserialize(cells).map_err(|e| e.to_string())
    }
}

/// A decoded cell; null doubles as the empty string
struct Cell(Value);

impl<'de> IntoDeserializer<'de, serde_json::Error> for Cell {
    type Deserializer = Self;

    fn into_deserializer(self) -> Self {
        self
    }
}

macro_rules! forward_to_value {
    ($($method:ident)*) => {
        $(
            fn $method<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
                self.0.$method(visitor)
            }
        )*
    };
}

impl<'de> Deserializer<'de> for Cell {
    type Error = serde_json::Error;

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_str(""),
            other => other.deserialize_str(visitor),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_string(String::new()),
            other => other.deserialize_string(visitor),
        }
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        match self.0 {
            Value::Null => visitor.visit_none(),
            other => visitor.visit_some(Cell(other)),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_unit_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_unit_struct(name, visitor)
    }

    fn deserialize_tuple<V: Visitor<'de>>(self, len: usize, visitor: V) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_tuple(len, visitor)
    }

    fn deserialize_tuple_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        len: usize,
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_tuple_struct(name, len, visitor)
    }

    fn deserialize_struct<V: Visitor<'de>>(
        self,
        name: &'static str,
        fields: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_struct(name, fields, visitor)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> std::result::Result<V::Value, Self::Error> {
        self.0.deserialize_enum(name, variants, visitor)
    }

    forward_to_value! {
        deserialize_any deserialize_bool deserialize_i8 deserialize_i16 deserialize_i32 deserialize_i64
        deserialize_u8 deserialize_u16 deserialize_u32 deserialize_u64 deserialize_f32 deserialize_f64
        deserialize_char deserialize_bytes deserialize_byte_buf deserialize_unit deserialize_seq
        deserialize_map deserialize_identifier deserialize_ignored_any
    }
}

pub(crate) fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::ColumnDef;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Invoice {
        number: String,
        line: i64,
        amount: f64,
    }

    impl FileRecord for Invoice {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::new("invoice")
                .version("1")
                .column("amount", ColumnDef::new(3).kind(ColumnType::Decimal))
                .column("number", ColumnDef::new(1).name("Invoice No"))
                .column("line", ColumnDef::new(2).kind(ColumnType::Integer))
                .id_ordered("line", 2)
                .id_ordered("number", 1)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Broken {
        a: String,
        b: String,
    }

    impl FileRecord for Broken {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::undeclared()
                .column("a", ColumnDef::new(1))
                .column("b", ColumnDef::new(1))
        }
    }

    #[test]
    fn test_columns_sorted_by_order() {
        let schema = Schema::of::<Invoice>().unwrap();
        let fields: Vec<_> = schema.columns().iter().map(|c| c.field_name.as_str()).collect();
        assert_eq!(fields, vec!["number", "line", "amount"]);
        assert_eq!(schema.columns()[0].name, "Invoice No");
        assert_eq!(schema.version(), Some("1"));
    }

    #[test]
    fn test_composite_identity_order() {
        let schema = Schema::of::<Invoice>().unwrap();
        let ids: Vec<_> = schema.id_columns().iter().map(|c| c.field_name.as_str()).collect();
        assert_eq!(ids, vec!["number", "line"]);
    }

    #[test]
    fn test_schema_is_cached() {
        let first = Schema::of::<Invoice>().unwrap();
        let second = Schema::of::<Invoice>().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_all_violations_reported() {
        let err = Schema::of::<Broken>().unwrap_err();
        match err {
            IntegrationError::SchemaValidation { violations, .. } => {
                assert_eq!(violations.len(), 2);
                assert!(violations.iter().any(|v| v.contains("type-level")));
                assert!(violations.iter().any(|v| v.contains("share order 1")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_order_length_and_unknown_id() {
        let descriptor = RecordDescriptor::new("x")
            .column("a", ColumnDef::unordered())
            .column("b", ColumnDef::new(2).length(0))
            .id("c");
        let err = Schema::from_descriptor("x", &descriptor).unwrap_err();
        match err {
            IntegrationError::SchemaValidation { violations, .. } => {
                assert_eq!(violations.len(), 3, "{violations:?}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_identity_key_and_resolve() {
        let schema = Schema::of::<Invoice>().unwrap();
        let row = schema
            .to_row(&Invoice {
                number: "A-1".into(),
                line: 2,
                amount: 10.0,
            })
            .unwrap();
        assert_eq!(
            schema.identity_key(&row),
            Some(vec![Value::from("A-1"), Value::from(2)])
        );
        assert_eq!(schema.resolve("Invoice No").unwrap().field_name, "number");
        assert_eq!(schema.resolve("invoice no").unwrap().field_name, "number");
        assert!(schema.record_width().is_none());
    }
}
