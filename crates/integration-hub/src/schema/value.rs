//! Conversion between textual cells and typed JSON values

use super::descriptor::ColumnType;
use super::model::ColumnSchema;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};

const ISO_DATE: &str = "%Y-%m-%d";
const ISO_DATE_TIME: &str = "%Y-%m-%dT%H:%M:%S";

/// Parse a non-empty cell into the column's value type
pub(crate) fn parse_cell(column: &ColumnSchema, raw: &str) -> Result<Value, String> {
    match column.kind {
        ColumnType::String => Ok(Value::String(raw.to_string())),
        ColumnType::Integer => raw
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .map_err(|_| format!("column '{}': '{}' is not an integer", column.name, raw)),
        ColumnType::Decimal => {
            let parsed = raw
                .trim()
                .parse::<f64>()
                .map_err(|_| format!("column '{}': '{}' is not a decimal", column.name, raw))?;
            Number::from_f64(parsed)
                .map(Value::Number)
                .ok_or_else(|| format!("column '{}': '{}' is not finite", column.name, raw))
        }
        ColumnType::Boolean => match raw.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "y" => Ok(Value::Bool(true)),
            "false" | "0" | "no" | "n" => Ok(Value::Bool(false)),
            _ => Err(format!("column '{}': '{}' is not a boolean", column.name, raw)),
        },
        ColumnType::Date => {
            let pattern = column.format.as_deref().unwrap_or(ISO_DATE);
            NaiveDate::parse_from_str(raw.trim(), pattern)
                .map(|d| Value::String(d.format(ISO_DATE).to_string()))
                .map_err(|e| {
                    format!("column '{}': '{}' does not match '{}': {}", column.name, raw, pattern, e)
                })
        }
        ColumnType::DateTime => {
            let pattern = column.format.as_deref().unwrap_or(ISO_DATE_TIME);
            NaiveDateTime::parse_from_str(raw.trim(), pattern)
                .map(|d| Value::String(d.format(ISO_DATE_TIME).to_string()))
                .map_err(|e| {
                    format!("column '{}': '{}' does not match '{}': {}", column.name, raw, pattern, e)
                })
        }
    }
}

/// Render a value for a textual format. `None` means the cell is null.
pub(crate) fn render_cell(column: &ColumnSchema, value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(render_number(column, n)),
        Value::String(s) => Some(render_string(column, s)),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

fn render_number(column: &ColumnSchema, n: &Number) -> String {
    if column.kind != ColumnType::Decimal {
        return n.to_string();
    }
    match (column.format.as_deref().and_then(decimal_places), n.as_f64()) {
        (Some(places), Some(f)) => format!("{:.*}", places, f),
        _ => n.to_string(),
    }
}

fn render_string(column: &ColumnSchema, s: &str) -> String {
    match (column.kind, column.format.as_deref()) {
        (ColumnType::Date, Some(pattern)) => NaiveDate::parse_from_str(s, ISO_DATE)
            .map(|d| d.format(pattern).to_string())
            .unwrap_or_else(|_| s.to_string()),
        (ColumnType::DateTime, Some(pattern)) => s
            .parse::<NaiveDateTime>()
            .map(|d| d.format(pattern).to_string())
            .unwrap_or_else(|_| s.to_string()),
        _ => s.to_string(),
    }
}

/// Digits after the decimal point in a pattern such as `#0.00`
fn decimal_places(pattern: &str) -> Option<usize> {
    let (_, fraction) = pattern.split_once('.')?;
    Some(fraction.chars().take_while(|c| *c == '0' || *c == '#').count())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn column(kind: ColumnType, format: Option<&str>) -> ColumnSchema {
        ColumnSchema {
            field_name: "f".into(),
            name: "f".into(),
            order: 1,
            nullable: true,
            format: format.map(str::to_string),
            length: None,
            default_value: None,
            kind,
        }
    }

    #[test]
    fn test_parse_typed_cells() {
        assert_eq!(
            parse_cell(&column(ColumnType::Integer, None), " 42 ").unwrap(),
            Value::from(42)
        );
        assert_eq!(
            parse_cell(&column(ColumnType::Boolean, None), "Y").unwrap(),
            Value::Bool(true)
        );
        assert!(parse_cell(&column(ColumnType::Integer, None), "4x2").is_err());
    }

    #[test]
    fn test_date_pattern_round_trip() {
        let col = column(ColumnType::Date, Some("%d.%m.%Y"));
        let value = parse_cell(&col, "31.12.2024").unwrap();
        assert_eq!(value, Value::String("2024-12-31".into()));
        assert_eq!(render_cell(&col, &value).as_deref(), Some("31.12.2024"));
    }

    #[test]
    fn test_decimal_format() {
        let col = column(ColumnType::Decimal, Some("#0.00"));
        assert_eq!(render_cell(&col, &Value::from(12.5)).as_deref(), Some("12.50"));
        assert_eq!(render_cell(&col, &Value::Null), None);
    }
}
