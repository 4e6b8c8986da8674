//! Merge engine
//!
//! Concatenates record lists and runs a chain of operations over the result,
//! strictly in the order they were declared. Each operation consumes the
//! output of the previous one.
//!
//! ```text
//! list A ─┐
//! list B ─┼─▶ concat ─▶ op 1 ─▶ op 2 ─▶ ... ─▶ build() / build_with_stats()
//! list C ─┘            (sort, deduplicate, filter, transform, limit)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! let merged = repository
//!     .merge([monday, tuesday])
//!     .deduplicate()
//!     .filter(|p: &Payment| p.amount > 0.0)
//!     .sort_by("booked")
//!     .then_by("id")
//!     .descending()
//!     .limit(100)
//!     .build_with_stats();
//! ```

use crate::schema::Schema;
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;
type Comparator<T> = Box<dyn Fn(&T, &T) -> Ordering + Send + Sync>;
type Mapper<T> = Box<dyn Fn(T) -> T + Send + Sync>;
type KeyFn<T> = Box<dyn Fn(&T) -> Option<String> + Send + Sync>;

enum SortKey<T> {
    Field(String),
    Comparator(Comparator<T>),
}

struct SortSpec<T> {
    keys: Vec<SortKey<T>>,
    descending: bool,
}

enum DedupKey<T> {
    /// Schema identity columns, or the whole record without them
    Identity,
    Custom(KeyFn<T>),
}

enum MergeOp<T> {
    Sort(SortSpec<T>),
    Deduplicate { key: DedupKey<T>, keep_last: bool },
    Filter(Predicate<T>),
    Transform(Mapper<T>),
    Limit(usize),
}

/// Records and counters produced by [`MergeBuilder::build_with_stats`]
#[derive(Debug, Clone)]
pub struct MergeResult<T> {
    pub records: Vec<T>,
    /// Sum of all input list sizes
    pub source_count: usize,
    /// Size of `records`
    pub total_count: usize,
    pub duplicates_removed: usize,
    pub filtered_out: usize,
    /// Records cut off by `limit`
    pub limit_applied: usize,
}

impl<T> MergeResult<T> {
    pub fn was_limited(&self) -> bool {
        self.limit_applied > 0
    }

    pub fn into_records(self) -> Vec<T> {
        self.records
    }
}

/// Fluent merge pipeline. Single owner; every call appends one operation.
pub struct MergeBuilder<T> {
    schema: Option<Arc<Schema>>,
    records: Vec<T>,
    ops: Vec<MergeOp<T>>,
}

impl<T: Serialize> MergeBuilder<T> {
    /// Start a merge of the given lists, concatenated in order
    pub fn new<I>(lists: I) -> Self
    where
        I: IntoIterator<Item = Vec<T>>,
    {
        Self {
            schema: None,
            records: lists.into_iter().flatten().collect(),
            ops: Vec::new(),
        }
    }

    /// Schema used for identity deduplication and header-name sort keys
    pub fn with_schema(mut self, schema: Arc<Schema>) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Append another source list. Sources are always concatenated before any
    /// operation runs, regardless of when they are added.
    pub fn and(mut self, list: Vec<T>) -> Self {
        self.records.extend(list);
        self
    }

    /// Stable ascending sort by a field (or header) name. Nulls sort lowest.
    pub fn sort_by(mut self, field: impl Into<String>) -> Self {
        self.ops.push(MergeOp::Sort(SortSpec {
            keys: vec![SortKey::Field(field.into())],
            descending: false,
        }));
        self
    }

    /// Stable ascending sort by an extracted key
    pub fn sort_by_key<K, F>(self, extract: F) -> Self
    where
        K: Ord,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.sort_with(move |a, b| extract(a).cmp(&extract(b)))
    }

    /// Stable sort with a custom comparator
    pub fn sort_with<F>(mut self, comparator: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.ops.push(MergeOp::Sort(SortSpec {
            keys: vec![SortKey::Comparator(Box::new(comparator))],
            descending: false,
        }));
        self
    }

    /// Secondary sort key for the most recent sort; starts a sort if none exists
    pub fn then_by(mut self, field: impl Into<String>) -> Self {
        let field = field.into();
        match self.last_sort() {
            Some(spec) => spec.keys.push(SortKey::Field(field)),
            None => return self.sort_by(field),
        }
        self
    }

    /// Make the most recent sort ascending
    pub fn ascending(mut self) -> Self {
        match self.last_sort() {
            Some(spec) => spec.descending = false,
            None => warn!("ascending() called before any sort; ignored"),
        }
        self
    }

    /// Make the most recent sort descending
    pub fn descending(mut self) -> Self {
        match self.last_sort() {
            Some(spec) => spec.descending = true,
            None => warn!("descending() called before any sort; ignored"),
        }
        self
    }

    /// Remove duplicates by identity columns, keeping the first occurrence
    pub fn deduplicate(mut self) -> Self {
        self.ops.push(MergeOp::Deduplicate {
            key: DedupKey::Identity,
            keep_last: false,
        });
        self
    }

    /// Remove duplicates by identity columns. The surviving record sits at the
    /// position of the first occurrence but carries the value of the last one.
    pub fn deduplicate_keep_last(mut self) -> Self {
        self.ops.push(MergeOp::Deduplicate {
            key: DedupKey::Identity,
            keep_last: true,
        });
        self
    }

    /// Remove duplicates by a custom key, keeping the first occurrence
    pub fn deduplicate_by<K, F>(mut self, key: F) -> Self
    where
        K: Serialize,
        F: Fn(&T) -> K + Send + Sync + 'static,
    {
        self.ops.push(MergeOp::Deduplicate {
            key: DedupKey::Custom(Box::new(move |record| serde_json::to_string(&key(record)).ok())),
            keep_last: false,
        });
        self
    }

    /// Keep only records matching the predicate
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.ops.push(MergeOp::Filter(Box::new(predicate)));
        self
    }

    /// Map every record; counts are unaffected
    pub fn transform<F>(mut self, mapper: F) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        self.ops.push(MergeOp::Transform(Box::new(mapper)));
        self
    }

    /// Keep the first `n` records of the current result
    pub fn limit(mut self, n: usize) -> Self {
        self.ops.push(MergeOp::Limit(n));
        self
    }

    pub fn build(self) -> Vec<T> {
        self.build_with_stats().records
    }

    pub fn build_with_stats(self) -> MergeResult<T> {
        let MergeBuilder {
            schema,
            mut records,
            ops,
        } = self;

        let source_count = records.len();
        let mut duplicates_removed = 0;
        let mut filtered_out = 0;
        let mut limit_applied = 0;

        for op in ops {
            match op {
                MergeOp::Sort(spec) => records = sort(records, &spec, schema.as_deref()),
                MergeOp::Deduplicate { key, keep_last } => {
                    let before = records.len();
                    records = deduplicate(records, &key, keep_last, schema.as_deref());
                    duplicates_removed += before - records.len();
                }
                MergeOp::Filter(predicate) => {
                    let before = records.len();
                    records.retain(|r| predicate(r));
                    filtered_out += before - records.len();
                }
                MergeOp::Transform(mapper) => {
                    records = records.into_iter().map(|r| mapper(r)).collect();
                }
                MergeOp::Limit(n) => {
                    if records.len() > n {
                        limit_applied += records.len() - n;
                        records.truncate(n);
                    }
                }
            }
        }

        debug!(
            "Merged {} records into {} ({} duplicates, {} filtered, {} over limit)",
            source_count,
            records.len(),
            duplicates_removed,
            filtered_out,
            limit_applied
        );

        MergeResult {
            total_count: records.len(),
            records,
            source_count,
            duplicates_removed,
            filtered_out,
            limit_applied,
        }
    }

    fn last_sort(&mut self) -> Option<&mut SortSpec<T>> {
        self.ops.iter_mut().rev().find_map(|op| match op {
            MergeOp::Sort(spec) => Some(spec),
            _ => None,
        })
    }
}

fn sort<T: Serialize>(records: Vec<T>, spec: &SortSpec<T>, schema: Option<&Schema>) -> Vec<T> {
    let fields: Vec<Option<String>> = spec
        .keys
        .iter()
        .map(|key| match key {
            SortKey::Field(name) => Some(
                schema
                    .and_then(|s| s.resolve(name))
                    .map(|c| c.field_name.clone())
                    .unwrap_or_else(|| name.clone()),
            ),
            SortKey::Comparator(_) => None,
        })
        .collect();

    let projected: Vec<Value> = if fields.iter().any(Option::is_some) {
        records
            .iter()
            .map(|r| serde_json::to_value(r).unwrap_or(Value::Null))
            .collect()
    } else {
        Vec::new()
    };

    let mut order: Vec<usize> = (0..records.len()).collect();
    order.sort_by(|&a, &b| {
        let mut ordering = Ordering::Equal;
        for (key, field) in spec.keys.iter().zip(&fields) {
            ordering = match (key, field) {
                (SortKey::Comparator(cmp), _) => cmp(&records[a], &records[b]),
                (SortKey::Field(_), Some(field)) => {
                    compare_values(projected[a].get(field), projected[b].get(field))
                }
                (SortKey::Field(_), None) => Ordering::Equal,
            };
            if ordering != Ordering::Equal {
                break;
            }
        }
        if spec.descending {
            ordering.reverse()
        } else {
            ordering
        }
    });

    let mut slots: Vec<Option<T>> = records.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

fn deduplicate<T: Serialize>(
    records: Vec<T>,
    key: &DedupKey<T>,
    keep_last: bool,
    schema: Option<&Schema>,
) -> Vec<T> {
    let mut positions: HashMap<String, usize> = HashMap::with_capacity(records.len());
    let mut kept: Vec<T> = Vec::with_capacity(records.len());

    for record in records {
        let Some(k) = dedup_key(&record, key, schema) else {
            kept.push(record);
            continue;
        };
        match positions.get(&k) {
            Some(&position) => {
                if keep_last {
                    kept[position] = record;
                }
            }
            None => {
                positions.insert(k, kept.len());
                kept.push(record);
            }
        }
    }
    kept
}

fn dedup_key<T: Serialize>(record: &T, key: &DedupKey<T>, schema: Option<&Schema>) -> Option<String> {
    match key {
        DedupKey::Custom(f) => f(record),
        DedupKey::Identity => {
            let value = serde_json::to_value(record).ok()?;
            let identity = match (&value, schema) {
                (Value::Object(row), Some(schema)) => schema.identity_key(row),
                _ => None,
            };
            match identity {
                Some(values) => serde_json::to_string(&values).ok(),
                None => serde_json::to_string(&value).ok(),
            }
        }
    }
}

/// Total order over JSON values: null < bool < number < string < array < object
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    let a = a.unwrap_or(&Value::Null);
    let b = b.unwrap_or(&Value::Null);
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(Ordering::Equal),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ColumnDef, ColumnType, FileRecord, RecordDescriptor};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payment {
        id: i64,
        payee: String,
        amount: Option<f64>,
    }

    impl FileRecord for Payment {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::new("payment")
                .column("id", ColumnDef::new(1).kind(ColumnType::Integer))
                .column("payee", ColumnDef::new(2).name("Payee"))
                .column("amount", ColumnDef::new(3).kind(ColumnType::Decimal))
                .id("id")
        }
    }

    fn p(id: i64, payee: &str, amount: Option<f64>) -> Payment {
        Payment {
            id,
            payee: payee.to_string(),
            amount,
        }
    }

    fn builder(lists: Vec<Vec<Payment>>) -> MergeBuilder<Payment> {
        MergeBuilder::new(lists).with_schema(Schema::of::<Payment>().unwrap())
    }

    #[test]
    fn test_disjoint_merge_keeps_everything() {
        let a: Vec<_> = (1..=5).map(|i| p(i, "a", Some(1.0))).collect();
        let b: Vec<_> = (6..=8).map(|i| p(i, "b", Some(1.0))).collect();
        assert_eq!(builder(vec![a, b]).build().len(), 8);
    }

    #[test]
    fn test_deduplicate_shared_identity() {
        let records = vec![p(1, "x", None), p(1, "y", None), p(1, "z", None)];
        let result = builder(vec![records]).deduplicate().build_with_stats();
        assert_eq!(result.total_count, 1);
        assert_eq!(result.duplicates_removed, 2);
        assert_eq!(result.records[0].payee, "x");
    }

    #[test]
    fn test_stats_identity() {
        let a = vec![p(1, "a", Some(50.0)), p(2, "b", Some(500.0))];
        let b = vec![p(2, "b2", Some(500.0)), p(3, "c", Some(5.0))];
        let result = builder(vec![a, b])
            .deduplicate()
            .filter(|r| r.amount.unwrap_or(0.0) >= 10.0)
            .build_with_stats();
        assert_eq!(result.source_count, 4);
        assert_eq!(result.duplicates_removed, 1);
        assert_eq!(result.filtered_out, 1);
        assert_eq!(result.total_count, 2);
        assert_eq!(
            result.total_count,
            result.source_count - result.duplicates_removed - result.filtered_out
        );
    }

    #[test]
    fn test_keep_last_takes_first_position() {
        let records = vec![p(1, "old", None), p(2, "other", None), p(1, "new", None)];
        let merged = builder(vec![records]).deduplicate_keep_last().build();
        assert_eq!(merged, vec![p(1, "new", None), p(2, "other", None)]);
    }

    #[test]
    fn test_operations_run_in_call_order() {
        let records: Vec<_> = (1..=6).map(|i| p(i, "x", Some(i as f64))).collect();

        let limit_then_filter = builder(vec![records.clone()])
            .limit(3)
            .filter(|r| r.id % 2 == 0)
            .build_with_stats();
        assert_eq!(limit_then_filter.total_count, 1);
        assert_eq!(limit_then_filter.limit_applied, 3);

        let filter_then_limit = builder(vec![records])
            .filter(|r| r.id % 2 == 0)
            .limit(3)
            .build_with_stats();
        assert_eq!(filter_then_limit.total_count, 3);
        assert_eq!(filter_then_limit.limit_applied, 0);
        assert!(!filter_then_limit.was_limited());
    }

    #[test]
    fn test_sort_nulls_lowest_and_descending() {
        let records = vec![p(1, "a", Some(3.0)), p(2, "b", None), p(3, "c", Some(1.0))];
        let ascending = builder(vec![records.clone()]).sort_by("amount").build();
        assert_eq!(ascending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 3, 1]);

        let descending = builder(vec![records]).sort_by("amount").descending().build();
        assert_eq!(descending.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3, 2]);
    }

    #[test]
    fn test_then_by_and_header_names() {
        let records = vec![p(3, "b", None), p(1, "b", None), p(2, "a", None)];
        let sorted = builder(vec![records]).sort_by("Payee").then_by("id").build();
        assert_eq!(sorted.iter().map(|r| r.id).collect::<Vec<_>>(), vec![2, 1, 3]);
    }

    #[test]
    fn test_sort_is_stable() {
        let records = vec![p(1, "same", None), p(2, "same", None), p(3, "same", None)];
        let sorted = builder(vec![records]).sort_by_key(|r| r.payee.clone()).build();
        assert_eq!(sorted.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn test_transform_does_not_change_counts() {
        let result = builder(vec![vec![p(1, "a", Some(1.0))]])
            .transform(|mut r| {
                r.payee = r.payee.to_uppercase();
                r
            })
            .build_with_stats();
        assert_eq!(result.records[0].payee, "A");
        assert_eq!(result.total_count, result.source_count);
    }

    #[test]
    fn test_empty_lists() {
        let result = builder(vec![vec![], vec![p(1, "a", None)], vec![]]).build();
        assert_eq!(result.len(), 1);
        let empty = builder(vec![vec![], vec![]]).deduplicate().build_with_stats();
        assert!(empty.records.is_empty());
        assert_eq!(empty.source_count, 0);
    }

    #[test]
    fn test_without_identity_uses_whole_record() {
        let records = vec![p(1, "a", None), p(1, "a", None), p(1, "b", None)];
        let merged = MergeBuilder::new(vec![records]).deduplicate().build();
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_custom_key() {
        let records = vec![p(1, "a", None), p(2, "a", None), p(3, "b", None)];
        let merged = builder(vec![records]).deduplicate_by(|r| r.payee.clone()).build();
        assert_eq!(merged.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn test_compare_values_mixed_types() {
        assert_eq!(compare_values(None, Some(&Value::from(1))), Ordering::Less);
        assert_eq!(
            compare_values(Some(&Value::from(2.5)), Some(&Value::from(2))),
            Ordering::Greater
        );
        assert_eq!(
            compare_values(Some(&Value::from("b")), Some(&Value::from("a"))),
            Ordering::Greater
        );
    }
}
