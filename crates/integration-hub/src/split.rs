//! Split engine
//!
//! Partitions a record list by a [`SplitRule`]. Every input record lands in
//! exactly one partition. Partitions keep the order in which their keys were
//! first seen, and records keep their input order within a partition.
//!
//! ```text
//! by_field(region)              by_count(2)            by_field(region).then(by_count(2))
//!   "EU" -> [a, c]                "partition_0" -> [a, b]   "EU/partition_0" -> [a, c]
//!   "US" -> [b]                   "partition_1" -> [c]      "US/partition_0" -> [b]
//! ```

use crate::error::{IntegrationError, Result};
use crate::format::FileFormat;
use crate::repository::FileRepository;
use crate::schema::FileRecord;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type KeyFn<T> = Box<dyn Fn(&T) -> String + Send + Sync>;
type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Key used for records whose field value is absent
pub const NULL_PARTITION: &str = "null";

/// Key used for records no predicate matched
pub const UNMATCHED_PARTITION: &str = "unmatched";

enum RuleKind<T> {
    Field(KeyFn<T>),
    Count(usize),
    Predicate {
        predicate: Predicate<T>,
        true_label: String,
        false_label: String,
    },
    Predicates(Vec<(String, Predicate<T>)>),
    Composite(Box<SplitRule<T>>, Box<SplitRule<T>>),
}

/// How records are assigned to partitions
pub struct SplitRule<T> {
    kind: RuleKind<T>,
    description: String,
}

impl<T> fmt::Debug for SplitRule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitRule")
            .field("description", &self.description)
            .finish()
    }
}

impl<T: 'static> SplitRule<T> {
    /// Partition by an extracted value; `None` goes to the `"null"` partition
    pub fn by_field<K, F>(extract: F) -> Self
    where
        K: fmt::Display,
        F: Fn(&T) -> Option<K> + Send + Sync + 'static,
    {
        Self {
            kind: RuleKind::Field(Box::new(move |record| match extract(record) {
                Some(key) => key.to_string(),
                None => NULL_PARTITION.to_string(),
            })),
            description: "by field".to_string(),
        }
    }

    /// Partition by a named field of the serialized record
    pub fn by_field_name(field: impl Into<String>) -> Self
    where
        T: Serialize,
    {
        let field = field.into();
        let description = format!("by field '{}'", field);
        Self {
            kind: RuleKind::Field(Box::new(move |record| {
                let value = serde_json::to_value(record).unwrap_or(Value::Null);
                match value.get(&field) {
                    None | Some(Value::Null) => NULL_PARTITION.to_string(),
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                }
            })),
            description,
        }
    }

    /// Chunks of `size` records named `partition_0`, `partition_1`, ...
    ///
    /// A size of zero is rejected when the rule is applied.
    pub fn by_count(size: usize) -> Self {
        Self {
            kind: RuleKind::Count(size),
            description: format!("by count {}", size),
        }
    }

    /// Two partitions; both labels exist even when one stays empty
    pub fn by_predicate<F>(
        predicate: F,
        true_label: impl Into<String>,
        false_label: impl Into<String>,
    ) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let true_label = true_label.into();
        let false_label = false_label.into();
        let description = format!("by predicate ({}/{})", true_label, false_label);
        Self {
            kind: RuleKind::Predicate {
                predicate: Box::new(predicate),
                true_label,
                false_label,
            },
            description,
        }
    }

    /// Labelled predicates checked in order; the first match wins and records
    /// matching none go to `"unmatched"`
    pub fn by_predicates<I, L, F>(rules: I) -> Self
    where
        I: IntoIterator<Item = (L, F)>,
        L: Into<String>,
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let rules: Vec<(String, Predicate<T>)> = rules
            .into_iter()
            .map(|(label, p)| (label.into(), Box::new(p) as Predicate<T>))
            .collect();
        let labels: Vec<&str> = rules.iter().map(|(l, _)| l.as_str()).collect();
        let description = format!("by predicates [{}]", labels.join(", "));
        Self {
            kind: RuleKind::Predicates(rules),
            description,
        }
    }

    /// Split every partition of `self` again by `inner`; keys become `outer/inner`
    pub fn then(self, inner: SplitRule<T>) -> Result<SplitRule<T>> {
        if self.contains_count() && inner.contains_count() {
            return Err(IntegrationError::SplitRuleConflict(format!(
                "cannot combine count-based rules ({} then {})",
                self.description, inner.description
            )));
        }
        let description = format!("{} then {}", self.description, inner.description);
        Ok(Self {
            kind: RuleKind::Composite(Box::new(self), Box::new(inner)),
            description,
        })
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    fn contains_count(&self) -> bool {
        match &self.kind {
            RuleKind::Count(_) => true,
            RuleKind::Composite(outer, inner) => outer.contains_count() || inner.contains_count(),
            _ => false,
        }
    }

    /// Partition records according to this rule
    pub fn apply(&self, records: Vec<T>) -> Result<SplitResult<T>> {
        let total = records.len();
        let partitions = self.partition(records)?;
        debug!(
            "Split {} records {} into {} partitions",
            total,
            self.description,
            partitions.len()
        );
        Ok(SplitResult {
            partitions,
            rule_description: self.description.clone(),
            total_count: total,
        })
    }

    fn partition(&self, records: Vec<T>) -> Result<Partitions<T>> {
        let mut partitions = Partitions::default();
        match &self.kind {
            RuleKind::Field(key) => {
                for record in records {
                    partitions.push(key(&record), record);
                }
            }
            RuleKind::Count(0) => {
                return Err(IntegrationError::config("split count must be greater than 0"));
            }
            RuleKind::Count(size) => {
                for (index, record) in records.into_iter().enumerate() {
                    partitions.push(format!("partition_{}", index / size), record);
                }
            }
            RuleKind::Predicate {
                predicate,
                true_label,
                false_label,
            } => {
                partitions.ensure(true_label);
                partitions.ensure(false_label);
                for record in records {
                    let label = if predicate(&record) { true_label } else { false_label };
                    partitions.push(label.clone(), record);
                }
            }
            RuleKind::Predicates(rules) => {
                for (label, _) in rules {
                    partitions.ensure(label);
                }
                for record in records {
                    let label = rules
                        .iter()
                        .find(|(_, p)| p(&record))
                        .map(|(label, _)| label.as_str())
                        .unwrap_or(UNMATCHED_PARTITION);
                    partitions.push(label.to_string(), record);
                }
            }
            RuleKind::Composite(outer, inner) => {
                for (outer_key, group) in outer.partition(records)?.entries {
                    for (inner_key, records) in inner.partition(group)?.entries {
                        let key = format!("{}/{}", outer_key, inner_key);
                        partitions.ensure(&key);
                        for record in records {
                            partitions.push(key.clone(), record);
                        }
                    }
                }
            }
        }
        Ok(partitions)
    }
}

/// Insertion-ordered key -> records map
struct Partitions<T> {
    entries: Vec<(String, Vec<T>)>,
    index: HashMap<String, usize>,
}

impl<T> Default for Partitions<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }
}

impl<T> Partitions<T> {
    fn ensure(&mut self, key: &str) -> usize {
        if let Some(&position) = self.index.get(key) {
            return position;
        }
        self.entries.push((key.to_string(), Vec::new()));
        self.index.insert(key.to_string(), self.entries.len() - 1);
        self.entries.len() - 1
    }

    fn push(&mut self, key: String, record: T) {
        let position = self.ensure(&key);
        self.entries[position].1.push(record);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Partitioned records produced by a [`SplitRule`]
pub struct SplitResult<T> {
    partitions: Partitions<T>,
    rule_description: String,
    total_count: usize,
}

impl<T> fmt::Debug for SplitResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SplitResult")
            .field("rule", &self.rule_description)
            .field("counts", &self.counts())
            .finish()
    }
}

impl<T> SplitResult<T> {
    /// Records of a partition; empty for unknown keys
    pub fn get(&self, key: &str) -> &[T] {
        self.partitions
            .index
            .get(key)
            .map(|&i| self.partitions.entries[i].1.as_slice())
            .unwrap_or_default()
    }

    pub fn partition_keys(&self) -> Vec<&str> {
        self.partitions.entries.iter().map(|(k, _)| k.as_str()).collect()
    }

    /// Record count per partition, in key order
    pub fn counts(&self) -> Vec<(&str, usize)> {
        self.partitions
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect()
    }

    pub fn partitions(&self) -> impl Iterator<Item = (&str, &[T])> {
        self.partitions
            .entries
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn into_partitions(self) -> Vec<(String, Vec<T>)> {
        self.partitions.entries
    }

    /// Number of input records
    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn has_partition(&self, key: &str) -> bool {
        self.partitions.index.contains_key(key)
    }

    pub fn rule_description(&self) -> &str {
        &self.rule_description
    }
}

impl<T: FileRecord> SplitResult<T> {
    /// Write one file per partition into `dir`.
    ///
    /// `pattern` must contain `{key}`; path separators in keys are replaced
    /// with `_`. Returns the written paths in partition order.
    pub fn write_all(
        &self,
        repository: &FileRepository<T>,
        dir: impl AsRef<Path>,
        pattern: &str,
        format: &FileFormat,
    ) -> Result<Vec<PathBuf>> {
        if !pattern.contains("{key}") {
            return Err(IntegrationError::config(format!(
                "partition file pattern '{}' must contain {{key}}",
                pattern
            )));
        }
        let dir = dir.as_ref();
        let mut written = Vec::with_capacity(self.partition_count());
        for (key, records) in self.partitions() {
            let safe_key = key.replace(['/', '\\'], "_");
            let path = dir.join(pattern.replace("{key}", &safe_key));
            repository.write(records, &path, format)?;
            written.push(path);
        }
        info!(
            "Wrote {} partitions ({} records) to {}",
            written.len(),
            self.total_count,
            dir.display()
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize)]
    struct Claim {
        id: u32,
        region: Option<String>,
        amount: f64,
    }

    fn claims() -> Vec<Claim> {
        vec![
            Claim { id: 1, region: Some("EU".into()), amount: 5000.0 },
            Claim { id: 2, region: Some("US".into()), amount: 200.0 },
            Claim { id: 3, region: Some("EU".into()), amount: 50.0 },
            Claim { id: 4, region: None, amount: 10.0 },
            Claim { id: 5, region: Some("US".into()), amount: 75.0 },
        ]
    }

    fn ids(records: &[Claim]) -> Vec<u32> {
        records.iter().map(|c| c.id).collect()
    }

    #[test]
    fn test_by_count_sizes() {
        let result = SplitRule::by_count(2).apply(claims()).unwrap();
        let sizes: Vec<usize> = result.counts().into_iter().map(|(_, n)| n).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(result.partition_keys(), vec!["partition_0", "partition_1", "partition_2"]);

        let mut six = claims();
        six.push(Claim { id: 6, region: None, amount: 1.0 });
        let result = SplitRule::by_count(2).apply(six).unwrap();
        let sizes: Vec<usize> = result.counts().into_iter().map(|(_, n)| n).collect();
        assert_eq!(sizes, vec![2, 2, 2]);
    }

    #[test]
    fn test_by_count_zero_is_config_error() {
        let err = SplitRule::<Claim>::by_count(0).apply(claims()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Config);
    }

    #[test]
    fn test_by_predicate() {
        let records: Vec<Claim> = claims().into_iter().take(3).collect();
        let result = SplitRule::by_predicate(|c: &Claim| c.amount > 1000.0, "high", "standard")
            .apply(records)
            .unwrap();
        assert_eq!(result.get("high").len(), 1);
        assert_eq!(result.get("standard").len(), 2);

        let none_high = SplitRule::by_predicate(|c: &Claim| c.amount > 1e9, "high", "standard")
            .apply(claims())
            .unwrap();
        assert!(none_high.has_partition("high"));
        assert!(none_high.get("high").is_empty());
    }

    #[test]
    fn test_by_field_with_null() {
        let result = SplitRule::by_field(|c: &Claim| c.region.clone()).apply(claims()).unwrap();
        assert_eq!(result.partition_keys(), vec!["EU", "US", "null"]);
        assert_eq!(ids(result.get("EU")), vec![1, 3]);
        assert_eq!(ids(result.get(NULL_PARTITION)), vec![4]);
        assert!(result.get("APAC").is_empty());
        assert_eq!(result.total_count(), 5);
    }

    #[test]
    fn test_by_field_name() {
        let result = SplitRule::by_field_name("region").apply(claims()).unwrap();
        assert_eq!(result.partition_count(), 3);
        assert_eq!(ids(result.get("US")), vec![2, 5]);
    }

    #[test]
    fn test_by_predicates_first_match_and_unmatched() {
        fn at_least(min: f64) -> Predicate<Claim> {
            Box::new(move |c: &Claim| c.amount >= min)
        }
        let rule = SplitRule::by_predicates(vec![
            ("large", at_least(100.0)),
            ("huge", at_least(1000.0)),
            ("medium", at_least(50.0)),
        ]);
        let result = rule.apply(claims()).unwrap();
        assert_eq!(ids(result.get("large")), vec![1, 2]);
        assert!(result.get("huge").is_empty());
        assert_eq!(ids(result.get("medium")), vec![3, 5]);
        assert_eq!(ids(result.get(UNMATCHED_PARTITION)), vec![4]);
        let total: usize = result.counts().iter().map(|(_, n)| n).sum();
        assert_eq!(total, result.total_count());
    }

    #[test]
    fn test_composite_keys() {
        let rule = SplitRule::by_field(|c: &Claim| c.region.clone())
            .then(SplitRule::by_count(1))
            .unwrap();
        let result = rule.apply(claims()).unwrap();
        assert_eq!(
            result.partition_keys(),
            vec!["EU/partition_0", "EU/partition_1", "US/partition_0", "US/partition_1", "null/partition_0"]
        );
        assert!(result.rule_description().contains("then"));
    }

    #[test]
    fn test_two_count_rules_conflict() {
        let err = SplitRule::<Claim>::by_count(2)
            .then(SplitRule::by_count(3))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::SplitRuleConflict);
    }

    #[test]
    fn test_empty_input() {
        let result = SplitRule::<Claim>::by_count(3).apply(Vec::new()).unwrap();
        assert_eq!(result.partition_count(), 0);
        assert_eq!(result.total_count(), 0);
    }
}
