//! Record repository tests: file formats, merge, split and conversion
//!
//! Run with: cargo test -p integration-hub --test repository

use anyhow::Result;
use integration_hub::{
    ColumnDef, ColumnType, ErrorKind, FieldMapping, FileFormat, FileRecord, FileRepository, IntegrationError,
    RecordDescriptor, Schema, SplitRule,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Payment {
    id: i64,
    payee: String,
    amount: f64,
    booked: String,
}

impl FileRecord for Payment {
    fn descriptor() -> RecordDescriptor {
        RecordDescriptor::new("payment")
            .column("id", ColumnDef::new(1).kind(ColumnType::Integer).nullable(false).length(6))
            .column("payee", ColumnDef::new(2).name("Payee").length(16))
            .column("amount", ColumnDef::new(3).kind(ColumnType::Decimal).format("0.00").length(10))
            .column("booked", ColumnDef::new(4).kind(ColumnType::Date).length(10))
            .id("id")
    }
}

fn payment(id: i64, payee: &str, amount: f64) -> Payment {
    Payment {
        id,
        payee: payee.to_string(),
        amount,
        booked: "2024-03-01".to_string(),
    }
}

fn batch(ids: std::ops::RangeInclusive<i64>) -> Vec<Payment> {
    ids.map(|i| payment(i, &format!("payee-{}", i), i as f64 * 10.25)).collect()
}

#[test]
fn json_and_fixed_width_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::<Payment>::new()?;
    let records = batch(1..=4);

    for (name, format) in [
        ("payments.json", FileFormat::json().pretty()),
        ("payments.dat", FileFormat::fixed_width()),
    ] {
        let path = dir.path().join(name);
        repo.write(&records, &path, &format)?;
        assert_eq!(repo.read(&path, &format)?, records, "round trip through {}", name);
    }
    Ok(())
}

#[test]
fn csv_uses_column_names_as_header() -> Result<()> {
    let repo = FileRepository::<Payment>::new()?;
    let bytes = repo.to_bytes(&batch(1..=1), &FileFormat::csv())?;
    let text = String::from_utf8(bytes)?;
    assert_eq!(text.lines().next(), Some("id,Payee,amount,booked"));
    assert_eq!(repo.read_bytes(text.as_bytes(), &FileFormat::csv())?, batch(1..=1));
    Ok(())
}

#[test]
fn merge_files_with_stats() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::<Payment>::new()?;
    let monday = dir.path().join("monday.csv");
    let tuesday = dir.path().join("tuesday.csv");
    repo.write(&[payment(1, "a", 50.0), payment(2, "b", 500.0)], &monday, &FileFormat::csv())?;
    repo.write(&[payment(2, "b", 500.0), payment(3, "c", 5.0)], &tuesday, &FileFormat::csv())?;

    let lists = vec![repo.read(&monday, &FileFormat::csv())?, repo.read(&tuesday, &FileFormat::csv())?];
    let result = repo
        .merge(lists)
        .deduplicate()
        .filter(|p| p.amount >= 10.0)
        .build_with_stats();

    assert_eq!(result.source_count, 4);
    assert_eq!(result.duplicates_removed, 1);
    assert_eq!(result.filtered_out, 1);
    assert_eq!(result.total_count, 2);
    assert_eq!(result.records.iter().map(|p| p.id).collect::<Vec<_>>(), vec![1, 2]);
    Ok(())
}

#[test]
fn merge_disjoint_lists_and_limit() -> Result<()> {
    let repo = FileRepository::<Payment>::new()?;
    assert_eq!(repo.merge(vec![batch(1..=5), batch(6..=8)]).build().len(), 8);

    let limited = repo
        .merge(vec![batch(1..=5), batch(6..=8)])
        .sort_by("amount")
        .descending()
        .limit(3)
        .build_with_stats();
    assert_eq!(limited.records.iter().map(|p| p.id).collect::<Vec<_>>(), vec![8, 7, 6]);
    assert!(limited.was_limited());
    assert_eq!(limited.limit_applied, 5);
    Ok(())
}

#[test]
fn split_by_count_and_predicate() -> Result<()> {
    let repo = FileRepository::<Payment>::new()?;

    let five = repo.split(batch(1..=5), &SplitRule::by_count(2))?;
    let sizes: Vec<usize> = five.counts().into_iter().map(|(_, n)| n).collect();
    assert_eq!(sizes, vec![2, 2, 1]);
    assert_eq!(five.total_count(), 5);

    let six = repo.split(batch(1..=6), &SplitRule::by_count(2))?;
    let sizes: Vec<usize> = six.counts().into_iter().map(|(_, n)| n).collect();
    assert_eq!(sizes, vec![2, 2, 2]);

    let amounts = vec![payment(1, "a", 100.0), payment(2, "b", 500.0), payment(3, "c", 200.0)];
    let tiers = repo.split(amounts, &SplitRule::by_predicate(|p: &Payment| p.amount > 300.0, "high", "standard"))?;
    assert_eq!(tiers.get("high").len(), 1);
    assert_eq!(tiers.get("standard").len(), 2);
    Ok(())
}

#[test]
fn split_partitions_written_per_key() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let repo = FileRepository::<Payment>::new()?;
    let split = repo.split(batch(1..=5), &SplitRule::by_count(2))?;

    let written = split.write_all(&repo, dir.path(), "payments_{key}.jsonl", &FileFormat::json_lines())?;
    assert_eq!(written.len(), 3);
    let total: usize = written
        .iter()
        .map(|path| repo.read(path, &FileFormat::json_lines()).map(|r| r.len()))
        .sum::<integration_hub::Result<usize>>()?;
    assert_eq!(total, 5);
    Ok(())
}

#[test]
fn convert_with_field_mapping() -> Result<()> {
    #[derive(Serialize)]
    struct LegacyPayment {
        payment_no: String,
        beneficiary: String,
        cents: i64,
        booked: String,
    }

    let repo = FileRepository::<Payment>::new()?;
    let legacy = vec![LegacyPayment {
        payment_no: "17".to_string(),
        beneficiary: "Acme".to_string(),
        cents: 1250,
        booked: "2024-03-01".to_string(),
    }];
    let mapping = FieldMapping::new()
        .map_with("payment_no", "id", |v| {
            v.as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .map(Value::from)
                .ok_or_else(|| "not a number".to_string())
        })
        .map("beneficiary", "Payee")
        .map_with("cents", "amount", |v| Ok(Value::from(v.as_f64().unwrap_or(0.0) / 100.0)))
        .copy_matching(true);

    let converted = repo.convert(&legacy, &mapping)?;
    assert_eq!(converted, vec![payment(17, "Acme", 12.5)]);
    Ok(())
}

#[test]
fn schema_errors_list_every_violation() {
    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Undeclared {
        id: i64,
    }

    impl FileRecord for Undeclared {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::undeclared().column("id", ColumnDef::new(1))
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Clashing {
        a: String,
        b: String,
    }

    impl FileRecord for Clashing {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::new("clashing")
                .column("a", ColumnDef::new(1))
                .column("b", ColumnDef::new(1))
                .id("missing")
        }
    }

    let err = Schema::of::<Undeclared>().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SchemaValidation);

    match Schema::of::<Clashing>().unwrap_err() {
        IntegrationError::SchemaValidation { violations, .. } => {
            assert_eq!(violations.len(), 2, "{:?}", violations);
            assert!(violations.iter().any(|v| v.contains("share order 1")));
            assert!(violations.iter().any(|v| v.contains("'missing'")));
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn validate_reports_null_and_truncation() -> Result<()> {
    let repo = FileRepository::<Payment>::new()?;
    let long = payment(1, "a payee name far longer than sixteen", 1.0);
    let result = repo.validate(&[long]);
    assert!(result.is_valid());
    assert_eq!(result.warnings.len(), 1);
    Ok(())
}

#[test]
fn empty_strings_survive_textual_formats() -> Result<()> {
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Remark {
        id: i64,
        note: String,
        reviewer: Option<String>,
    }

    impl FileRecord for Remark {
        fn descriptor() -> RecordDescriptor {
            RecordDescriptor::new("remark")
                .column("id", ColumnDef::new(1).kind(ColumnType::Integer).length(4))
                .column("note", ColumnDef::new(2).length(12))
                .column("reviewer", ColumnDef::new(3).length(8))
        }
    }

    let repo = FileRepository::<Remark>::new()?;
    let records = vec![
        Remark {
            id: 1,
            note: String::new(),
            reviewer: None,
        },
        Remark {
            id: 2,
            note: "checked".to_string(),
            reviewer: Some("kim".to_string()),
        },
    ];

    for format in [FileFormat::fixed_width(), FileFormat::csv()] {
        let bytes = repo.to_bytes(&records, &format)?;
        assert_eq!(repo.read_bytes(&bytes, &format)?, records, "{:?}", format.format_type);
    }
    Ok(())
}
