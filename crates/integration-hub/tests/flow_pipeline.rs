//! End-to-end flow tests against local directories and in-memory components
//!
//! Run with: cargo test -p integration-hub --test flow_pipeline

use anyhow::Result;
use integration_hub::connectors::FilePattern;
use integration_hub::flow::testing::{MemoryInput, MemoryOutput};
use integration_hub::flow::FnTransformer;
use integration_hub::{
    ColumnDef, ColumnType, ErrorKind, FileFormat, FileInput, FileOutput, FileRecord, FlowDefinition, FlowState,
    IntegrationEngine, RecordDescriptor, Schema,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: i64,
    customer: String,
    total: f64,
}

impl FileRecord for Order {
    fn descriptor() -> RecordDescriptor {
        RecordDescriptor::new("order")
            .column("id", ColumnDef::new(1).kind(ColumnType::Integer).nullable(false))
            .column("customer", ColumnDef::new(2))
            .column("total", ColumnDef::new(3).kind(ColumnType::Decimal))
            .id("id")
    }
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

#[tokio::test]
async fn file_flow_merges_inputs_and_archives() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (csv_dir, json_dir, out_dir, archive) = (
        dir.path().join("csv"),
        dir.path().join("json"),
        dir.path().join("out"),
        dir.path().join("archive"),
    );
    std::fs::create_dir_all(&csv_dir)?;
    std::fs::create_dir_all(&json_dir)?;
    std::fs::write(csv_dir.join("orders.csv"), "id,customer,total\n1,acme,120.5\n2,globex,8\n")?;
    std::fs::write(
        json_dir.join("orders.json"),
        r#"[{"id": 3, "customer": "initech", "total": 64.0}]"#,
    )?;
    std::fs::write(csv_dir.join("ignored.txt"), "not an order")?;

    let schema = Schema::of::<Order>()?;
    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    registry.register_input(
        "csv-orders",
        Arc::new(
            FileInput::new("csv-orders", &csv_dir, FilePattern::new("*.csv")?, FileFormat::csv(), schema.clone())
                .with_archive_dir(&archive),
        ),
    );
    registry.register_input(
        "json-orders",
        Arc::new(
            FileInput::new("json-orders", &json_dir, FilePattern::new("*.json")?, FileFormat::json(), schema.clone())
                .with_archive_dir(&archive),
        ),
    );
    registry.register_transformer(
        "large-only",
        Arc::new(FnTransformer::filter("large-only", |r: &Value| {
            r["total"].as_f64().unwrap_or(0.0) >= 10.0
        })),
    );
    registry.register_output(
        "export",
        Arc::new(FileOutput::new("export", &out_dir, FileFormat::json_lines(), schema).with_filename_pattern("{flow}.{ext}")),
    );
    registry.register_flow(
        FlowDefinition::builder("orders")
            .input("csv-orders")
            .input("json-orders")
            .transformer("large-only")
            .output("export")
            .build()?,
    );

    let result = engine.execute_flow("orders").await;
    assert!(result.is_success(), "{}", result.message);
    assert_eq!(result.records_read, 3);
    assert_eq!(result.records_processed, 2);
    assert!(!result.partial);

    let written = std::fs::read_to_string(out_dir.join("orders.jsonl"))?;
    let ids: Vec<i64> = written
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).map(|v| v["id"].as_i64().unwrap_or_default()))
        .collect::<serde_json::Result<_>>()?;
    assert_eq!(ids, vec![1, 3]);

    assert_eq!(file_names(&csv_dir), vec!["ignored.txt"]);
    assert!(file_names(&json_dir).is_empty());
    assert_eq!(file_names(&archive), vec!["orders.csv", "orders.json"]);
    Ok(())
}

#[tokio::test]
async fn required_output_failure_keeps_input_files() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (inbox, out_dir) = (dir.path().join("in"), dir.path().join("out"));
    std::fs::create_dir_all(&inbox)?;
    std::fs::write(inbox.join("orders.csv"), "id,customer,total\n1,acme,120.5\n")?;

    let schema = Schema::of::<Order>()?;
    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    registry.register_input(
        "inbox",
        Arc::new(FileInput::new("inbox", &inbox, FilePattern::any(), FileFormat::csv(), schema.clone()).delete_after_read(true)),
    );
    registry.register_output(
        "export",
        Arc::new(FileOutput::new("export", &out_dir, FileFormat::csv(), schema).with_filename_pattern("{flow}.{ext}")),
    );
    registry.register_output("partner", Arc::new(MemoryOutput::failing("partner")));
    registry.register_flow(
        FlowDefinition::builder("orders")
            .input("inbox")
            .output("export")
            .output("partner")
            .build()?,
    );

    let result = engine.execute_flow("orders").await;
    assert_eq!(result.state, FlowState::Failed);
    assert!(result.partial);
    assert!(result.message.contains("partner"));
    let sent = result.send_result("partner").expect("partner result");
    assert_eq!(sent.metadata.get("error_kind").map(String::as_str), Some("send"));

    // input untouched, export file written by this run removed
    assert_eq!(file_names(&inbox), vec!["orders.csv"]);
    assert!(file_names(&out_dir).is_empty());

    let stats = engine.error_handler().stats("orders").expect("errors recorded");
    assert_eq!(stats.count_for(ErrorKind::Send), 1);
    Ok(())
}

#[tokio::test]
async fn optional_output_failure_completes_partially() -> Result<()> {
    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    let input = Arc::new(MemoryInput::new("in", vec![json!({"id": 1}), json!({"id": 2})]));
    let primary = Arc::new(MemoryOutput::new("primary"));
    registry.register_input("in", input.clone());
    registry.register_output("primary", primary.clone());
    registry.register_output("audit", Arc::new(MemoryOutput::failing("audit").optional()));
    registry.register_flow(
        FlowDefinition::builder("copy")
            .input("in")
            .output("primary")
            .output("audit")
            .build()?,
    );

    let result = engine.execute_flow("copy").await;
    assert_eq!(result.state, FlowState::Completed);
    assert!(result.success);
    assert!(result.partial);
    assert_eq!(primary.records().len(), 2);
    assert_eq!(input.acknowledged(), 1);
    assert_eq!(input.remaining(), 0);
    Ok(())
}

#[tokio::test]
async fn lenient_flow_counts_transformation_failures() -> Result<()> {
    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    let output = Arc::new(MemoryOutput::new("out"));
    registry.register_input(
        "in",
        Arc::new(MemoryInput::new(
            "in",
            vec![json!({"amount": "12"}), json!({"amount": "n/a"}), json!({"amount": "7"})],
        )),
    );
    registry.register_transformer(
        "parse",
        Arc::new(FnTransformer::new("parse", |mut record: Value| {
            let amount = record["amount"]
                .as_str()
                .and_then(|s| s.parse::<i64>().ok())
                .ok_or_else(|| integration_hub::IntegrationError::transformation("parse", "amount is not a number"))?;
            record["amount"] = json!(amount);
            Ok(Some(record))
        })),
    );
    registry.register_output("out", output.clone());
    registry.register_flow(
        FlowDefinition::builder("amounts")
            .input("in")
            .transformer("parse")
            .output("out")
            .fail_on_error(false)
            .build()?,
    );

    let result = engine.execute_flow("amounts").await;
    assert!(result.is_success());
    assert_eq!(result.records_read, 3);
    assert_eq!(result.records_processed, 2);
    assert_eq!(result.records_failed, 1);
    assert_eq!(output.records(), vec![json!({"amount": 12}), json!({"amount": 7})]);
    assert_eq!(engine.statistics().total_errors, 1);
    Ok(())
}

#[tokio::test]
async fn background_run_holds_concurrency_slot() -> Result<()> {
    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    let input = Arc::new(MemoryInput::new("in", vec![json!({"id": 1})]));
    registry.register_input("in", input.clone());
    registry.register_output(
        "slow",
        Arc::new(MemoryOutput::new("slow").with_delay(Duration::from_millis(300))),
    );
    registry.register_flow(FlowDefinition::builder("slow").input("in").output("slow").build()?);

    let handle = engine.execute_flow_async("slow");
    assert_eq!(handle.flow_name(), "slow");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(engine.is_running("slow"));
    assert_eq!(engine.running_flows().len(), 1);

    // a second run exceeds max_concurrent = 1
    let second = engine.execute_flow("slow").await;
    assert!(!second.success);
    assert!(second.message.contains("already running"));

    let first = handle.join().await;
    assert!(first.is_success());
    assert!(!engine.is_running("slow"));

    let stats = engine.statistics();
    assert_eq!(stats.total_executions, 2);
    assert_eq!(stats.successful_executions, 1);
    Ok(())
}

#[tokio::test]
async fn validate_flow_names_missing_components() -> Result<()> {
    let engine = IntegrationEngine::new();
    engine.registry().register_input("in", Arc::new(MemoryInput::new("in", Vec::new())));
    engine
        .registry()
        .register_flow(FlowDefinition::builder("broken").input("in").output("nowhere").build()?);

    let validation = engine.validate_flow("broken");
    assert!(!validation.is_valid());
    assert!(validation.errors.iter().any(|e| e.contains("nowhere")));

    let unknown = engine.validate_flow("unknown");
    assert!(!unknown.is_valid());
    assert!(unknown.errors.iter().any(|e| e.contains("flow definition not found: unknown")));

    let result = engine.execute_flow("broken").await;
    assert_eq!(result.state, FlowState::Failed);
    assert!(result.message.contains("nowhere"));
    Ok(())
}

#[tokio::test]
async fn flows_sharing_an_input_archive_each_file_once() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let (inbox, archive) = (dir.path().join("in"), dir.path().join("archive"));
    std::fs::create_dir_all(&inbox)?;
    for id in 1..=6 {
        std::fs::write(inbox.join(format!("orders-{}.csv", id)), format!("id,customer,total\n{},acme,{}\n", id, id))?;
    }

    let engine = IntegrationEngine::new();
    let registry = engine.registry();
    registry.register_input(
        "inbox",
        Arc::new(
            FileInput::new("inbox", &inbox, FilePattern::new("*.csv")?, FileFormat::csv(), Schema::of::<Order>()?)
                .with_archive_dir(&archive),
        ),
    );
    let (north, south) = (Arc::new(MemoryOutput::new("north")), Arc::new(MemoryOutput::new("south")));
    registry.register_output("north", north.clone());
    registry.register_output("south", south.clone());
    registry.register_flow(FlowDefinition::builder("north").input("inbox").output("north").build()?);
    registry.register_flow(FlowDefinition::builder("south").input("inbox").output("south").build()?);

    let results = engine.execute_all_flows().await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|r| r.is_success()), "{:?}", results);
    assert_eq!(north.records().len() + south.records().len(), 6);

    let mut ids: Vec<i64> = north
        .records()
        .iter()
        .chain(south.records().iter())
        .filter_map(|r| r["id"].as_i64())
        .collect();
    ids.sort();
    assert_eq!(ids, vec![1, 2, 3, 4, 5, 6]);
    assert!(file_names(&inbox).is_empty());
    assert_eq!(file_names(&archive).len(), 6);
    Ok(())
}
