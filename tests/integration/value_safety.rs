#![allow(missing_docs)]

use std::sync::Arc;

use arrow::array::{
    ArrayRef, BinaryArray, BooleanArray, Date32Array, Float64Array, Int64Array, StringArray,
    TimestampMicrosecondArray,
};
use arrow::record_batch::RecordBatch;
use dataslot::codec::Cell;
use dataslot::config::{LimitsSection, QuerySection};
use dataslot::query::{QueryService, SqlRequest};
use dataslot::registry::Workspace;
use dataslot::storage::ChunkRequest;
use parquet::arrow::ArrowWriter;
use proptest::prelude::*;
use serde_json::Value;
use tempfile::tempdir;

#[derive(Debug, Clone)]
struct Row {
    float: Option<f64>,
    int: Option<i64>,
    flag: Option<bool>,
    text: Option<String>,
    blob: Option<Vec<u8>>,
    day: Option<i32>,
    micros: Option<i64>,
}

fn float_strategy() -> impl Strategy<Value = Option<f64>> {
    prop_oneof![
        Just(Some(f64::NAN)),
        Just(Some(f64::INFINITY)),
        Just(Some(f64::NEG_INFINITY)),
        Just(None),
        any::<f64>().prop_map(Some),
    ]
}

fn row_strategy() -> impl Strategy<Value = Row> {
    (
        float_strategy(),
        proptest::option::of(any::<i64>()),
        proptest::option::of(any::<bool>()),
        proptest::option::of("[a-zA-Z0-9 ,;\"]{0,12}"),
        proptest::option::of(proptest::collection::vec(any::<u8>(), 0..8)),
        proptest::option::of(-200_000i32..200_000),
        proptest::option::of(-4_000_000_000_000_000i64..4_000_000_000_000_000),
    )
        .prop_map(|(float, int, flag, text, blob, day, micros)| Row {
            float,
            int,
            flag,
            text,
            blob,
            day,
            micros,
        })
}

fn parquet_bytes(rows: &[Row]) -> Vec<u8> {
    let columns: Vec<(&str, ArrayRef)> = vec![
        (
            "float",
            Arc::new(rows.iter().map(|r| r.float).collect::<Float64Array>()),
        ),
        (
            "int",
            Arc::new(rows.iter().map(|r| r.int).collect::<Int64Array>()),
        ),
        (
            "flag",
            Arc::new(rows.iter().map(|r| r.flag).collect::<BooleanArray>()),
        ),
        (
            "text",
            Arc::new(rows.iter().map(|r| r.text.as_deref()).collect::<StringArray>()),
        ),
        (
            "blob",
            Arc::new(BinaryArray::from_iter(rows.iter().map(|r| r.blob.as_deref()))),
        ),
        (
            "day",
            Arc::new(rows.iter().map(|r| r.day).collect::<Date32Array>()),
        ),
        (
            "stamp",
            Arc::new(
                rows.iter()
                    .map(|r| r.micros)
                    .collect::<TimestampMicrosecondArray>()
                    .with_timezone("UTC"),
            ),
        ),
    ];
    let batch = RecordBatch::try_from_iter(columns).expect("batch");
    let mut out = Vec::new();
    let mut writer = ArrowWriter::try_new(&mut out, batch.schema(), None).expect("writer");
    writer.write(&batch).expect("write");
    writer.close().expect("close");
    out
}

fn assert_safe(rows: &[Vec<Cell>], width: usize) {
    for row in rows {
        assert_eq!(row.len(), width);
        for cell in row {
            assert!(cell.is_json_safe(), "unsafe cell {cell:?}");
            let json = serde_json::to_value(cell).expect("cell serializes");
            assert!(
                matches!(json, Value::Null | Value::Bool(_) | Value::Number(_) | Value::String(_)),
                "unexpected json shape {json}"
            );
            if let Value::Number(n) = &json {
                assert!(n.as_f64().is_some_and(f64::is_finite));
            }
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn every_emitted_cell_is_json_safe(rows in proptest::collection::vec(row_strategy(), 1..12)) {
        let dir = tempdir().unwrap();
        let workspace = Arc::new(
            Workspace::with_root(dir.path(), LimitsSection::default(), 5).unwrap(),
        );
        let upload = workspace
            .register_or_reuse("generated.parquet", &parquet_bytes(&rows))
            .unwrap();
        let id = upload.dataset.dataset_id;
        prop_assert_eq!(upload.dataset.n_rows, rows.len());

        let chunk = workspace
            .chunk(&id, ChunkRequest { n_rows: 100, ..ChunkRequest::default() })
            .unwrap();
        prop_assert_eq!(chunk.rows.len(), rows.len());
        assert_safe(&chunk.rows, 7);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let service = QueryService::new(Arc::clone(&workspace), &QuerySection::default());
        let grid = runtime
            .block_on(service.sql(SqlRequest {
                query: "SELECT *, float * 2 AS doubled FROM t1".into(),
                ..SqlRequest::default()
            }))
            .unwrap();
        prop_assert_eq!(grid.rows.len(), rows.len());
        assert_safe(&grid.rows, 8);
    }
}

#[test]
fn special_floats_surface_as_null() {
    let rows = vec![
        Row {
            float: Some(f64::NAN),
            int: None,
            flag: Some(true),
            text: None,
            blob: Some(vec![0xff, 0x41]),
            day: Some(19_782),
            micros: Some(1_709_164_800_000_000),
        },
        Row {
            float: Some(f64::INFINITY),
            int: Some(7),
            flag: None,
            text: Some("ok".into()),
            blob: None,
            day: None,
            micros: None,
        },
    ];
    let dir = tempdir().unwrap();
    let workspace = Workspace::with_root(dir.path(), LimitsSection::default(), 5).unwrap();
    let id = workspace
        .register_or_reuse("special.parquet", &parquet_bytes(&rows))
        .unwrap()
        .dataset
        .dataset_id;

    let chunk = workspace.chunk(&id, ChunkRequest::default()).unwrap();
    assert_eq!(chunk.columns, vec!["float", "int", "flag", "text", "blob", "day", "stamp"]);
    assert_eq!(chunk.rows[0][0], Cell::Null);
    assert_eq!(chunk.rows[1][0], Cell::Null);
    assert_eq!(chunk.rows[0][2], Cell::Bool(true));
    assert_eq!(chunk.rows[0][4], Cell::Text("\u{fffd}A".into()));
    assert_eq!(chunk.rows[0][5], Cell::Text("2024-02-29".into()));
    assert_eq!(chunk.rows[0][6], Cell::Text("2024-02-29T00:00:00+00:00".into()));
    assert_eq!(chunk.rows[1][1], Cell::Int(7));
}
