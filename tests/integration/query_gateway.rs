#![allow(missing_docs)]

use std::sync::Arc;

use dataslot::codec::Cell;
use dataslot::config::{LimitsSection, QuerySection};
use dataslot::query::{OpsRequest, QueryEngine, QueryService, SqlRequest, SqliteEngine};
use dataslot::registry::Workspace;
use serde_json::{json, Value};
use tempfile::{tempdir, TempDir};

const LEFT: &[u8] = b"id,a\n1,10\n2,20\n3,30\n";
const RIGHT: &[u8] = b"id,b\n1,100\n3,300\n4,400\n";

struct Fixture {
    _dir: TempDir,
    workspace: Arc<Workspace>,
}

impl Fixture {
    fn new(uploads: &[(&str, &[u8])]) -> Self {
        let dir = tempdir().expect("tempdir");
        let workspace =
            Workspace::with_root(dir.path(), LimitsSection::default(), 4).expect("workspace");
        for (name, bytes) in uploads {
            workspace.register_or_reuse(name, bytes).expect("upload");
        }
        Self {
            _dir: dir,
            workspace: Arc::new(workspace),
        }
    }

    fn service(&self, config: &QuerySection) -> QueryService {
        QueryService::new(Arc::clone(&self.workspace), config)
    }
}

fn sql(query: &str) -> SqlRequest {
    SqlRequest {
        query: query.to_string(),
        ..SqlRequest::default()
    }
}

fn ops(steps: Value) -> OpsRequest {
    let Value::Array(steps) = steps else {
        panic!("steps must be an array");
    };
    OpsRequest {
        steps,
        ..OpsRequest::default()
    }
}

fn ints(rows: &[&[i64]]) -> Vec<Vec<Cell>> {
    rows.iter()
        .map(|row| row.iter().map(|v| Cell::Int(*v)).collect())
        .collect()
}

#[tokio::test]
async fn pipeline_join_elides_the_shared_key() {
    let fixture = Fixture::new(&[("left.csv", LEFT), ("right.csv", RIGHT)]);
    let service = fixture.service(&QuerySection::default());

    let grid = service
        .ops(ops(json!([
            {"op": "source", "table": "t1"},
            {"op": "merge", "right_table": "t2", "how": "inner", "left_on": ["id"], "right_on": ["id"]},
            {"op": "sort", "by": ["id"]}
        ])))
        .await
        .unwrap();

    assert_eq!(grid.columns, vec!["id", "a", "b"]);
    assert_eq!(grid.rows, ints(&[&[1, 10, 100], &[3, 30, 300]]));
    assert!(!grid.truncated);
    assert!(grid.note.is_none());
}

#[tokio::test]
async fn outer_join_keeps_right_only_keys() {
    let fixture = Fixture::new(&[("left.csv", LEFT), ("right.csv", RIGHT)]);
    let service = fixture.service(&QuerySection::default());

    let grid = service
        .ops(ops(json!([
            {"op": "source", "table": "t1"},
            {"op": "merge", "right_table": "t2", "how": "outer", "left_on": ["id"], "right_on": ["id"]},
            {"op": "sort", "by": ["id"]}
        ])))
        .await
        .unwrap();

    assert_eq!(grid.rows.len(), 4);
    assert_eq!(grid.rows[1], vec![Cell::Int(2), Cell::Int(20), Cell::Null]);
    assert_eq!(grid.rows[3], vec![Cell::Int(4), Cell::Null, Cell::Int(400)]);
}

#[tokio::test]
async fn filter_groupby_and_limit_compose() {
    let data = b"g,v\nx,1\nx,2\ny,5\ny,\nz,9\n";
    let fixture = Fixture::new(&[("g.csv", data)]);
    let service = fixture.service(&QuerySection::default());

    let grid = service
        .ops(ops(json!([
            {"op": "source", "table": "t1"},
            {"op": "filter", "conditions": [{"column": "g", "cmp": "!=", "value": "z"}]},
            {"op": "groupby", "by": ["g"], "aggs": [
                {"column": "*", "fn": "count", "as": "rows"},
                {"column": "v", "fn": "sum", "as": "total"}
            ]},
            {"op": "sort", "by": ["total"], "ascending": [false]},
            {"op": "limit", "n": 1}
        ])))
        .await
        .unwrap();

    assert_eq!(grid.columns, vec!["g", "rows", "total"]);
    assert_eq!(
        grid.rows,
        vec![vec![Cell::Text("y".into()), Cell::Int(2), Cell::Int(5)]]
    );

    let nulls = service
        .ops(ops(json!([
            {"op": "source", "table": "t1"},
            {"op": "filter", "conditions": [{"column": "v", "cmp": "==", "value": null}]},
            {"op": "select", "columns": ["g"]}
        ])))
        .await
        .unwrap();
    assert_eq!(nulls.rows, vec![vec![Cell::Text("y".into())]]);
}

#[tokio::test]
async fn raw_sql_matches_the_pipeline_join() {
    let fixture = Fixture::new(&[("left.csv", LEFT), ("right.csv", RIGHT)]);
    let service = fixture.service(&QuerySection::default());

    let grid = service
        .sql(sql(
            "select t1.id, a, b from t1 join t2 on t1.id = t2.id order by t1.id;",
        ))
        .await
        .unwrap();
    assert_eq!(grid.columns, vec!["id", "a", "b"]);
    assert_eq!(grid.rows, ints(&[&[1, 10, 100], &[3, 30, 300]]));
}

#[tokio::test]
async fn truncation_is_flagged_with_a_note() {
    let mut csv = String::from("n\n");
    for n in 0..10 {
        csv.push_str(&format!("{n}\n"));
    }
    let fixture = Fixture::new(&[("ten.csv", csv.as_bytes())]);
    let service = fixture.service(&QuerySection::default());

    let grid = service
        .sql(SqlRequest {
            max_rows: Some(3),
            ..sql("SELECT n FROM t1 ORDER BY n")
        })
        .await
        .unwrap();
    assert_eq!(grid.rows, ints(&[&[0], &[1], &[2]]));
    assert!(grid.truncated);
    assert_eq!(
        grid.note.as_deref(),
        Some("Results truncated to 3 rows to stay under 20000 cells.")
    );

    let piped = service
        .ops(OpsRequest {
            max_rows: Some(3),
            ..ops(json!([{"op": "source", "table": "t1"}]))
        })
        .await
        .unwrap();
    assert_eq!(piped.rows.len(), 3);
    assert!(piped.truncated);
    assert!(piped.note.is_some());
}

#[tokio::test]
async fn invalid_pipelines_fail_before_execution() {
    let fixture = Fixture::new(&[("left.csv", LEFT)]);
    let service = fixture.service(&QuerySection::default());

    let err = service
        .ops(ops(json!([
            {"op": "source", "table": "t1"},
            {"op": "filter", "conditions": [{"column": "missing", "cmp": "==", "value": 1}]}
        ])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OPS_VALIDATION_ERROR");
    assert_eq!(err.to_string(), "step 1 (filter): unknown column 'missing'");

    let err = service
        .ops(ops(json!([{"op": "source", "table": "t2"}])))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "OPS_VALIDATION_ERROR");
}

#[tokio::test]
async fn raw_sql_error_codes() {
    let empty = Fixture::new(&[]);
    let service = empty.service(&QuerySection::default());
    assert_eq!(service.sql(sql("SELECT 1")).await.unwrap_err().code(), "NO_DATASETS");
    assert_eq!(service.sql(sql("   ")).await.unwrap_err().code(), "BAD_SQL");

    let fixture = Fixture::new(&[("left.csv", LEFT)]);
    let service = fixture.service(&QuerySection::default());
    assert_eq!(service.sql(sql("DELETE FROM t1")).await.unwrap_err().code(), "BAD_SQL");
    assert_eq!(
        service.sql(sql("SELECT 1; SELECT 2")).await.unwrap_err().code(),
        "BAD_SQL"
    );

    let err = service.sql(sql("SELECT * FROM t9")).await.unwrap_err();
    assert_eq!(err.code(), "SQL_ERROR");
    assert!(err.to_string().contains("t9"));
}

#[tokio::test]
async fn wide_results_exceed_the_cell_budget() {
    let header: Vec<String> = (0..1_001).map(|i| format!("c{i}")).collect();
    let row: Vec<String> = (0..1_001).map(|i| i.to_string()).collect();
    let csv = format!("{}\n{}\n", header.join(","), row.join(","));
    let fixture = Fixture::new(&[("wide.csv", csv.as_bytes())]);
    let service = fixture.service(&QuerySection::default());

    let err = service
        .sql(SqlRequest {
            max_cells: Some(1_000),
            ..sql("SELECT * FROM t1")
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOO_MANY_COLUMNS");

    let grid = service.sql(sql("SELECT * FROM t1")).await.unwrap();
    assert_eq!(grid.columns.len(), 1_001);
    assert_eq!(grid.rows.len(), 1);
}

#[tokio::test]
async fn runaway_queries_time_out_and_release_the_worker() {
    let fixture = Fixture::new(&[("left.csv", LEFT)]);
    let config = QuerySection {
        timeout_ms: 200,
        workers: 1,
        ..QuerySection::default()
    };
    let service = fixture.service(&config);

    let err = service
        .sql(sql(
            "WITH RECURSIVE r(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM r) SELECT count(*) FROM r",
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SQL_TIMEOUT");
    assert_eq!(err.status(), 408);

    let grid = service.sql(sql("SELECT count(*) AS n FROM t1")).await.unwrap();
    assert_eq!(grid.rows, ints(&[&[3]]));
}

#[test]
fn table_loading_stops_once_cancelled() {
    let fixture = Fixture::new(&[("left.csv", LEFT), ("right.csv", RIGHT)]);
    let tables = fixture.workspace.bound_tables().expect("tables");

    let Err(err) = SqliteEngine::with_tables(&tables, || true) else {
        panic!("loading should stop when cancelled");
    };
    assert_eq!(err.code(), "INTERNAL");

    let mut engine = SqliteEngine::with_tables(&tables, || false).expect("engine");
    let columns = engine
        .probe_schema("SELECT * FROM t1 JOIN t2 USING (id)", &[])
        .expect("probe");
    assert_eq!(columns, vec!["id", "a", "b"]);
}
