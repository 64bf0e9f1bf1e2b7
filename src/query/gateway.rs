//! Bounded, cancellable execution of raw and compiled queries.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::engine::{Canceller, ParamValue, QueryEngine};
use super::ResultGrid;
use crate::codec::encode_row;
use crate::config::QuerySection;
use crate::error::{DataslotError, Result};

/// Normalizes raw query text and checks its shape: one statement, read-only
/// leading keyword. Returns the text to execute.
pub fn validate_raw_sql(query: &str) -> Result<String> {
    let normalized = query.trim().trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    if normalized.is_empty() {
        return Err(DataslotError::BadQuery("Query is empty"));
    }
    if normalized.contains(';') {
        return Err(DataslotError::BadQuery(
            "Only a single SQL statement is allowed",
        ));
    }
    let head = normalized.to_ascii_lowercase();
    if !(head.starts_with("select") || head.starts_with("with")) {
        return Err(DataslotError::BadQuery("Only SELECT/WITH queries are allowed"));
    }
    Ok(normalized.to_string())
}

/// Caller-facing budget after clamping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryLimits {
    /// Cell budget for the whole grid.
    pub max_cells: usize,
    /// Row ceiling before the cell budget applies.
    pub max_rows: usize,
}

impl QueryLimits {
    /// Applies defaults and clamps from `config` to caller-supplied values.
    pub fn resolve(max_cells: Option<i64>, max_rows: Option<i64>, config: &QuerySection) -> Self {
        let clamp = |value: Option<i64>, default: usize, lo: usize, hi: usize| match value {
            None => default.clamp(lo, hi),
            Some(v) if v < 0 => lo,
            Some(v) => usize::try_from(v).unwrap_or(hi).clamp(lo, hi),
        };
        Self {
            max_cells: clamp(
                max_cells,
                config.default_max_cells,
                config.min_max_cells,
                config.max_max_cells,
            ),
            max_rows: clamp(max_rows, config.default_max_rows, 1, config.hard_max_rows.max(1)),
        }
    }
}

/// Row limit derived from the probed column count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowBudget {
    /// Rows returned at most.
    pub limit: usize,
    /// Cell budget the limit was derived from.
    pub max_cells: usize,
}

impl RowBudget {
    /// `min(max_rows, max_cells / k)`, at least one, for `k` output columns.
    pub fn derive(columns: usize, limits: QueryLimits) -> Result<Self> {
        let k = columns.max(1);
        if k > limits.max_cells {
            return Err(DataslotError::TooManyColumns {
                columns: k,
                max_cells: limits.max_cells,
            });
        }
        let limit = limits.max_rows.min(limits.max_cells / k).max(1);
        Ok(Self {
            limit,
            max_cells: limits.max_cells,
        })
    }

    /// Message attached to truncated grids.
    pub fn note(&self) -> String {
        format!(
            "Results truncated to {} rows to stay under {} cells.",
            self.limit, self.max_cells
        )
    }
}

/// Statement plus bound parameters, ready for the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedQuery {
    /// SQL text of a single SELECT/WITH statement.
    pub sql: String,
    /// Positional parameters.
    pub params: Vec<ParamValue>,
}

impl PreparedQuery {
    /// Query without parameters.
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Probes the schema, derives the row budget, executes with one extra row,
/// and encodes the result. Runs on the calling thread.
pub fn run_to_completion(
    engine: &mut dyn QueryEngine,
    query: &PreparedQuery,
    limits: QueryLimits,
) -> Result<ResultGrid> {
    let probe = format!("SELECT * FROM ({}) AS q LIMIT 0", query.sql);
    let columns = engine.probe_schema(&probe, &query.params)?;
    let budget = RowBudget::derive(columns.len(), limits)?;
    debug!(
        columns = columns.len(),
        limit = budget.limit,
        max_cells = budget.max_cells,
        "query.gateway.budget"
    );

    let fetch = budget.limit + 1;
    let wrapped = format!("SELECT * FROM ({}) AS q LIMIT {fetch}", query.sql);
    let mut rows = engine.execute(&wrapped, &query.params, fetch)?;
    let truncated = rows.len() > budget.limit;
    rows.truncate(budget.limit);

    Ok(ResultGrid {
        columns,
        rows: rows.into_iter().map(encode_row).collect(),
        truncated,
        note: truncated.then(|| budget.note()),
    })
}

/// Cancellation state shared between the gateway and one running job.
///
/// Planning code polls [`CancelToken::is_cancelled`] while it loads data;
/// once the engine exists its canceller is armed here and fired on timeout.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<Mutex<CancelState>>,
}

#[derive(Default)]
struct CancelState {
    cancelled: bool,
    canceller: Option<Arc<dyn Canceller>>,
}

impl CancelToken {
    /// True once the gateway has given up on the job.
    pub fn is_cancelled(&self) -> bool {
        self.inner.lock().cancelled
    }

    /// Registers the engine's canceller. Returns false (and cancels at once)
    /// if the job was already abandoned.
    fn arm(&self, canceller: Arc<dyn Canceller>) -> bool {
        let mut state = self.inner.lock();
        if state.cancelled {
            canceller.cancel();
            return false;
        }
        state.canceller = Some(canceller);
        true
    }

    fn cancel(&self) {
        let mut state = self.inner.lock();
        state.cancelled = true;
        if let Some(canceller) = &state.canceller {
            canceller.cancel();
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Worker pool running queries under a wall-clock timeout.
#[derive(Debug, Clone)]
pub struct QueryGateway {
    permits: Arc<Semaphore>,
    timeout: Duration,
}

impl QueryGateway {
    /// Pool sized and timed by `config`.
    pub fn new(config: &QuerySection) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.workers.max(1))),
            timeout: config.timeout(),
        }
    }

    /// Configured timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Runs `plan` then the query it yields on a blocking worker.
    ///
    /// One deadline covers waiting for a worker, planning, and execution.
    /// `plan` opens the engine and produces the statement; it should stop
    /// early once the token reports cancellation. Failures there
    /// (validation, loading) are returned as-is. When the deadline passes
    /// first, the job is cancelled and [`DataslotError::QueryTimeout`] is
    /// returned; the worker permit is released once the job unwinds.
    pub async fn execute<F>(&self, limits: QueryLimits, plan: F) -> Result<ResultGrid>
    where
        F: FnOnce(&CancelToken) -> Result<(Box<dyn QueryEngine>, PreparedQuery)> + Send + 'static,
    {
        let deadline = Instant::now() + self.timeout;
        let permit = match tokio::time::timeout_at(
            deadline,
            Arc::clone(&self.permits).acquire_owned(),
        )
        .await
        {
            Ok(permit) => permit
                .map_err(|err| DataslotError::Internal(format!("query workers closed: {err}")))?,
            Err(_) => {
                warn!(
                    timeout_ms = self.timeout.as_millis() as u64,
                    "query.gateway.queue_timeout"
                );
                return Err(self.timed_out());
            }
        };

        let token = CancelToken::default();
        let job_token = token.clone();
        let job = task::spawn_blocking(move || {
            let _permit = permit;
            let (mut engine, query) = plan(&job_token)?;
            if !job_token.arm(engine.canceller()) {
                return Err(DataslotError::Internal("query abandoned".into()));
            }
            run_to_completion(engine.as_mut(), &query, limits)
        });

        match tokio::time::timeout_at(deadline, job).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(DataslotError::Internal(format!("query worker failed: {join}"))),
            Err(_) => {
                token.cancel();
                warn!(timeout_ms = self.timeout.as_millis() as u64, "query.gateway.timeout");
                Err(self.timed_out())
            }
        }
    }

    fn timed_out(&self) -> DataslotError {
        DataslotError::QueryTimeout {
            seconds: self.timeout.as_secs_f64(),
        }
    }
}
