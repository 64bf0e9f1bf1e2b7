//! Declarative pipeline steps and their validation errors.

use std::fmt;

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// One pipeline step, tagged by its `op` field.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Step {
    /// Starts the pipeline from a bound table.
    Source {
        /// Table name (`t1`, `t2`, `t3`).
        table: String,
    },
    /// Projects onto the listed columns, in order.
    Select {
        /// Columns to keep.
        columns: Vec<String>,
    },
    /// Keeps rows matching every condition.
    Filter {
        /// Conjunction of comparisons.
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    /// Joins the running result with another table.
    #[serde(alias = "join")]
    Merge(Merge),
    /// Groups rows and computes named aggregates.
    #[serde(rename = "groupby")]
    GroupBy {
        /// Grouping columns.
        by: Vec<String>,
        /// Aggregates appended after the grouping columns.
        #[serde(default)]
        aggs: Vec<Aggregate>,
    },
    /// Orders rows.
    Sort {
        /// Sort keys, most significant first.
        by: Vec<String>,
        /// Direction per key; padded with `true` or truncated to `by`.
        #[serde(default)]
        ascending: Vec<bool>,
    },
    /// Caps the row count.
    Limit {
        /// Requested row count.
        n: i64,
    },
}

impl Step {
    /// Tag as written by callers.
    pub fn op(&self) -> &'static str {
        match self {
            Step::Source { .. } => "source",
            Step::Select { .. } => "select",
            Step::Filter { .. } => "filter",
            Step::Merge(_) => "merge",
            Step::GroupBy { .. } => "groupby",
            Step::Sort { .. } => "sort",
            Step::Limit { .. } => "limit",
        }
    }
}

const KNOWN_OPS: &[&str] = &[
    "source", "select", "filter", "merge", "join", "groupby", "sort", "limit",
];

/// One `column <cmp> value` test.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Condition {
    /// Column under test.
    pub column: String,
    /// Comparison operator.
    pub cmp: Comparator,
    /// JSON scalar compared against; `null` allows only `==` and `!=`.
    #[serde(default)]
    pub value: Value,
}

/// Comparison operators accepted by `filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Comparator {
    /// Equal.
    #[serde(rename = "==")]
    Eq,
    /// Not equal.
    #[serde(rename = "!=")]
    Ne,
    /// Less than.
    #[serde(rename = "<")]
    Lt,
    /// Less than or equal.
    #[serde(rename = "<=")]
    Le,
    /// Greater than.
    #[serde(rename = ">")]
    Gt,
    /// Greater than or equal.
    #[serde(rename = ">=")]
    Ge,
}

impl Comparator {
    /// SQL spelling.
    pub fn sql(self) -> &'static str {
        match self {
            Comparator::Eq => "=",
            Comparator::Ne => "<>",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        }
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Comparator::Eq => "==",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
        };
        f.write_str(text)
    }
}

/// Parameters of a `merge` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Merge {
    /// Table joined on the right.
    pub right_table: String,
    /// Join kind.
    #[serde(default)]
    pub how: JoinKind,
    /// Key columns of the running result.
    pub left_on: Vec<String>,
    /// Key columns of the right table, paired positionally.
    pub right_on: Vec<String>,
}

/// Join kinds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinKind {
    /// Matching rows only.
    #[default]
    Inner,
    /// Every left row.
    Left,
    /// Every right row.
    Right,
    /// Every row from both sides.
    Outer,
}

impl JoinKind {
    /// SQL join keyword.
    pub fn sql(self) -> &'static str {
        match self {
            JoinKind::Inner => "INNER JOIN",
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Right => "RIGHT JOIN",
            JoinKind::Outer => "FULL OUTER JOIN",
        }
    }

    /// True when rows may come from the right side alone.
    pub fn keeps_unmatched_right(self) -> bool {
        matches!(self, JoinKind::Right | JoinKind::Outer)
    }
}

/// One aggregate of a `groupby` step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregate {
    /// Input column, or `*` for `count`.
    pub column: String,
    /// Aggregate function.
    #[serde(rename = "fn")]
    pub func: AggFn,
    /// Output column name.
    #[serde(rename = "as", default)]
    pub alias: String,
}

/// Aggregate functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFn {
    /// Sum.
    Sum,
    /// Arithmetic mean.
    Avg,
    /// Row or non-null count.
    Count,
    /// Minimum.
    Min,
    /// Maximum.
    Max,
}

impl AggFn {
    /// SQL function name.
    pub fn sql(self) -> &'static str {
        match self {
            AggFn::Sum => "SUM",
            AggFn::Avg => "AVG",
            AggFn::Count => "COUNT",
            AggFn::Min => "MIN",
            AggFn::Max => "MAX",
        }
    }
}

impl fmt::Display for AggFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql().to_ascii_lowercase())
    }
}

/// A pipeline rejected before execution, naming the offending step.
#[derive(Debug, Error)]
#[error("step {step} ({op}): {reason}")]
pub struct PipelineError {
    /// Zero-based index of the step.
    pub step: usize,
    /// Tag of the step, as supplied.
    pub op: String,
    /// What was wrong.
    #[source]
    pub reason: StepError,
}

impl PipelineError {
    pub(crate) fn new(step: usize, op: impl Into<String>, reason: StepError) -> Self {
        Self {
            step,
            op: op.into(),
            reason,
        }
    }
}

/// Reasons a step fails validation.
#[derive(Debug, Error, PartialEq)]
pub enum StepError {
    /// The pipeline has no steps.
    #[error("pipeline has no steps")]
    Empty,
    /// The first step is not `source`.
    #[error("the first step must be 'source'")]
    MissingSource,
    /// `source` appeared after the first step.
    #[error("'source' is only allowed as the first step")]
    SourceNotFirst,
    /// Unrecognized tag.
    #[error("unknown op '{0}'")]
    UnknownOp(String),
    /// Step JSON did not match the op's shape.
    #[error("{0}")]
    Malformed(String),
    /// Table not bound in the workspace.
    #[error("unknown table '{0}'")]
    UnknownTable(String),
    /// Column not in the current schema.
    #[error("unknown column '{0}'")]
    UnknownColumn(String),
    /// A list parameter that must be non-empty was empty.
    #[error("'{0}' must not be empty")]
    EmptyList(&'static str),
    /// An output column name would repeat.
    #[error("duplicate output column '{0}'")]
    DuplicateColumn(String),
    /// `left_on` and `right_on` differ in length.
    #[error("left_on has {left} keys but right_on has {right}")]
    KeyLengthMismatch {
        /// Left key count.
        left: usize,
        /// Right key count.
        right: usize,
    },
    /// Ordering comparison against `null`.
    #[error("'{0}' cannot compare against null; use '==' or '!='")]
    NullComparison(Comparator),
    /// Filter value is an array or object.
    #[error("filter value for '{0}' must be a scalar")]
    NonScalarValue(String),
    /// Aggregate without an output name.
    #[error("aggregate '{0}' needs a non-empty 'as' name")]
    MissingAlias(AggFn),
    /// `*` used with something other than `count`.
    #[error("'*' is only valid with count, not {0}")]
    StarAggregate(AggFn),
    /// `limit` below one.
    #[error("limit must be a positive integer (got {0})")]
    NonPositiveLimit(i64),
}

/// Parses raw JSON steps one at a time so a failure names its index.
pub fn parse_steps(values: &[Value]) -> Result<Vec<Step>, PipelineError> {
    values
        .iter()
        .enumerate()
        .map(|(idx, value)| parse_step(idx, value))
        .collect()
}

fn parse_step(idx: usize, value: &Value) -> Result<Step, PipelineError> {
    let op = value.get("op").and_then(Value::as_str);
    match op {
        None => Err(PipelineError::new(
            idx,
            "?",
            StepError::Malformed("step must be an object with a string 'op'".into()),
        )),
        Some(op) if !KNOWN_OPS.contains(&op) => Err(PipelineError::new(
            idx,
            op,
            StepError::UnknownOp(op.to_string()),
        )),
        Some(op) => Step::deserialize(value)
            .map_err(|err| PipelineError::new(idx, op, StepError::Malformed(err.to_string()))),
    }
}
