//! Compiles validated pipeline steps into one SQL statement.
//!
//! Each step becomes a named stage `sN` of a `WITH` chain reading from the
//! stage before it. The compiler tracks the ordered column list after every
//! step and validates each step against it before emitting SQL, so nothing
//! reaches the engine unless the whole pipeline checks out.

use std::collections::{BTreeMap, HashSet};

use serde_json::Value;
use tracing::debug;

use super::engine::ParamValue;
use super::pipeline::{
    AggFn, Aggregate, Comparator, Condition, Merge, PipelineError, Step, StepError,
};

/// Compiled pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Single `WITH ... SELECT` statement.
    pub sql: String,
    /// Positional parameters, bound as `?1`, `?2`, …
    pub params: Vec<ParamValue>,
    /// Output columns, in order.
    pub columns: Vec<String>,
}

/// Quotes an identifier for SQL, doubling embedded quotes.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Validates `steps` against `tables` (table name to column list) and
/// compiles them. `limit` steps are capped at `limit_ceiling`.
pub fn compile(
    steps: &[Step],
    tables: &BTreeMap<String, Vec<String>>,
    limit_ceiling: u64,
) -> Result<CompiledQuery, PipelineError> {
    let Some((first, rest)) = steps.split_first() else {
        return Err(PipelineError::new(0, "?", StepError::Empty));
    };
    let Step::Source { table } = first else {
        return Err(PipelineError::new(0, first.op(), StepError::MissingSource));
    };

    let mut state = Compiler {
        tables,
        limit_ceiling,
        stages: Vec::with_capacity(steps.len()),
        params: Vec::new(),
        columns: Vec::new(),
        order: None,
    };
    state.source(table).map_err(|reason| PipelineError::new(0, "source", reason))?;
    for (offset, step) in rest.iter().enumerate() {
        let idx = offset + 1;
        state
            .step(step)
            .map_err(|reason| PipelineError::new(idx, step.op(), reason))?;
    }

    let last = format!("s{}", state.stages.len() - 1);
    let mut sql = String::from("WITH ");
    for (idx, stage) in state.stages.iter().enumerate() {
        if idx > 0 {
            sql.push_str(", ");
        }
        sql.push_str(&format!("s{idx} AS ({stage})"));
    }
    sql.push_str(&format!(" SELECT * FROM {last}"));
    if let Some(order) = &state.order {
        sql.push_str(&order.clause());
    }
    debug!(
        steps = steps.len(),
        params = state.params.len(),
        columns = state.columns.len(),
        "query.pipeline.compiled"
    );
    Ok(CompiledQuery {
        sql,
        params: state.params,
        columns: state.columns,
    })
}

/// Parses raw JSON steps and compiles them.
pub fn compile_json(
    steps: &[Value],
    tables: &BTreeMap<String, Vec<String>>,
    limit_ceiling: u64,
) -> Result<CompiledQuery, PipelineError> {
    let steps = super::pipeline::parse_steps(steps)?;
    compile(&steps, tables, limit_ceiling)
}

/// Ordering established by a `sort` step, carried forward while its keys
/// survive.
#[derive(Debug, Clone)]
struct Ordering {
    keys: Vec<(String, bool)>,
}

impl Ordering {
    fn clause(&self) -> String {
        let keys: Vec<String> = self
            .keys
            .iter()
            .map(|(col, asc)| {
                let direction = if *asc { "ASC" } else { "DESC" };
                format!("{} {direction}", quote_ident(col))
            })
            .collect();
        format!(" ORDER BY {}", keys.join(", "))
    }

    fn survives(&self, columns: &[String]) -> bool {
        self.keys.iter().all(|(col, _)| columns.contains(col))
    }
}

struct Compiler<'a> {
    tables: &'a BTreeMap<String, Vec<String>>,
    limit_ceiling: u64,
    stages: Vec<String>,
    params: Vec<ParamValue>,
    columns: Vec<String>,
    order: Option<Ordering>,
}

type StepResult = Result<(), StepError>;

impl Compiler<'_> {
    fn step(&mut self, step: &Step) -> StepResult {
        match step {
            Step::Source { .. } => Err(StepError::SourceNotFirst),
            Step::Select { columns } => self.select(columns),
            Step::Filter { conditions } => self.filter(conditions),
            Step::Merge(merge) => self.merge(merge),
            Step::GroupBy { by, aggs } => self.group_by(by, aggs),
            Step::Sort { by, ascending } => self.sort(by, ascending),
            Step::Limit { n } => self.limit(*n),
        }
    }

    fn prev(&self) -> String {
        format!("s{}", self.stages.len() - 1)
    }

    fn require(&self, column: &str) -> StepResult {
        if self.columns.iter().any(|c| c == column) {
            Ok(())
        } else {
            Err(StepError::UnknownColumn(column.to_string()))
        }
    }

    /// Ordering clause to re-apply on a stage that keeps rows in place.
    fn carried_order(&self) -> String {
        self.order
            .as_ref()
            .map(Ordering::clause)
            .unwrap_or_default()
    }

    fn source(&mut self, table: &str) -> StepResult {
        let columns = self
            .tables
            .get(table)
            .ok_or_else(|| StepError::UnknownTable(table.to_string()))?;
        self.stages
            .push(format!("SELECT {} FROM {}", column_list(columns), quote_ident(table)));
        self.columns = columns.clone();
        Ok(())
    }

    fn select(&mut self, columns: &[String]) -> StepResult {
        if columns.is_empty() {
            return Err(StepError::EmptyList("columns"));
        }
        let mut seen = HashSet::new();
        for column in columns {
            self.require(column)?;
            if !seen.insert(column.as_str()) {
                return Err(StepError::DuplicateColumn(column.clone()));
            }
        }
        if self.order.as_ref().is_some_and(|o| !o.survives(columns)) {
            self.order = None;
        }
        let stage = format!(
            "SELECT {} FROM {}{}",
            column_list(columns),
            self.prev(),
            self.carried_order()
        );
        self.stages.push(stage);
        self.columns = columns.to_vec();
        Ok(())
    }

    fn filter(&mut self, conditions: &[Condition]) -> StepResult {
        let mut predicates = Vec::with_capacity(conditions.len());
        for condition in conditions {
            self.require(&condition.column)?;
            predicates.push(self.predicate(condition)?);
        }
        let mut stage = format!("SELECT * FROM {}", self.prev());
        if !predicates.is_empty() {
            stage.push_str(" WHERE ");
            stage.push_str(&predicates.join(" AND "));
        }
        stage.push_str(&self.carried_order());
        self.stages.push(stage);
        Ok(())
    }

    fn predicate(&mut self, condition: &Condition) -> Result<String, StepError> {
        let column = quote_ident(&condition.column);
        let param = match &condition.value {
            Value::Null => {
                return match condition.cmp {
                    Comparator::Eq => Ok(format!("{column} IS NULL")),
                    Comparator::Ne => Ok(format!("{column} IS NOT NULL")),
                    other => Err(StepError::NullComparison(other)),
                };
            }
            Value::Bool(v) => ParamValue::Bool(*v),
            Value::Number(n) => match n.as_i64() {
                Some(v) => ParamValue::Int(v),
                None => ParamValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Value::String(s) => ParamValue::Text(s.clone()),
            Value::Array(_) | Value::Object(_) => {
                return Err(StepError::NonScalarValue(condition.column.clone()));
            }
        };
        self.params.push(param);
        Ok(format!(
            "{column} {} ?{}",
            condition.cmp.sql(),
            self.params.len()
        ))
    }

    fn merge(&mut self, merge: &Merge) -> StepResult {
        if merge.left_on.is_empty() {
            return Err(StepError::EmptyList("left_on"));
        }
        if merge.right_on.is_empty() {
            return Err(StepError::EmptyList("right_on"));
        }
        if merge.left_on.len() != merge.right_on.len() {
            return Err(StepError::KeyLengthMismatch {
                left: merge.left_on.len(),
                right: merge.right_on.len(),
            });
        }
        let right_columns = self
            .tables
            .get(&merge.right_table)
            .ok_or_else(|| StepError::UnknownTable(merge.right_table.clone()))?;
        for key in &merge.left_on {
            self.require(key)?;
        }
        for key in &merge.right_on {
            if !right_columns.contains(key) {
                return Err(StepError::UnknownColumn(key.clone()));
            }
        }

        // Right keys named like their paired left key are not emitted twice.
        let shared: HashSet<&str> = merge
            .left_on
            .iter()
            .zip(&merge.right_on)
            .filter(|(l, r)| l == r)
            .map(|(_, r)| r.as_str())
            .collect();

        let mut projections = Vec::new();
        let mut output: Vec<String> = Vec::new();
        for column in &self.columns {
            let left = format!("l.{}", quote_ident(column));
            let expr = if merge.how.keeps_unmatched_right() && shared.contains(column.as_str()) {
                format!("COALESCE({left}, r.{})", quote_ident(column))
            } else {
                left
            };
            projections.push(format!("{expr} AS {}", quote_ident(column)));
            output.push(column.clone());
        }
        for column in right_columns {
            if shared.contains(column.as_str()) {
                continue;
            }
            let name = unique_right_name(column, &output);
            projections.push(format!("r.{} AS {}", quote_ident(column), quote_ident(&name)));
            output.push(name);
        }

        let on: Vec<String> = merge
            .left_on
            .iter()
            .zip(&merge.right_on)
            .map(|(l, r)| format!("l.{} = r.{}", quote_ident(l), quote_ident(r)))
            .collect();
        let stage = format!(
            "SELECT {} FROM {} AS l {} {} AS r ON {}",
            projections.join(", "),
            self.prev(),
            merge.how.sql(),
            quote_ident(&merge.right_table),
            on.join(" AND ")
        );
        self.stages.push(stage);
        self.columns = output;
        self.order = None;
        Ok(())
    }

    fn group_by(&mut self, by: &[String], aggs: &[Aggregate]) -> StepResult {
        if by.is_empty() {
            return Err(StepError::EmptyList("by"));
        }
        let mut output: Vec<String> = Vec::with_capacity(by.len() + aggs.len());
        for column in by {
            self.require(column)?;
            if output.contains(column) {
                return Err(StepError::DuplicateColumn(column.clone()));
            }
            output.push(column.clone());
        }

        let mut projections: Vec<String> = by.iter().map(|c| quote_ident(c)).collect();
        for agg in aggs {
            if agg.alias.trim().is_empty() {
                return Err(StepError::MissingAlias(agg.func));
            }
            let input = if agg.column == "*" {
                if agg.func != AggFn::Count {
                    return Err(StepError::StarAggregate(agg.func));
                }
                "*".to_string()
            } else {
                self.require(&agg.column)?;
                quote_ident(&agg.column)
            };
            if output.contains(&agg.alias) {
                return Err(StepError::DuplicateColumn(agg.alias.clone()));
            }
            projections.push(format!(
                "{}({input}) AS {}",
                agg.func.sql(),
                quote_ident(&agg.alias)
            ));
            output.push(agg.alias.clone());
        }

        let stage = format!(
            "SELECT {} FROM {} GROUP BY {}",
            projections.join(", "),
            self.prev(),
            column_list(by)
        );
        self.stages.push(stage);
        self.columns = output;
        self.order = None;
        Ok(())
    }

    fn sort(&mut self, by: &[String], ascending: &[bool]) -> StepResult {
        if by.is_empty() {
            return Err(StepError::EmptyList("by"));
        }
        for column in by {
            self.require(column)?;
        }
        let keys = by
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.clone(), ascending.get(idx).copied().unwrap_or(true)))
            .collect();
        let order = Ordering { keys };
        self.stages
            .push(format!("SELECT * FROM {}{}", self.prev(), order.clause()));
        self.order = Some(order);
        Ok(())
    }

    fn limit(&mut self, n: i64) -> StepResult {
        if n <= 0 {
            return Err(StepError::NonPositiveLimit(n));
        }
        let capped = u64::try_from(n).unwrap_or(u64::MAX).min(self.limit_ceiling);
        let stage = format!(
            "SELECT * FROM {}{} LIMIT {capped}",
            self.prev(),
            self.carried_order()
        );
        self.stages.push(stage);
        Ok(())
    }
}

fn column_list(columns: &[String]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `name`, or `name_right`, `name_right2`, … whichever is free first.
fn unique_right_name(name: &str, taken: &[String]) -> String {
    let is_taken = |candidate: &str| taken.iter().any(|t| t == candidate);
    if !is_taken(name) {
        return name.to_string();
    }
    let mut candidate = format!("{name}_right");
    let mut n = 2;
    while is_taken(&candidate) {
        candidate = format!("{name}_right{n}");
        n += 1;
    }
    candidate
}
