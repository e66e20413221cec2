use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const QUERY_PLAN_SCHEMA_VERSION: &str = "tabletalk.query-plan.v1";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    #[must_use]
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }

    fn render(&self) -> String {
        format!("{}.{}", quote_ident(&self.table), quote_ident(&self.column))
    }
}

impl Display for ColumnRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.table, self.column)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AggregateFn {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFn {
    #[must_use]
    pub const fn sql_name(self) -> &'static str {
        match self {
            Self::Count => "COUNT",
            Self::Sum => "SUM",
            Self::Avg => "AVG",
            Self::Min => "MIN",
            Self::Max => "MAX",
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Count => "Count",
            Self::Sum => "Total",
            Self::Avg => "Average",
            Self::Min => "Min",
            Self::Max => "Max",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TimeBucket {
    Month,
    Year,
}

impl TimeBucket {
    #[must_use]
    pub const fn strftime_pattern(self) -> &'static str {
        match self {
            Self::Month => "%Y-%m",
            Self::Year => "%Y",
        }
    }

    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Month => "Month",
            Self::Year => "Year",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Projection {
    Column {
        column: ColumnRef,
        alias: String,
    },
    Aggregate {
        function: AggregateFn,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        column: Option<ColumnRef>,
        alias: String,
    },
    Bucket {
        column: ColumnRef,
        bucket: TimeBucket,
        alias: String,
    },
}

impl Projection {
    #[must_use]
    pub fn alias(&self) -> &str {
        match self {
            Self::Column { alias, .. }
            | Self::Aggregate { alias, .. }
            | Self::Bucket { alias, .. } => alias,
        }
    }

    #[must_use]
    pub fn column_ref(&self) -> Option<&ColumnRef> {
        match self {
            Self::Column { column, .. } | Self::Bucket { column, .. } => Some(column),
            Self::Aggregate { column, .. } => column.as_ref(),
        }
    }

    #[must_use]
    pub const fn is_aggregate(&self) -> bool {
        matches!(self, Self::Aggregate { .. })
    }

    fn expression(&self) -> String {
        match self {
            Self::Column { column, .. } => column.render(),
            Self::Aggregate {
                function,
                column: Some(column),
                ..
            } => format!("{}({})", function.sql_name(), column.render()),
            Self::Aggregate { function, .. } => format!("{}(*)", function.sql_name()),
            Self::Bucket { column, bucket, .. } => {
                format!("strftime('{}', {})", bucket.strftime_pattern(), column.render())
            }
        }
    }

    fn render(&self) -> String {
        format!("{} AS {}", self.expression(), quote_ident(self.alias()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Like,
}

impl FilterOp {
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Like => "LIKE",
        }
    }

    #[must_use]
    pub const fn is_range(self) -> bool {
        matches!(self, Self::Gt | Self::Ge | Self::Lt | Self::Le)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum Literal {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl Literal {
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Integer(value) => Value::from(*value),
            Self::Real(value) => Value::from(*value),
            Self::Text(value) => Value::from(value.as_str()),
        }
    }
}

impl Display for Literal {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Integer(value) => write!(f, "{value}"),
            Self::Real(value) => write!(f, "{value}"),
            Self::Text(value) => write!(f, "'{value}'"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Filter {
    pub column: ColumnRef,
    pub op: FilterOp,
    pub value: Literal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct JoinClause {
    pub table: String,
    pub left: ColumnRef,
    pub right: ColumnRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OrderTerm {
    pub output: String,
    #[serde(default)]
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SelectQuery {
    pub from: String,
    #[serde(default)]
    pub joins: Vec<JoinClause>,
    pub projection: Vec<Projection>,
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub group_by: Vec<Projection>,
    #[serde(default)]
    pub order_by: Vec<OrderTerm>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl SelectQuery {
    #[must_use]
    pub fn output_columns(&self) -> Vec<&str> {
        self.projection.iter().map(Projection::alias).collect()
    }

    #[must_use]
    pub fn tables(&self) -> Vec<&str> {
        std::iter::once(self.from.as_str())
            .chain(self.joins.iter().map(|join| join.table.as_str()))
            .collect()
    }

    #[must_use]
    pub fn has_aggregate(&self) -> bool {
        self.projection.iter().any(Projection::is_aggregate)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
    Create,
    Alter,
    Drop,
}

impl WriteKind {
    #[must_use]
    pub const fn keyword(self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Create => "create",
            Self::Alter => "alter",
            Self::Drop => "drop",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Assignment {
    pub column: String,
    pub expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WriteStatement {
    pub kind: WriteKind,
    pub table: String,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    #[serde(default)]
    pub filters: Vec<Filter>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanStatement {
    Select(SelectQuery),
    Write(WriteStatement),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChartKind {
    Bar,
    Line,
    Pie,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChartFragment {
    pub kind: ChartKind,
    pub x: String,
    pub y: String,
    pub title: String,
    pub code: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct QueryPlan {
    pub platform: String,
    pub statement: PlanStatement,
    pub rationale: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartFragment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedQuery {
    pub sql: String,
    pub params: Vec<Literal>,
}

impl QueryPlan {
    #[must_use]
    pub fn select(&self) -> Option<&SelectQuery> {
        match &self.statement {
            PlanStatement::Select(query) => Some(query),
            PlanStatement::Write(_) => None,
        }
    }

    /// Tables and columns the plan touches, in a stable order.
    #[must_use]
    pub fn referenced_columns(&self) -> BTreeSet<ColumnRef> {
        let mut columns = BTreeSet::new();
        match &self.statement {
            PlanStatement::Select(query) => {
                for projection in query.projection.iter().chain(&query.group_by) {
                    if let Some(column) = projection.column_ref() {
                        columns.insert(column.clone());
                    }
                }
                for filter in &query.filters {
                    columns.insert(filter.column.clone());
                }
                for join in &query.joins {
                    columns.insert(join.left.clone());
                    columns.insert(join.right.clone());
                }
            }
            PlanStatement::Write(write) => {
                for assignment in &write.assignments {
                    columns.insert(ColumnRef::new(&write.table, &assignment.column));
                }
                for filter in &write.filters {
                    columns.insert(filter.column.clone());
                }
            }
        }
        columns
    }

    #[must_use]
    pub fn referenced_tables(&self) -> BTreeSet<String> {
        let mut tables = match &self.statement {
            PlanStatement::Select(query) => query
                .tables()
                .into_iter()
                .map(ToString::to_string)
                .collect::<BTreeSet<_>>(),
            PlanStatement::Write(write) => BTreeSet::from([write.table.clone()]),
        };
        tables.extend(
            self.referenced_columns()
                .into_iter()
                .map(|column| column.table),
        );
        tables
    }

    #[must_use]
    pub fn render(&self) -> RenderedQuery {
        match &self.statement {
            PlanStatement::Select(query) => render_select(query),
            PlanStatement::Write(write) => render_write(write),
        }
    }
}

fn render_select(query: &SelectQuery) -> RenderedQuery {
    let mut params = Vec::new();
    let projection = query
        .projection
        .iter()
        .map(Projection::render)
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!("SELECT {projection} FROM {}", quote_ident(&query.from));

    for join in &query.joins {
        sql.push_str(&format!(
            " JOIN {} ON {} = {}",
            quote_ident(&join.table),
            join.left.render(),
            join.right.render()
        ));
    }

    push_where(&mut sql, &mut params, &query.filters);

    if !query.group_by.is_empty() {
        let group_by = query
            .group_by
            .iter()
            .map(Projection::expression)
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" GROUP BY {group_by}"));
    }

    if !query.order_by.is_empty() {
        let order_by = query
            .order_by
            .iter()
            .map(|term| {
                let direction = if term.descending { "DESC" } else { "ASC" };
                format!("{} {direction}", quote_ident(&term.output))
            })
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" ORDER BY {order_by}"));
    }

    if let Some(limit) = query.limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    RenderedQuery { sql, params }
}

fn render_write(write: &WriteStatement) -> RenderedQuery {
    let mut params = Vec::new();
    let table = quote_ident(&write.table);
    let mut sql = match write.kind {
        WriteKind::Update => {
            let assignments = write
                .assignments
                .iter()
                .map(|assignment| {
                    format!("{} = {}", quote_ident(&assignment.column), assignment.expression)
                })
                .collect::<Vec<_>>()
                .join(", ");
            format!("UPDATE {table} SET {assignments}")
        }
        WriteKind::Insert => {
            let columns = write
                .assignments
                .iter()
                .map(|assignment| quote_ident(&assignment.column))
                .collect::<Vec<_>>()
                .join(", ");
            let values = write
                .assignments
                .iter()
                .map(|assignment| assignment.expression.as_str())
                .collect::<Vec<_>>()
                .join(", ");
            format!("INSERT INTO {table} ({columns}) VALUES ({values})")
        }
        WriteKind::Delete => format!("DELETE FROM {table}"),
        WriteKind::Create => format!("CREATE TABLE {table} (id INTEGER)"),
        WriteKind::Alter => format!("ALTER TABLE {table} ADD COLUMN note TEXT"),
        WriteKind::Drop => format!("DROP TABLE {table}"),
    };
    if matches!(write.kind, WriteKind::Update | WriteKind::Delete) {
        push_where(&mut sql, &mut params, &write.filters);
    }
    RenderedQuery { sql, params }
}

fn push_where(sql: &mut String, params: &mut Vec<Literal>, filters: &[Filter]) {
    if filters.is_empty() {
        return;
    }
    let clauses = filters
        .iter()
        .map(|filter| {
            params.push(filter.value.clone());
            format!(
                "{} {} ?{}",
                filter.column.render(),
                filter.op.sql(),
                params.len()
            )
        })
        .collect::<Vec<_>>()
        .join(" AND ");
    sql.push_str(&format!(" WHERE {clauses}"));
}

#[must_use]
pub fn quote_ident(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

#[must_use]
pub fn json_schema() -> Value {
    let schema = schemars::schema_for!(QueryPlan);
    serde_json::to_value(schema).unwrap_or(Value::Null)
}
