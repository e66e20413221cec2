use serde::Serialize;

use crate::catalog::{Catalog, DEFAULT_ESTIMATED_ROWS};
use crate::config::PlanLimits;
use crate::models::{FilterOp, JoinClause, Projection, Rejection, SelectQuery, TimeBucket};

const EQ_SELECTIVITY: f64 = 0.1;
const NE_SELECTIVITY: f64 = 0.9;
const RANGE_SELECTIVITY: f64 = 0.33;
const LIKE_SELECTIVITY: f64 = 0.25;
const MONTH_BUCKETS: f64 = 240.0;
const YEAR_BUCKETS: f64 = 50.0;

/// Static estimate of what a select would produce, derived from catalog row counts.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CostEstimate {
    pub estimated_rows: u64,
    /// Product of per-join row multipliers before filters and limit apply.
    pub join_fan_out: f64,
    pub join_count: usize,
}

impl CostEstimate {
    #[must_use]
    pub fn within(&self, limits: &PlanLimits) -> bool {
        self.estimated_rows <= limits.max_estimated_rows
            && self.join_fan_out <= limits.max_join_fan_out
            && self.join_count <= limits.max_joins
    }

    #[must_use]
    pub fn rejection(&self, limits: &PlanLimits) -> Rejection {
        Rejection::PlanTooExpensive {
            estimated_rows: self.estimated_rows,
            join_fan_out: self.join_fan_out,
            join_count: self.join_count,
            max_estimated_rows: limits.max_estimated_rows,
            max_join_fan_out: limits.max_join_fan_out,
            max_joins: limits.max_joins,
        }
    }
}

#[must_use]
pub fn estimate(query: &SelectQuery, catalog: &Catalog) -> CostEstimate {
    let mut rows = table_rows(catalog, &query.from);
    let mut fan_out = 1.0;
    for join in &query.joins {
        let factor = join_factor(catalog, join);
        fan_out *= factor;
        rows *= factor;
    }

    for filter in &query.filters {
        let primary_key_match = filter.op == FilterOp::Eq
            && catalog
                .column(&filter.column)
                .is_some_and(|column| column.primary_key);
        rows *= if primary_key_match {
            1.0 / table_rows(catalog, &filter.column.table)
        } else {
            selectivity(filter.op)
        };
    }

    if query.has_aggregate() || !query.group_by.is_empty() {
        rows = if query.group_by.is_empty() {
            1.0
        } else {
            rows.min(group_ceiling(catalog, &query.group_by))
        };
    }

    let mut estimated_rows = rows.ceil().max(1.0) as u64;
    if let Some(limit) = query.limit {
        estimated_rows = estimated_rows.min(limit);
    }

    CostEstimate {
        estimated_rows,
        join_fan_out: fan_out,
        join_count: query.joins.len(),
    }
}

fn table_rows(catalog: &Catalog, table: &str) -> f64 {
    catalog
        .table(table)
        .map_or(DEFAULT_ESTIMATED_ROWS, |table| table.estimated_rows)
        .max(1) as f64
}

/// Row multiplier for one join: many-to-one keeps the row count, one-to-many multiplies it by
/// the child/parent ratio and an unkeyed join by the whole joined table.
fn join_factor(catalog: &Catalog, join: &JoinClause) -> f64 {
    if catalog.is_foreign_key_edge(&join.left, &join.right) {
        return 1.0;
    }
    if catalog.is_foreign_key_edge(&join.right, &join.left) {
        let child = table_rows(catalog, &join.right.table);
        let parent = table_rows(catalog, &join.left.table);
        return (child / parent).max(1.0);
    }
    table_rows(catalog, &join.table)
}

const fn selectivity(op: FilterOp) -> f64 {
    match op {
        FilterOp::Eq => EQ_SELECTIVITY,
        FilterOp::Ne => NE_SELECTIVITY,
        FilterOp::Gt | FilterOp::Ge | FilterOp::Lt | FilterOp::Le => RANGE_SELECTIVITY,
        FilterOp::Like => LIKE_SELECTIVITY,
    }
}

fn group_ceiling(catalog: &Catalog, group_by: &[Projection]) -> f64 {
    group_by
        .iter()
        .map(|projection| match projection {
            Projection::Bucket {
                bucket: TimeBucket::Month,
                ..
            } => MONTH_BUCKETS,
            Projection::Bucket {
                bucket: TimeBucket::Year,
                ..
            } => YEAR_BUCKETS,
            Projection::Column { column, .. } => table_rows(catalog, &column.table),
            Projection::Aggregate { .. } => 1.0,
        })
        .product()
}
