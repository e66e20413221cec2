//! Turns execution outcomes into user-facing responses.
//!
//! Summaries are built only from values present in the result; failure texts name the kind of
//! failure and nothing about the schema or the plan behind it.

mod suggest;

use serde_json::Value;

use crate::catalog::Catalog;
use crate::models::{ChartFragment, ExecutionResult, FailureKind, QueryPlan, Response, TurnStatus};
use crate::utils::text::humanize_identifier;

pub use suggest::{follow_ups, sample_questions};

pub const NOT_ANSWERABLE_TEXT: &str = "Required information is not available in the given database.";

#[must_use]
pub fn compose(
    question: &str,
    plan: &QueryPlan,
    result: &ExecutionResult,
    catalog: &Catalog,
) -> Response {
    let chart = plan
        .chart
        .as_ref()
        .filter(|chart| chart_matches(chart, result))
        .cloned();
    Response {
        status: TurnStatus::Succeeded,
        text: summarize(result),
        columns: result.columns.clone(),
        rows: result.rows.clone(),
        row_count: result.row_count,
        truncated: result.truncated,
        chart,
        generated_sql: Some(plan.render().sql),
        follow_ups: follow_ups(question, plan, catalog),
        failure: None,
    }
}

#[must_use]
pub fn compose_failure(status: TurnStatus, kind: FailureKind) -> Response {
    Response {
        status,
        text: failure_text(kind).to_string(),
        columns: Vec::new(),
        rows: Vec::new(),
        row_count: 0,
        truncated: false,
        chart: None,
        generated_sql: None,
        follow_ups: Vec::new(),
        failure: Some(kind),
    }
}

#[must_use]
pub const fn failure_text(kind: FailureKind) -> &'static str {
    match kind {
        FailureKind::NotAnswerable => NOT_ANSWERABLE_TEXT,
        FailureKind::PlannerExhausted => {
            "I couldn't put together a query for that question. Try rephrasing it or naming the records you are interested in."
        }
        FailureKind::UnknownReference => {
            "I couldn't match that question to the data available on this platform."
        }
        FailureKind::WriteNotAllowed => {
            "I can only read data; requests that change records are not supported."
        }
        FailureKind::PlanTooExpensive => {
            "That question would read too much data. Try narrowing it down, for example with a date range or a specific record."
        }
        FailureKind::ChartReferencesUnknownColumn => {
            "I couldn't build a consistent chart for that question. Try asking without a chart."
        }
        FailureKind::ExecutionTimeout => {
            "The query took too long and was stopped. Try a narrower question."
        }
        FailureKind::ExecutionFailed => "The query could not be run against the database.",
    }
}

/// A chart survives only when both axes came back and the y axis holds numbers or nulls.
fn chart_matches(chart: &ChartFragment, result: &ExecutionResult) -> bool {
    let (Some(_), Some(y)) = (result.column_index(&chart.x), result.column_index(&chart.y)) else {
        return false;
    };
    result
        .rows
        .iter()
        .filter_map(|row| row.get(y))
        .all(|value| value.is_number() || value.is_null())
}

fn summarize(result: &ExecutionResult) -> String {
    let mut text = match result.rows.len() {
        0 => "No matching records were found.".to_string(),
        1 => single_row(result),
        _ => many_rows(result),
    };
    if result.truncated {
        text.push_str(&format!(
            " Only the first {} rows are shown; more rows matched.",
            result.row_cap
        ));
    }
    text
}

fn single_row(result: &ExecutionResult) -> String {
    let row = &result.rows[0];
    if let [column] = result.columns.as_slice() {
        return format!(
            "The {} is {}.",
            humanize_identifier(column),
            display_value(&row[0])
        );
    }
    let fields = result
        .columns
        .iter()
        .zip(row)
        .map(|(column, value)| format!("{} {}", humanize_identifier(column), display_value(value)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("Found one record: {fields}.")
}

fn many_rows(result: &ExecutionResult) -> String {
    let count = result.rows.len();
    let numeric = (0..result.columns.len())
        .filter(|index| is_numeric_column(result, *index))
        .collect::<Vec<_>>();
    let label = (0..result.columns.len()).find(|index| !numeric.contains(index));

    let Some(&measure) = numeric.last() else {
        let first = result.rows[0]
            .iter()
            .map(display_value)
            .collect::<Vec<_>>()
            .join(" ");
        return format!("Found {count} rows; the first is {first}.");
    };

    let measure_name = humanize_identifier(&result.columns[measure]);
    let numbered = result
        .rows
        .iter()
        .filter_map(|row| Some((row.get(measure)?.as_f64()?, row)))
        .collect::<Vec<_>>();
    let highest = numbered
        .iter()
        .max_by(|left, right| left.0.total_cmp(&right.0));
    let lowest = numbered
        .iter()
        .min_by(|left, right| left.0.total_cmp(&right.0));
    let (Some((_, highest)), Some((_, lowest))) = (highest, lowest) else {
        return format!("Found {count} rows.");
    };

    match label {
        Some(label) => format!(
            "Found {count} rows. The highest {measure_name} is {} for {}; the lowest is {} for {}.",
            display_value(&highest[measure]),
            display_value(&highest[label]),
            display_value(&lowest[measure]),
            display_value(&lowest[label]),
        ),
        None => format!(
            "Found {count} rows. {} ranges from {} to {}.",
            capitalize(&measure_name),
            display_value(&lowest[measure]),
            display_value(&highest[measure]),
        ),
    }
}

fn is_numeric_column(result: &ExecutionResult, index: usize) -> bool {
    let mut values = result.rows.iter().filter_map(|row| row.get(index));
    let mut any_number = false;
    let all_numeric = values.all(|value| {
        any_number |= value.is_number();
        value.is_number() || value.is_null()
    });
    all_numeric && any_number
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "no value".to_string(),
        Value::String(text) => text.clone(),
        Value::Number(number) => match number.as_i64() {
            Some(integer) => integer.to_string(),
            None => {
                let real = number.as_f64().unwrap_or_default();
                if real.fract() == 0.0 {
                    format!("{real:.0}")
                } else {
                    format!("{real:.2}")
                }
            }
        },
        other => other.to_string(),
    }
}

fn capitalize(text: &str) -> String {
    let mut chars = text.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::{NOT_ANSWERABLE_TEXT, compose, compose_failure, summarize};
    use crate::catalog::Catalog;
    use crate::chart::{self, AxisKind};
    use crate::models::{
        AggregateFn, ChartKind, ColumnRef, ExecutionResult, FailureKind, PlanStatement,
        Projection, QueryPlan, SelectQuery, TurnStatus,
    };

    fn result(columns: &[&str], rows: Vec<Vec<Value>>, truncated: bool) -> ExecutionResult {
        ExecutionResult {
            columns: columns.iter().map(ToString::to_string).collect(),
            row_count: rows.len(),
            rows,
            truncated,
            row_cap: 2,
            duration_ms: 1,
        }
    }

    fn per_department_plan() -> QueryPlan {
        QueryPlan {
            platform: "hr".to_string(),
            statement: PlanStatement::Select(SelectQuery {
                from: "Employees".to_string(),
                joins: Vec::new(),
                projection: vec![
                    Projection::Column {
                        column: ColumnRef::new("Employees", "Status"),
                        alias: "Status".to_string(),
                    },
                    Projection::Aggregate {
                        function: AggregateFn::Count,
                        column: None,
                        alias: "Count".to_string(),
                    },
                ],
                filters: Vec::new(),
                group_by: Vec::new(),
                order_by: Vec::new(),
                limit: None,
            }),
            rationale: "count per status".to_string(),
            chart: Some(chart::fragment(
                ChartKind::Bar,
                "Status",
                "Count",
                "Employees per status",
                AxisKind::Nominal,
            )),
        }
    }

    #[test]
    fn summary_names_extremes_from_result_values() {
        let result = result(
            &["Status", "Count"],
            vec![vec![json!("active"), json!(12)], vec![json!("on_leave"), json!(3)]],
            false,
        );
        assert_eq!(
            summarize(&result),
            "Found 2 rows. The highest count is 12 for active; the lowest is 3 for on_leave."
        );
    }

    #[test]
    fn summary_flags_truncation_and_empty_results() {
        let truncated = result(
            &["FirstName"],
            vec![vec![json!("Ada")], vec![json!("Grace")]],
            true,
        );
        assert_eq!(
            summarize(&truncated),
            "Found 2 rows; the first is Ada. Only the first 2 rows are shown; more rows matched."
        );
        assert_eq!(
            summarize(&result(&["FirstName"], Vec::new(), false)),
            "No matching records were found."
        );
        assert_eq!(
            summarize(&result(&["AverageSalary"], vec![vec![json!(81250.5)]], false)),
            "The average salary is 81250.50."
        );
    }

    #[test]
    fn keeps_chart_only_when_result_shape_matches() {
        let catalog = Catalog::from_ddl("hr", include_str!("../../schemas/hr.sql"))
            .expect("hr ddl should load");
        let plan = per_department_plan();
        let numeric = result(
            &["Status", "Count"],
            vec![vec![json!("active"), json!(12)], vec![json!("terminated"), Value::Null]],
            false,
        );
        let response = compose("employees per status", &plan, &numeric, &catalog);
        assert!(response.chart.is_some());
        assert!(response.generated_sql.is_some());
        assert!(!response.follow_ups.is_empty() && response.follow_ups.len() <= 2);

        let textual = result(&["Status", "Count"], vec![vec![json!("active"), json!("many")]], false);
        assert!(compose("employees per status", &plan, &textual, &catalog).chart.is_none());

        let missing = result(&["Status"], vec![vec![json!("active")]], false);
        assert!(compose("employees per status", &plan, &missing, &catalog).chart.is_none());
    }

    #[test]
    fn failure_response_carries_no_plan_details() {
        let response = compose_failure(TurnStatus::PlannerExhausted, FailureKind::NotAnswerable);
        assert_eq!(response.text, NOT_ANSWERABLE_TEXT);
        assert_eq!(response.failure, Some(FailureKind::NotAnswerable));
        assert!(response.generated_sql.is_none());
        assert!(response.rows.is_empty());
    }
}
