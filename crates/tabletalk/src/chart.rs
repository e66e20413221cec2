//! Declarative chart fragments.
//!
//! A fragment is a Vega-Lite specification bound to the named data source `result`. It only
//! carries output column names; rows are attached by whoever renders it, never by the agent.

use serde_json::{Value, json};

use crate::models::{ChartFragment, ChartKind};

pub const VEGA_LITE_SCHEMA: &str = "https://vega.github.io/schema/vega-lite/v5.json";
pub const DATA_SOURCE_NAME: &str = "result";

/// How the x axis of a chart should be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisKind {
    Nominal,
    /// Ordered buckets such as `2024-01`; plotted in result order.
    Ordinal,
}

impl AxisKind {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Nominal => "nominal",
            Self::Ordinal => "ordinal",
        }
    }
}

#[must_use]
pub fn fragment(kind: ChartKind, x: &str, y: &str, title: &str, axis: AxisKind) -> ChartFragment {
    ChartFragment {
        kind,
        x: x.to_string(),
        y: y.to_string(),
        title: title.to_string(),
        code: vega_lite(kind, x, y, title, axis).to_string(),
    }
}

fn vega_lite(kind: ChartKind, x: &str, y: &str, title: &str, axis: AxisKind) -> Value {
    let encoding = match kind {
        ChartKind::Pie => json!({
            "theta": { "field": y, "type": "quantitative" },
            "color": { "field": x, "type": "nominal" },
        }),
        ChartKind::Bar | ChartKind::Line => json!({
            "x": { "field": x, "type": axis.as_str(), "sort": null },
            "y": { "field": y, "type": "quantitative" },
        }),
    };
    let mark = match kind {
        ChartKind::Bar => "bar",
        ChartKind::Line => "line",
        ChartKind::Pie => "arc",
    };
    json!({
        "$schema": VEGA_LITE_SCHEMA,
        "title": title,
        "data": { "name": DATA_SOURCE_NAME },
        "mark": mark,
        "encoding": encoding,
    })
}

/// Field names a fragment's code binds to, read back from the code itself.
///
/// Returns `None` when the code is not a Vega-Lite object bound to the `result` source.
#[must_use]
pub fn bound_fields(fragment: &ChartFragment) -> Option<Vec<String>> {
    let spec = serde_json::from_str::<Value>(&fragment.code).ok()?;
    let source = spec.pointer("/data/name").and_then(Value::as_str)?;
    if source != DATA_SOURCE_NAME || spec.pointer("/data/values").is_some() {
        return None;
    }
    let encoding = spec.get("encoding")?.as_object()?;
    let mut fields = encoding
        .values()
        .filter_map(|channel| channel.get("field").and_then(Value::as_str))
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    fields.sort();
    fields.dedup();
    Some(fields)
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::{AxisKind, bound_fields, fragment};
    use crate::models::ChartKind;

    fn x_type(code: &str) -> Option<String> {
        let spec = serde_json::from_str::<Value>(code).ok()?;
        spec.pointer("/encoding/x/type")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    #[test]
    fn bar_fragment_binds_only_column_names() {
        let chart = fragment(ChartKind::Bar, "Name", "Count", "Employees per department", AxisKind::Nominal);
        assert_eq!(chart.x, "Name");
        assert!(chart.code.contains("\"name\":\"result\""));
        assert_eq!(
            bound_fields(&chart),
            Some(vec!["Count".to_string(), "Name".to_string()])
        );
    }

    #[test]
    fn axis_kind_names_the_encoded_x_type() {
        let line = fragment(ChartKind::Line, "Month", "Total", "Payroll by month", AxisKind::Ordinal);
        assert_eq!(x_type(&line.code).as_deref(), Some("ordinal"));
        let bar = fragment(ChartKind::Bar, "Name", "Count", "Employees per department", AxisKind::Nominal);
        assert_eq!(x_type(&bar.code).as_deref(), Some("nominal"));
    }

    #[test]
    fn pie_fragment_uses_theta_and_color() {
        let chart = fragment(ChartKind::Pie, "Status", "Count", "Invoices by status", AxisKind::Nominal);
        assert!(chart.code.contains("\"theta\""));
        assert!(chart.code.contains("\"mark\":\"arc\""));
    }

    #[test]
    fn inline_data_is_not_a_bound_fragment() {
        let mut chart = fragment(ChartKind::Line, "Month", "Total", "Revenue", AxisKind::Ordinal);
        chart.code = r#"{"data":{"name":"result","values":[{"Month":"2024-01"}]},"encoding":{}}"#
            .to_string();
        assert_eq!(bound_fields(&chart), None);
    }
}
