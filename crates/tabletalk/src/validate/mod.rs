//! Static plan checks run before anything touches a store.
//!
//! Checks run in a fixed order and the first failure wins, so a planner always sees the most
//! fundamental problem with its plan first.

mod cost;
mod guardrail;

use crate::catalog::Catalog;
use crate::chart;
use crate::config::PlanLimits;
use crate::models::{
    ColumnRef, Literal, PlanStatement, QueryPlan, Rejection, RenderedQuery, SelectQuery, WriteKind,
};

pub use cost::{CostEstimate, estimate};
pub use guardrail::{GuardrailViolation, check_read_only_sql};

/// A plan that passed every check. Only [`validate`] can build one, so holding a value is proof
/// that the plan is read-only, grounded and within budget.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedPlan {
    plan: QueryPlan,
    rendered: RenderedQuery,
    cost: CostEstimate,
}

impl ValidatedPlan {
    #[must_use]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    #[must_use]
    pub fn platform(&self) -> &str {
        &self.plan.platform
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.rendered.sql
    }

    #[must_use]
    pub fn params(&self) -> &[Literal] {
        &self.rendered.params
    }

    #[must_use]
    pub fn cost(&self) -> CostEstimate {
        self.cost
    }

    #[must_use]
    pub fn into_plan(self) -> QueryPlan {
        self.plan
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(ValidatedPlan),
    Rejected(Rejection),
}

impl Verdict {
    #[must_use]
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Accepted(_) => None,
            Self::Rejected(rejection) => Some(rejection),
        }
    }
}

type PlanCheck = fn(&QueryPlan, &Catalog, &PlanLimits) -> Result<(), Rejection>;

fn check_catalog() -> &'static [PlanCheck] {
    &[
        check_references,
        check_read_only,
        check_cost,
        check_chart,
    ]
}

#[must_use]
pub fn validate(plan: &QueryPlan, catalog: &Catalog, limits: &PlanLimits) -> Verdict {
    for check in check_catalog() {
        if let Err(rejection) = check(plan, catalog, limits) {
            return Verdict::Rejected(rejection);
        }
    }
    // Only select statements survive the read-only check.
    let PlanStatement::Select(query) = &plan.statement else {
        return Verdict::Rejected(Rejection::WriteNotAllowed {
            operation: "write".to_string(),
        });
    };
    Verdict::Accepted(ValidatedPlan {
        plan: plan.clone(),
        rendered: plan.render(),
        cost: estimate(query, catalog),
    })
}

fn check_references(plan: &QueryPlan, catalog: &Catalog, _limits: &PlanLimits) -> Result<(), Rejection> {
    let creates_table = matches!(
        &plan.statement,
        PlanStatement::Write(write) if write.kind == WriteKind::Create
    );
    if !creates_table {
        for table in plan.referenced_tables() {
            if catalog.table(&table).is_none() {
                return Err(Rejection::unknown_table(table));
            }
        }
        for column in plan.referenced_columns() {
            if catalog.column(&column).is_none() {
                return Err(Rejection::unknown_column(column.table, column.column));
            }
        }
    }

    match &plan.statement {
        PlanStatement::Select(query) => check_select_scope(query),
        PlanStatement::Write(_) => Ok(()),
    }
}

/// Columns must come from tables the query actually joins, and ordering may only name outputs.
fn check_select_scope(query: &SelectQuery) -> Result<(), Rejection> {
    let mut in_scope = vec![query.from.as_str()];
    for join in &query.joins {
        let left_joined = in_scope
            .iter()
            .any(|table| table.eq_ignore_ascii_case(&join.left.table));
        if !left_joined {
            return Err(out_of_scope(&join.left));
        }
        if !join.right.table.eq_ignore_ascii_case(&join.table) {
            return Err(out_of_scope(&join.right));
        }
        in_scope.push(join.table.as_str());
    }

    let used_columns = query
        .projection
        .iter()
        .chain(&query.group_by)
        .filter_map(|projection| projection.column_ref())
        .chain(query.filters.iter().map(|filter| &filter.column));
    for column in used_columns {
        if !in_scope
            .iter()
            .any(|table| table.eq_ignore_ascii_case(&column.table))
        {
            return Err(out_of_scope(column));
        }
    }

    let outputs = query.output_columns();
    for term in &query.order_by {
        if !outputs.contains(&term.output.as_str()) {
            return Err(Rejection::unknown_column(&query.from, &term.output));
        }
    }
    Ok(())
}

fn out_of_scope(column: &ColumnRef) -> Rejection {
    Rejection::unknown_column(&column.table, &column.column)
}

fn check_read_only(plan: &QueryPlan, _catalog: &Catalog, _limits: &PlanLimits) -> Result<(), Rejection> {
    if let PlanStatement::Write(write) = &plan.statement {
        return Err(Rejection::WriteNotAllowed {
            operation: write.kind.keyword().to_string(),
        });
    }
    check_read_only_sql(&plan.render().sql).map_err(|violation| Rejection::WriteNotAllowed {
        operation: violation.operation(),
    })
}

fn check_cost(plan: &QueryPlan, catalog: &Catalog, limits: &PlanLimits) -> Result<(), Rejection> {
    let Some(query) = plan.select() else {
        return Ok(());
    };
    let cost = estimate(query, catalog);
    if cost.within(limits) {
        Ok(())
    } else {
        Err(cost.rejection(limits))
    }
}

fn check_chart(plan: &QueryPlan, _catalog: &Catalog, _limits: &PlanLimits) -> Result<(), Rejection> {
    let (Some(fragment), Some(query)) = (&plan.chart, plan.select()) else {
        return Ok(());
    };
    let outputs = query.output_columns();
    let unknown = |column: &str| Rejection::ChartReferencesUnknownColumn {
        column: column.to_string(),
    };
    for column in [&fragment.x, &fragment.y] {
        if !outputs.contains(&column.as_str()) {
            return Err(unknown(column.as_str()));
        }
    }
    let Some(fields) = chart::bound_fields(fragment) else {
        return Err(unknown("data.values"));
    };
    match fields
        .iter()
        .find(|field| !outputs.contains(&field.as_str()))
    {
        Some(field) => Err(unknown(field.as_str())),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::{Verdict, validate};
    use crate::catalog::Catalog;
    use crate::chart::{self, AxisKind};
    use crate::config::PlanLimits;
    use crate::models::{
        AggregateFn, Assignment, ChartKind, ColumnRef, Filter, FilterOp, JoinClause, Literal,
        OrderTerm, PlanStatement, Projection, QueryPlan, Rejection, SelectQuery, WriteKind,
        WriteStatement,
    };

    fn hr() -> Catalog {
        Catalog::from_ddl("hr", include_str!("../../schemas/hr.sql")).expect("hr ddl should load")
    }

    fn column(table: &str, name: &str) -> Projection {
        Projection::Column {
            column: ColumnRef::new(table, name),
            alias: name.to_string(),
        }
    }

    fn select(query: SelectQuery) -> QueryPlan {
        QueryPlan {
            platform: "hr".to_string(),
            statement: PlanStatement::Select(query),
            rationale: "test".to_string(),
            chart: None,
        }
    }

    fn employees_query() -> SelectQuery {
        SelectQuery {
            from: "Employees".to_string(),
            joins: Vec::new(),
            projection: vec![column("Employees", "FirstName")],
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: Some(50),
        }
    }

    fn count_per_department() -> SelectQuery {
        SelectQuery {
            from: "Employees".to_string(),
            joins: vec![JoinClause {
                table: "Departments".to_string(),
                left: ColumnRef::new("Employees", "DepartmentID"),
                right: ColumnRef::new("Departments", "DepartmentID"),
            }],
            projection: vec![
                column("Departments", "Name"),
                Projection::Aggregate {
                    function: AggregateFn::Count,
                    column: None,
                    alias: "Count".to_string(),
                },
            ],
            filters: Vec::new(),
            group_by: vec![column("Departments", "Name")],
            order_by: vec![OrderTerm {
                output: "Count".to_string(),
                descending: true,
            }],
            limit: None,
        }
    }

    fn write(kind: WriteKind, table: &str, expression: &str) -> QueryPlan {
        QueryPlan {
            platform: "hr".to_string(),
            statement: PlanStatement::Write(WriteStatement {
                kind,
                table: table.to_string(),
                assignments: vec![Assignment {
                    column: "Salary".to_string(),
                    expression: expression.to_string(),
                }],
                filters: vec![Filter {
                    column: ColumnRef::new(table, "EmployeeID"),
                    op: FilterOp::Eq,
                    value: Literal::Integer(1),
                }],
            }),
            rationale: "test".to_string(),
            chart: None,
        }
    }

    #[test]
    fn accepts_grounded_aggregate_with_chart() {
        let mut plan = select(count_per_department());
        plan.chart = Some(chart::fragment(
            ChartKind::Bar,
            "Name",
            "Count",
            "Employees per department",
            AxisKind::Nominal,
        ));
        let Verdict::Accepted(validated) = validate(&plan, &hr(), &PlanLimits::default()) else {
            panic!("plan should be accepted");
        };
        assert!(validated.sql().starts_with("SELECT "));
        assert!(validated.params().is_empty());
        assert_eq!(validated.platform(), "hr");
    }

    #[test]
    fn rejects_unknown_column() {
        let mut query = employees_query();
        query.projection.push(column("Employees", "ShoeSize"));
        assert_eq!(
            validate(&select(query), &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::unknown_column("Employees", "ShoeSize"))
        );
    }

    #[test]
    fn rejects_columns_from_tables_outside_the_join_scope() {
        let mut query = employees_query();
        query.filters.push(Filter {
            column: ColumnRef::new("Departments", "Name"),
            op: FilterOp::Eq,
            value: Literal::Text("Engineering".to_string()),
        });
        assert_eq!(
            validate(&select(query), &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::unknown_column("Departments", "Name"))
        );
    }

    #[test]
    fn rejects_order_by_on_unprojected_output() {
        let mut query = employees_query();
        query.order_by.push(OrderTerm {
            output: "Salary".to_string(),
            descending: false,
        });
        assert!(matches!(
            validate(&select(query), &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::UnknownReference { .. })
        ));
    }

    #[test]
    fn rejects_update_as_write() {
        let plan = write(WriteKind::Update, "Employees", "\"Salary\" * 1.1");
        assert_eq!(
            validate(&plan, &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::WriteNotAllowed {
                operation: "update".to_string()
            })
        );
    }

    #[test]
    fn rejects_fan_out_above_ceiling() {
        let catalog = hr()
            .with_row_estimate("Departments", 10)
            .with_row_estimate("Employees", 50_000);
        let query = SelectQuery {
            from: "Departments".to_string(),
            joins: vec![JoinClause {
                table: "Employees".to_string(),
                left: ColumnRef::new("Departments", "DepartmentID"),
                right: ColumnRef::new("Employees", "DepartmentID"),
            }],
            projection: vec![column("Departments", "Name"), column("Employees", "FirstName")],
            filters: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        };
        let limits = PlanLimits {
            max_join_fan_out: 100.0,
            ..PlanLimits::default()
        };
        let Verdict::Rejected(Rejection::PlanTooExpensive {
            join_fan_out,
            join_count,
            max_join_fan_out,
            ..
        }) = validate(&select(query), &catalog, &limits)
        else {
            panic!("plan should be too expensive");
        };
        assert!((join_fan_out - 5_000.0).abs() < f64::EPSILON);
        assert_eq!(join_count, 1);
        assert!((max_join_fan_out - 100.0).abs() < f64::EPSILON);
    }

    #[test]
    fn rejects_chart_on_unknown_output() {
        let mut plan = select(count_per_department());
        plan.chart = Some(chart::fragment(
            ChartKind::Bar,
            "Name",
            "Headcount",
            "Employees per department",
            AxisKind::Nominal,
        ));
        assert_eq!(
            validate(&plan, &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::ChartReferencesUnknownColumn {
                column: "Headcount".to_string()
            })
        );
    }

    #[test]
    fn rejects_chart_with_inline_data() {
        let mut plan = select(count_per_department());
        let mut fragment = chart::fragment(ChartKind::Bar, "Name", "Count", "t", AxisKind::Nominal);
        fragment.code = r#"{"data":{"values":[{"Name":"x","Count":1}]},"encoding":{}}"#.to_string();
        plan.chart = Some(fragment);
        assert!(matches!(
            validate(&plan, &hr(), &PlanLimits::default()),
            Verdict::Rejected(Rejection::ChartReferencesUnknownColumn { .. })
        ));
    }

    /// Deterministic linear congruential generator so the corpus is reproducible.
    struct Lcg(u64);

    impl Lcg {
        fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
            self.0 = self
                .0
                .wrapping_mul(6_364_136_223_846_793_005)
                .wrapping_add(1_442_695_040_888_963_407);
            let index = usize::try_from(self.0 >> 33).expect("index should fit") % items.len();
            &items[index]
        }
    }

    #[test]
    fn mutation_corpus_is_never_accepted() {
        let catalog = hr();
        let kinds = [
            WriteKind::Insert,
            WriteKind::Update,
            WriteKind::Delete,
            WriteKind::Create,
            WriteKind::Alter,
            WriteKind::Drop,
        ];
        let tables = ["Employees", "Departments", "Salaries", "Ghosts"];
        let expressions = [
            "0",
            "\"Salary\" * 2",
            "1; DROP TABLE \"Employees\"",
            "(SELECT 1)",
            "'x'); DELETE FROM \"Employees\"; --",
        ];
        let injected_tables = [
            "Employees\"; DROP TABLE \"Employees\"; --",
            "Employees WHERE 1=1; UPDATE Employees SET Salary=0",
            "sqlite_master",
        ];

        let mut rng = Lcg(7);
        let mut corpus = Vec::new();
        for _ in 0..200 {
            corpus.push(write(*rng.pick(&kinds), *rng.pick(&tables), *rng.pick(&expressions)));
            let mut query = employees_query();
            query.from = (*rng.pick(&injected_tables)).to_string();
            corpus.push(select(query));
        }

        for plan in &corpus {
            let verdict = validate(plan, &catalog, &PlanLimits::default());
            assert!(
                matches!(verdict, Verdict::Rejected(_)),
                "mutation plan should be rejected: {plan:?}"
            );
        }
    }
}
