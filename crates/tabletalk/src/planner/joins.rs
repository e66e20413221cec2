use std::collections::{HashMap, VecDeque};

use crate::catalog::Catalog;
use crate::models::{ColumnRef, JoinClause};

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct JoinPlan {
    pub joins: Vec<JoinClause>,
    pub unreachable: Vec<String>,
}

impl JoinPlan {
    pub(crate) fn tables<'a>(&'a self, root: &'a str) -> impl Iterator<Item = &'a str> {
        std::iter::once(root).chain(self.joins.iter().map(|join| join.table.as_str()))
    }
}

/// Connects every target to `root` through the shortest foreign-key paths.
///
/// Paths may only pass through tables accepted by `allowed`. Outgoing keys are explored
/// before incoming ones, so a many-to-one hop wins over a one-to-many hop of equal length.
pub(crate) fn connect(
    catalog: &Catalog,
    root: &str,
    targets: &[&str],
    allowed: impl Fn(&str) -> bool,
) -> JoinPlan {
    let mut plan = JoinPlan::default();
    let mut joined = vec![root.to_string()];

    for target in targets {
        if joined.iter().any(|table| table.eq_ignore_ascii_case(target)) {
            continue;
        }
        match shortest_path(catalog, &joined, target, &allowed) {
            Some(steps) => {
                for step in steps {
                    joined.push(step.table.clone());
                    plan.joins.push(step);
                }
            }
            None => plan.unreachable.push((*target).to_string()),
        }
    }
    plan
}

fn shortest_path(
    catalog: &Catalog,
    joined: &[String],
    target: &str,
    allowed: &impl Fn(&str) -> bool,
) -> Option<Vec<JoinClause>> {
    let mut queue = joined.iter().cloned().collect::<VecDeque<_>>();
    let mut reached_from: HashMap<String, Option<JoinClause>> = joined
        .iter()
        .map(|table| (table.to_ascii_lowercase(), None))
        .collect();

    while let Some(current) = queue.pop_front() {
        if current.eq_ignore_ascii_case(target) {
            return Some(unwind(&reached_from, &current));
        }
        for step in hops(catalog, &current) {
            let key = step.table.to_ascii_lowercase();
            if reached_from.contains_key(&key) || !allowed(&step.table) {
                continue;
            }
            queue.push_back(step.table.clone());
            reached_from.insert(key, Some(step));
        }
    }
    None
}

fn unwind(reached_from: &HashMap<String, Option<JoinClause>>, end: &str) -> Vec<JoinClause> {
    let mut steps = Vec::new();
    let mut cursor = end.to_ascii_lowercase();
    while let Some(Some(step)) = reached_from.get(&cursor) {
        cursor = step.left.table.to_ascii_lowercase();
        steps.push(step.clone());
    }
    steps.reverse();
    steps
}

/// Single foreign-key hops out of `table`, outgoing keys first.
fn hops(catalog: &Catalog, table: &str) -> Vec<JoinClause> {
    let Some(source) = catalog.table(table) else {
        return Vec::new();
    };
    let mut hops = source
        .foreign_keys
        .iter()
        .filter(|fk| !fk.target_table.eq_ignore_ascii_case(&source.name))
        .filter_map(|fk| {
            let target = catalog.table(&fk.target_table)?;
            Some(JoinClause {
                table: target.name.clone(),
                left: ColumnRef::new(&source.name, &fk.column),
                right: ColumnRef::new(&target.name, &fk.target_column),
            })
        })
        .collect::<Vec<_>>();

    for other in catalog.tables() {
        if other.name.eq_ignore_ascii_case(&source.name) {
            continue;
        }
        for fk in &other.foreign_keys {
            if fk.target_table.eq_ignore_ascii_case(&source.name) {
                hops.push(JoinClause {
                    table: other.name.clone(),
                    left: ColumnRef::new(&source.name, &fk.target_column),
                    right: ColumnRef::new(&other.name, &fk.column),
                });
            }
        }
    }
    hops
}
