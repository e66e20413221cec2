//! Question templates over a catalog: sample questions per platform and follow-ups per answer.

use crate::catalog::{Catalog, Table};
use crate::models::{Projection, QueryPlan};
use crate::utils::text::humanize_identifier;

const MAX_FOLLOW_UPS: usize = 2;
const TOP_N: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Template {
    CountPerParent,
    MonthlyTrend,
    AveragePerParent,
    CountPerStatus,
    TopByMeasure,
}

const TEMPLATES: [Template; 5] = [
    Template::CountPerParent,
    Template::MonthlyTrend,
    Template::AveragePerParent,
    Template::CountPerStatus,
    Template::TopByMeasure,
];

/// Up to `count` distinct questions the planner can answer from `catalog`.
///
/// Template kinds are interleaved so a short list still shows the range of supported questions.
#[must_use]
pub fn sample_questions(catalog: &Catalog, count: usize) -> Vec<String> {
    let per_template = TEMPLATES
        .iter()
        .map(|template| {
            catalog
                .tables()
                .iter()
                .filter_map(|table| render(*template, table, catalog))
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>();

    let mut questions = Vec::new();
    let longest = per_template.iter().map(Vec::len).max().unwrap_or(0);
    for index in 0..longest {
        for questions_of_kind in &per_template {
            if questions.len() >= count {
                return questions;
            }
            if let Some(question) = questions_of_kind.get(index) {
                if !questions.contains(question) {
                    questions.push(question.clone());
                }
            }
        }
    }
    questions
}

/// One or two follow-ups about the plan's primary table that differ from the question asked.
#[must_use]
pub fn follow_ups(question: &str, plan: &QueryPlan, catalog: &Catalog) -> Vec<String> {
    let Some(query) = plan.select() else {
        return Vec::new();
    };
    let Some(table) = catalog.table(&query.from) else {
        return Vec::new();
    };
    let already_trended = query
        .projection
        .iter()
        .any(|projection| matches!(projection, Projection::Bucket { .. }));

    let mut suggestions = TEMPLATES
        .iter()
        .filter(|template| !(already_trended && **template == Template::MonthlyTrend))
        .filter_map(|template| render(*template, table, catalog))
        .filter(|candidate| !candidate.eq_ignore_ascii_case(question.trim()))
        .take(MAX_FOLLOW_UPS)
        .collect::<Vec<_>>();
    if suggestions.is_empty() {
        suggestions.push(format!("How many {} are there in total?", noun(table)));
    }
    suggestions
}

fn render(template: Template, table: &Table, catalog: &Catalog) -> Option<String> {
    let noun = noun(table);
    match template {
        Template::CountPerParent => {
            let parent = parent_table(table, catalog)?;
            Some(format!(
                "How many {noun} are there per {}?",
                singular(&humanize_identifier(&parent.name))
            ))
        }
        Template::MonthlyTrend => {
            let date = table.date_columns().next()?;
            Some(format!(
                "How many {noun} per month by {}?",
                humanize_identifier(&date.name)
            ))
        }
        Template::AveragePerParent => {
            let measure = table.measure_columns().next()?;
            let parent = parent_table(table, catalog)?;
            Some(format!(
                "What is the average {} per {}?",
                humanize_identifier(&measure.name),
                singular(&humanize_identifier(&parent.name))
            ))
        }
        Template::CountPerStatus => {
            let status = table.enum_columns().next()?;
            Some(format!(
                "How many {noun} are there per {}?",
                humanize_identifier(&status.name)
            ))
        }
        Template::TopByMeasure => {
            let measure = table.measure_columns().next()?;
            table.label_columns().first()?;
            Some(format!(
                "Show the top {TOP_N} {noun} by {}",
                humanize_identifier(&measure.name)
            ))
        }
    }
}

fn noun(table: &Table) -> String {
    humanize_identifier(&table.name)
}

/// First table this one points at through a foreign key, skipping self references.
fn parent_table<'a>(table: &Table, catalog: &'a Catalog) -> Option<&'a Table> {
    table
        .foreign_keys
        .iter()
        .filter(|fk| !fk.target_table.eq_ignore_ascii_case(&table.name))
        .find_map(|fk| catalog.table(&fk.target_table))
}

fn singular(phrase: &str) -> String {
    let (head, last) = phrase.rsplit_once(' ').unwrap_or(("", phrase));
    let last = if let Some(stripped) = last.strip_suffix("ies") {
        format!("{stripped}y")
    } else if last.ends_with("sses") || last.ends_with("ches") || last.ends_with("shes") {
        last[..last.len() - 2].to_string()
    } else if last.ends_with('s') && !["ss", "us", "is"].iter().any(|end| last.ends_with(end)) {
        last[..last.len() - 1].to_string()
    } else {
        last.to_string()
    };
    if head.is_empty() {
        last
    } else {
        format!("{head} {last}")
    }
}
