use std::collections::BTreeSet;
use std::fmt::Write as _;

use serde::Serialize;

use super::{Catalog, Table};
use crate::utils::text::{approx_tokens, identifier_words, stem};

/// Relevance-filtered grounding document handed to the planner.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogDigest<'a> {
    pub platform: &'a str,
    pub text: String,
    pub approx_tokens: usize,
    pub tables: Vec<&'a Table>,
    pub omitted: Vec<&'a str>,

    #[serde(skip)]
    catalog: &'a Catalog,
}

impl<'a> CatalogDigest<'a> {
    #[must_use]
    pub fn catalog(&self) -> &'a Catalog {
        self.catalog
    }

    #[must_use]
    pub fn table(&self, name: &str) -> Option<&'a Table> {
        self.tables
            .iter()
            .copied()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.table(name).is_some()
    }
}

impl Catalog {
    /// Builds the grounding document for `question`.
    ///
    /// Every table is included when the whole schema fits `token_budget`. Otherwise tables are
    /// ranked by word overlap with the question and added best-first until the budget is spent;
    /// `pinned` tables (the ones prior turns were grounded on) are always kept regardless of
    /// budget.
    #[must_use]
    pub fn describe(&self, question: &str, pinned: &[String], token_budget: usize) -> CatalogDigest<'_> {
        let header = format!(
            "platform {}: {} tables\n",
            self.platform,
            self.tables.len()
        );
        let blocks = self.tables.iter().map(render_table).collect::<Vec<_>>();
        let total = approx_tokens(&header) + blocks.iter().map(|block| approx_tokens(block)).sum::<usize>();

        let included = if total <= token_budget {
            (0..self.tables.len()).collect::<BTreeSet<_>>()
        } else {
            self.select_within_budget(question, pinned, &blocks, token_budget.saturating_sub(approx_tokens(&header)))
        };

        let mut text = header;
        let mut tables = Vec::new();
        let mut omitted = Vec::new();
        for (index, table) in self.tables.iter().enumerate() {
            if included.contains(&index) {
                text.push_str(&blocks[index]);
                tables.push(table);
            } else {
                omitted.push(table.name.as_str());
            }
        }
        if !omitted.is_empty() {
            let _ = writeln!(text, "({} less relevant tables omitted)", omitted.len());
        }

        CatalogDigest {
            platform: &self.platform,
            approx_tokens: approx_tokens(&text),
            text,
            tables,
            omitted,
            catalog: self,
        }
    }

    fn select_within_budget(
        &self,
        question: &str,
        pinned: &[String],
        blocks: &[String],
        budget: usize,
    ) -> BTreeSet<usize> {
        let scores = self.relevance_scores(question);
        let is_pinned = |index: usize| {
            pinned
                .iter()
                .any(|name| self.tables[index].name.eq_ignore_ascii_case(name))
        };

        let mut order = (0..self.tables.len()).collect::<Vec<_>>();
        order.sort_by(|left, right| {
            is_pinned(*right)
                .cmp(&is_pinned(*left))
                .then(scores[*right].cmp(&scores[*left]))
                .then(left.cmp(right))
        });

        let mut used = 0usize;
        let mut included = BTreeSet::new();
        for index in order {
            let cost = approx_tokens(&blocks[index]);
            if is_pinned(index) || used + cost <= budget {
                used += cost;
                included.insert(index);
            }
        }
        included
    }

    /// Overlap between question words and table/column/value words; table-name hits weigh most
    /// and direct neighbours of a named table get a small bonus so join paths survive.
    fn relevance_scores(&self, question: &str) -> Vec<u32> {
        let words = question_stems(question);
        let mut scores = self
            .tables
            .iter()
            .map(|table| {
                let name_hits = overlap(&words, identifier_words(&table.name).iter());
                let column_hits = table
                    .columns
                    .iter()
                    .map(|column| overlap(&words, identifier_words(&column.name).iter()))
                    .sum::<u32>();
                let value_hits = table
                    .columns
                    .iter()
                    .flat_map(|column| column.allowed_values.iter())
                    .map(|value| overlap(&words, identifier_words(value).iter()))
                    .sum::<u32>();
                name_hits * 6 + column_hits * 2 + value_hits * 4
            })
            .collect::<Vec<_>>();

        let named = self
            .tables
            .iter()
            .enumerate()
            .filter(|(_, table)| overlap(&words, identifier_words(&table.name).iter()) > 0)
            .map(|(_, table)| table.name.as_str())
            .collect::<Vec<_>>();
        for name in named {
            for neighbor in self.neighbors(name) {
                if let Some(index) = self
                    .tables
                    .iter()
                    .position(|table| table.name.eq_ignore_ascii_case(neighbor))
                {
                    scores[index] += 1;
                }
            }
        }
        scores
    }
}

fn question_stems(question: &str) -> BTreeSet<String> {
    question
        .split(|ch: char| !ch.is_alphanumeric() && ch != '_')
        .flat_map(identifier_words)
        .filter(|word| word.len() > 1)
        .map(|word| stem(&word))
        .collect()
}

fn overlap<'w>(question: &BTreeSet<String>, words: impl Iterator<Item = &'w String>) -> u32 {
    let hits = words
        .filter(|word| word.len() > 1 && question.contains(&stem(word)))
        .count();
    u32::try_from(hits).unwrap_or(u32::MAX)
}

fn render_table(table: &Table) -> String {
    let mut block = format!("table {} (~{} rows)\n", table.name, table.estimated_rows);
    for column in &table.columns {
        let _ = write!(
            block,
            "  {} {}",
            column.name,
            column.semantic_type.as_str()
        );
        if column.primary_key {
            block.push_str(" pk");
        }
        if !column.nullable && !column.primary_key {
            block.push_str(" not null");
        }
        if let Some(fk) = table.foreign_key(&column.name) {
            let _ = write!(block, " -> {}.{}", fk.target_table, fk.target_column);
        }
        if !column.allowed_values.is_empty() {
            let _ = write!(block, " values: {}", column.allowed_values.join("|"));
        }
        block.push('\n');
    }
    block
}
