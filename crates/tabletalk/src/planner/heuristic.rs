use std::collections::BTreeSet;

use time::{Date, Month};

use super::joins;
use super::lexicon::{
    self, ANAPHORA_CUES, AVG_CUES, COUNT_CUES, EARLY_CUES, GROUP_CUES, LEADING_FILLER, MAX_CUES,
    MIN_CUES, MONTH_CUES, RECENT_CUES, STOPWORDS, SUM_CUES, Token, VISUAL_CUES, WriteIntent,
    YEAR_CUES,
};
use super::{PlanRequest, Planner, PlanningFailure};
use crate::catalog::{Catalog, CatalogDigest, Column, SemanticType, Table};
use crate::chart::{self, AxisKind};
use crate::models::{
    AggregateFn, Assignment, ChartFragment, ChartKind, ColumnRef, ExecutionResult, Filter,
    FilterOp, Literal, OrderTerm, PlanStatement, Projection, QueryPlan, Rejection, SelectQuery,
    TimeBucket, Turn, WriteKind, WriteStatement, quote_ident,
};
use crate::utils::text::identifier_words;
use crate::utils::time::format_calendar_date;

/// Identifier words that say nothing about what a column holds.
const GENERIC_COLUMN_WORDS: &[&str] = &[
    "id", "date", "at", "on", "of", "code", "number", "no", "type",
];
/// Words that mark the measure a question most likely means when it names none.
const MEASURE_HINTS: &[&str] = &[
    "amount", "gross", "total", "salary", "price", "pay", "budget", "cost", "net",
];
/// Row limits imposed by successive `plan_too_expensive` rejections.
const NARROWED_LIMITS: [u64; 3] = [100, 10, 1];
const RANKING_DEFAULT_LIMIT: u64 = 10;
const LISTING_FALLBACK_COLUMNS: usize = 8;
const CHART_TITLE_MAX_CHARS: usize = 80;
/// Lowercase words before a table name that describe it rather than name a row.
const NON_VALUE_MODIFIERS: &[&str] = &[
    "current", "new", "other", "own", "different", "single", "same", "whole", "entire",
    "biggest", "smallest", "largest", "highest", "lowest", "recent", "previous", "his", "her",
];
/// Longest run of lowercase words read as one value ("human resources department").
const MODIFIER_MAX_WORDS: usize = 3;

/// Deterministic planner that grounds questions by word overlap with the catalog digest.
///
/// It never calls out to anything: the same question, transcript tail, digest and feedback
/// always produce the same plan.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicPlanner;

impl HeuristicPlanner {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Planner for HeuristicPlanner {
    fn propose(&self, request: &PlanRequest<'_>) -> Result<QueryPlan, PlanningFailure> {
        let tokens = lexicon::tokenize(request.question);
        let constraints = Constraints::from_request(request);
        let mut scene = Scene::ground(request.digest, &tokens, constraints);
        if scene.tables.is_empty() {
            return Err(PlanningFailure::ungrounded(
                "no table of this platform is usable for the question",
            ));
        }

        let (statement, chart, rationale) = match lexicon::write_intent(&tokens) {
            Some(intent) => {
                let write = scene.write_statement(intent)?;
                let rationale = format!("requested change: {} {}", write.kind.keyword(), write.table);
                (PlanStatement::Write(write), None, rationale)
            }
            None => {
                let cues = Cues::read(&tokens);
                let draft = scene.select_draft(request, &cues)?;
                let query = draft.into_query(&scene);
                let chart = if cues.visual && !scene.constraints.without_chart {
                    chart_for(&query, scene.catalog, &cues, request.question)
                } else {
                    None
                };
                let rationale = describe(&query);
                (PlanStatement::Select(query), chart, rationale)
            }
        };

        Ok(QueryPlan {
            platform: request.digest.platform.to_string(),
            statement,
            rationale,
            chart,
        })
    }
}

/// What earlier rejections rule out for this attempt.
#[derive(Debug, Clone, Default)]
struct Constraints {
    excluded_tables: BTreeSet<String>,
    excluded_columns: BTreeSet<(String, String)>,
    narrowing: usize,
    without_chart: bool,
}

impl Constraints {
    fn from_request(request: &PlanRequest<'_>) -> Self {
        let mut constraints = Self::default();
        for turn in request.transcript_tail.iter().filter(|turn| !turn.succeeded()) {
            for rejection in turn.rejections() {
                if matches!(rejection, Rejection::UnknownReference { .. }) {
                    constraints.apply(rejection);
                }
            }
        }
        if let Some(feedback) = request.feedback {
            for rejection in &feedback.rejections {
                constraints.apply(rejection);
            }
        }
        constraints
    }

    fn apply(&mut self, rejection: &Rejection) {
        match rejection {
            Rejection::UnknownReference {
                table,
                column: None,
            } => {
                self.excluded_tables.insert(table.to_ascii_lowercase());
            }
            Rejection::UnknownReference {
                table,
                column: Some(column),
            } => {
                self.excluded_columns
                    .insert((table.to_ascii_lowercase(), column.to_ascii_lowercase()));
            }
            Rejection::PlanTooExpensive { .. } => self.narrowing += 1,
            Rejection::ChartReferencesUnknownColumn { .. } => self.without_chart = true,
            // A write is proposed again as-is; the question asks for nothing else.
            Rejection::WriteNotAllowed { .. } => {}
        }
    }

    fn allows_table(&self, table: &str) -> bool {
        !self.excluded_tables.contains(&table.to_ascii_lowercase())
    }

    fn allows_column(&self, table: &str, column: &str) -> bool {
        !self
            .excluded_columns
            .contains(&(table.to_ascii_lowercase(), column.to_ascii_lowercase()))
    }
}

/// Question-wide signals that do not depend on the schema.
#[derive(Debug, Clone, Default)]
struct Cues {
    count: bool,
    sum: bool,
    avg: bool,
    max: Option<usize>,
    min: Option<usize>,
    asks_which: bool,
    visual: bool,
    pie: bool,
    monthly: bool,
    yearly: bool,
    trend: bool,
    top_n: Option<(usize, u64)>,
}

impl Cues {
    fn read(tokens: &[Token]) -> Self {
        let has_pair = |first: &str, second: &str| {
            tokens
                .windows(2)
                .any(|pair| pair[0].is(first) && pair[1].is(second))
        };
        // "at least 3" and "at most 5" are comparisons, not rankings.
        let ranking_cue = |words: &[&str]| {
            tokens.iter().enumerate().position(|(position, token)| {
                token.is_any(words)
                    && !position
                        .checked_sub(1)
                        .is_some_and(|previous| tokens[previous].is("at"))
            })
        };
        let opening = tokens.iter().find(|token| !token.is_any(LEADING_FILLER));
        let top_n = tokens.windows(2).enumerate().find_map(|(position, pair)| {
            let cue = pair[0].is_any(&["top", "bottom", "first", "last", "latest", "newest", "oldest"]);
            let count = pair[1].integer().and_then(|value| u64::try_from(value).ok());
            count.filter(|_| cue).map(|count| (position + 1, count))
        });

        Self {
            count: has_pair("how", "many") || has_pair("number", "of") || tokens.iter().any(|token| token.is_any(COUNT_CUES) && !token.is("many")),
            sum: tokens.iter().any(|token| token.is_any(SUM_CUES)),
            avg: tokens.iter().any(|token| token.is_any(AVG_CUES)),
            max: ranking_cue(MAX_CUES),
            min: ranking_cue(MIN_CUES),
            asks_which: opening.is_some_and(|token| token.is_any(&["which", "who"])),
            visual: tokens.iter().any(|token| token.is_any(VISUAL_CUES))
                || has_pair("over", "time"),
            pie: tokens
                .iter()
                .any(|token| token.is_any(&["pie", "share", "proportion", "split"])),
            monthly: tokens.iter().any(|token| token.is("monthly")),
            yearly: tokens
                .iter()
                .any(|token| token.is_any(&["yearly", "annual", "annually"])),
            trend: tokens.iter().any(|token| token.is_any(&["trend", "trends"]))
                || has_pair("over", "time"),
            top_n,
        }
    }

    fn ranking(&self) -> Option<(usize, bool)> {
        match (self.max, self.min) {
            (Some(max), Some(min)) => Some(if max <= min { (max, true) } else { (min, false) }),
            (Some(max), None) => Some((max, true)),
            (None, Some(min)) => Some((min, false)),
            (None, None) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Mention<'a> {
    table: &'a Table,
    position: usize,
    len: usize,
}

#[derive(Debug, Clone)]
struct ColumnHit<'a> {
    table: &'a Table,
    column: &'a Column,
    positions: Vec<usize>,
    significant_words: usize,
}

impl ColumnHit<'_> {
    fn full(&self) -> bool {
        self.positions.len() == self.significant_words
    }

    fn position(&self) -> usize {
        self.positions.iter().copied().min().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy)]
struct EnumHit<'a> {
    table: &'a Table,
    column: &'a Column,
    value: &'a str,
    position: usize,
    len: usize,
}

#[derive(Debug, Clone)]
struct Phrase {
    start: usize,
    end: usize,
    words: Vec<String>,
    /// Capitalised and quoted phrases are matched as spelled; lowercase modifiers are not.
    exact: bool,
}

/// The question laid over the usable part of the digest.
struct Scene<'a> {
    catalog: &'a Catalog,
    tables: Vec<&'a Table>,
    tokens: &'a [Token],
    constraints: Constraints,
    mentions: Vec<Mention<'a>>,
    columns: Vec<ColumnHit<'a>>,
    enums: Vec<EnumHit<'a>>,
    consumed: Vec<bool>,
}

fn word_stems(identifier: &str) -> Vec<String> {
    identifier_words(identifier)
        .iter()
        .map(|word| lexicon::word_stem(word))
        .collect()
}

fn is_measure(table: &Table, column: &Column) -> bool {
    column.semantic_type.is_numeric()
        && !column.primary_key
        && table.foreign_key(&column.name).is_none()
}

fn same_table(left: &Table, right: &Table) -> bool {
    left.name.eq_ignore_ascii_case(&right.name)
}

impl<'a> Scene<'a> {
    fn ground(digest: &CatalogDigest<'a>, tokens: &'a [Token], constraints: Constraints) -> Self {
        let tables = digest
            .tables
            .iter()
            .copied()
            .filter(|table| constraints.allows_table(&table.name))
            .collect::<Vec<_>>();
        let mut scene = Self {
            catalog: digest.catalog(),
            tables,
            tokens,
            constraints,
            mentions: Vec::new(),
            columns: Vec::new(),
            enums: Vec::new(),
            consumed: vec![false; tokens.len()],
        };
        scene.find_mentions();
        scene.find_enum_values();
        scene.find_column_hits();
        scene
    }

    fn table(&self, name: &str) -> Option<&'a Table> {
        self.tables
            .iter()
            .copied()
            .find(|table| table.name.eq_ignore_ascii_case(name))
    }

    fn allows(&self, table: &Table, column: &Column) -> bool {
        self.constraints.allows_column(&table.name, &column.name)
    }

    fn word_at(&self, position: usize) -> Option<&'a str> {
        self.tokens.get(position).and_then(Token::lower)
    }

    fn matches_at(&self, position: usize, stems: &[String]) -> bool {
        !stems.is_empty()
            && stems.iter().enumerate().all(|(offset, stem)| {
                self.tokens.get(position + offset).and_then(Token::stem) == Some(stem.as_str())
                    && !self.consumed[position + offset]
            })
    }

    fn consume(&mut self, start: usize, len: usize) {
        for flag in self.consumed.iter_mut().skip(start).take(len) {
            *flag = true;
        }
    }

    fn is_free(&self, start: usize, len: usize) -> bool {
        (start..start + len).all(|position| self.consumed.get(position) == Some(&false))
    }

    fn mention_at(&self, position: usize) -> Option<&Mention<'a>> {
        self.mentions
            .iter()
            .find(|mention| mention.position == position)
    }

    fn in_full_column_hit(&self, position: usize) -> bool {
        self.columns
            .iter()
            .any(|hit| hit.full() && hit.positions.contains(&position))
    }

    /// Table names, whole (`leave requests`) or by their last word (`requests`).
    fn find_mentions(&mut self) {
        let mut candidates = Vec::new();
        for (order, table) in self.tables.iter().copied().enumerate() {
            let stems = word_stems(&table.name);
            for position in 0..self.tokens.len() {
                if self.matches_at(position, &stems) {
                    candidates.push((position, false, stems.len(), order, table));
                } else if stems.len() > 1
                    && stems
                        .last()
                        .is_some_and(|last| self.matches_at(position, std::slice::from_ref(last)))
                {
                    candidates.push((position, true, 1, order, table));
                }
            }
        }
        candidates.sort_by_key(|(position, partial, len, order, _)| {
            (*position, *partial, std::cmp::Reverse(*len), *order)
        });
        for (position, _, len, _, table) in candidates {
            if !self.is_free(position, len) {
                continue;
            }
            self.consume(position, len);
            self.mentions.push(Mention {
                table,
                position,
                len,
            });
        }
    }

    fn find_enum_values(&mut self) {
        let mut hits = Vec::new();
        for (order, table) in self.tables.iter().copied().enumerate() {
            for column in table.enum_columns() {
                if !self.allows(table, column) {
                    continue;
                }
                for value in &column.allowed_values {
                    let stems = word_stems(value);
                    for position in 0..self.tokens.len() {
                        if self.matches_at(position, &stems) {
                            hits.push((order, EnumHit {
                                table,
                                column,
                                value,
                                position,
                                len: stems.len(),
                            }));
                        }
                    }
                }
            }
        }
        hits.sort_by_key(|(order, hit)| (hit.position, std::cmp::Reverse(hit.len), *order));
        self.enums = hits.into_iter().map(|(_, hit)| hit).collect();
    }

    fn find_column_hits(&mut self) {
        let table_stems = self
            .tables
            .iter()
            .flat_map(|table| word_stems(&table.name))
            .collect::<BTreeSet<_>>();
        let mut hits = Vec::new();
        for table in self.tables.iter().copied() {
            for column in &table.columns {
                if !self.allows(table, column) {
                    continue;
                }
                let significant = identifier_words(&column.name)
                    .into_iter()
                    .filter(|word| !GENERIC_COLUMN_WORDS.contains(&word.as_str()))
                    .map(|word| lexicon::word_stem(&word))
                    .filter(|stem| !table_stems.contains(stem))
                    .collect::<Vec<_>>();
                let positions = significant
                    .iter()
                    .filter_map(|stem| {
                        (0..self.tokens.len()).find(|&position| {
                            !self.consumed[position]
                                && self.tokens[position].stem() == Some(stem.as_str())
                        })
                    })
                    .collect::<Vec<_>>();
                if !positions.is_empty() {
                    hits.push(ColumnHit {
                        table,
                        column,
                        positions,
                        significant_words: significant.len(),
                    });
                }
            }
        }
        hits.sort_by_key(ColumnHit::position);
        self.columns = hits;
    }

    fn has_anaphora(&self) -> bool {
        let opening = self
            .tokens
            .iter()
            .position(|token| !token.is_any(&["please", "now"]));
        let leading_and = opening.is_some_and(|position| self.tokens[position].is("and"));
        let what_about = self.tokens.windows(2).take(2).any(|pair| {
            pair[0].is_any(&["what", "how"]) && pair[1].is("about")
        });
        leading_and
            || what_about
            || self.tokens.iter().any(|token| token.is_any(ANAPHORA_CUES))
    }

    /// "which department has the most employees": rank one table by a measure of another.
    fn which_most(&self) -> Option<Focus<'a>> {
        let opening = self.tokens.first()?;
        if !opening.is_any(&["which", "what"]) {
            return None;
        }
        let dimension = self.mentions.first().filter(|mention| mention.position <= 3)?;
        let after = dimension.position + dimension.len;
        let cue = (after..self.tokens.len()).find(|&position| {
            self.tokens[position].is_any(MAX_CUES) || self.tokens[position].is_any(MIN_CUES)
        })?;
        let descending = self.tokens[cue].is_any(MAX_CUES);
        let differs = |table: &Table| !same_table(table, dimension.table);

        let subject = self
            .mentions
            .iter()
            .find(|mention| mention.position > cue && differs(mention.table))
            .map(|mention| mention.table)
            .or_else(|| {
                self.enums
                    .iter()
                    .find(|hit| hit.position > cue && differs(hit.table))
                    .map(|hit| hit.table)
            });
        let subject = match subject {
            Some(subject) => subject,
            None => {
                let measure_after_cue = |hit: &&ColumnHit<'a>| {
                    hit.position() > cue && is_measure(hit.table, hit.column)
                };
                if self
                    .columns
                    .iter()
                    .filter(measure_after_cue)
                    .any(|hit| !differs(hit.table))
                {
                    return None;
                }
                self.columns
                    .iter()
                    .filter(measure_after_cue)
                    .find(|hit| hit.full())
                    .map(|hit| hit.table)?
            }
        };
        Some(Focus {
            primary: subject,
            ranked_by: Some(dimension.table),
            descending,
        })
    }

    fn choose_focus(&self, previous: Option<&Previous<'_>>) -> Option<Focus<'a>> {
        if let Some(focus) = self.which_most() {
            return Some(focus);
        }
        // A table right after "by"/"per" is a dimension, not the subject.
        let subject_mention = self.mentions.iter().find(|mention| {
            !mention
                .position
                .checked_sub(1)
                .is_some_and(|previous| self.tokens[previous].is_any(GROUP_CUES))
        });
        let primary = subject_mention
            .map(|mention| mention.table)
            .or_else(|| self.enums.first().map(|hit| hit.table))
            .or_else(|| self.best_column_table())
            .or_else(|| self.mentions.first().map(|mention| mention.table))
            .or_else(|| previous.and_then(|previous| self.table(&previous.query.from)))?;
        Some(Focus {
            primary,
            ranked_by: None,
            descending: true,
        })
    }

    /// Table whose columns the question names most fully.
    fn best_column_table(&self) -> Option<&'a Table> {
        let mut best: Option<(&'a Table, usize, usize)> = None;
        for hit in self.columns.iter().filter(|hit| hit.full()) {
            let score = self
                .columns
                .iter()
                .filter(|other| other.full() && same_table(other.table, hit.table))
                .count();
            let better = best.is_none_or(|(_, best_score, best_position)| {
                score > best_score || (score == best_score && hit.position() < best_position)
            });
            if better {
                best = Some((hit.table, score, hit.position()));
            }
        }
        best.map(|(table, _, _)| table)
    }

    fn select_draft(
        &mut self,
        request: &PlanRequest<'_>,
        cues: &Cues,
    ) -> Result<SelectDraft<'a>, PlanningFailure> {
        let previous = previous_select(request.transcript_tail);
        let previous = previous.filter(|_| self.has_anaphora());
        let focus = self.choose_focus(previous.as_ref()).ok_or_else(|| {
            PlanningFailure::ungrounded("no table, column or value in the question matches the schema")
        })?;

        let mut draft = SelectDraft::new(focus.primary);
        for mention in &self.mentions {
            draft.involve(mention.table);
        }
        if let Some(table) = focus.ranked_by {
            draft.involve(table);
        }
        if let Some((position, _)) = cues.top_n {
            self.consume(position, 1);
        }

        self.find_key_filters(&mut draft)?;
        self.find_date_filters(&mut draft);
        self.find_numeric_filters(&mut draft);
        self.find_enum_filters(&mut draft);
        self.find_phrase_filters(&mut draft)?;
        if let Some(previous) = previous.as_ref() {
            self.inherit_from(previous, &mut draft);
        }

        draft.dimension = self.find_dimension(&focus, &draft, cues);
        self.shape(&mut draft, &focus, cues);
        Ok(draft)
    }

    /// "employee 5", "invoice #12": equality on the primary key.
    ///
    /// A number in key position that is not a valid key fails the plan rather than being
    /// dropped, which would widen the answer to every row.
    fn find_key_filters(&mut self, draft: &mut SelectDraft<'a>) -> Result<(), PlanningFailure> {
        let mentions = self.mentions.clone();
        for mention in mentions {
            let mut position = mention.position + mention.len;
            let labelled = self
                .tokens
                .get(position)
                .is_some_and(|token| token.is_any(&["id", "number", "no"]));
            if labelled {
                position += 1;
            }
            let id = match self.tokens.get(position) {
                Some(Token::Integer(id)) => *id,
                Some(Token::Decimal(value)) if labelled || value.fract() == 0.0 => {
                    return Err(PlanningFailure::ungrounded(format!(
                        "`{value}` is not a usable {} key",
                        mention.table.name
                    )));
                }
                _ => continue,
            };
            let Some(key) = mention.table.primary_key() else {
                continue;
            };
            if !self.is_free(position, 1) || !self.allows(mention.table, key) {
                continue;
            }
            self.consume(position, 1);
            draft.add_filter(position, mention.table, key, FilterOp::Eq, Literal::Integer(id));
        }
        Ok(())
    }

    fn first_date_column(&self, table: &'a Table) -> Option<&'a Column> {
        table.date_columns().find(|column| self.allows(table, column))
    }

    /// Date column a date literal at `position` most likely constrains.
    fn date_column_near(&self, position: usize, draft: &SelectDraft<'a>) -> Option<(&'a Table, &'a Column)> {
        self.columns
            .iter()
            .filter(|hit| {
                hit.full()
                    && hit.column.semantic_type == SemanticType::Date
                    && draft.involves(hit.table)
            })
            .min_by_key(|hit| hit.position().abs_diff(position))
            .map(|hit| (hit.table, hit.column))
            .or_else(|| {
                self.first_date_column(draft.primary)
                    .map(|column| (draft.primary, column))
            })
            .or_else(|| {
                draft.involved.iter().find_map(|&table| {
                    self.first_date_column(table).map(|column| (table, column))
                })
            })
    }

    fn find_date_filters(&mut self, draft: &mut SelectDraft<'a>) {
        let tokens = self.tokens;
        for position in 0..tokens.len() {
            if self.consumed[position] {
                continue;
            }
            match &tokens[position] {
                Token::Date(date) => {
                    let Some((table, column)) = self.date_column_near(position, draft) else {
                        continue;
                    };
                    let opens_range = position
                        .checked_sub(1)
                        .and_then(|previous| self.word_at(previous))
                        == Some("between")
                        && self.word_at(position + 1) == Some("and");
                    if opens_range {
                        if let Some(Token::Date(end)) = tokens.get(position + 2) {
                            self.consume(position, 3);
                            draft.add_filter(position, table, column, FilterOp::Ge, date_literal(*date));
                            draft.add_filter(position + 2, table, column, FilterOp::Le, date_literal(*end));
                            continue;
                        }
                    }
                    let op = lexicon::comparison_before(tokens, position).unwrap_or(FilterOp::Eq);
                    self.consume(position, 1);
                    draft.add_filter(position, table, column, op, date_literal(*date));
                }
                Token::Integer(year) if (1900..=2100).contains(year) => {
                    if let Ok(year) = i32::try_from(*year) {
                        self.find_year_filter(position, year, draft);
                    }
                }
                _ => {}
            }
        }
    }

    fn find_year_filter(&mut self, position: usize, year: i32, draft: &mut SelectDraft<'a>) {
        let Some((table, column)) = self.date_column_near(position, draft) else {
            return;
        };
        let previous_word = position
            .checked_sub(1)
            .filter(|previous| !self.consumed[*previous])
            .and_then(|previous| self.word_at(previous));

        if let Some(month) = previous_word.and_then(lexicon::month_number) {
            if let Some((start, end)) = month_range(year, month) {
                self.consume(position - 1, 2);
                draft.add_filter(position, table, column, FilterOp::Ge, date_literal(start));
                draft.add_filter(position, table, column, FilterOp::Lt, date_literal(end));
            }
            return;
        }

        let (Some(start), Some(next)) = (year_start(year), year_start(year + 1)) else {
            return;
        };
        let bounds = match previous_word {
            Some("in" | "during" | "of" | "for") => vec![(FilterOp::Ge, start), (FilterOp::Lt, next)],
            Some("since" | "from") => vec![(FilterOp::Ge, start)],
            Some("after") => vec![(FilterOp::Ge, next)],
            Some("before") => vec![(FilterOp::Lt, start)],
            Some("until" | "through" | "till" | "by") => vec![(FilterOp::Lt, next)],
            _ => return,
        };
        self.consume(position, 1);
        for (op, date) in bounds {
            draft.add_filter(position, table, column, op, date_literal(date));
        }
    }

    /// "salary over 50000": a range on the nearest measure named before the number.
    fn find_numeric_filters(&mut self, draft: &mut SelectDraft<'a>) {
        let tokens = self.tokens;
        for position in 0..tokens.len() {
            if self.consumed[position] {
                continue;
            }
            let value = match &tokens[position] {
                Token::Integer(value) => Literal::Integer(*value),
                Token::Decimal(value) => Literal::Real(*value),
                _ => continue,
            };
            let Some(op) = lexicon::comparison_before(tokens, position).filter(|op| op.is_range())
            else {
                continue;
            };
            // "more than 5 employees" counts rows, which a plain filter cannot express.
            if self.mention_at(position + 1).is_some() {
                continue;
            }
            let measure = self
                .columns
                .iter()
                .filter(|hit| {
                    hit.position() < position
                        && is_measure(hit.table, hit.column)
                        && draft.involves(hit.table)
                })
                .max_by_key(|hit| hit.position())
                .map(|hit| (hit.table, hit.column));
            let Some((table, column)) = measure else {
                continue;
            };
            self.consume(position, 1);
            draft.add_filter(position, table, column, op, value);
        }
    }

    fn find_enum_filters(&mut self, draft: &mut SelectDraft<'a>) {
        let hits = self.enums.clone();
        for hit in hits {
            if !draft.involves(hit.table)
                || !self.is_free(hit.position, hit.len)
                || draft.has_filter_on(hit.table, hit.column)
            {
                continue;
            }
            self.consume(hit.position, hit.len);
            draft.add_filter(
                hit.position,
                hit.table,
                hit.column,
                FilterOp::Eq,
                Literal::Text(hit.value.to_string()),
            );
        }
    }

    /// Capitalised or quoted phrases the schema does not otherwise explain, plus lowercase
    /// modifiers of a table other than the subject ("the engineering department").
    fn phrases(&self, primary: &Table) -> Vec<Phrase> {
        let mut phrases = Vec::new();
        let mut position = 0;
        while position < self.tokens.len() {
            if self.consumed[position] || self.in_full_column_hit(position) {
                position += 1;
                continue;
            }
            match &self.tokens[position] {
                Token::Quoted(text) => {
                    phrases.push(Phrase {
                        start: position,
                        end: position + 1,
                        words: vec![text.clone()],
                        exact: true,
                    });
                    position += 1;
                }
                token if position > 0 && token.is_proper_noun() => {
                    let start = position;
                    let mut words = Vec::new();
                    while position < self.tokens.len()
                        && !self.consumed[position]
                        && !self.in_full_column_hit(position)
                        && self.tokens[position].is_proper_noun()
                    {
                        words.extend(self.tokens[position].text().map(ToString::to_string));
                        position += 1;
                    }
                    phrases.push(Phrase {
                        start,
                        end: position,
                        words,
                        exact: true,
                    });
                }
                _ => position += 1,
            }
        }
        for mention in &self.mentions {
            if same_table(mention.table, primary) || mention.table.label_columns().is_empty() {
                continue;
            }
            if let Some(phrase) = self.modifier_before(mention.position) {
                let overlaps = phrases
                    .iter()
                    .any(|other| other.start < phrase.end && phrase.start < other.end);
                if !overlaps {
                    phrases.push(phrase);
                }
            }
        }
        phrases.sort_by_key(|phrase| phrase.start);
        phrases
    }

    fn modifier_before(&self, end: usize) -> Option<Phrase> {
        let is_modifier = |position: usize| {
            let token = &self.tokens[position];
            !self.consumed[position]
                && !self.in_full_column_hit(position)
                && !token.is_proper_noun()
                && token.lower().is_some_and(|lower| {
                    !STOPWORDS.contains(&lower)
                        && !NON_VALUE_MODIFIERS.contains(&lower)
                        && !lexicon::is_cue_word(lower)
                        && lexicon::month_number(lower).is_none()
                })
        };
        let mut start = end;
        while start > 0 && end - start < MODIFIER_MAX_WORDS && is_modifier(start - 1) {
            start -= 1;
        }
        if start == end {
            return None;
        }
        let words = self.tokens[start..end]
            .iter()
            .filter_map(Token::lower)
            .map(ToString::to_string)
            .collect();
        Some(Phrase {
            start,
            end,
            words,
            exact: false,
        })
    }

    fn phrase_target(&self, phrase: &Phrase, primary: &'a Table) -> &'a Table {
        let labelled = |table: &Table| !table.label_columns().is_empty();
        // "department Engineering"
        if let Some(mention) = self
            .mentions
            .iter()
            .find(|mention| mention.position + mention.len == phrase.start)
        {
            return mention.table;
        }
        // "Engineering department", unless it is the subject itself ("Engineering employees")
        if let Some(mention) = self
            .mentions
            .iter()
            .find(|mention| mention.position == phrase.end && !same_table(mention.table, primary))
        {
            return mention.table;
        }
        let preceding = phrase
            .start
            .checked_sub(1)
            .and_then(|previous| self.word_at(previous));
        if preceding.is_some_and(|word| matches!(word, "named" | "called")) {
            return primary;
        }
        if let Some(mention) = self
            .mentions
            .iter()
            .find(|mention| !same_table(mention.table, primary) && labelled(mention.table))
        {
            return mention.table;
        }
        primary
            .foreign_keys
            .iter()
            .filter(|fk| !fk.target_table.eq_ignore_ascii_case(&primary.name))
            .find_map(|fk| self.table(&fk.target_table).filter(|table| labelled(table)))
            .unwrap_or(primary)
    }

    /// Each phrase becomes an equality on a label column, or the plan fails: a value the
    /// question names but the plan ignores would answer a wider question than was asked.
    fn find_phrase_filters(&mut self, draft: &mut SelectDraft<'a>) -> Result<(), PlanningFailure> {
        for phrase in self.phrases(draft.primary) {
            let table = self.phrase_target(&phrase, draft.primary);
            let labels = table
                .label_columns()
                .into_iter()
                .filter(|column| self.allows(table, column))
                .collect::<Vec<_>>();
            let Some(first_label) = labels.first().copied() else {
                return Err(PlanningFailure::ungrounded(format!(
                    "no column of {} can hold `{}`",
                    table.name,
                    phrase.words.join(" ")
                )));
            };
            self.consume(phrase.start, phrase.end - phrase.start);
            // SQLite's LIKE folds ASCII case, so lowercase modifiers still match stored names.
            let op = if phrase.exact { FilterOp::Eq } else { FilterOp::Like };
            if phrase.words.len() == 2 && labels.len() >= 2 {
                for (column, word) in labels.iter().zip(&phrase.words) {
                    draft.add_filter(phrase.start, table, column, op, Literal::Text(word.clone()));
                }
            } else {
                draft.add_filter(
                    phrase.start,
                    table,
                    first_label,
                    op,
                    Literal::Text(phrase.words.join(" ")),
                );
            }
        }
        Ok(())
    }

    /// Applies what "that", "those" or "the same period" point back to.
    fn inherit_from(&self, previous: &Previous<'_>, draft: &mut SelectDraft<'a>) {
        if let Some((table, values)) = self.single_row_referent(previous) {
            for (column, value) in values {
                if !draft.has_filter_on(table, column) {
                    draft.add_filter(usize::MAX, table, column, FilterOp::Eq, Literal::Text(value));
                }
            }
            return;
        }

        for filter in &previous.query.filters {
            let Some(table) = self.table(&filter.column.table) else {
                continue;
            };
            let Some(column) = table.column(&filter.column.column) else {
                continue;
            };
            if !self.allows(table, column) {
                continue;
            }
            // "the same period" on a different subject moves the range onto its own date.
            let (table, column) = if filter.op.is_range()
                && column.semantic_type == SemanticType::Date
                && !draft.involves(table)
            {
                match self.first_date_column(draft.primary) {
                    Some(own) => (draft.primary, own),
                    None => (table, column),
                }
            } else {
                (table, column)
            };
            let duplicate = draft.filters.iter().any(|(_, existing)| {
                existing.column == ColumnRef::new(&table.name, &column.name)
                    && (existing.op == filter.op || !filter.op.is_range())
            });
            if !duplicate {
                draft.add_filter(usize::MAX, table, column, filter.op, filter.value.clone());
            }
        }
    }

    /// The one row a previous answer produced, identified by its label values.
    fn single_row_referent(&self, previous: &Previous<'_>) -> Option<(&'a Table, Vec<(&'a Column, String)>)> {
        let result = previous.result?;
        if result.row_count != 1 {
            return None;
        }
        let table = self.table(&previous.query.from)?;
        let mut values = Vec::new();
        for label in table.label_columns() {
            let reference = ColumnRef::new(&table.name, &label.name);
            let projection = previous.query.projection.iter().find(|projection| {
                matches!(projection, Projection::Column { .. })
                    && projection.column_ref() == Some(&reference)
            })?;
            let value = result.value(0, projection.alias())?.as_str()?;
            values.push((label, value.to_string()));
        }
        (!values.is_empty()).then_some((table, values))
    }

    fn bucket_column(&self, position: usize, draft: &SelectDraft<'a>) -> Option<(&'a Table, &'a Column)> {
        self.date_column_near(position, draft)
    }

    fn find_dimension(&self, focus: &Focus<'a>, draft: &SelectDraft<'a>, cues: &Cues) -> Option<Dimension<'a>> {
        if let Some(table) = focus.ranked_by {
            return Some(Dimension::Table(table));
        }
        for (position, token) in self.tokens.iter().enumerate() {
            if !token.is_any(GROUP_CUES) {
                continue;
            }
            let end = (position + 4).min(self.tokens.len());
            for candidate in position + 1..end {
                let word = &self.tokens[candidate];
                if word.is_any(MONTH_CUES) || word.is_any(YEAR_CUES) {
                    let bucket = if word.is_any(MONTH_CUES) {
                        TimeBucket::Month
                    } else {
                        TimeBucket::Year
                    };
                    return self
                        .bucket_column(candidate, draft)
                        .map(|(table, column)| Dimension::Bucket(table, column, bucket));
                }
                if let Some(mention) = self.mention_at(candidate) {
                    if same_table(mention.table, draft.primary) {
                        break;
                    }
                    return Some(Dimension::Table(mention.table));
                }
                let hit = self.columns.iter().find(|hit| {
                    hit.full()
                        && hit.positions.contains(&candidate)
                        && draft.involves(hit.table)
                        && !hit.column.primary_key
                        && !is_measure(hit.table, hit.column)
                });
                if let Some(hit) = hit {
                    if hit.column.semantic_type == SemanticType::Date {
                        return Some(Dimension::Bucket(hit.table, hit.column, TimeBucket::Month));
                    }
                    return Some(Dimension::Column(hit.table, hit.column));
                }
                if !word.is_any(STOPWORDS) {
                    break;
                }
            }
        }

        let bucket = if cues.yearly {
            Some(TimeBucket::Year)
        } else if cues.monthly || cues.trend {
            Some(TimeBucket::Month)
        } else {
            None
        };
        let bucket = bucket?;
        self.bucket_column(0, draft)
            .map(|(table, column)| Dimension::Bucket(table, column, bucket))
    }

    /// Measure the question names, preferring the primary table's columns.
    fn explicit_measure(&self, draft: &SelectDraft<'a>) -> Option<(&'a Table, &'a Column)> {
        let mut hits = self
            .columns
            .iter()
            .filter(|hit| is_measure(hit.table, hit.column) && draft.involves(hit.table))
            .collect::<Vec<_>>();
        hits.sort_by_key(|hit| (!same_table(hit.table, draft.primary), !hit.full(), hit.position()));
        hits.first().map(|hit| (hit.table, hit.column))
    }

    fn measure(&self, draft: &SelectDraft<'a>) -> Option<(&'a Table, &'a Column)> {
        if let Some(measure) = self.explicit_measure(draft) {
            return Some(measure);
        }
        let primary = draft.primary;
        let measures = || {
            primary
                .measure_columns()
                .filter(|column| self.allows(primary, column))
        };
        measures()
            .find(|column| {
                identifier_words(&column.name)
                    .iter()
                    .any(|word| MEASURE_HINTS.contains(&word.as_str()))
            })
            .or_else(|| measures().next())
            .map(|column| (primary, column))
    }

    /// Decides aggregation, listing columns, ordering and limits.
    fn shape(&self, draft: &mut SelectDraft<'a>, focus: &Focus<'a>, cues: &Cues) {
        let top_n = cues.top_n.map(|(_, count)| count);
        let explicit_measure = self.explicit_measure(draft);
        let subject_named = self
            .mentions
            .iter()
            .any(|mention| same_table(mention.table, draft.primary));

        let function = if cues.count {
            Some(AggregateFn::Count)
        } else if cues.avg {
            Some(AggregateFn::Avg)
        } else if cues.sum {
            Some(AggregateFn::Sum)
        } else if cues.ranking().is_some()
            && !cues.asks_which
            && top_n.is_none()
            && explicit_measure.is_some()
            && (draft.dimension.is_some() || !subject_named)
            && focus.ranked_by.is_none()
        {
            cues.ranking().map(|(_, descending)| {
                if descending {
                    AggregateFn::Max
                } else {
                    AggregateFn::Min
                }
            })
        } else if draft.dimension.is_some() {
            Some(AggregateFn::Count)
        } else {
            None
        };

        if let Some(function) = function {
            let measure = match function {
                AggregateFn::Count => None,
                AggregateFn::Max | AggregateFn::Min => explicit_measure,
                AggregateFn::Sum | AggregateFn::Avg => self.measure(draft),
            };
            draft.aggregate = Some(match measure {
                Some(measure) => Aggregate {
                    function,
                    measure: Some(measure),
                },
                None => Aggregate::count(),
            });
            draft.order = match &draft.dimension {
                Some(Dimension::Bucket(..)) => Some(Order {
                    key: OrderKey::Bucket,
                    descending: false,
                }),
                Some(_) => {
                    let descending = if focus.ranked_by.is_some() {
                        focus.descending
                    } else {
                        cues.ranking().is_none_or(|(_, descending)| descending)
                    };
                    Some(Order {
                        key: OrderKey::Aggregate,
                        descending,
                    })
                }
                None => None,
            };
            draft.limit = if focus.ranked_by.is_some() {
                Some(top_n.unwrap_or(1))
            } else if draft.dimension.is_some() {
                top_n
            } else {
                None
            };
            return;
        }

        self.listing_columns(draft);
        let singular_subject = self.mentions.first().is_none_or(|mention| {
            self.word_at(mention.position + mention.len - 1)
                .is_none_or(|word| !word.ends_with('s'))
        });
        let single_answer = cues.asks_which && singular_subject;

        if let (Some((_, descending)), Some((table, column))) = (cues.ranking(), explicit_measure) {
            draft.order = Some(Order {
                key: OrderKey::Column(table, column),
                descending,
            });
            draft.limit = Some(top_n.unwrap_or(if single_answer { 1 } else { RANKING_DEFAULT_LIMIT }));
            return;
        }

        let recency = self.tokens.iter().enumerate().find_map(|(position, token)| {
            if self.in_full_column_hit(position) || self.consumed[position] {
                return None;
            }
            if token.is_any(RECENT_CUES) {
                Some((position, true))
            } else if token.is_any(EARLY_CUES) {
                Some((position, false))
            } else {
                None
            }
        });
        let recency = recency.or_else(|| {
            cues.top_n
                .and_then(|(position, _)| position.checked_sub(1))
                .and_then(|cue| {
                    let token = &self.tokens[cue];
                    if token.is_any(RECENT_CUES) {
                        Some((cue, true))
                    } else if token.is_any(EARLY_CUES) {
                        Some((cue, false))
                    } else {
                        None
                    }
                })
        });
        if let Some((position, descending)) = recency {
            if let Some((table, column)) = self.date_column_near(position, draft) {
                draft.extra_columns_push(table, column);
                draft.order = Some(Order {
                    key: OrderKey::Column(table, column),
                    descending,
                });
                draft.limit = top_n.or(single_answer.then_some(1));
                return;
            }
        }
        draft.limit = top_n;
    }

    fn listing_columns(&self, draft: &mut SelectDraft<'a>) {
        for hit in &self.columns {
            if hit.full()
                && draft.involves(hit.table)
                && !hit.column.primary_key
                && !draft.has_eq_filter(hit.table, hit.column)
            {
                draft.extra_columns_push(hit.table, hit.column);
            }
        }
        let ranged = draft
            .filters
            .iter()
            .filter(|(_, filter)| filter.op.is_range())
            .filter_map(|(_, filter)| {
                let table = self.table(&filter.column.table)?;
                let column = table.column(&filter.column.column)?;
                (column.semantic_type == SemanticType::Date).then_some((table, column))
            })
            .collect::<Vec<_>>();
        for (table, column) in ranged {
            draft.extra_columns_push(table, column);
        }
        // "departments with their employees": a second named table shows its labels.
        for mention in &self.mentions {
            let table = mention.table;
            let constrained = draft
                .filters
                .iter()
                .any(|(_, filter)| filter.column.table.eq_ignore_ascii_case(&table.name));
            if same_table(table, draft.primary) || constrained {
                continue;
            }
            for label in table.label_columns() {
                if self.allows(table, label) {
                    draft.extra_columns_push(table, label);
                }
            }
        }
    }

    fn write_statement(&mut self, intent: WriteIntent) -> Result<WriteStatement, PlanningFailure> {
        let mention = self
            .mentions
            .first()
            .copied()
            .ok_or_else(|| PlanningFailure::ungrounded("the requested change names no known table"))?;
        let table = mention.table;
        let mut draft = SelectDraft::new(table);
        // The write is refused whatever it targets, so an unusable key still yields the plan.
        let _ = self.find_key_filters(&mut draft);
        self.find_enum_filters(&mut draft);
        let filters = draft
            .filters
            .into_iter()
            .map(|(_, filter)| filter)
            .filter(|filter| filter.column.table.eq_ignore_ascii_case(&table.name))
            .collect::<Vec<_>>();

        let assignments = match intent.verb {
            WriteKind::Update => self.update_assignment(table, intent).into_iter().collect(),
            WriteKind::Insert => {
                let mut values = self
                    .phrases(table)
                    .into_iter()
                    .flat_map(|phrase| phrase.words)
                    .map(|word| sql_text(&word));
                table
                    .label_columns()
                    .into_iter()
                    .map(|column| Assignment {
                        column: column.name.clone(),
                        expression: values.next().unwrap_or_else(|| "NULL".to_string()),
                    })
                    .collect()
            }
            WriteKind::Delete | WriteKind::Create | WriteKind::Alter | WriteKind::Drop => Vec::new(),
        };

        Ok(WriteStatement {
            kind: intent.verb,
            table: table.name.clone(),
            assignments,
            filters,
        })
    }

    fn update_assignment(&self, table: &'a Table, intent: WriteIntent) -> Option<Assignment> {
        let named = self
            .columns
            .iter()
            .find(|hit| hit.full() && same_table(hit.table, table) && !hit.column.primary_key)
            .map(|hit| hit.column);
        let hinted = || {
            table.measure_columns().find(|column| {
                identifier_words(&column.name)
                    .iter()
                    .any(|word| MEASURE_HINTS.contains(&word.as_str()))
            })
        };
        let column = named
            .or_else(hinted)
            .or_else(|| table.columns.iter().find(|column| !column.primary_key))?;

        let expression = if let Some(scale) = intent.scale {
            format!("{} * {scale}", quote_ident(&column.name))
        } else {
            let target = self
                .tokens
                .iter()
                .position(|token| token.is("to"))
                .and_then(|position| self.tokens.get(position + 1));
            target.map_or_else(|| "NULL".to_string(), sql_literal)
        };
        Some(Assignment {
            column: column.name.clone(),
            expression,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct Focus<'a> {
    primary: &'a Table,
    ranked_by: Option<&'a Table>,
    descending: bool,
}

#[derive(Debug, Clone, Copy)]
enum Dimension<'a> {
    Table(&'a Table),
    Column(&'a Table, &'a Column),
    Bucket(&'a Table, &'a Column, TimeBucket),
}

impl<'a> Dimension<'a> {
    const fn table(&self) -> &'a Table {
        match self {
            Self::Table(table) | Self::Column(table, _) | Self::Bucket(table, _, _) => *table,
        }
    }

    fn projections(&self, aliases: &mut BTreeSet<String>) -> Vec<Projection> {
        match self {
            Self::Table(table) => {
                let mut labels = table.label_columns();
                if labels.is_empty() {
                    labels.extend(table.primary_key());
                }
                labels
                    .into_iter()
                    .map(|column| column_projection(table, column, aliases))
                    .collect()
            }
            Self::Column(table, column) => vec![column_projection(table, column, aliases)],
            Self::Bucket(table, column, bucket) => vec![Projection::Bucket {
                column: ColumnRef::new(&table.name, &column.name),
                bucket: *bucket,
                alias: unique_alias(bucket.label(), table, aliases),
            }],
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Aggregate<'a> {
    function: AggregateFn,
    measure: Option<(&'a Table, &'a Column)>,
}

impl<'a> Aggregate<'a> {
    const fn count() -> Self {
        Self {
            function: AggregateFn::Count,
            measure: None,
        }
    }

    fn table(&self) -> Option<&'a Table> {
        self.measure.map(|(table, _)| table)
    }

    fn projection(&self, aliases: &mut BTreeSet<String>) -> Projection {
        match self.measure {
            Some((table, column)) => Projection::Aggregate {
                function: self.function,
                column: Some(ColumnRef::new(&table.name, &column.name)),
                alias: unique_alias(&format!("{}{}", self.function.label(), column.name), table, aliases),
            },
            None => {
                aliases.insert(self.function.label().to_string());
                Projection::Aggregate {
                    function: self.function,
                    column: None,
                    alias: self.function.label().to_string(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum OrderKey<'a> {
    Aggregate,
    Bucket,
    Column(&'a Table, &'a Column),
}

#[derive(Debug, Clone, Copy)]
struct Order<'a> {
    key: OrderKey<'a>,
    descending: bool,
}

/// A select under construction; table references stay typed until the final query.
struct SelectDraft<'a> {
    primary: &'a Table,
    involved: Vec<&'a Table>,
    filters: Vec<(usize, Filter)>,
    dimension: Option<Dimension<'a>>,
    aggregate: Option<Aggregate<'a>>,
    extra_columns: Vec<(&'a Table, &'a Column)>,
    order: Option<Order<'a>>,
    limit: Option<u64>,
}

impl<'a> SelectDraft<'a> {
    fn new(primary: &'a Table) -> Self {
        Self {
            primary,
            involved: vec![primary],
            filters: Vec::new(),
            dimension: None,
            aggregate: None,
            extra_columns: Vec::new(),
            order: None,
            limit: None,
        }
    }

    fn involves(&self, table: &Table) -> bool {
        self.involved.iter().any(|involved| same_table(involved, table))
    }

    fn involve(&mut self, table: &'a Table) {
        if !self.involves(table) {
            self.involved.push(table);
        }
    }

    fn add_filter(&mut self, position: usize, table: &'a Table, column: &Column, op: FilterOp, value: Literal) {
        self.involve(table);
        self.filters.push((
            position,
            Filter {
                column: ColumnRef::new(&table.name, &column.name),
                op,
                value,
            },
        ));
    }

    fn has_filter_on(&self, table: &Table, column: &Column) -> bool {
        let reference = ColumnRef::new(&table.name, &column.name);
        self.filters.iter().any(|(_, filter)| filter.column == reference)
    }

    fn has_eq_filter(&self, table: &Table, column: &Column) -> bool {
        let reference = ColumnRef::new(&table.name, &column.name);
        self.filters
            .iter()
            .any(|(_, filter)| filter.column == reference && filter.op == FilterOp::Eq)
    }

    fn extra_columns_push(&mut self, table: &'a Table, column: &'a Column) {
        let present = self
            .extra_columns
            .iter()
            .any(|(known_table, known)| same_table(known_table, table) && known.name == column.name);
        if !present {
            self.extra_columns.push((table, column));
        }
    }

    fn filter_tables(&self) -> Vec<&str> {
        self.filters
            .iter()
            .map(|(_, filter)| filter.column.table.as_str())
            .collect()
    }

    /// Shrinks the draft after `level` cost rejections.
    fn narrow(&mut self, level: usize) {
        if level == 0 {
            return;
        }
        let primary = self.primary;

        let mut essential = vec![primary.name.clone()];
        essential.extend(self.filter_tables().into_iter().map(ToString::to_string));
        essential.extend(self.dimension.map(|dimension| dimension.table().name.clone()));
        essential.extend(self.aggregate.and_then(|aggregate| aggregate.table()).map(|table| table.name.clone()));
        let is_essential = |table: &Table| {
            essential
                .iter()
                .any(|name| name.eq_ignore_ascii_case(&table.name))
        };
        self.extra_columns.retain(|(table, _)| is_essential(table));

        if level >= 2 {
            let foreign_dimension = self
                .dimension
                .is_some_and(|dimension| !same_table(dimension.table(), primary));
            if foreign_dimension {
                self.dimension = None;
                if matches!(self.order, Some(Order { key: OrderKey::Aggregate | OrderKey::Bucket, .. })) {
                    self.order = None;
                }
            }
        }

        if level >= 3 {
            self.filters
                .retain(|(_, filter)| filter.column.table.eq_ignore_ascii_case(&primary.name));
            if self
                .aggregate
                .and_then(|aggregate| aggregate.table())
                .is_some_and(|table| !same_table(table, primary))
            {
                self.aggregate = Some(Aggregate::count());
            }
            self.extra_columns.retain(|(table, _)| same_table(table, primary));
            if matches!(self.order, Some(Order { key: OrderKey::Column(table, _), .. }) if !same_table(table, primary))
            {
                self.order = None;
            }
        }

        let cap = NARROWED_LIMITS[level.min(NARROWED_LIMITS.len()) - 1];
        self.limit = Some(self.limit.map_or(cap, |limit| limit.min(cap)));
    }

    fn into_query(mut self, scene: &Scene<'a>) -> SelectQuery {
        self.narrow(scene.constraints.narrowing);
        let primary = self.primary;

        let mut listing: Vec<(&'a Table, &'a Column)> = Vec::new();
        let push_listing = |table: &'a Table, column: &'a Column, listing: &mut Vec<(&'a Table, &'a Column)>| {
            if !listing
                .iter()
                .any(|(known_table, known)| same_table(known_table, table) && known.name == column.name)
            {
                listing.push((table, column));
            }
        };
        if self.aggregate.is_none() {
            for label in primary.label_columns() {
                if scene.allows(primary, label) {
                    push_listing(primary, label, &mut listing);
                }
            }
            for &(table, column) in &self.extra_columns {
                push_listing(table, column, &mut listing);
            }
            if let Some(Order {
                key: OrderKey::Column(table, column),
                ..
            }) = self.order
            {
                push_listing(table, column, &mut listing);
            }
        }

        let mut targets = self.filter_tables();
        if let Some(dimension) = &self.dimension {
            targets.push(dimension.table().name.as_str());
        }
        if let Some(table) = self.aggregate.and_then(|aggregate| aggregate.table()) {
            targets.push(table.name.as_str());
        }
        targets.extend(listing.iter().map(|(table, _)| table.name.as_str()));
        let plan = joins::connect(scene.catalog, &primary.name, &targets, |name| {
            scene.table(name).is_some()
        });
        let joined = plan
            .tables(&primary.name)
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        let reachable = |name: &str| joined.iter().any(|table| table.eq_ignore_ascii_case(name));

        self.filters
            .retain(|(_, filter)| reachable(&filter.column.table));
        if self
            .dimension
            .is_some_and(|dimension| !reachable(&dimension.table().name))
        {
            self.dimension = None;
        }
        if let Some(aggregate) = self.aggregate {
            if aggregate.table().is_some_and(|table| !reachable(&table.name)) {
                self.aggregate = Some(Aggregate::count());
            }
        }
        listing.retain(|(table, _)| reachable(&table.name));
        if self.aggregate.is_none() && listing.is_empty() {
            listing = fallback_columns(primary, scene);
        }

        let mut aliases = BTreeSet::new();
        let mut projection = Vec::new();
        let mut group_by = Vec::new();
        if let Some(dimension) = &self.dimension {
            for grouped in dimension.projections(&mut aliases) {
                group_by.push(grouped.clone());
                projection.push(grouped);
            }
        }
        match &self.aggregate {
            Some(aggregate) => projection.push(aggregate.projection(&mut aliases)),
            None => projection.extend(
                listing
                    .iter()
                    .map(|(table, column)| column_projection(table, column, &mut aliases)),
            ),
        }

        let order_alias = self.order.and_then(|order| {
            let alias = match order.key {
                OrderKey::Aggregate => projection
                    .iter()
                    .find(|projection| projection.is_aggregate())
                    .map(Projection::alias),
                OrderKey::Bucket => projection
                    .iter()
                    .find(|projection| matches!(projection, Projection::Bucket { .. }))
                    .map(Projection::alias),
                OrderKey::Column(table, column) => {
                    let reference = ColumnRef::new(&table.name, &column.name);
                    projection
                        .iter()
                        .find(|projection| {
                            matches!(projection, Projection::Column { .. })
                                && projection.column_ref() == Some(&reference)
                        })
                        .map(Projection::alias)
                }
            };
            alias.map(|alias| OrderTerm {
                output: alias.to_string(),
                descending: order.descending,
            })
        });

        self.filters.sort_by_key(|(position, _)| *position);
        SelectQuery {
            from: primary.name.clone(),
            joins: plan.joins,
            projection,
            filters: self.filters.into_iter().map(|(_, filter)| filter).collect(),
            group_by,
            order_by: order_alias.into_iter().collect(),
            limit: self.limit,
        }
    }
}

/// Key plus the first few descriptive columns, for questions that name no column at all.
fn fallback_columns<'a>(table: &'a Table, scene: &Scene<'a>) -> Vec<(&'a Table, &'a Column)> {
    let key = table.primary_key().into_iter();
    let rest = table
        .columns
        .iter()
        .filter(|column| !column.primary_key && table.foreign_key(&column.name).is_none());
    key.chain(rest)
        .filter(|column| scene.allows(table, column))
        .take(LISTING_FALLBACK_COLUMNS)
        .map(|column| (table, column))
        .collect()
}

fn unique_alias(preferred: &str, table: &Table, aliases: &mut BTreeSet<String>) -> String {
    let alias = if aliases.contains(preferred) {
        format!("{}{preferred}", table.name)
    } else {
        preferred.to_string()
    };
    aliases.insert(alias.clone());
    alias
}

fn column_projection(table: &Table, column: &Column, aliases: &mut BTreeSet<String>) -> Projection {
    Projection::Column {
        column: ColumnRef::new(&table.name, &column.name),
        alias: unique_alias(&column.name, table, aliases),
    }
}

struct Previous<'t> {
    query: &'t SelectQuery,
    result: Option<&'t ExecutionResult>,
}

/// Most recent successful read in the tail.
fn previous_select(tail: &[Turn]) -> Option<Previous<'_>> {
    tail.iter().filter(|turn| turn.succeeded()).find_map(|turn| {
        let query = turn.plan.as_ref()?.select()?;
        Some(Previous {
            query,
            result: turn.result.as_ref(),
        })
    })
}

fn date_literal(date: Date) -> Literal {
    Literal::Text(format_calendar_date(date))
}

fn year_start(year: i32) -> Option<Date> {
    Date::from_calendar_date(year, Month::January, 1).ok()
}

fn month_range(year: i32, month: u8) -> Option<(Date, Date)> {
    let month = Month::try_from(month).ok()?;
    let start = Date::from_calendar_date(year, month, 1).ok()?;
    let end = if month == Month::December {
        Date::from_calendar_date(year + 1, Month::January, 1)
    } else {
        Date::from_calendar_date(year, month.next(), 1)
    }
    .ok()?;
    Some((start, end))
}

fn sql_text(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

fn sql_literal(token: &Token) -> String {
    match token {
        Token::Integer(value) => value.to_string(),
        Token::Decimal(value) => value.to_string(),
        Token::Date(date) => sql_text(&format_calendar_date(*date)),
        Token::Word { text, .. } | Token::Quoted(text) => sql_text(text),
    }
}

fn chart_for(query: &SelectQuery, catalog: &Catalog, cues: &Cues, question: &str) -> Option<ChartFragment> {
    let column_type = |projection: &Projection| {
        projection
            .column_ref()
            .and_then(|reference| catalog.column(reference))
            .map(|column| column.semantic_type)
    };
    let x = query
        .group_by
        .first()
        .or_else(|| {
            query.projection.iter().find(|projection| {
                matches!(projection, Projection::Column { .. })
                    && column_type(projection).is_some_and(|kind| !kind.is_numeric())
            })
        })?;
    let y = query
        .projection
        .iter()
        .find(|projection| projection.is_aggregate())
        .or_else(|| {
            query.projection.iter().find(|projection| {
                matches!(projection, Projection::Column { .. })
                    && column_type(projection).is_some_and(SemanticType::is_numeric)
            })
        })?;

    let temporal = matches!(x, Projection::Bucket { .. })
        || column_type(x) == Some(SemanticType::Date);
    let (kind, axis) = if temporal {
        (ChartKind::Line, AxisKind::Ordinal)
    } else if cues.pie {
        (ChartKind::Pie, AxisKind::Nominal)
    } else {
        (ChartKind::Bar, AxisKind::Nominal)
    };
    let title = question
        .trim()
        .trim_end_matches(['?', '.', '!'])
        .chars()
        .take(CHART_TITLE_MAX_CHARS)
        .collect::<String>();
    Some(chart::fragment(kind, x.alias(), y.alias(), &title, axis))
}

/// One-line account of what the query reads, for audit trails.
fn describe(query: &SelectQuery) -> String {
    let mut parts = vec![format!("read {}", query.from)];
    if !query.joins.is_empty() {
        let tables = query
            .joins
            .iter()
            .map(|join| join.table.as_str())
            .collect::<Vec<_>>();
        parts.push(format!("joined with {}", tables.join(", ")));
    }
    if !query.filters.is_empty() {
        let filters = query
            .filters
            .iter()
            .map(|filter| format!("{} {} {}", filter.column, filter.op.sql(), filter.value))
            .collect::<Vec<_>>();
        parts.push(format!("where {}", filters.join(" and ")));
    }
    if !query.group_by.is_empty() {
        let groups = query
            .group_by
            .iter()
            .map(Projection::alias)
            .collect::<Vec<_>>();
        parts.push(format!("grouped by {}", groups.join(", ")));
    }
    if let Some(order) = query.order_by.first() {
        let direction = if order.descending { "descending" } else { "ascending" };
        parts.push(format!("ordered by {} {direction}", order.output));
    }
    if let Some(limit) = query.limit {
        parts.push(format!("limited to {limit} rows"));
    }
    parts.join("; ")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::HeuristicPlanner;
    use crate::catalog::Catalog;
    use crate::models::{
        AttemptOutcome, AttemptRecord, ChartKind, ExecutionResult, FilterOp, Literal, PlanStatement,
        QueryPlan, Rejection, Response, Turn, TurnStatus, WriteKind,
    };
    use crate::planner::{PlanRequest, Planner, PlannerFeedback, PlanningFailure};

    fn hr() -> Catalog {
        Catalog::from_ddl("hr", include_str!("../../schemas/hr.sql")).expect("hr ddl should load")
    }

    fn propose(
        catalog: &Catalog,
        question: &str,
        tail: &[Turn],
        feedback: Option<&PlannerFeedback>,
    ) -> Result<QueryPlan, PlanningFailure> {
        let digest = catalog.describe(question, &[], 100_000);
        HeuristicPlanner::new().propose(&PlanRequest {
            question,
            transcript_tail: tail,
            digest: &digest,
            feedback,
        })
    }

    fn succeeded_turn(plan: QueryPlan, result: ExecutionResult) -> Turn {
        Turn {
            sequence: 1,
            question: "previous".to_string(),
            plan: Some(plan),
            result: Some(result.clone()),
            response: Response {
                status: TurnStatus::Succeeded,
                text: String::new(),
                columns: result.columns.clone(),
                rows: result.rows.clone(),
                row_count: result.row_count,
                truncated: false,
                chart: None,
                generated_sql: None,
                follow_ups: Vec::new(),
                failure: None,
            },
            status: TurnStatus::Succeeded,
            attempts: vec![AttemptRecord {
                attempt: 1,
                sql: None,
                outcome: AttemptOutcome::Accepted,
            }],
            failure: None,
            created_at_utc: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn grounds_department_and_hire_date_filters() {
        let catalog = hr();
        let plan = propose(
            &catalog,
            "Show me employees in Engineering hired after 2022-01-01",
            &[],
            None,
        )
        .expect("question should be grounded");
        let rendered = plan.render();
        assert_eq!(
            rendered.sql,
            "SELECT \"Employees\".\"FirstName\" AS \"FirstName\", \"Employees\".\"LastName\" AS \"LastName\", \"Employees\".\"HireDate\" AS \"HireDate\" FROM \"Employees\" JOIN \"Departments\" ON \"Employees\".\"DepartmentID\" = \"Departments\".\"DepartmentID\" WHERE \"Departments\".\"Name\" = ?1 AND \"Employees\".\"HireDate\" > ?2"
        );
        assert_eq!(
            rendered.params,
            vec![
                Literal::Text("Engineering".to_string()),
                Literal::Text("2022-01-01".to_string())
            ]
        );
        assert!(plan.chart.is_none());
    }

    #[test]
    fn lowercase_department_name_still_filters() {
        let catalog = hr();
        let plan = propose(
            &catalog,
            "list employees in the engineering department hired after 2022-01-01",
            &[],
            None,
        )
        .expect("question should be grounded");
        let query = plan.select().expect("plan should read");
        let filters = query
            .filters
            .iter()
            .map(|filter| {
                (
                    filter.column.table.as_str(),
                    filter.column.column.as_str(),
                    filter.op,
                    filter.value.clone(),
                )
            })
            .collect::<Vec<_>>();
        assert_eq!(
            filters,
            vec![
                (
                    "Departments",
                    "Name",
                    FilterOp::Like,
                    Literal::Text("engineering".to_string())
                ),
                (
                    "Employees",
                    "HireDate",
                    FilterOp::Gt,
                    Literal::Text("2022-01-01".to_string())
                ),
            ]
        );
    }

    #[test]
    fn values_that_cannot_be_placed_fail_instead_of_widening() {
        let catalog = hr();
        let failure = propose(
            &catalog,
            "show payroll for employee 999999999999999999999999",
            &[],
            None,
        )
        .expect_err("an id that overflows cannot be a key");
        assert!(matches!(failure, PlanningFailure::Ungrounded { .. }));

        let failure = propose(&catalog, "show payroll for employee id 4.5", &[], None)
            .expect_err("a fractional id cannot be a key");
        assert!(matches!(failure, PlanningFailure::Ungrounded { .. }));
    }

    #[test]
    fn counts_per_related_table() {
        let catalog = hr();
        let plan = propose(&catalog, "How many employees are in each department?", &[], None)
            .expect("question should be grounded");
        let query = plan.select().expect("plan should read");
        assert_eq!(query.from, "Employees");
        assert_eq!(query.output_columns(), vec!["Name", "Count"]);
        assert_eq!(query.group_by.len(), 1);
        assert_eq!(query.order_by[0].output, "Count");
        assert!(query.order_by[0].descending);
    }

    #[test]
    fn which_most_ranks_the_dimension_and_keeps_one_row() {
        let catalog = hr();
        let plan = propose(&catalog, "Which department has the most employees?", &[], None)
            .expect("question should be grounded");
        let query = plan.select().expect("plan should read");
        assert_eq!(query.from, "Employees");
        assert_eq!(query.output_columns(), vec!["Name", "Count"]);
        assert_eq!(query.limit, Some(1));
    }

    #[test]
    fn monthly_trend_becomes_a_line_chart() {
        let catalog = hr();
        let plan = propose(&catalog, "Plot the monthly trend of hires", &[], None)
            .expect("question should be grounded");
        let query = plan.select().expect("plan should read");
        assert_eq!(query.output_columns(), vec!["Month", "Count"]);
        assert_eq!(query.order_by[0].output, "Month");
        let chart = plan.chart.expect("visual question should carry a chart");
        assert_eq!(chart.kind, ChartKind::Line);
        assert_eq!((chart.x.as_str(), chart.y.as_str()), ("Month", "Count"));
    }

    #[test]
    fn chart_is_dropped_after_a_chart_rejection() {
        let catalog = hr();
        let feedback = PlannerFeedback {
            attempt: 2,
            rejections: vec![Rejection::ChartReferencesUnknownColumn {
                column: "Count".to_string(),
            }],
        };
        let plan = propose(
            &catalog,
            "Chart the number of employees per department",
            &[],
            Some(&feedback),
        )
        .expect("question should be grounded");
        assert!(plan.chart.is_none());
    }

    #[test]
    fn raise_request_becomes_an_update() {
        let catalog = hr();
        let plan = propose(&catalog, "give employee 5 a raise", &[], None)
            .expect("write request should still produce a plan");
        let PlanStatement::Write(write) = &plan.statement else {
            panic!("expected a write statement");
        };
        assert_eq!(write.kind, WriteKind::Update);
        assert_eq!(
            plan.render().sql,
            "UPDATE \"Employees\" SET \"Salary\" = \"Salary\" * 1.1 WHERE \"Employees\".\"EmployeeID\" = ?1"
        );
    }

    #[test]
    fn narrows_after_cost_rejections() {
        let catalog = hr();
        let question = "list trainings with their enrollments";
        let first = propose(&catalog, question, &[], None).expect("question should be grounded");
        let first = first.select().expect("plan should read").clone();
        assert_eq!(first.joins.len(), 1);
        assert_eq!(first.output_columns(), vec!["Title", "CompletionStatus"]);

        let feedback = PlannerFeedback {
            attempt: 2,
            rejections: vec![Rejection::PlanTooExpensive {
                estimated_rows: 30,
                join_fan_out: 10.0,
                join_count: 1,
                max_estimated_rows: 100_000,
                max_join_fan_out: 2.0,
                max_joins: 4,
            }],
        };
        let second = propose(&catalog, question, &[], Some(&feedback)).expect("retry should plan");
        let second = second.select().expect("plan should read");
        assert!(second.joins.is_empty());
        assert_eq!(second.output_columns(), vec!["Title"]);
        assert_eq!(second.limit, Some(100));
    }

    #[test]
    fn year_and_status_filters() {
        let catalog = hr();
        let plan = propose(&catalog, "list approved leave requests in 2024", &[], None)
            .expect("question should be grounded");
        let query = plan.select().expect("plan should read");
        assert_eq!(query.from, "LeaveRequests");
        let filters = query
            .filters
            .iter()
            .map(|filter| (filter.column.to_string(), filter.op.sql(), filter.value.to_string()))
            .collect::<Vec<_>>();
        assert_eq!(
            filters,
            vec![
                ("LeaveRequests.Status".to_string(), "=", "'approved'".to_string()),
                ("LeaveRequests.StartDate".to_string(), ">=", "'2024-01-01'".to_string()),
                ("LeaveRequests.StartDate".to_string(), "<", "'2025-01-01'".to_string()),
            ]
        );
    }

    #[test]
    fn resolves_a_single_row_referent_from_the_tail() {
        let catalog = hr();
        let previous = propose(&catalog, "who has the highest salary", &[], None)
            .expect("question should be grounded");
        assert_eq!(previous.select().map(|query| query.limit), Some(Some(1)));
        let result = ExecutionResult {
            columns: vec!["FirstName".to_string(), "LastName".to_string(), "Salary".to_string()],
            rows: vec![vec![json!("Ada"), json!("Lovelace"), json!(180_000.0)]],
            row_count: 1,
            truncated: false,
            row_cap: 500,
            duration_ms: 1,
        };
        let tail = vec![succeeded_turn(previous, result)];

        let plan = propose(&catalog, "when was she hired?", &tail, None)
            .expect("follow-up should be grounded");
        let query = plan.select().expect("plan should read");
        assert_eq!(query.from, "Employees");
        let values = query
            .filters
            .iter()
            .map(|filter| filter.value.to_string())
            .collect::<Vec<_>>();
        assert_eq!(values, vec!["'Ada'", "'Lovelace'"]);
        assert!(query.output_columns().contains(&"HireDate"));
    }

    #[test]
    fn ungrounded_questions_fail() {
        let catalog = hr();
        let failure = propose(&catalog, "what is the weather like on mars", &[], None)
            .expect_err("nothing in the schema matches");
        assert!(matches!(failure, PlanningFailure::Ungrounded { .. }));
    }

    #[test]
    fn same_question_same_plan() {
        let catalog = hr();
        let question = "average salary by department";
        let first = propose(&catalog, question, &[], None).expect("question should be grounded");
        let second = propose(&catalog, question, &[], None).expect("question should be grounded");
        assert_eq!(first.referenced_columns(), second.referenced_columns());
        assert_eq!(first.render().sql, second.render().sql);
        assert_eq!(
            first.select().map(|query| query.output_columns()),
            Some(vec!["Name", "AverageSalary"])
        );
    }
}
