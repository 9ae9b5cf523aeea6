//! Heuristic entity and relationship extraction from raw text.
//!
//! Pattern based: dates by regex, names and places from runs of capitalized
//! words classified against small dictionaries, quoted phrases. Output is
//! deterministic for a given input.

use std::collections::HashSet;

use chrono::NaiveDate;
use lazy_static::lazy_static;
use regex::Regex;

use crate::memory::{Entity, EntityType, MemoryItem, Relationship};

lazy_static! {
    static ref NUMERIC_DATE: Regex =
        Regex::new(r"\b(0?[1-9]|1[0-2])/(0?[1-9]|[12]\d|3[01])/((?:19|20)\d{2})\b").unwrap();
    static ref ISO_DATE: Regex =
        Regex::new(r"\b((?:19|20)\d{2})-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])\b").unwrap();
    static ref MONTH_DATE: Regex = Regex::new(
        r"\b(January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\.?\s+(0?[1-9]|[12]\d|3[01])(?:st|nd|rd|th)?,?\s+((?:19|20)\d{2})\b"
    )
    .unwrap();
    static ref QUOTED: Regex = Regex::new(r#""([^"\n]{1,100})"|“([^”\n]{1,100})”"#).unwrap();
    static ref WORD: Regex = Regex::new(r"\p{L}[\p{L}\p{N}'&\-]*").unwrap();
}

const HONORIFICS: &[&str] = &["Dr", "Mr", "Mrs", "Ms", "Miss", "Mx", "Prof", "Sir", "Madam"];

const ORGANIZATION_WORDS: &[&str] = &[
    "Inc", "Corp", "Corporation", "Ltd", "LLC", "Co", "Company", "Group", "University",
    "College", "Institute", "Bank", "Foundation", "Association", "Agency", "Labs",
    "Technologies", "Systems", "School", "Hospital", "Department", "Ministry",
];

const LOCATION_SUFFIXES: &[&str] = &[
    "City", "River", "Street", "Avenue", "Road", "Lane", "Boulevard", "Lake", "Mountain",
    "Mountains", "Park", "County", "State", "Island", "Islands", "Bay", "Valley", "Ocean",
    "Sea", "Beach", "Square", "Bridge",
];

const LOCATION_CUES: &[&str] = &["in", "near"];

/// Lower-case words allowed inside a capitalized run ("Bank of America")
const CONNECTORS: &[&str] = &["of", "de", "la", "van", "von", "der", "du", "da"];

/// Capitalized words that start sentences or questions rather than names
const LEADING_STOP_WORDS: &[&str] = &[
    "the", "a", "an", "what", "when", "where", "who", "whom", "why", "how", "which", "i", "my",
    "our", "your", "his", "her", "their", "its", "it", "this", "that", "these", "those", "we",
    "you", "they", "he", "she", "is", "are", "was", "were", "do", "does", "did", "can",
    "could", "would", "should", "will", "shall", "may", "might", "must", "and", "but", "or",
    "so", "if", "then", "also", "yes", "no", "hello", "hi", "hey", "please", "thanks",
    "yesterday", "today", "tomorrow", "tonight", "on", "in", "at", "from", "to", "for",
    "with", "after", "before", "later", "last", "next", "let", "tell", "remember",
];

/// Words ending in "." that do not end a sentence
const ABBREVIATIONS: &[&str] = &[
    "Dr", "Mr", "Mrs", "Ms", "Mx", "Prof", "Sr", "Jr", "St", "Inc", "Corp", "Ltd", "Co",
    "vs", "etc", "e.g", "i.e", "Mt", "Ave",
];

const VERBS: &[&str] = &[
    "is", "are", "was", "were", "be", "been", "has", "have", "had", "works", "work", "worked",
    "lives", "live", "lived", "met", "meets", "meet", "founded", "founds", "owns", "own",
    "owned", "joined", "joins", "visited", "visits", "visit", "moved", "moves", "leads",
    "led", "manages", "managed", "married", "knows", "knew", "likes", "liked", "loves",
    "loved", "born", "created", "creates", "built", "builds", "wrote", "writes", "acquired",
    "acquires", "bought", "buys", "sold", "sells", "hired", "hires", "studied", "studies",
    "teaches", "taught", "runs", "ran", "started", "starts", "became", "becomes", "heads",
    "directs", "called", "calls", "went", "goes", "traveled", "travelled", "attended",
    "attends", "graduated", "reports", "reported", "partnered", "signed", "invested",
    "located", "based", "employed", "said", "says", "told", "tells", "sent",
    "sends", "emailed", "emails", "returned", "left", "leaves", "arrived", "arrives",
];

const AUXILIARIES: &[&str] = &["is", "are", "was", "were", "be", "been", "has", "have", "had"];

const PARTICLES: &[&str] = &[
    "at", "in", "for", "with", "to", "from", "on", "by", "of", "into", "near", "about", "up",
    "out", "as",
];

const FALLBACK_PREDICATE: &str = "related_to";

/// Character distance at which relationship confidence bottoms out
const CONFIDENCE_SPAN: f32 = 200.0;
const MIN_CONFIDENCE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum SpanKind {
    Quoted = 1,
    Capitalized = 2,
    Date = 3,
}

#[derive(Debug, Clone)]
struct Span {
    start: usize,
    end: usize,
    kind: SpanKind,
    entity: Entity,
}

impl Span {
    fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Pattern-based entity and relationship extractor
#[derive(Debug, Clone, Default)]
pub struct EntityExtractor;

impl EntityExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Entities in left-to-right order, one per distinct normalized form
    pub fn extract_entities(&self, text: &str) -> Vec<Entity> {
        let mut spans = self.extract_dates(text);
        spans.extend(self.extract_capitalized(text));
        spans.extend(self.extract_quoted(text));

        let mut seen = HashSet::new();
        remove_overlaps(spans)
            .into_iter()
            .map(|span| span.entity)
            .filter(|e| seen.insert((e.normalized_form.clone(), e.entity_type)))
            .collect()
    }

    /// Relationships between entities mentioned in the same sentence.
    ///
    /// The earlier mention is the subject. The predicate is the first verb
    /// between the two mentions, plus directly following particles.
    pub fn extract_relationships(&self, entities: &[Entity], text: &str) -> Vec<Relationship> {
        let mentions = locate_mentions(entities, text);
        if mentions.len() < 2 {
            return Vec::new();
        }

        let mut relationships = Vec::new();
        let mut seen = HashSet::new();

        for (sentence_start, sentence_end) in split_sentences(text) {
            let in_sentence: Vec<&Mention> = mentions
                .iter()
                .filter(|m| m.start >= sentence_start && m.end <= sentence_end)
                .collect();

            for (i, subject) in in_sentence.iter().enumerate() {
                for object in &in_sentence[i + 1..] {
                    let subject_entity = &entities[subject.entity];
                    let object_entity = &entities[object.entity];
                    if subject_entity.normalized_form == object_entity.normalized_form {
                        continue;
                    }

                    let gap = &text[subject.end..object.start];
                    let predicate = predicate_for(gap);
                    let key = (
                        subject_entity.normalized_form.clone(),
                        predicate.clone(),
                        object_entity.normalized_form.clone(),
                    );
                    if !seen.insert(key) {
                        continue;
                    }

                    let gap_chars = gap.chars().count() as f32;
                    let confidence = (1.0 - gap_chars / CONFIDENCE_SPAN).max(MIN_CONFIDENCE);
                    relationships.push(Relationship::new(
                        subject_entity.clone(),
                        predicate,
                        object_entity.clone(),
                        confidence,
                    ));
                }
            }
        }

        relationships
    }

    fn extract_dates(&self, text: &str) -> Vec<Span> {
        let mut spans = Vec::new();

        for caps in NUMERIC_DATE.captures_iter(text) {
            let whole = &caps[0];
            let ymd = parse_ymd(&caps[3], &caps[1], &caps[2]);
            spans.push(date_span(caps.get(0).map_or(0, |m| m.start()), whole, ymd));
        }

        for caps in ISO_DATE.captures_iter(text) {
            let whole = &caps[0];
            let ymd = parse_ymd(&caps[1], &caps[2], &caps[3]);
            spans.push(date_span(caps.get(0).map_or(0, |m| m.start()), whole, ymd));
        }

        for caps in MONTH_DATE.captures_iter(text) {
            let whole = &caps[0];
            let ymd = month_number(&caps[1])
                .and_then(|month| parse_ymd(&caps[3], &month.to_string(), &caps[2]));
            spans.push(date_span(caps.get(0).map_or(0, |m| m.start()), whole, ymd));
        }

        spans
    }

    fn extract_quoted(&self, text: &str) -> Vec<Span> {
        QUOTED
            .captures_iter(text)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                let inner = caps.get(1).or_else(|| caps.get(2))?.as_str().trim();
                if inner.is_empty() {
                    return None;
                }
                Some(Span {
                    start: whole.start(),
                    end: whole.end(),
                    kind: SpanKind::Quoted,
                    entity: Entity::new(inner, EntityType::Other),
                })
            })
            .collect()
    }

    fn extract_capitalized(&self, text: &str) -> Vec<Span> {
        let words: Vec<(usize, usize)> = WORD.find_iter(text).map(|m| (m.start(), m.end())).collect();
        let word = |i: usize| &text[words[i].0..words[i].1];

        let mut spans = Vec::new();
        let mut i = 0;
        while i < words.len() {
            if !is_capitalized(word(i)) {
                i += 1;
                continue;
            }

            // Extend the run over capitalized words and inner connectors
            let mut last = i;
            let mut j = i + 1;
            while j < words.len() {
                let joined = joins(text, words[last], words[j], word(last));
                if joined && is_capitalized(word(j)) {
                    last = j;
                    j += 1;
                } else if joined
                    && CONNECTORS.contains(&word(j))
                    && j + 1 < words.len()
                    && is_capitalized(word(j + 1))
                    && joins(text, words[j], words[j + 1], word(j))
                {
                    last = j + 1;
                    j += 2;
                } else {
                    break;
                }
            }

            // Trim stop-words from both ends
            let mut first = i;
            let mut end = last;
            while first <= end && is_leading_stop_word(word(first)) {
                first += 1;
            }
            while end >= first && end > 0 && is_leading_stop_word(word(end)) {
                end -= 1;
            }

            if first <= end {
                let tokens: Vec<&str> = (first..=end).map(word).collect();
                let start = words[first].0;
                let stop = words[end].1;
                let preceding = first.checked_sub(1).and_then(|p| {
                    joins(text, words[p], words[first], word(p)).then(|| word(p))
                });
                let sentence_start = at_sentence_start(text, start);
                if let Some(entity) = classify_run(&text[start..stop], &tokens, preceding, sentence_start) {
                    spans.push(Span {
                        start,
                        end: stop,
                        kind: SpanKind::Capitalized,
                        entity,
                    });
                }
            }

            i = last + 1;
        }

        spans
    }
}

/// Attach entities and relationships to a memory item, skipping ones it already carries
pub fn enhance_memory_with_context(
    mut item: MemoryItem,
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
) -> MemoryItem {
    for entity in entities {
        let known = item.entities.iter().any(|e| {
            e.normalized_form == entity.normalized_form && e.entity_type == entity.entity_type
        });
        if !known {
            item.entities.push(entity);
        }
    }

    for relationship in relationships {
        let known = item.relationships.iter().any(|r| {
            r.subject.normalized_form == relationship.subject.normalized_form
                && r.predicate == relationship.predicate
                && r.object.normalized_form == relationship.object.normalized_form
        });
        if !known {
            item.relationships.push(relationship);
        }
    }

    item.touch();
    item
}

/// Keep the higher-priority span of any overlapping pair; earlier wins ties
fn remove_overlaps(mut spans: Vec<Span>) -> Vec<Span> {
    spans.sort_by_key(|s| (s.start, std::cmp::Reverse(s.kind)));

    let mut result: Vec<Span> = Vec::new();
    for span in spans {
        let mut should_add = true;
        let mut indices_to_remove = Vec::new();

        for (idx, existing) in result.iter().enumerate() {
            if span.overlaps(existing) {
                if span.kind > existing.kind {
                    indices_to_remove.push(idx);
                } else {
                    should_add = false;
                    break;
                }
            }
        }

        if should_add {
            for &idx in indices_to_remove.iter().rev() {
                result.remove(idx);
            }
            result.push(span);
        }
    }

    result.sort_by_key(|s| s.start);
    result
}

fn date_span(start: usize, whole: &str, ymd: Option<NaiveDate>) -> Span {
    let entity = Entity::new(whole, EntityType::Date);
    let entity = match ymd {
        Some(date) => entity.with_normalized_form(date.format("%Y-%m-%d").to_string()),
        None => entity,
    };
    Span {
        start,
        end: start + whole.len(),
        kind: SpanKind::Date,
        entity,
    }
}

fn parse_ymd(year: &str, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn month_number(name: &str) -> Option<u32> {
    let month = match &name[..3.min(name.len())] {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    };
    Some(month)
}

fn is_capitalized(word: &str) -> bool {
    word.chars().next().is_some_and(char::is_uppercase)
}

fn is_leading_stop_word(word: &str) -> bool {
    LEADING_STOP_WORDS.contains(&word.to_lowercase().as_str())
}

/// Whether two adjacent words belong to one run: spaces only, or the period
/// after an honorific
fn joins(text: &str, prev: (usize, usize), next: (usize, usize), prev_word: &str) -> bool {
    let gap = &text[prev.1..next.0];
    let spaces = |s: &str| !s.is_empty() && s.chars().all(|c| c == ' ' || c == '\t');
    if spaces(gap) {
        return true;
    }
    HONORIFICS.contains(&prev_word) && gap.starts_with('.') && spaces(&gap[1..])
}

fn at_sentence_start(text: &str, start: usize) -> bool {
    match text[..start].trim_end().chars().last() {
        None => true,
        Some(c) => matches!(c, '.' | '!' | '?' | ':' | '"' | '“'),
    }
}

fn classify_run(
    surface: &str,
    tokens: &[&str],
    preceding: Option<&str>,
    sentence_start: bool,
) -> Option<Entity> {
    let last = *tokens.last()?;

    if tokens.iter().any(|t| ORGANIZATION_WORDS.contains(t)) {
        return Some(Entity::new(surface, EntityType::Organization));
    }

    if tokens.len() > 1 && LOCATION_SUFFIXES.contains(&last) {
        return Some(Entity::new(surface, EntityType::Location));
    }

    if HONORIFICS.contains(&tokens[0]) {
        if tokens.len() == 1 {
            return None;
        }
        let name = tokens[1..].join(" ").to_lowercase();
        return Some(Entity::new(surface, EntityType::Person).with_normalized_form(name));
    }

    if preceding.is_some_and(|p| LOCATION_CUES.contains(&p.to_lowercase().as_str())) {
        return Some(Entity::new(surface, EntityType::Location));
    }

    let name_like = tokens.iter().all(|t| is_capitalized(t) && !CONNECTORS.contains(t));
    if name_like && (2..=3).contains(&tokens.len()) {
        return Some(Entity::new(surface, EntityType::Person));
    }

    // A lone capitalized word opening a sentence is usually not a name
    if sentence_start && tokens.len() == 1 {
        return None;
    }

    Some(Entity::new(surface, EntityType::Other))
}

#[derive(Debug)]
struct Mention {
    start: usize,
    end: usize,
    entity: usize,
}

/// Find non-overlapping mentions of the entities, left to right
fn locate_mentions(entities: &[Entity], text: &str) -> Vec<Mention> {
    let mut found = Vec::new();
    for (idx, entity) in entities.iter().enumerate() {
        let needle = entity.text.trim();
        if needle.is_empty() {
            continue;
        }
        for (start, matched) in text.match_indices(needle) {
            found.push(Mention {
                start,
                end: start + matched.len(),
                entity: idx,
            });
        }
    }

    // Longer mentions win when they overlap
    found.sort_by_key(|m| (m.start, std::cmp::Reverse(m.end)));
    let mut mentions: Vec<Mention> = Vec::new();
    for mention in found {
        if mentions.last().is_some_and(|prev| mention.start < prev.end) {
            continue;
        }
        mentions.push(mention);
    }
    mentions
}

/// Byte ranges of sentences; abbreviations and initials do not end one
fn split_sentences(text: &str) -> Vec<(usize, usize)> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((idx, c)) = chars.next() {
        let boundary = match c {
            '!' | '?' | '\n' => true,
            '.' => {
                let followed_by_space = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
                followed_by_space && !ends_with_abbreviation(&text[start..idx])
            }
            _ => false,
        };

        if boundary {
            let end = idx + c.len_utf8();
            sentences.push((start, end));
            start = end;
        }
    }

    if start < text.len() {
        sentences.push((start, text.len()));
    }
    sentences
}

fn ends_with_abbreviation(before: &str) -> bool {
    let last_word = before
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    if ABBREVIATIONS.contains(&last_word) {
        return true;
    }
    let mut chars = last_word.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_uppercase())
}

/// Predicate from the text between two mentions
fn predicate_for(gap: &str) -> String {
    let words: Vec<String> = WORD
        .find_iter(gap)
        .map(|m| m.as_str().to_lowercase())
        .collect();

    let Some(mut verb_at) = words.iter().position(|w| is_verb(w)) else {
        return FALLBACK_PREDICATE.to_string();
    };

    // "was born in" -> "born_in"
    if AUXILIARIES.contains(&words[verb_at].as_str()) {
        if let Some(next) = words.get(verb_at + 1) {
            if is_verb(next) {
                verb_at += 1;
            }
        }
    }

    let mut parts = vec![words[verb_at].as_str()];
    parts.extend(
        words[verb_at + 1..]
            .iter()
            .map(String::as_str)
            .take_while(|w| PARTICLES.contains(w)),
    );
    parts.join("_")
}

fn is_verb(word: &str) -> bool {
    VERBS.contains(&word) || (word.len() > 4 && word.ends_with("ed"))
}
