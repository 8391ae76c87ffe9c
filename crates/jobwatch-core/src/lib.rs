//! Core domain model and history reconciliation for jobwatch.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "jobwatch-core";

/// A job posting as scraped in the current run. Ephemeral; the canonical
/// link doubles as the unique id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    pub id: String,
    pub title: String,
    pub location: Option<String>,
}

impl Posting {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            location: None,
        }
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Active,
    Closed,
}

/// Persisted lifecycle record of a posting. Created the first run its id
/// is observed and never deleted afterwards; `closed_on` is `Some` exactly
/// while `status == Closed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub status: Status,
    pub opened_on: NaiveDate,
    pub closed_on: Option<NaiveDate>,
}

impl HistoryEntry {
    pub fn opened(posting: &Posting, today: NaiveDate) -> Self {
        Self {
            id: posting.id.clone(),
            title: posting.title.clone(),
            location: posting.location.clone(),
            status: Status::Active,
            opened_on: today,
            closed_on: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == Status::Active
    }
}

/// Full persisted history, keyed by posting id.
pub type History = BTreeMap<String, HistoryEntry>;

/// Precondition violations on the current-posting set. These indicate an
/// upstream collector or filter bug and are fatal to the run.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("posting {title:?} has an empty id")]
    EmptyId { title: String },
    #[error("duplicate posting id {id} in current set")]
    DuplicateId { id: String },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReconcileOptions {
    /// Refresh `title`/`location` from the fresh scrape when a closed
    /// entry reopens. Off by default: the historical title is kept.
    pub refresh_on_reopen: bool,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone)]
pub struct ReconcileOutcome {
    pub history: History,
    /// Entries created this run, in `current` discovery order. This is
    /// the notification payload.
    pub new_entries: Vec<HistoryEntry>,
    pub closed_ids: Vec<String>,
    pub reopened_ids: Vec<String>,
}

/// Applies one run's scraped snapshot to the persisted history.
///
/// Entries no longer visible are closed, previously closed entries that
/// reappear are reopened, and ids never seen before become new Active
/// entries. Pure computation over in-memory maps; running it twice with
/// the same snapshot is a no-op with an empty `new_entries`.
pub fn reconcile(
    mut history: History,
    current: &[Posting],
    today: NaiveDate,
    options: ReconcileOptions,
) -> Result<ReconcileOutcome, ReconcileError> {
    let mut by_id: HashMap<&str, &Posting> = HashMap::with_capacity(current.len());
    for posting in current {
        if posting.id.trim().is_empty() {
            return Err(ReconcileError::EmptyId {
                title: posting.title.clone(),
            });
        }
        if by_id.insert(posting.id.as_str(), posting).is_some() {
            return Err(ReconcileError::DuplicateId {
                id: posting.id.clone(),
            });
        }
    }

    let mut closed_ids = Vec::new();
    let mut reopened_ids = Vec::new();

    // Closure and reopen checks run against the full current set before
    // any new entry is synthesized, so an id can never be both.
    for entry in history.values_mut() {
        match (entry.status, by_id.get(entry.id.as_str())) {
            (Status::Active, None) => {
                entry.status = Status::Closed;
                entry.closed_on = Some(today);
                closed_ids.push(entry.id.clone());
            }
            (Status::Closed, Some(posting)) => {
                entry.status = Status::Active;
                entry.closed_on = None;
                if options.refresh_on_reopen {
                    entry.title = posting.title.clone();
                    entry.location = posting.location.clone();
                }
                reopened_ids.push(entry.id.clone());
            }
            _ => {}
        }
    }

    let mut new_entries = Vec::new();
    for posting in current {
        if history.contains_key(&posting.id) {
            continue;
        }
        let entry = HistoryEntry::opened(posting, today);
        history.insert(entry.id.clone(), entry.clone());
        new_entries.push(entry);
    }

    Ok(ReconcileOutcome {
        history,
        new_entries,
        closed_ids,
        reopened_ids,
    })
}

/// Keeps postings whose title contains at least one keyword as a
/// case-insensitive substring. Matching is plain substring, not
/// tokenized: "CRM" matches "Analista de CRM Sênior".
pub fn filter_by_keywords(postings: Vec<Posting>, keywords: &[String]) -> Vec<Posting> {
    let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
    postings
        .into_iter()
        .filter(|posting| {
            let title = posting.title.to_lowercase();
            lowered.iter().any(|keyword| title.contains(keyword))
        })
        .collect()
}

/// Drops repeated ids from a scraped batch, keeping first occurrence
/// order. Postings from overlapping term searches collapse here before
/// the reconciler's uniqueness precondition applies.
pub fn dedup_by_id(postings: Vec<Posting>) -> Vec<Posting> {
    let mut seen = BTreeSet::new();
    postings
        .into_iter()
        .filter(|posting| seen.insert(posting.id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> NaiveDate {
        s.parse().expect("date literal")
    }

    fn posting(id: &str, title: &str) -> Posting {
        Posting::new(id, title)
    }

    fn entry(id: &str, status: Status, opened: &str, closed: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            id: id.to_string(),
            title: format!("title of {id}"),
            location: None,
            status,
            opened_on: day(opened),
            closed_on: closed.map(day),
        }
    }

    fn history_of(entries: Vec<HistoryEntry>) -> History {
        entries.into_iter().map(|e| (e.id.clone(), e)).collect()
    }

    #[test]
    fn first_sighting_creates_active_entry_and_notifies() {
        let current = vec![posting("https://jobs.example/a", "Analista de Dados")];
        let outcome = reconcile(
            History::new(),
            &current,
            day("2024-01-01"),
            ReconcileOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.new_entries.len(), 1);
        let created = &outcome.history["https://jobs.example/a"];
        assert_eq!(created.status, Status::Active);
        assert_eq!(created.opened_on, day("2024-01-01"));
        assert_eq!(created.closed_on, None);
        assert_eq!(outcome.new_entries[0], *created);
    }

    #[test]
    fn vanished_posting_is_closed_with_todays_date() {
        let history = history_of(vec![entry("a", Status::Active, "2024-01-01", None)]);
        let outcome =
            reconcile(history, &[], day("2024-01-05"), ReconcileOptions::default()).unwrap();

        assert!(outcome.new_entries.is_empty());
        assert_eq!(outcome.closed_ids, vec!["a".to_string()]);
        let closed = &outcome.history["a"];
        assert_eq!(closed.status, Status::Closed);
        assert_eq!(closed.closed_on, Some(day("2024-01-05")));
    }

    #[test]
    fn reappearing_posting_reopens_without_notification() {
        let history = history_of(vec![entry(
            "a",
            Status::Closed,
            "2024-01-01",
            Some("2024-01-05"),
        )]);
        let current = vec![posting("a", "fresh title")];
        let outcome = reconcile(
            history,
            &current,
            day("2024-01-10"),
            ReconcileOptions::default(),
        )
        .unwrap();

        assert!(outcome.new_entries.is_empty());
        assert_eq!(outcome.reopened_ids, vec!["a".to_string()]);
        let reopened = &outcome.history["a"];
        assert_eq!(reopened.status, Status::Active);
        assert_eq!(reopened.closed_on, None);
        // Baseline behavior keeps the historical title.
        assert_eq!(reopened.title, "title of a");
    }

    #[test]
    fn refresh_on_reopen_copies_title_and_location() {
        let history = history_of(vec![entry(
            "a",
            Status::Closed,
            "2024-01-01",
            Some("2024-01-05"),
        )]);
        let current = vec![posting("a", "fresh title").with_location("São Paulo")];
        let outcome = reconcile(
            history,
            &current,
            day("2024-01-10"),
            ReconcileOptions {
                refresh_on_reopen: true,
            },
        )
        .unwrap();

        let reopened = &outcome.history["a"];
        assert_eq!(reopened.title, "fresh title");
        assert_eq!(reopened.location.as_deref(), Some("São Paulo"));
    }

    #[test]
    fn unchanged_snapshot_is_a_no_op() {
        let history = history_of(vec![entry("a", Status::Active, "2024-01-01", None)]);
        let current = vec![posting("a", "whatever")];
        let outcome = reconcile(
            history.clone(),
            &current,
            day("2024-02-01"),
            ReconcileOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.history, history);
        assert!(outcome.new_entries.is_empty());
        assert!(outcome.closed_ids.is_empty());
        assert!(outcome.reopened_ids.is_empty());
    }

    #[test]
    fn reconcile_is_idempotent_over_mixed_transitions() {
        let history = history_of(vec![
            entry("stays", Status::Active, "2024-01-01", None),
            entry("vanishes", Status::Active, "2024-01-02", None),
            entry("returns", Status::Closed, "2024-01-03", Some("2024-01-04")),
        ]);
        let current = vec![
            posting("stays", "stays"),
            posting("returns", "returns"),
            posting("brand-new", "brand new"),
        ];
        let today = day("2024-02-01");

        let first = reconcile(history, &current, today, ReconcileOptions::default()).unwrap();
        assert_eq!(first.new_entries.len(), 1);

        let second = reconcile(
            first.history.clone(),
            &current,
            today,
            ReconcileOptions::default(),
        )
        .unwrap();
        assert_eq!(second.history, first.history);
        assert!(second.new_entries.is_empty());
    }

    #[test]
    fn one_entry_per_id_even_when_present_in_both_inputs() {
        let history = history_of(vec![
            entry("a", Status::Active, "2024-01-01", None),
            entry("b", Status::Closed, "2024-01-01", Some("2024-01-02")),
        ]);
        let current = vec![posting("a", "a"), posting("b", "b"), posting("c", "c")];
        let outcome = reconcile(
            history,
            &current,
            day("2024-03-01"),
            ReconcileOptions::default(),
        )
        .unwrap();

        assert_eq!(outcome.history.len(), 3);
        assert_eq!(
            outcome.new_entries.iter().map(|e| &e.id).collect::<Vec<_>>(),
            vec!["c"]
        );
    }

    #[test]
    fn empty_id_in_current_set_is_fatal() {
        let current = vec![posting("  ", "nameless")];
        let err = reconcile(
            History::new(),
            &current,
            day("2024-01-01"),
            ReconcileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReconcileError::EmptyId {
                title: "nameless".to_string()
            }
        );
    }

    #[test]
    fn duplicate_id_in_current_set_is_fatal() {
        let current = vec![posting("a", "first"), posting("a", "second")];
        let err = reconcile(
            History::new(),
            &current,
            day("2024-01-01"),
            ReconcileOptions::default(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ReconcileError::DuplicateId {
                id: "a".to_string()
            }
        );
    }

    #[test]
    fn keyword_filter_is_case_insensitive_substring() {
        let postings = vec![
            posting("1", "Analista de CRM Sênior"),
            posting("2", "Engenheiro de Software"),
            posting("3", "ANALISTA DE DADOS"),
        ];
        let keywords = vec!["CRM".to_string(), "Dados".to_string()];
        let kept = filter_by_keywords(postings, &keywords);
        assert_eq!(
            kept.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["1", "3"]
        );
    }

    #[test]
    fn dedup_keeps_first_occurrence_order() {
        let postings = vec![
            posting("b", "b"),
            posting("a", "a"),
            posting("b", "b again"),
        ];
        let deduped = dedup_by_id(postings);
        assert_eq!(
            deduped.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec!["b", "a"]
        );
        assert_eq!(deduped[0].title, "b");
    }
}
