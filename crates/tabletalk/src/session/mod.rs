mod journal;

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::Turn;
use crate::utils::time::now_utc_rfc3339;

pub use journal::{JOURNAL_SCHEMA_VERSION, SessionJournal};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("invalid platform `{platform}`")]
    InvalidPlatform { platform: String },

    #[error("session `{session_id}` already has a turn in progress")]
    SessionBusy { session_id: String },

    #[error("session journal failure: {detail}")]
    Journal { detail: String },
}

impl SessionError {
    fn journal(error: &anyhow::Error) -> Self {
        Self::Journal {
            detail: format!("{error:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub platform: Option<String>,
    pub turns: Vec<Turn>,
    pub turn_counter: u64,
    pub created_at_utc: String,
}

impl Session {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            platform: None,
            turns: Vec::new(),
            turn_counter: 0,
            created_at_utc: now_utc_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlatformSelection {
    pub platform: String,
    pub previous: Option<String>,
    pub changed: bool,
    pub cleared_turns: usize,
}

#[derive(Debug)]
struct SessionCell {
    state: Mutex<Session>,
    in_flight: AtomicBool,
}

impl SessionCell {
    fn lock(&self) -> MutexGuard<'_, Session> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive right to run one turn on a session; released on drop.
#[derive(Debug)]
pub struct TurnPermit {
    cell: Arc<SessionCell>,
    session_id: String,
}

impl TurnPermit {
    fn claim(cell: &Arc<SessionCell>, session_id: &str) -> Result<Self, SessionError> {
        if cell
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(SessionError::SessionBusy {
                session_id: session_id.to_string(),
            });
        }
        Ok(Self {
            cell: Arc::clone(cell),
            session_id: session_id.to_string(),
        })
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        self.cell.in_flight.store(false, Ordering::Release);
    }
}

/// Per-session transcripts and platform selections.
///
/// Each session has its own mutex, so different sessions never contend; a session admits at
/// most one in-flight turn at a time. With a journal attached every mutation is written
/// through before it becomes visible in memory, and unknown session ids are looked up in the
/// journal before a fresh session is created.
#[derive(Debug)]
pub struct SessionStore {
    platforms: BTreeSet<String>,
    sessions: RwLock<HashMap<String, Arc<SessionCell>>>,
    journal: Option<Mutex<SessionJournal>>,
}

impl SessionStore {
    #[must_use]
    pub fn new(platforms: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            platforms: platforms.into_iter().map(Into::into).collect(),
            sessions: RwLock::new(HashMap::new()),
            journal: None,
        }
    }

    #[must_use]
    pub fn with_journal(mut self, journal: SessionJournal) -> Self {
        self.journal = Some(Mutex::new(journal));
        self
    }

    pub fn get_or_create(&self, session_id: &str) -> Result<Session, SessionError> {
        Ok(self.cell(session_id)?.lock().clone())
    }

    /// Points the session at `platform`. Fails with `SessionBusy` while a turn is in flight.
    pub fn select_platform(
        &self,
        session_id: &str,
        platform: &str,
    ) -> Result<PlatformSelection, SessionError> {
        self.check_platform(platform)?;
        let permit = self.begin_turn(session_id)?;
        self.select_platform_in_turn(&permit, platform)
    }

    /// Platform switch performed by the holder of the session's turn permit.
    pub fn select_platform_in_turn(
        &self,
        permit: &TurnPermit,
        platform: &str,
    ) -> Result<PlatformSelection, SessionError> {
        self.check_platform(platform)?;
        let session_id = permit.session_id();
        let mut session = permit.cell.lock();
        let previous = session.platform.clone();
        if previous.as_deref() == Some(platform) {
            return Ok(PlatformSelection {
                platform: platform.to_string(),
                previous,
                changed: false,
                cleared_turns: 0,
            });
        }

        let mut updated = session.clone();
        updated.platform = Some(platform.to_string());
        let cleared_turns = updated.turns.len();
        updated.turns.clear();
        self.write_through(|journal| {
            journal.clear_turns(session_id)?;
            journal.upsert_session(&updated)
        })?;
        *session = updated;

        tracing::info!(
            session_id,
            platform,
            previous = previous.as_deref().unwrap_or(""),
            cleared_turns,
            "platform_selected"
        );
        Ok(PlatformSelection {
            platform: platform.to_string(),
            previous,
            changed: true,
            cleared_turns,
        })
    }

    /// Appends a finalized turn, stamping it with the next sequence number. Only the permit
    /// holder can append, so turns of one session never interleave.
    pub fn append_turn(&self, permit: &TurnPermit, mut turn: Turn) -> Result<Turn, SessionError> {
        let mut session = permit.cell.lock();
        turn.sequence = session.turn_counter + 1;

        let mut updated = session.clone();
        updated.turn_counter = turn.sequence;
        self.write_through(|journal| journal.append_turn(&updated, &turn))?;
        updated.turns.push(turn.clone());
        *session = updated;
        Ok(turn)
    }

    /// Drops every turn but keeps the platform and the turn counter.
    pub fn clear_history(&self, session_id: &str) -> Result<usize, SessionError> {
        let permit = self.begin_turn(session_id)?;
        let mut session = permit.cell.lock();
        self.write_through(|journal| journal.clear_turns(session_id))?;
        let cleared = session.turns.len();
        session.turns.clear();
        tracing::info!(session_id, cleared, "history_cleared");
        Ok(cleared)
    }

    pub fn list_turns(&self, session_id: &str) -> Result<Vec<Turn>, SessionError> {
        Ok(self.cell(session_id)?.lock().turns.clone())
    }

    /// The last `window` turns, most recent first.
    pub fn recent_turns(&self, session_id: &str, window: usize) -> Result<Vec<Turn>, SessionError> {
        let cell = self.cell(session_id)?;
        let session = cell.lock();
        Ok(session.turns.iter().rev().take(window).cloned().collect())
    }

    /// Removes the session from memory and the journal. A session with a turn in flight is
    /// busy; its cell stays claimed until removal so no new turn can start on it meanwhile.
    pub fn delete_session(&self, session_id: &str) -> Result<bool, SessionError> {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let claimed = match sessions.get(session_id) {
            Some(cell) => Some(TurnPermit::claim(cell, session_id)?),
            None => None,
        };
        let journal_deleted = self.write_through(|journal| journal.delete_session(session_id))?;
        let removed = sessions.remove(session_id).is_some();
        drop(sessions);
        drop(claimed);
        tracing::info!(session_id, "session_deleted");
        Ok(removed || journal_deleted.unwrap_or(false))
    }

    /// Claims the session for one turn, or reports it busy.
    pub fn begin_turn(&self, session_id: &str) -> Result<TurnPermit, SessionError> {
        let cell = self.cell(session_id)?;
        TurnPermit::claim(&cell, session_id)
    }

    fn check_platform(&self, platform: &str) -> Result<(), SessionError> {
        if self.platforms.contains(platform) {
            Ok(())
        } else {
            Err(SessionError::InvalidPlatform {
                platform: platform.to_string(),
            })
        }
    }

    fn cell(&self, session_id: &str) -> Result<Arc<SessionCell>, SessionError> {
        if let Some(cell) = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
        {
            return Ok(Arc::clone(cell));
        }

        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(cell) = sessions.get(session_id) {
            return Ok(Arc::clone(cell));
        }

        let restored = self
            .write_through(|journal| journal.load_session(session_id))?
            .flatten();
        let session = match restored {
            Some(session) => {
                tracing::debug!(session_id, turns = session.turns.len(), "session_restored");
                session
            }
            None => {
                let session = Session::new(session_id);
                self.write_through(|journal| journal.upsert_session(&session))?;
                session
            }
        };

        let cell = Arc::new(SessionCell {
            state: Mutex::new(session),
            in_flight: AtomicBool::new(false),
        });
        sessions.insert(session_id.to_string(), Arc::clone(&cell));
        Ok(cell)
    }

    fn write_through<T>(
        &self,
        operation: impl FnOnce(&mut SessionJournal) -> anyhow::Result<T>,
    ) -> Result<Option<T>, SessionError> {
        let Some(journal) = &self.journal else {
            return Ok(None);
        };
        let mut journal = journal.lock().unwrap_or_else(PoisonError::into_inner);
        operation(&mut journal)
            .map(Some)
            .map_err(|error| SessionError::journal(&error))
    }
}

#[cfg(test)]
mod tests {
    use super::{SessionError, SessionJournal, SessionStore};
    use crate::models::{Response, Turn, TurnStatus};

    fn turn(question: &str) -> Turn {
        Turn {
            sequence: 0,
            question: question.to_string(),
            plan: None,
            result: None,
            response: Response {
                status: TurnStatus::Succeeded,
                text: format!("answer to {question}"),
                columns: Vec::new(),
                rows: Vec::new(),
                row_count: 0,
                truncated: false,
                chart: None,
                generated_sql: None,
                follow_ups: Vec::new(),
                failure: None,
            },
            status: TurnStatus::Succeeded,
            attempts: Vec::new(),
            failure: None,
            created_at_utc: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn new_store() -> SessionStore {
        SessionStore::new(["hr", "fic"])
    }

    fn append(store: &SessionStore, session_id: &str, question: &str) -> Turn {
        let permit = store.begin_turn(session_id).expect("session should be idle");
        store
            .append_turn(&permit, turn(question))
            .expect("turn should append")
    }

    #[test]
    fn creates_sessions_lazily_without_platform() {
        let session = new_store().get_or_create("s1").expect("session should be created");
        assert_eq!(session.id, "s1");
        assert!(session.platform.is_none());
        assert_eq!(session.turn_counter, 0);
    }

    #[test]
    fn rejects_unknown_platforms() {
        assert_eq!(
            new_store().select_platform("s1", "crm"),
            Err(SessionError::InvalidPlatform {
                platform: "crm".to_string()
            })
        );
    }

    #[test]
    fn switching_platform_clears_transcript_and_reselecting_is_a_no_op() {
        let store = new_store();
        store.select_platform("s1", "hr").expect("hr is known");
        append(&store, "s1", "q1");

        let same = store.select_platform("s1", "hr").expect("hr is known");
        assert!(!same.changed);
        assert_eq!(store.list_turns("s1").expect("turns").len(), 1);

        let switched = store.select_platform("s1", "fic").expect("fic is known");
        assert!(switched.changed);
        assert_eq!(switched.cleared_turns, 1);
        assert_eq!(switched.previous.as_deref(), Some("hr"));
        assert!(store.list_turns("s1").expect("turns").is_empty());
    }

    #[test]
    fn sequence_numbers_stay_monotonic_across_clear() {
        let store = new_store();
        let first = append(&store, "s1", "q1");
        let second = append(&store, "s1", "q2");
        assert_eq!((first.sequence, second.sequence), (1, 2));

        assert_eq!(store.clear_history("s1").expect("clear"), 2);
        let third = append(&store, "s1", "q3");
        assert_eq!(third.sequence, 3);
        assert_eq!(store.list_turns("s1").expect("turns").len(), 1);
    }

    #[test]
    fn recent_turns_are_most_recent_first_and_bounded() {
        let store = new_store();
        for index in 0..5 {
            append(&store, "s1", &format!("q{index}"));
        }
        let recent = store.recent_turns("s1", 2).expect("recent");
        let questions = recent.iter().map(|t| t.question.as_str()).collect::<Vec<_>>();
        assert_eq!(questions, vec!["q4", "q3"]);
    }

    #[test]
    fn second_permit_on_same_session_is_busy_until_released() {
        let store = new_store();
        let permit = store.begin_turn("s1").expect("first permit");
        assert!(matches!(
            store.begin_turn("s1"),
            Err(SessionError::SessionBusy { .. })
        ));
        assert!(store.begin_turn("s2").is_ok());
        drop(permit);
        assert!(store.begin_turn("s1").is_ok());
    }

    #[test]
    fn session_mutations_wait_for_the_turn_in_flight() {
        let store = new_store();
        store.select_platform("s1", "hr").expect("hr is known");
        append(&store, "s1", "q1");

        let permit = store.begin_turn("s1").expect("first permit");
        let busy = |result: Result<_, SessionError>| {
            matches!(result, Err(SessionError::SessionBusy { .. }))
        };
        assert!(busy(store.select_platform("s1", "fic").map(|_| ())));
        assert!(busy(store.clear_history("s1").map(|_| ())));
        assert!(busy(store.delete_session("s1").map(|_| ())));

        let in_turn = store
            .select_platform_in_turn(&permit, "hr")
            .expect("permit holder may reselect");
        assert!(!in_turn.changed);
        drop(permit);

        let session = store.get_or_create("s1").expect("session survives");
        assert_eq!(session.platform.as_deref(), Some("hr"));
        assert_eq!(session.turns.len(), 1);
        assert!(store.delete_session("s1").expect("idle session deletes"));
    }

    #[test]
    fn journal_restores_sessions_and_honours_clear_and_delete() {
        let path = std::env::temp_dir().join(format!(
            "tabletalk-journal-{}.sqlite",
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);

        {
            let store = new_store().with_journal(SessionJournal::open(&path).expect("journal opens"));
            store.select_platform("s1", "hr").expect("select");
            append(&store, "s1", "q1");
            append(&store, "s1", "q2");
        }

        let store = new_store().with_journal(SessionJournal::open(&path).expect("journal reopens"));
        let restored = store.get_or_create("s1").expect("session restores");
        assert_eq!(restored.platform.as_deref(), Some("hr"));
        assert_eq!(restored.turn_counter, 2);
        assert_eq!(restored.turns.len(), 2);
        assert_eq!(restored.turns[1].question, "q2");

        store.clear_history("s1").expect("clear");
        drop(store);
        let store = new_store().with_journal(SessionJournal::open(&path).expect("journal reopens"));
        let cleared = store.get_or_create("s1").expect("session restores");
        assert!(cleared.turns.is_empty());
        assert_eq!(cleared.turn_counter, 2);

        assert!(store.delete_session("s1").expect("delete"));
        let fresh = store.get_or_create("s1").expect("fresh session");
        assert!(fresh.platform.is_none());

        let _ = std::fs::remove_file(&path);
    }
}
