use std::collections::{HashMap, HashSet};

use super::{Session, SessionStatus, SessionSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    Inserted(Session),
    Updated {
        session: Session,
        previous: SessionStatus,
    },
    /// The id was removed earlier; the report is stale.
    Ignored,
}

impl Upsert {
    pub fn session(&self) -> Option<&Session> {
        match self {
            Upsert::Inserted(session) | Upsert::Updated { session, .. } => Some(session),
            Upsert::Ignored => None,
        }
    }

    pub fn status_changed(&self) -> bool {
        match self {
            Upsert::Inserted(_) => true,
            Upsert::Updated { session, previous } => session.status != *previous,
            Upsert::Ignored => false,
        }
    }
}

#[derive(Debug)]
struct Entry {
    seq: u64,
    session: Session,
}

/// Mirrored table of known sessions, keyed by id.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    entries: HashMap<String, Entry>,
    removed: HashSet<String>,
    next_seq: u64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges `summary` into the table. `status` and `pid` are always taken
    /// from the summary; the working directory is fixed once known.
    pub fn upsert(&mut self, summary: SessionSummary) -> Upsert {
        if self.removed.contains(&summary.id) {
            return Upsert::Ignored;
        }
        let pid = match summary.status {
            SessionStatus::Connected => summary.pid,
            _ => None,
        };

        if let Some(entry) = self.entries.get_mut(&summary.id) {
            let session = &mut entry.session;
            let previous = session.status;
            session.status = summary.status;
            session.pid = pid;
            if let Some(kind) = summary.kind {
                session.kind = kind;
            }
            if let Some(name) = summary.display_name {
                session.display_name = name;
            }
            if session.working_directory.is_empty() {
                if let Some(cwd) = summary.working_directory {
                    session.working_directory = cwd;
                }
            }
            return Upsert::Updated {
                session: session.clone(),
                previous,
            };
        }

        let session = Session {
            display_name: summary.display_name.unwrap_or_else(|| summary.id.clone()),
            id: summary.id,
            kind: summary.kind.unwrap_or_default(),
            status: summary.status,
            working_directory: summary.working_directory.unwrap_or_default(),
            pid,
        };
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert(
            session.id.clone(),
            Entry {
                seq,
                session: session.clone(),
            },
        );
        Upsert::Inserted(session)
    }

    pub fn get(&self, id: &str) -> Option<&Session> {
        self.entries.get(id).map(|entry| &entry.session)
    }

    /// Sessions in the order they were first seen.
    pub fn list(&self) -> Vec<Session> {
        let mut entries: Vec<&Entry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.seq);
        entries.into_iter().map(|entry| entry.session.clone()).collect()
    }

    pub fn rename(&mut self, id: &str, name: impl Into<String>) -> Option<Session> {
        let entry = self.entries.get_mut(id)?;
        entry.session.display_name = name.into();
        Some(entry.session.clone())
    }

    /// Drops the entry and tombstones the id. Unknown ids are a no-op.
    pub fn remove(&mut self, id: &str) -> Option<Session> {
        let entry = self.entries.remove(id)?;
        self.removed.insert(id.to_string());
        Some(entry.session)
    }

    pub fn is_removed(&self, id: &str) -> bool {
        self.removed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
