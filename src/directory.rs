use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::limits::*;
use crate::model::*;

pub const DEFAULT_SESSION_DURATION_MIN: u32 = 30;

// ── Collaborator ports ───────────────────────────────────────────
//
// The engine reads these; it never writes them.

#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    /// Active weekly windows, ordered by weekday then start time.
    async fn windows_for(&self, mentor_id: Ulid) -> io::Result<Vec<AvailabilityWindow>>;
}

#[async_trait]
pub trait MentorProfileStore: Send + Sync {
    async fn snapshot_for(&self, mentor_id: Ulid) -> io::Result<Option<MentorSnapshot>>;
}

#[async_trait]
pub trait AccountDirectory: Send + Sync {
    async fn account(&self, account_id: Ulid) -> io::Result<Option<Account>>;
}

// ── In-memory implementation ─────────────────────────────────────

#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectorySnapshot {
    accounts: Vec<Account>,
    mentors: Vec<MentorSnapshot>,
    availability: Vec<(Ulid, Vec<AvailabilityWindow>)>,
}

/// Accounts, mentor profiles and weekly templates, optionally persisted as a JSON
/// snapshot that is rewritten on every change.
///
/// Mutations hold `write_lock` from validation through the snapshot write, and
/// touch the maps only once the new snapshot is on disk.
pub struct InMemoryDirectory {
    accounts: DashMap<Ulid, Account>,
    mentors: DashMap<Ulid, MentorSnapshot>,
    /// account_id → mentor_id; an account owns at most one profile.
    profile_of: DashMap<Ulid, Ulid>,
    windows: DashMap<Ulid, Vec<AvailabilityWindow>>,
    snapshot_path: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl Default for InMemoryDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDirectory {
    /// A directory that lives only in memory.
    pub fn new() -> Self {
        Self {
            accounts: DashMap::new(),
            mentors: DashMap::new(),
            profile_of: DashMap::new(),
            windows: DashMap::new(),
            snapshot_path: None,
            write_lock: Mutex::new(()),
        }
    }

    /// Load the snapshot at `path` (if any) and persist future changes there.
    pub fn open(path: &Path) -> io::Result<Self> {
        let mut dir = Self::new();
        dir.snapshot_path = Some(path.to_path_buf());

        let snapshot: DirectorySnapshot = match File::open(path) {
            Ok(f) => serde_json::from_reader(io::BufReader::new(f))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DirectorySnapshot::default(),
            Err(e) => return Err(e),
        };

        for account in snapshot.accounts {
            dir.accounts.insert(account.id, account);
        }
        for mentor in snapshot.mentors {
            dir.profile_of.insert(mentor.account_id, mentor.mentor_id);
            dir.mentors.insert(mentor.mentor_id, mentor);
        }
        for (mentor_id, windows) in snapshot.availability {
            dir.windows.insert(mentor_id, windows);
        }
        info!(
            "directory loaded: {} accounts, {} mentors",
            dir.accounts.len(),
            dir.mentors.len()
        );
        Ok(dir)
    }

    pub fn register_account(&self, account: Account) -> Result<(), EngineError> {
        if account.contact.is_empty() {
            return Err(EngineError::Invalid("contact is required"));
        }
        if account.contact.len() > MAX_CONTACT_LEN {
            return Err(EngineError::LimitExceeded("contact too long"));
        }

        let _guard = self.lock_writes()?;
        if self.accounts.contains_key(&account.id) {
            return Err(EngineError::AlreadyExists {
                what: "account",
                id: account.id,
            });
        }
        self.persist_with(|s| s.accounts.push(account.clone()))?;
        self.accounts.insert(account.id, account);
        Ok(())
    }

    /// Create or update a mentor profile. Only accounts in the mentor role may own
    /// one, each owns at most one, and a profile never changes owner.
    pub fn upsert_mentor(
        &self,
        mentor_id: Ulid,
        account_id: Ulid,
        session_price: Decimal,
        session_duration: Option<u32>,
        active: bool,
    ) -> Result<MentorSnapshot, EngineError> {
        let _guard = self.lock_writes()?;
        let role = self
            .accounts
            .get(&account_id)
            .map(|a| a.role)
            .ok_or(EngineError::NotFound(account_id))?;
        if role != Role::Mentor {
            return Err(EngineError::Unauthorized("only mentors can own a profile"));
        }
        if session_price.is_sign_negative() {
            return Err(EngineError::Invalid("session price must not be negative"));
        }
        let session_duration = session_duration.unwrap_or(DEFAULT_SESSION_DURATION_MIN);
        if session_duration == 0 {
            return Err(EngineError::Invalid("session duration must be positive"));
        }
        if session_duration > MAX_SESSION_DURATION_MIN {
            return Err(EngineError::LimitExceeded("session duration too long"));
        }
        let owner = self.mentors.get(&mentor_id).map(|m| m.account_id);
        if owner.is_some_and(|owner| owner != account_id) {
            return Err(EngineError::Unauthorized(
                "mentor profile belongs to another account",
            ));
        }
        let owned = self.profile_of.get(&account_id).map(|e| *e.value());
        if owned.is_some_and(|owned| owned != mentor_id) {
            return Err(EngineError::AlreadyExists {
                what: "mentor profile for account",
                id: account_id,
            });
        }

        let snapshot = MentorSnapshot {
            mentor_id,
            account_id,
            session_price,
            session_duration,
            active,
        };
        self.persist_with(|s| {
            s.mentors.retain(|m| m.mentor_id != mentor_id);
            s.mentors.push(snapshot.clone());
        })?;
        self.profile_of.insert(account_id, mentor_id);
        self.mentors.insert(mentor_id, snapshot.clone());
        Ok(snapshot)
    }

    /// Replace the mentor's whole weekly template. Never a patch.
    pub fn replace_availability(
        &self,
        mentor_id: Ulid,
        mut windows: Vec<AvailabilityWindow>,
    ) -> Result<Vec<AvailabilityWindow>, EngineError> {
        if windows.len() > MAX_WINDOWS_PER_MENTOR {
            return Err(EngineError::LimitExceeded("too many availability windows"));
        }
        if windows.iter().any(|w| !w.is_well_formed()) {
            return Err(EngineError::Invalid("window start must be before end"));
        }
        windows.sort_by_key(|w| (w.day.num_days_from_monday(), w.start, w.end));

        let _guard = self.lock_writes()?;
        if !self.mentors.contains_key(&mentor_id) {
            return Err(EngineError::NotFound(mentor_id));
        }
        self.persist_with(|s| {
            s.availability.retain(|(id, _)| *id != mentor_id);
            s.availability.push((mentor_id, windows.clone()));
        })?;
        self.windows.insert(mentor_id, windows.clone());
        Ok(windows)
    }

    pub fn windows(&self, mentor_id: &Ulid) -> Vec<AvailabilityWindow> {
        self.windows
            .get(mentor_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }

    pub fn mentor(&self, mentor_id: &Ulid) -> Option<MentorSnapshot> {
        self.mentors.get(mentor_id).map(|e| e.value().clone())
    }

    pub fn get_account(&self, account_id: &Ulid) -> Option<Account> {
        self.accounts.get(account_id).map(|e| e.value().clone())
    }

    fn lock_writes(&self) -> Result<MutexGuard<'_, ()>, EngineError> {
        self.write_lock
            .lock()
            .map_err(|_| EngineError::Collaborator("directory write lock poisoned".into()))
    }

    /// Write the current state with `change` applied via tmp + rename. The caller
    /// holds the write lock and applies the same change in memory only on success.
    /// No-op without a path.
    fn persist_with(&self, change: impl FnOnce(&mut DirectorySnapshot)) -> Result<(), EngineError> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let mut snapshot = DirectorySnapshot {
            accounts: self.accounts.iter().map(|e| e.value().clone()).collect(),
            mentors: self.mentors.iter().map(|e| e.value().clone()).collect(),
            availability: self
                .windows
                .iter()
                .map(|e| (*e.key(), e.value().clone()))
                .collect(),
        };
        change(&mut snapshot);
        write_snapshot(path, &snapshot).map_err(|e| EngineError::Collaborator(e.to_string()))
    }
}

fn write_snapshot(path: &Path, snapshot: &DirectorySnapshot) -> io::Result<()> {
    let tmp_path = path.with_extension("json.tmp");
    let file = File::create(&tmp_path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer(&mut writer, snapshot)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.flush()?;
    writer.get_ref().sync_all()?;
    fs::rename(&tmp_path, path)
}

#[async_trait]
impl AvailabilityStore for InMemoryDirectory {
    async fn windows_for(&self, mentor_id: Ulid) -> io::Result<Vec<AvailabilityWindow>> {
        Ok(self.windows(&mentor_id))
    }
}

#[async_trait]
impl MentorProfileStore for InMemoryDirectory {
    async fn snapshot_for(&self, mentor_id: Ulid) -> io::Result<Option<MentorSnapshot>> {
        Ok(self.mentor(&mentor_id))
    }
}

#[async_trait]
impl AccountDirectory for InMemoryDirectory {
    async fn account(&self, account_id: Ulid) -> io::Result<Option<Account>> {
        Ok(self.get_account(&account_id))
    }
}
