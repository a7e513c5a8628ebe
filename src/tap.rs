use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use anyhow::Context as _;
use regex::Regex;
use rusqlite::{OptionalExtension as _, params};
use serde::Serialize;

use crate::store::{MessageStore, open_connection};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TapId(pub i64);

impl std::fmt::Display for TapId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored rule selecting requests to capture. The pattern is searched anywhere in the
/// request path; an empty pattern matches every path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tap {
    pub id: TapId,
    pub path_regex: String,
}

#[derive(Debug, thiserror::Error)]
pub enum TapError {
    #[error("invalid tap pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("tap {0} was not found")]
    NotFound(TapId),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Decides which requests get captured.
///
/// The tap list is re-read from the datastore on every decision so administrative
/// edits apply to the next request. Compiled patterns are memoized by their text.
#[derive(Debug, Clone)]
pub struct TapRegistry {
    db_path: PathBuf,
    compiled: Arc<Mutex<HashMap<String, Result<Regex, regex::Error>>>>,
}

impl TapRegistry {
    pub fn new(store: &MessageStore) -> Self {
        Self::with_db_path(store.db_path().to_path_buf())
    }

    fn with_db_path(db_path: PathBuf) -> Self {
        Self {
            db_path,
            compiled: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// True iff any tap's pattern matches somewhere in `path`.
    ///
    /// A tap whose pattern does not compile is skipped with a warning on every
    /// evaluation; the remaining taps are still evaluated.
    pub async fn should_capture(&self, path: &str) -> anyhow::Result<bool> {
        let taps = self.list_taps().await?;
        Ok(self.matches_any(&taps, path))
    }

    fn matches_any(&self, taps: &[Tap], path: &str) -> bool {
        let mut compiled = self
            .compiled
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        for tap in taps {
            let regex = compiled
                .entry(tap.path_regex.clone())
                .or_insert_with(|| Regex::new(&tap.path_regex));
            match regex {
                Ok(regex) if regex.is_match(path) => return true,
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        tap = %tap.id,
                        pattern = %tap.path_regex,
                        "skipping tap with invalid pattern: {err}"
                    );
                }
            }
        }
        false
    }

    pub async fn list_taps(&self) -> anyhow::Result<Vec<Tap>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || list_taps_blocking(&db_path))
            .await
            .context("join list_taps task")?
    }

    pub async fn create_tap(&self, path_regex: &str) -> Result<Tap, TapError> {
        validate_pattern(path_regex)?;
        let db_path = self.db_path.clone();
        let path_regex = path_regex.to_owned();
        tokio::task::spawn_blocking(move || create_tap_blocking(&db_path, path_regex))
            .await
            .context("join create_tap task")?
            .map_err(TapError::from)
    }

    pub async fn update_tap(&self, id: TapId, path_regex: &str) -> Result<Tap, TapError> {
        validate_pattern(path_regex)?;
        let db_path = self.db_path.clone();
        let path_regex = path_regex.to_owned();
        let updated =
            tokio::task::spawn_blocking(move || update_tap_blocking(&db_path, id, path_regex))
                .await
                .context("join update_tap task")??;
        updated.ok_or(TapError::NotFound(id))
    }

    pub async fn delete_tap(&self, id: TapId) -> Result<(), TapError> {
        let db_path = self.db_path.clone();
        let deleted = tokio::task::spawn_blocking(move || delete_tap_blocking(&db_path, id))
            .await
            .context("join delete_tap task")??;
        if deleted {
            Ok(())
        } else {
            Err(TapError::NotFound(id))
        }
    }

    /// Inserts each pattern that no existing tap already carries. Returns the new taps.
    pub async fn seed_taps(&self, patterns: &[String]) -> Result<Vec<Tap>, TapError> {
        let existing = self.list_taps().await?;
        let mut created = Vec::new();
        for pattern in patterns {
            let already_present = existing.iter().any(|tap| &tap.path_regex == pattern)
                || created.iter().any(|tap: &Tap| &tap.path_regex == pattern);
            if !already_present {
                created.push(self.create_tap(pattern).await?);
            }
        }
        Ok(created)
    }
}

pub fn validate_pattern(path_regex: &str) -> Result<(), TapError> {
    Regex::new(path_regex)
        .map(|_| ())
        .map_err(|source| TapError::InvalidPattern {
            pattern: path_regex.to_owned(),
            source,
        })
}

fn list_taps_blocking(path: &Path) -> anyhow::Result<Vec<Tap>> {
    let conn = open_connection(path)?;
    let mut stmt = conn
        .prepare("SELECT id, path_regex FROM taps ORDER BY id")
        .context("prepare list taps")?;
    let mut rows = stmt.query([]).context("query list taps")?;

    let mut taps = Vec::new();
    while let Some(row) = rows.next().context("iterate list taps")? {
        taps.push(Tap {
            id: TapId(row.get(0).context("deserialize tap id")?),
            path_regex: row.get(1).context("deserialize tap path_regex")?,
        });
    }
    Ok(taps)
}

fn create_tap_blocking(path: &Path, path_regex: String) -> anyhow::Result<Tap> {
    let conn = open_connection(path)?;
    conn.execute(
        "INSERT INTO taps (path_regex) VALUES (?1)",
        params![path_regex],
    )
    .context("insert tap")?;
    Ok(Tap {
        id: TapId(conn.last_insert_rowid()),
        path_regex,
    })
}

fn update_tap_blocking(path: &Path, id: TapId, path_regex: String) -> anyhow::Result<Option<Tap>> {
    let conn = open_connection(path)?;
    let updated = conn
        .execute(
            "UPDATE taps SET path_regex = ?2 WHERE id = ?1",
            params![id.0, path_regex],
        )
        .context("update tap")?;
    if updated == 0 {
        return Ok(None);
    }
    let path_regex = conn
        .query_row(
            "SELECT path_regex FROM taps WHERE id = ?1",
            params![id.0],
            |row| row.get::<_, String>(0),
        )
        .optional()
        .context("read updated tap")?;
    Ok(path_regex.map(|path_regex| Tap { id, path_regex }))
}

fn delete_tap_blocking(path: &Path, id: TapId) -> anyhow::Result<bool> {
    let conn = open_connection(path)?;
    let deleted = conn
        .execute("DELETE FROM taps WHERE id = ?1", params![id.0])
        .context("delete tap by id")?;
    Ok(deleted == 1)
}
