use std::{
    collections::BTreeSet,
    fs,
    io::Read as _,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use bytes::Bytes;
use rusqlite::{Connection, OpenFlags, OptionalExtension as _, TransactionBehavior, params};
use serde::{Deserialize, Deserializer};

use crate::{
    blob::{BlobStore, FsBlobStore, SpillBuffer},
    config::Config,
    message::{BlobRef, HeaderList, Message, MessageId, NewMessage},
};

const SCHEMA_VERSION: i32 = 1;
pub const DATABASE_FILENAME: &str = "wiretap.db";
pub const BLOBS_DIRNAME: &str = "blobs";
pub const DEFAULT_MAX_MESSAGES: usize = 1000;

const MESSAGE_COLUMNS: &str = r#"
  id,
  started_at_unix_ms,
  ended_at_unix_ms,
  remote_addr,
  request_method,
  request_path,
  request_headers_json,
  request_body_key,
  request_body_content_type,
  request_body_size,
  response_status,
  response_reason,
  response_headers_json,
  response_body_key,
  response_body_content_type,
  response_body_size
"#;

/// How many messages survive a retention sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionLimit {
    Unlimited,
    MaxMessages(usize),
}

impl Default for RetentionLimit {
    fn default() -> Self {
        Self::MaxMessages(DEFAULT_MAX_MESSAGES)
    }
}

impl std::fmt::Display for RetentionLimit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unlimited => f.write_str("unlimited"),
            Self::MaxMessages(max) => write!(f, "{max}"),
        }
    }
}

impl<'de> Deserialize<'de> for RetentionLimit {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawLimit {
            Count(usize),
            Keyword(String),
        }

        match RawLimit::deserialize(deserializer)? {
            RawLimit::Count(max) => Ok(Self::MaxMessages(max)),
            RawLimit::Keyword(keyword) if keyword.eq_ignore_ascii_case("unlimited") => {
                Ok(Self::Unlimited)
            }
            RawLimit::Keyword(other) => Err(serde::de::Error::custom(format!(
                "invalid max_messages `{other}`; expected a non-negative integer or \"unlimited\""
            ))),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MessageStoreError {
    #[error("message {0} was not found")]
    NotFound(MessageId),
    #[error("message {0} was already finalized")]
    AlreadyFinalized(MessageId),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Optional filters for [`MessageStore::search_messages`]. Unset or blank fields match
/// every message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageSearch {
    pub method: Option<String>,
    pub status: Option<u16>,
    pub remote_addr: Option<String>,
    pub path_contains: Option<String>,
}

/// A body waiting to be persisted alongside its message.
#[derive(Debug)]
pub struct CapturedBody {
    pub spill: SpillBuffer,
    pub content_type: Option<String>,
}

/// Response-phase fields applied by [`MessageStore::finalize_message`].
#[derive(Debug)]
pub struct ResponseCapture {
    pub status_code: u16,
    pub reason_phrase: String,
    pub headers: HeaderList,
    pub body: Option<CapturedBody>,
}

/// Captured messages in SQLite plus their bodies in a [`BlobStore`].
///
/// Every write that touches blobs runs inside a `BEGIN IMMEDIATE` transaction, and the
/// blob files are persisted or removed while that write lock is held. A message row
/// and the blobs only it references therefore appear and disappear together, and two
/// concurrent retention sweeps can never delete the same row.
#[derive(Debug, Clone)]
pub struct MessageStore {
    db_path: PathBuf,
    blobs: Arc<dyn BlobStore>,
}

impl MessageStore {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Self::open(&config.storage.path)
    }

    /// Opens `<root>/wiretap.db` with filesystem blobs under `<root>/blobs`.
    pub fn open(root: &Path) -> anyhow::Result<Self> {
        fs::create_dir_all(root)
            .with_context(|| format!("create storage dir {}", root.display()))?;
        let blobs = FsBlobStore::open(root.join(BLOBS_DIRNAME))
            .with_context(|| format!("open blob store under {}", root.display()))?;
        Self::with_blob_store(root.join(DATABASE_FILENAME), Arc::new(blobs))
    }

    pub fn with_blob_store(db_path: PathBuf, blobs: Arc<dyn BlobStore>) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create storage dir {}", parent.display()))?;
        }

        let store = Self { db_path, blobs };
        store.init()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn blob_store(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub async fn create_message(
        &self,
        new_message: NewMessage,
        body: Option<CapturedBody>,
    ) -> anyhow::Result<Message> {
        let db_path = self.db_path.clone();
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || {
            create_message_blocking(&db_path, blobs.as_ref(), new_message, body)
        })
        .await
        .context("join create_message task")?
    }

    /// Applies the response fields to a pending message. Succeeds at most once per id.
    pub async fn finalize_message(
        &self,
        id: MessageId,
        capture: ResponseCapture,
    ) -> Result<Message, MessageStoreError> {
        let db_path = self.db_path.clone();
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || {
            finalize_message_blocking(&db_path, blobs.as_ref(), id, capture)
        })
        .await
        .context("join finalize_message task")?
    }

    pub async fn delete_message(&self, id: MessageId) -> anyhow::Result<bool> {
        let db_path = self.db_path.clone();
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || delete_message_blocking(&db_path, blobs.as_ref(), id))
            .await
            .context("join delete_message task")?
    }

    /// Keeps the most recently started messages and deletes the rest in one batch.
    /// Returns how many messages were evicted.
    pub async fn enforce_retention(&self, limit: RetentionLimit) -> anyhow::Result<usize> {
        let RetentionLimit::MaxMessages(max_messages) = limit else {
            return Ok(0);
        };
        let keep = i64::try_from(max_messages).unwrap_or(i64::MAX);
        let db_path = self.db_path.clone();
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || {
            enforce_retention_blocking(&db_path, blobs.as_ref(), keep)
        })
        .await
        .context("join enforce_retention task")?
    }

    pub async fn get_message(&self, id: MessageId) -> anyhow::Result<Option<Message>> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            select_message(&conn, id)
        })
        .await
        .context("join get_message task")?
    }

    /// Newest first, by start time then id.
    pub async fn list_messages(&self, offset: usize, limit: usize) -> anyhow::Result<Vec<Message>> {
        self.search_messages(MessageSearch::default(), offset, limit).await
    }

    /// Like [`MessageStore::list_messages`], restricted to messages matching `search`.
    pub async fn search_messages(
        &self,
        search: MessageSearch,
        offset: usize,
        limit: usize,
    ) -> anyhow::Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let (offset, limit) = validate_pagination(offset, limit)?;
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            search_messages_blocking(&db_path, &search, offset, limit)
        })
        .await
        .context("join search_messages task")?
    }

    pub async fn count_messages(&self) -> anyhow::Result<u64> {
        self.count_matching(MessageSearch::default()).await
    }

    pub async fn count_matching(&self, search: MessageSearch) -> anyhow::Result<u64> {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open_connection(&db_path)?;
            let filter = SearchParams::from(&search);
            let count: i64 = conn
                .query_row(
                    &format!("SELECT COUNT(*) FROM messages {SEARCH_WHERE}"),
                    params![
                        filter.method,
                        filter.status,
                        filter.remote_addr,
                        filter.path_contains
                    ],
                    |row| row.get(0),
                )
                .context("count messages")?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
        .await
        .context("join count_messages task")?
    }

    pub async fn read_blob(&self, blob: &BlobRef) -> anyhow::Result<Vec<u8>> {
        let blobs = Arc::clone(&self.blobs);
        let key = blob.key.clone();
        tokio::task::spawn_blocking(move || {
            let mut reader = blobs
                .open_for_read(&key)
                .with_context(|| format!("open blob {key}"))?;
            let mut bytes = Vec::new();
            reader
                .read_to_end(&mut bytes)
                .with_context(|| format!("read blob {key}"))?;
            Ok(bytes)
        })
        .await
        .context("join read_blob task")?
    }

    /// Opens a spill buffer on the backing blob store.
    pub async fn open_spill(&self) -> anyhow::Result<SpillBuffer> {
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || blobs.open_for_write())
            .await
            .context("join open_spill task")?
            .context("open spill buffer")
    }

    /// Writes an already-buffered body into a fresh spill buffer.
    pub async fn spill_bytes(&self, bytes: Bytes) -> anyhow::Result<SpillBuffer> {
        let blobs = Arc::clone(&self.blobs);
        tokio::task::spawn_blocking(move || -> anyhow::Result<SpillBuffer> {
            let mut spill = blobs.open_for_write().context("open spill buffer")?;
            spill.append(&bytes).context("write spill buffer")?;
            Ok(spill)
        })
        .await
        .context("join spill_bytes task")?
    }

    fn init(&self) -> anyhow::Result<()> {
        let mut conn = open_connection(&self.db_path)?;
        migrate(&mut conn)?;
        Ok(())
    }
}

pub(crate) fn open_connection(path: &Path) -> anyhow::Result<Connection> {
    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
        | OpenFlags::SQLITE_OPEN_CREATE
        | OpenFlags::SQLITE_OPEN_URI
        | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags)
        .with_context(|| format!("open sqlite {}", path.display()))?;

    conn.pragma_update(None, "journal_mode", "WAL")
        .context("set PRAGMA journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("set PRAGMA synchronous=NORMAL")?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .context("set sqlite busy_timeout")?;

    Ok(conn)
}

fn migrate(conn: &mut Connection) -> anyhow::Result<()> {
    let user_version: i32 = conn
        .query_row("PRAGMA user_version;", [], |row| row.get(0))
        .context("read PRAGMA user_version")?;

    match user_version {
        0 => {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS taps (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  path_regex TEXT NOT NULL DEFAULT ''
                );

                CREATE TABLE IF NOT EXISTS messages (
                  id INTEGER PRIMARY KEY AUTOINCREMENT,
                  started_at_unix_ms INTEGER NOT NULL,
                  ended_at_unix_ms INTEGER,
                  remote_addr TEXT NOT NULL,
                  request_method TEXT NOT NULL,
                  request_path TEXT NOT NULL,
                  request_headers_json TEXT NOT NULL,
                  request_body_key TEXT,
                  request_body_content_type TEXT,
                  request_body_size INTEGER,
                  response_status INTEGER,
                  response_reason TEXT NOT NULL DEFAULT '',
                  response_headers_json TEXT NOT NULL DEFAULT '[]',
                  response_body_key TEXT,
                  response_body_content_type TEXT,
                  response_body_size INTEGER
                );

                CREATE INDEX IF NOT EXISTS messages_started_at_idx
                  ON messages(started_at_unix_ms DESC, id DESC);
                CREATE INDEX IF NOT EXISTS messages_remote_addr_idx ON messages(remote_addr);
                CREATE INDEX IF NOT EXISTS messages_request_body_key_idx
                  ON messages(request_body_key);
                CREATE INDEX IF NOT EXISTS messages_response_body_key_idx
                  ON messages(response_body_key);
                "#,
            )
            .context("create sqlite schema v1")?;

            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .context("set PRAGMA user_version=1")?;
            Ok(())
        }
        SCHEMA_VERSION => Ok(()),
        _ => anyhow::bail!(
            "unsupported {DATABASE_FILENAME} schema version {user_version} (expected {SCHEMA_VERSION})"
        ),
    }
}

fn persist_body(
    blobs: &dyn BlobStore,
    body: Option<CapturedBody>,
    what: &str,
) -> anyhow::Result<Option<BlobRef>> {
    body.map(|body| blobs.persist(body.spill, body.content_type))
        .transpose()
        .with_context(|| format!("persist {what} body blob"))
}

/// Removes the blob file unless some message row still references its key. Must be
/// called while holding the write transaction that removed the last reference.
fn release_blob_if_unreferenced(
    conn: &Connection,
    blobs: &dyn BlobStore,
    key: &str,
) -> anyhow::Result<bool> {
    let referenced: bool = conn
        .query_row(
            r#"
            SELECT EXISTS(
              SELECT 1 FROM messages
              WHERE request_body_key = ?1 OR response_body_key = ?1
            )
            "#,
            params![key],
            |row| row.get(0),
        )
        .with_context(|| format!("check references to blob {key}"))?;
    if referenced {
        return Ok(false);
    }

    blobs
        .delete(key)
        .with_context(|| format!("delete blob {key}"))?;
    Ok(true)
}

fn release_after_failed_write(conn: &Connection, blobs: &dyn BlobStore, blob: Option<&BlobRef>) {
    let Some(blob) = blob else { return };
    if let Err(err) = release_blob_if_unreferenced(conn, blobs, &blob.key) {
        tracing::warn!(blob = %blob.key, "release blob after failed write: {err:#}");
    }
}

fn create_message_blocking(
    path: &Path,
    blobs: &dyn BlobStore,
    new_message: NewMessage,
    body: Option<CapturedBody>,
) -> anyhow::Result<Message> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin create message transaction")?;

    let request_body = persist_body(blobs, body, "request")?;
    let insert = insert_message(&tx, &new_message, request_body.as_ref());
    let id = match insert {
        Ok(id) => id,
        Err(err) => {
            release_after_failed_write(&tx, blobs, request_body.as_ref());
            return Err(err);
        }
    };
    tx.commit().context("commit create message transaction")?;

    Ok(Message {
        id,
        started_at_unix_ms: new_message.started_at_unix_ms,
        ended_at_unix_ms: Some(new_message.ended_at_unix_ms),
        remote_addr: new_message.remote_addr,
        method: new_message.method,
        path: new_message.path,
        request_headers: new_message.request_headers,
        request_body,
        status_code: None,
        reason_phrase: String::new(),
        response_headers: HeaderList::new(),
        response_body: None,
    })
}

fn insert_message(
    conn: &Connection,
    new_message: &NewMessage,
    request_body: Option<&BlobRef>,
) -> anyhow::Result<MessageId> {
    let request_headers_json = new_message.request_headers.to_json()?;
    conn.execute(
        r#"
        INSERT INTO messages (
          started_at_unix_ms,
          ended_at_unix_ms,
          remote_addr,
          request_method,
          request_path,
          request_headers_json,
          request_body_key,
          request_body_content_type,
          request_body_size
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
        "#,
        params![
            new_message.started_at_unix_ms,
            new_message.ended_at_unix_ms,
            new_message.remote_addr,
            new_message.method,
            new_message.path,
            request_headers_json,
            request_body.map(|blob| blob.key.as_str()),
            request_body.and_then(|blob| blob.content_type.as_deref()),
            request_body.map(|blob| blob_size_i64(blob.size_bytes)),
        ],
    )
    .context("insert message")?;

    Ok(MessageId(conn.last_insert_rowid()))
}

fn finalize_message_blocking(
    path: &Path,
    blobs: &dyn BlobStore,
    id: MessageId,
    capture: ResponseCapture,
) -> Result<Message, MessageStoreError> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin finalize message transaction")?;

    let current_status: Option<Option<i64>> = tx
        .query_row(
            "SELECT response_status FROM messages WHERE id = ?1",
            params![id.0],
            |row| row.get(0),
        )
        .optional()
        .context("read message status")?;
    match current_status {
        None => return Err(MessageStoreError::NotFound(id)),
        Some(Some(_)) => return Err(MessageStoreError::AlreadyFinalized(id)),
        Some(None) => {}
    }

    let response_body = persist_body(blobs, capture.body, "response")?;
    let update = update_response(
        &tx,
        id,
        capture.status_code,
        &capture.reason_phrase,
        &capture.headers,
        response_body.as_ref(),
    )
    .and_then(|()| {
        select_message(&tx, id)?.ok_or_else(|| anyhow::anyhow!("message {id} vanished"))
    });
    let message = match update {
        Ok(message) => message,
        Err(err) => {
            release_after_failed_write(&tx, blobs, response_body.as_ref());
            return Err(err.into());
        }
    };
    tx.commit().context("commit finalize message transaction")?;

    Ok(message)
}

fn update_response(
    conn: &Connection,
    id: MessageId,
    status_code: u16,
    reason_phrase: &str,
    headers: &HeaderList,
    response_body: Option<&BlobRef>,
) -> anyhow::Result<()> {
    let response_headers_json = headers.to_json()?;
    let updated = conn
        .execute(
            r#"
            UPDATE messages SET
              response_status = ?2,
              response_reason = ?3,
              response_headers_json = ?4,
              response_body_key = ?5,
              response_body_content_type = ?6,
              response_body_size = ?7
            WHERE id = ?1 AND response_status IS NULL
            "#,
            params![
                id.0,
                i64::from(status_code),
                reason_phrase,
                response_headers_json,
                response_body.map(|blob| blob.key.as_str()),
                response_body.and_then(|blob| blob.content_type.as_deref()),
                response_body.map(|blob| blob_size_i64(blob.size_bytes)),
            ],
        )
        .context("update message response")?;
    anyhow::ensure!(updated == 1, "finalize message {id}: no pending row updated");
    Ok(())
}

fn delete_message_blocking(
    path: &Path,
    blobs: &dyn BlobStore,
    id: MessageId,
) -> anyhow::Result<bool> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin delete message transaction")?;

    let keys: Option<(Option<String>, Option<String>)> = tx
        .query_row(
            "SELECT request_body_key, response_body_key FROM messages WHERE id = ?1",
            params![id.0],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .context("read message blob keys")?;
    let Some((request_key, response_key)) = keys else {
        return Ok(false);
    };

    tx.execute("DELETE FROM messages WHERE id = ?1", params![id.0])
        .context("delete message by id")?;
    let keys: BTreeSet<String> = request_key.into_iter().chain(response_key).collect();
    for key in &keys {
        release_blob_if_unreferenced(&tx, blobs, key)?;
    }
    tx.commit().context("commit delete message transaction")?;

    Ok(true)
}

fn enforce_retention_blocking(
    path: &Path,
    blobs: &dyn BlobStore,
    keep: i64,
) -> anyhow::Result<usize> {
    let mut conn = open_connection(path)?;
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("begin retention transaction")?;

    let mut evicted_ids = Vec::new();
    let mut keys = BTreeSet::new();
    {
        let mut stmt = tx
            .prepare(
                r#"
                SELECT id, request_body_key, response_body_key
                FROM messages
                ORDER BY started_at_unix_ms DESC, id DESC
                LIMIT -1 OFFSET ?1
                "#,
            )
            .context("prepare select evicted messages")?;
        let mut rows = stmt
            .query(params![keep])
            .context("query evicted messages")?;
        while let Some(row) = rows.next().context("iterate evicted messages")? {
            evicted_ids.push(row.get::<_, i64>(0).context("deserialize evicted id")?);
            keys.extend(row.get::<_, Option<String>>(1).context("deserialize key")?);
            keys.extend(row.get::<_, Option<String>>(2).context("deserialize key")?);
        }
    }

    if evicted_ids.is_empty() {
        return Ok(0);
    }

    tx.execute(
        r#"
        DELETE FROM messages
        WHERE id IN (
          SELECT id FROM messages
          ORDER BY started_at_unix_ms DESC, id DESC
          LIMIT -1 OFFSET ?1
        )
        "#,
        params![keep],
    )
    .context("delete evicted messages")?;
    for key in &keys {
        release_blob_if_unreferenced(&tx, blobs, key)?;
    }
    tx.commit().context("commit retention transaction")?;

    tracing::debug!(
        evicted = evicted_ids.len(),
        blobs = keys.len(),
        "retention sweep evicted messages"
    );
    Ok(evicted_ids.len())
}

fn select_message(conn: &Connection, id: MessageId) -> anyhow::Result<Option<Message>> {
    let mut stmt = conn
        .prepare(&format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"))
        .context("prepare select message by id")?;
    let mut rows = stmt
        .query(params![id.0])
        .context("query message by id")?;

    let Some(row) = rows.next().context("iterate message by id")? else {
        return Ok(None);
    };
    Ok(Some(deserialize_message_at(row, 0)?))
}

const SEARCH_WHERE: &str = r#"
WHERE (?1 IS NULL OR request_method = ?1)
  AND (?2 IS NULL OR response_status = ?2)
  AND (?3 IS NULL OR remote_addr = ?3)
  AND (?4 IS NULL OR instr(request_path, ?4) > 0)
"#;

/// Normalized bind values for [`SEARCH_WHERE`].
struct SearchParams {
    method: Option<String>,
    status: Option<i64>,
    remote_addr: Option<String>,
    path_contains: Option<String>,
}

impl From<&MessageSearch> for SearchParams {
    fn from(search: &MessageSearch) -> Self {
        let non_empty = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToOwned::to_owned)
        };
        Self {
            method: non_empty(&search.method).map(|method| method.to_ascii_uppercase()),
            status: search.status.map(i64::from),
            remote_addr: non_empty(&search.remote_addr),
            path_contains: non_empty(&search.path_contains),
        }
    }
}

fn search_messages_blocking(
    path: &Path,
    search: &MessageSearch,
    offset: i64,
    limit: i64,
) -> anyhow::Result<Vec<Message>> {
    let conn = open_connection(path)?;
    let filter = SearchParams::from(search);
    let mut stmt = conn
        .prepare(&format!(
            r#"
            SELECT {MESSAGE_COLUMNS}
            FROM messages
            {SEARCH_WHERE}
            ORDER BY started_at_unix_ms DESC, id DESC
            LIMIT ?5 OFFSET ?6
            "#
        ))
        .context("prepare search messages")?;

    let mut rows = stmt
        .query(params![
            filter.method,
            filter.status,
            filter.remote_addr,
            filter.path_contains,
            limit,
            offset
        ])
        .context("query search messages")?;

    let mut messages = Vec::new();
    while let Some(row) = rows.next().context("iterate search messages")? {
        messages.push(deserialize_message_at(row, 0)?);
    }
    Ok(messages)
}

fn validate_pagination(offset: usize, limit: usize) -> anyhow::Result<(i64, i64)> {
    let offset = i64::try_from(offset).context("pagination offset exceeds sqlite range")?;
    let limit = i64::try_from(limit).context("pagination limit exceeds sqlite range")?;
    Ok((offset, limit))
}

fn blob_size_i64(size_bytes: u64) -> i64 {
    i64::try_from(size_bytes).unwrap_or(i64::MAX)
}

fn blob_ref_at(
    row: &rusqlite::Row<'_>,
    offset: usize,
    field_name: &str,
) -> anyhow::Result<Option<BlobRef>> {
    let key = row
        .get::<_, Option<String>>(offset)
        .with_context(|| format!("deserialize {field_name}_body_key"))?;
    let content_type = row
        .get::<_, Option<String>>(offset + 1)
        .with_context(|| format!("deserialize {field_name}_body_content_type"))?;
    let size_bytes = row
        .get::<_, Option<i64>>(offset + 2)
        .with_context(|| format!("deserialize {field_name}_body_size"))?;

    Ok(key.map(|key| BlobRef {
        key,
        content_type,
        size_bytes: size_bytes.and_then(|size| u64::try_from(size).ok()).unwrap_or(0),
    }))
}

fn deserialize_message_at(row: &rusqlite::Row<'_>, offset: usize) -> anyhow::Result<Message> {
    let id = row.get::<_, i64>(offset).context("deserialize message id")?;
    let started_at_unix_ms = row
        .get::<_, i64>(offset + 1)
        .context("deserialize started_at_unix_ms")?;
    let ended_at_unix_ms = row
        .get::<_, Option<i64>>(offset + 2)
        .context("deserialize ended_at_unix_ms")?;
    let remote_addr = row
        .get::<_, String>(offset + 3)
        .context("deserialize remote_addr")?;
    let method = row
        .get::<_, String>(offset + 4)
        .context("deserialize request_method")?;
    let path = row
        .get::<_, String>(offset + 5)
        .context("deserialize request_path")?;
    let request_headers_json = row
        .get::<_, String>(offset + 6)
        .context("deserialize request_headers_json")?;
    let request_body = blob_ref_at(row, offset + 7, "request")?;
    let status_code = row
        .get::<_, Option<i64>>(offset + 10)
        .context("deserialize response_status")?;
    let reason_phrase = row
        .get::<_, String>(offset + 11)
        .context("deserialize response_reason")?;
    let response_headers_json = row
        .get::<_, String>(offset + 12)
        .context("deserialize response_headers_json")?;
    let response_body = blob_ref_at(row, offset + 13, "response")?;

    let status_code = status_code
        .map(u16::try_from)
        .transpose()
        .context("deserialize response_status")?;

    Ok(Message {
        id: MessageId(id),
        started_at_unix_ms,
        ended_at_unix_ms,
        remote_addr,
        method,
        path,
        request_headers: HeaderList::from_json(&request_headers_json, "request")?,
        request_body,
        status_code,
        reason_phrase,
        response_headers: HeaderList::from_json(&response_headers_json, "response")?,
        response_body,
    })
}
