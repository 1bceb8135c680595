use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{
        SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
        SqliteSynchronous,
    },
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use shared::{
    domain::{
        ConversationId, CorrelationKey, DeliveryStatus, MessageId, PendingWriteId, UserId,
        WriteKind,
    },
    protocol::{MessageCursor, RemoteMessage, WritePayload},
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable on-device cache.
///
/// The pool holds a single connection, so every statement is serialized. The
/// database runs in WAL mode with `synchronous=FULL`: a committed write
/// survives process death whether or not a checkpoint has run. Automatic
/// checkpointing is disabled; checkpoints are scheduled by the caller through
/// [`Storage::checkpoint`].
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
    db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub local_id: i64,
    pub server_id: Option<MessageId>,
    pub correlation_key: Option<CorrelationKey>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub delivery_status: DeliveryStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// A new row was created.
    Inserted,
    /// A locally sent row was matched by correlation key and received its server id.
    Reconciled,
    /// The server id was already present.
    Ignored,
}

#[derive(Debug, Clone, Default)]
pub struct BatchMerge {
    pub inserted: Vec<RemoteMessage>,
    pub reconciled: usize,
    pub ignored: usize,
    pub cursor: Option<MessageCursor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadState {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub last_read_at: DateTime<Utc>,
    pub last_read_message_id: MessageId,
    pub synced: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingWriteState {
    Pending,
    Failed,
}

impl PendingWriteState {
    fn as_str(self) -> &'static str {
        match self {
            PendingWriteState::Pending => "pending",
            PendingWriteState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingWrite {
    pub id: PendingWriteId,
    pub kind: WriteKind,
    pub correlation_key: CorrelationKey,
    pub payload: WritePayload,
    pub retry_count: u32,
    pub next_eligible_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub state: PendingWriteState,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Succeeded,
    RetryAt {
        retry_count: u32,
        next_eligible_at: DateTime<Utc>,
        error: String,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingWriteCounts {
    pub pending: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    Passive,
    Truncate,
}

impl CheckpointMode {
    fn pragma(self) -> &'static str {
        match self {
            CheckpointMode::Passive => "PRAGMA wal_checkpoint(PASSIVE)",
            CheckpointMode::Truncate => "PRAGMA wal_checkpoint(TRUNCATE)",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointResult {
    /// SQLite could not obtain the locks it needed.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMode {
    pub journal_mode: String,
    pub synchronous: i64,
    pub wal_autocheckpoint: i64,
}

impl CommitMode {
    /// WAL + `synchronous=FULL` with SQLite's own checkpointing turned off.
    pub fn is_crash_safe(&self) -> bool {
        self.journal_mode.eq_ignore_ascii_case("wal") && self.synchronous >= 2
    }
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .busy_timeout(BUSY_TIMEOUT)
            .foreign_keys(true)
            .pragma("wal_autocheckpoint", "0");
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .with_context(|| format!("failed to open local store at {database_url}"))?;
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self {
            pool,
            db_path: sqlite_path(database_url),
        })
    }

    // ---- conversations ------------------------------------------------------

    /// Registers a conversation id; returns whether it was new.
    pub async fn ensure_conversation(&self, conversation_id: ConversationId) -> Result<bool> {
        let result = sqlx::query("INSERT OR IGNORE INTO conversations (id) VALUES (?)")
            .bind(conversation_id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_conversation_ids(&self) -> Result<Vec<ConversationId>> {
        let rows = sqlx::query("SELECT id FROM conversations ORDER BY id ASC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| ConversationId(r.get::<i64, _>(0)))
            .collect())
    }

    /// Users seen sending in the conversation, the local user included.
    pub async fn list_members(&self, conversation_id: ConversationId) -> Result<Vec<UserId>> {
        let rows = sqlx::query(
            "SELECT user_id FROM conversation_members WHERE conversation_id = ? ORDER BY user_id",
        )
        .bind(conversation_id.0)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| UserId(r.get::<i64, _>(0))).collect())
    }

    // ---- messages -----------------------------------------------------------

    /// Creates the optimistic row for a message the user just sent.
    pub async fn insert_local_message(
        &self,
        conversation_id: ConversationId,
        sender_id: UserId,
        content: &str,
        correlation_key: CorrelationKey,
        created_at: DateTime<Utc>,
    ) -> Result<StoredMessage> {
        let mut tx = self.pool.begin().await?;
        insert_conversation_if_missing(&mut tx, conversation_id).await?;
        insert_member_if_missing(&mut tx, conversation_id, sender_id).await?;
        sqlx::query(
            "INSERT OR IGNORE INTO messages
                (server_id, correlation_key, conversation_id, sender_id, content, created_at_ms, delivery_status)
             VALUES (NULL, ?, ?, ?, ?, ?, ?)",
        )
        .bind(correlation_key.to_string())
        .bind(conversation_id.0)
        .bind(sender_id.0)
        .bind(content)
        .bind(created_at.timestamp_millis())
        .bind(DeliveryStatus::Pending.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.get_message_by_correlation_key(correlation_key)
            .await?
            .ok_or_else(|| anyhow!("local message {correlation_key} vanished after insert"))
    }

    /// Merges a remote record by server id. A row already carrying the same
    /// correlation key without a server id is completed instead of duplicated.
    pub async fn insert_or_ignore_message(&self, message: &RemoteMessage) -> Result<MergeOutcome> {
        let mut tx = self.pool.begin().await?;
        let outcome = merge_remote_message(&mut tx, message).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Merges a catch-up batch in increasing timestamp order and advances the
    /// conversation's cursor in the same transaction.
    pub async fn merge_batch(
        &self,
        conversation_id: ConversationId,
        messages: &[RemoteMessage],
    ) -> Result<BatchMerge> {
        let mut ordered: Vec<&RemoteMessage> = messages.iter().collect();
        ordered.sort_by_key(|m| (m.created_at, m.id));

        let mut tx = self.pool.begin().await?;
        insert_conversation_if_missing(&mut tx, conversation_id).await?;
        let mut merge = BatchMerge::default();
        for message in ordered {
            if message.conversation_id != conversation_id {
                return Err(anyhow!(
                    "message {} belongs to conversation {}, not {}",
                    message.id,
                    message.conversation_id,
                    conversation_id
                ));
            }
            match merge_remote_message(&mut tx, message).await? {
                MergeOutcome::Inserted => merge.inserted.push(message.clone()),
                MergeOutcome::Reconciled => merge.reconciled += 1,
                MergeOutcome::Ignored => merge.ignored += 1,
            }
            merge.cursor = Some(MessageCursor::of(message));
        }
        if let Some(cursor) = merge.cursor {
            advance_cursor(&mut tx, conversation_id, cursor).await?;
        }
        tx.commit().await?;
        Ok(merge)
    }

    /// Attaches the server id and authoritative timestamp to a locally sent
    /// message and marks it delivered.
    pub async fn acknowledge_message(
        &self,
        correlation_key: CorrelationKey,
        server_id: MessageId,
        created_at: Option<DateTime<Utc>>,
    ) -> Result<Option<StoredMessage>> {
        let key = correlation_key.to_string();
        let mut tx = self.pool.begin().await?;
        // A live echo that arrived without its correlation key may already hold the server id.
        sqlx::query(
            "DELETE FROM messages
             WHERE server_id = ? AND (correlation_key IS NULL OR correlation_key != ?)",
        )
        .bind(server_id.0)
        .bind(&key)
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "UPDATE messages
             SET server_id = ?, created_at_ms = COALESCE(?, created_at_ms), delivery_status = ?
             WHERE correlation_key = ?",
        )
        .bind(server_id.0)
        .bind(created_at.map(|at| at.timestamp_millis()))
        .bind(DeliveryStatus::Delivered.as_str())
        .bind(&key)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        self.get_message_by_correlation_key(correlation_key).await
    }

    /// Moves a local message's status. `delivered` is terminal.
    pub async fn set_delivery_status(
        &self,
        correlation_key: CorrelationKey,
        status: DeliveryStatus,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE messages SET delivery_status = ?
             WHERE correlation_key = ? AND delivery_status != ?",
        )
        .bind(status.as_str())
        .bind(correlation_key.to_string())
        .bind(DeliveryStatus::Delivered.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_message(&self, server_id: MessageId) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE server_id = ?"))
            .bind(server_id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    pub async fn get_message_by_correlation_key(
        &self,
        correlation_key: CorrelationKey,
    ) -> Result<Option<StoredMessage>> {
        let row = sqlx::query(&format!("{MESSAGE_COLUMNS} WHERE correlation_key = ?"))
            .bind(correlation_key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(message_from_row).transpose()
    }

    /// Messages newer than `cursor`, oldest first.
    pub async fn get_messages_after(
        &self,
        conversation_id: ConversationId,
        cursor: Option<MessageCursor>,
        limit: u32,
    ) -> Result<Vec<StoredMessage>> {
        let (after_ms, after_id) = cursor
            .map(|c| (c.created_at.timestamp_millis(), c.message_id.0))
            .unwrap_or((i64::MIN, i64::MIN));
        let rows = sqlx::query(&format!(
            "{MESSAGE_COLUMNS}
             WHERE conversation_id = ?
               AND (created_at_ms > ? OR (created_at_ms = ? AND COALESCE(server_id, ?) > ?))
             ORDER BY created_at_ms ASC, local_id ASC
             LIMIT ?"
        ))
        .bind(conversation_id.0)
        .bind(after_ms)
        .bind(after_ms)
        .bind(i64::MAX)
        .bind(after_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(message_from_row).collect()
    }

    pub async fn count_messages(&self, conversation_id: ConversationId) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.0)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ---- read state ---------------------------------------------------------

    /// Writes the read marker unless it would move `last_read_at` backward.
    /// Returns whether the stored state changed.
    pub async fn upsert_read_state(&self, state: &ReadState) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        insert_conversation_if_missing(&mut tx, state.conversation_id).await?;
        let result = sqlx::query(
            "INSERT INTO read_states
                (conversation_id, user_id, last_read_at_ms, last_read_message_id, synced)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(conversation_id, user_id) DO UPDATE SET
                last_read_at_ms = excluded.last_read_at_ms,
                last_read_message_id = excluded.last_read_message_id,
                synced = excluded.synced
             WHERE excluded.last_read_at_ms > read_states.last_read_at_ms",
        )
        .bind(state.conversation_id.0)
        .bind(state.user_id.0)
        .bind(state.last_read_at.timestamp_millis())
        .bind(state.last_read_message_id.0)
        .bind(state.synced)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn get_read_state(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
    ) -> Result<Option<ReadState>> {
        let row = sqlx::query(
            "SELECT conversation_id, user_id, last_read_at_ms, last_read_message_id, synced
             FROM read_states WHERE conversation_id = ? AND user_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(read_state_from_row).transpose()
    }

    /// Flags the read marker as confirmed remotely, if it has not moved since.
    pub async fn mark_read_state_synced(
        &self,
        conversation_id: ConversationId,
        user_id: UserId,
        last_read_message_id: MessageId,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE read_states SET synced = 1
             WHERE conversation_id = ? AND user_id = ? AND last_read_message_id = ?",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(last_read_message_id.0)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Messages newer than the user's read marker, excluding the user's own.
    pub async fn count_unread(&self, conversation_id: ConversationId, user_id: UserId) -> Result<u32> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM messages
             WHERE conversation_id = ?
               AND sender_id != ?
               AND created_at_ms > COALESCE(
                    (SELECT last_read_at_ms FROM read_states
                     WHERE conversation_id = ? AND user_id = ?),
                    ?)",
        )
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(conversation_id.0)
        .bind(user_id.0)
        .bind(i64::MIN)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn latest_message_at(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<DateTime<Utc>>> {
        let newest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(created_at_ms) FROM messages WHERE conversation_id = ?")
                .bind(conversation_id.0)
                .fetch_one(&self.pool)
                .await?;
        newest.map(from_millis).transpose()
    }

    // ---- sync cursors -------------------------------------------------------

    pub async fn get_sync_cursor(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Option<MessageCursor>> {
        let row = sqlx::query(
            "SELECT last_message_id, last_created_at_ms FROM sync_cursors WHERE conversation_id = ?",
        )
        .bind(conversation_id.0)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(MessageCursor {
                message_id: MessageId(r.get::<i64, _>(0)),
                created_at: from_millis(r.get::<i64, _>(1))?,
            })
        })
        .transpose()
    }

    // ---- pending writes -----------------------------------------------------

    /// Queues a write. A second enqueue with the same correlation key returns
    /// the existing row.
    pub async fn enqueue_pending_write(
        &self,
        payload: &WritePayload,
        now: DateTime<Utc>,
    ) -> Result<PendingWriteId> {
        let key = payload.correlation_key().to_string();
        let body = serde_json::to_string(payload).context("failed to encode pending write")?;
        sqlx::query(
            "INSERT INTO pending_writes
                (kind, correlation_key, payload, retry_count, next_eligible_at_ms, created_at_ms, state)
             VALUES (?, ?, ?, 0, ?, ?, ?)
             ON CONFLICT(correlation_key) DO NOTHING",
        )
        .bind(payload.kind().as_str())
        .bind(&key)
        .bind(body)
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .bind(PendingWriteState::Pending.as_str())
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM pending_writes WHERE correlation_key = ?")
            .bind(&key)
            .fetch_one(&self.pool)
            .await?;
        Ok(PendingWriteId(id))
    }

    /// Pending writes whose next-eligible time has passed, in creation order.
    pub async fn dequeue_due(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(&format!(
            "{PENDING_WRITE_COLUMNS}
             WHERE state = ? AND next_eligible_at_ms <= ?
             ORDER BY created_at_ms ASC, id ASC
             LIMIT ?"
        ))
        .bind(PendingWriteState::Pending.as_str())
        .bind(now.timestamp_millis())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pending_write_from_row).collect()
    }

    pub async fn get_pending_write(&self, id: PendingWriteId) -> Result<Option<PendingWrite>> {
        let row = sqlx::query(&format!("{PENDING_WRITE_COLUMNS} WHERE id = ?"))
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(pending_write_from_row).transpose()
    }

    pub async fn mark_write_result(&self, id: PendingWriteId, outcome: &WriteOutcome) -> Result<()> {
        match outcome {
            WriteOutcome::Succeeded => {
                sqlx::query("DELETE FROM pending_writes WHERE id = ?")
                    .bind(id.0)
                    .execute(&self.pool)
                    .await?;
            }
            WriteOutcome::RetryAt {
                retry_count,
                next_eligible_at,
                error,
            } => {
                sqlx::query(
                    "UPDATE pending_writes
                     SET retry_count = ?,
                         next_eligible_at_ms = MAX(next_eligible_at_ms, ?),
                         last_error = ?
                     WHERE id = ?",
                )
                .bind(i64::from(*retry_count))
                .bind(next_eligible_at.timestamp_millis())
                .bind(error)
                .bind(id.0)
                .execute(&self.pool)
                .await?;
            }
            WriteOutcome::Failed { error } => {
                sqlx::query("UPDATE pending_writes SET state = ?, last_error = ? WHERE id = ?")
                    .bind(PendingWriteState::Failed.as_str())
                    .bind(error)
                    .bind(id.0)
                    .execute(&self.pool)
                    .await?;
            }
        }
        Ok(())
    }

    /// Explicit retrigger of a permanently failed write with a fresh retry budget.
    pub async fn retry_failed_write(
        &self,
        id: PendingWriteId,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingWrite>> {
        let result = sqlx::query(
            "UPDATE pending_writes
             SET state = ?, retry_count = 0,
                 next_eligible_at_ms = MAX(next_eligible_at_ms, ?),
                 last_error = NULL
             WHERE id = ? AND state = ?",
        )
        .bind(PendingWriteState::Pending.as_str())
        .bind(now.timestamp_millis())
        .bind(id.0)
        .bind(PendingWriteState::Failed.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        self.get_pending_write(id).await
    }

    pub async fn list_failed_writes(&self) -> Result<Vec<PendingWrite>> {
        let rows = sqlx::query(&format!(
            "{PENDING_WRITE_COLUMNS} WHERE state = ? ORDER BY created_at_ms ASC, id ASC"
        ))
        .bind(PendingWriteState::Failed.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(pending_write_from_row).collect()
    }

    pub async fn pending_write_counts(&self) -> Result<PendingWriteCounts> {
        let row = sqlx::query(
            "SELECT
                COALESCE(SUM(CASE WHEN state = 'pending' THEN 1 ELSE 0 END), 0),
                COALESCE(SUM(CASE WHEN state = 'failed' THEN 1 ELSE 0 END), 0)
             FROM pending_writes",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(PendingWriteCounts {
            pending: u32::try_from(row.get::<i64, _>(0)).unwrap_or(u32::MAX),
            failed: u32::try_from(row.get::<i64, _>(1)).unwrap_or(u32::MAX),
        })
    }

    /// Earliest next-eligible time among pending writes.
    pub async fn next_due_at(&self) -> Result<Option<DateTime<Utc>>> {
        let next: Option<i64> = sqlx::query_scalar(
            "SELECT MIN(next_eligible_at_ms) FROM pending_writes WHERE state = ?",
        )
        .bind(PendingWriteState::Pending.as_str())
        .fetch_one(&self.pool)
        .await?;
        next.map(from_millis).transpose()
    }

    // ---- durability ---------------------------------------------------------

    pub async fn checkpoint(&self, mode: CheckpointMode) -> Result<CheckpointResult> {
        let row = sqlx::query(mode.pragma())
            .fetch_one(&self.pool)
            .await
            .context("wal checkpoint failed")?;
        Ok(CheckpointResult {
            busy: row.get::<i64, _>(0) != 0,
            log_frames: row.get::<i64, _>(1),
            checkpointed_frames: row.get::<i64, _>(2),
        })
    }

    /// Size of the write-ahead log file, zero for in-memory stores.
    pub fn wal_size_bytes(&self) -> Result<u64> {
        let Some(path) = &self.db_path else {
            return Ok(0);
        };
        let mut wal = path.clone().into_os_string();
        wal.push("-wal");
        match fs::metadata(PathBuf::from(wal)) {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(err) => Err(err).context("failed to stat wal file"),
        }
    }

    pub async fn commit_mode(&self) -> Result<CommitMode> {
        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(&self.pool)
            .await?;
        let synchronous: i64 = sqlx::query_scalar("PRAGMA synchronous")
            .fetch_one(&self.pool)
            .await?;
        let wal_autocheckpoint: i64 = sqlx::query_scalar("PRAGMA wal_autocheckpoint")
            .fetch_one(&self.pool)
            .await?;
        Ok(CommitMode {
            journal_mode,
            synchronous,
            wal_autocheckpoint,
        })
    }
}

const MESSAGE_COLUMNS: &str = "SELECT local_id, server_id, correlation_key, conversation_id, sender_id, content, created_at_ms, delivery_status FROM messages";

const PENDING_WRITE_COLUMNS: &str = "SELECT id, kind, correlation_key, payload, retry_count, next_eligible_at_ms, created_at_ms, state, last_error FROM pending_writes";

async fn insert_conversation_if_missing(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
) -> Result<()> {
    sqlx::query("INSERT OR IGNORE INTO conversations (id) VALUES (?)")
        .bind(conversation_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn insert_member_if_missing(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    user_id: UserId,
) -> Result<()> {
    sqlx::query(
        "INSERT OR IGNORE INTO conversation_members (conversation_id, user_id) VALUES (?, ?)",
    )
    .bind(conversation_id.0)
    .bind(user_id.0)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn merge_remote_message(
    conn: &mut SqliteConnection,
    message: &RemoteMessage,
) -> Result<MergeOutcome> {
    insert_conversation_if_missing(conn, message.conversation_id).await?;
    insert_member_if_missing(conn, message.conversation_id, message.sender_id).await?;

    if let Some(key) = message.correlation_key {
        let key = key.to_string();
        let existing = sqlx::query("SELECT local_id, server_id FROM messages WHERE correlation_key = ?")
            .bind(&key)
            .fetch_optional(&mut *conn)
            .await?;
        if let Some(row) = existing {
            if row.get::<Option<i64>, _>(1).is_some() {
                return Ok(MergeOutcome::Ignored);
            }
            sqlx::query("DELETE FROM messages WHERE server_id = ?")
                .bind(message.id.0)
                .execute(&mut *conn)
                .await?;
            sqlx::query(
                "UPDATE messages SET server_id = ?, created_at_ms = ?, delivery_status = ?
                 WHERE local_id = ?",
            )
            .bind(message.id.0)
            .bind(message.created_at.timestamp_millis())
            .bind(DeliveryStatus::Delivered.as_str())
            .bind(row.get::<i64, _>(0))
            .execute(&mut *conn)
            .await?;
            return Ok(MergeOutcome::Reconciled);
        }
    }

    let result = sqlx::query(
        "INSERT OR IGNORE INTO messages
            (server_id, correlation_key, conversation_id, sender_id, content, created_at_ms, delivery_status)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(message.id.0)
    .bind(message.correlation_key.map(|k| k.to_string()))
    .bind(message.conversation_id.0)
    .bind(message.sender_id.0)
    .bind(&message.content)
    .bind(message.created_at.timestamp_millis())
    .bind(DeliveryStatus::Delivered.as_str())
    .execute(&mut *conn)
    .await?;

    Ok(if result.rows_affected() > 0 {
        MergeOutcome::Inserted
    } else {
        MergeOutcome::Ignored
    })
}

async fn advance_cursor(
    conn: &mut SqliteConnection,
    conversation_id: ConversationId,
    cursor: MessageCursor,
) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO sync_cursors (conversation_id, last_message_id, last_created_at_ms)
         VALUES (?, ?, ?)
         ON CONFLICT(conversation_id) DO UPDATE SET
            last_message_id = excluded.last_message_id,
            last_created_at_ms = excluded.last_created_at_ms
         WHERE excluded.last_created_at_ms > sync_cursors.last_created_at_ms
            OR (excluded.last_created_at_ms = sync_cursors.last_created_at_ms
                AND excluded.last_message_id > sync_cursors.last_message_id)",
    )
    .bind(conversation_id.0)
    .bind(cursor.message_id.0)
    .bind(cursor.created_at.timestamp_millis())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

fn message_from_row(r: &SqliteRow) -> Result<StoredMessage> {
    let status = r.get::<String, _>(7);
    Ok(StoredMessage {
        local_id: r.get::<i64, _>(0),
        server_id: r.get::<Option<i64>, _>(1).map(MessageId),
        correlation_key: r
            .get::<Option<String>, _>(2)
            .map(|raw| CorrelationKey::from_str(&raw))
            .transpose()
            .context("corrupt correlation key")?,
        conversation_id: ConversationId(r.get::<i64, _>(3)),
        sender_id: UserId(r.get::<i64, _>(4)),
        content: r.get::<String, _>(5),
        created_at: from_millis(r.get::<i64, _>(6))?,
        delivery_status: DeliveryStatus::parse(&status)
            .ok_or_else(|| anyhow!("unknown delivery status '{status}'"))?,
    })
}

fn read_state_from_row(r: &SqliteRow) -> Result<ReadState> {
    Ok(ReadState {
        conversation_id: ConversationId(r.get::<i64, _>(0)),
        user_id: UserId(r.get::<i64, _>(1)),
        last_read_at: from_millis(r.get::<i64, _>(2))?,
        last_read_message_id: MessageId(r.get::<i64, _>(3)),
        synced: r.get::<bool, _>(4),
    })
}

fn pending_write_from_row(r: &SqliteRow) -> Result<PendingWrite> {
    let kind = r.get::<String, _>(1);
    let state = r.get::<String, _>(7);
    let payload: WritePayload = serde_json::from_str(&r.get::<String, _>(3))
        .context("corrupt pending write payload")?;
    Ok(PendingWrite {
        id: PendingWriteId(r.get::<i64, _>(0)),
        kind: WriteKind::parse(&kind).ok_or_else(|| anyhow!("unknown write kind '{kind}'"))?,
        correlation_key: CorrelationKey::from_str(&r.get::<String, _>(2))
            .context("corrupt correlation key")?,
        payload,
        retry_count: u32::try_from(r.get::<i64, _>(4)).unwrap_or(u32::MAX),
        next_eligible_at: from_millis(r.get::<i64, _>(5))?,
        created_at: from_millis(r.get::<i64, _>(6))?,
        state: match state.as_str() {
            "failed" => PendingWriteState::Failed,
            _ => PendingWriteState::Pending,
        },
        last_error: r.get::<Option<String>, _>(8),
    })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("timestamp {ms} out of range"))
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url.starts_with("sqlite::memory:") || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
