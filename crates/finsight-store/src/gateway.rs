use std::sync::Mutex;

use rusqlite::Connection;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use finsight_core::types::{
    now_rfc3339, Analysis, AnalysisStatus, CacheEntry, ChatMessage, ChatSession, Job, JobStatus,
    MessageStatus, ProgressEvent, ProgressEventType, ProgressLevel, QueryType, QueueName, Role,
};

use crate::db::init_db;
use crate::error::{Result, StoreError};

/// The only component that touches durable storage.
///
/// Wraps a single SQLite connection in a `Mutex`; every operation is a pure
/// read or a single atomic write (one statement or one transaction). The
/// mutex serializes writers inside the process, and SQLite's write lock
/// covers multi-process deployments.
pub struct StoreGateway {
    db: Mutex<Connection>,
}

/// Optional fields written alongside a message status transition.
#[derive(Debug, Default)]
pub struct MessageUpdate {
    pub analysis_id: Option<String>,
    pub analysis_snapshot: Option<Value>,
    pub generated_script: Option<String>,
    pub tool_calls: Option<Vec<String>>,
    pub query_type: Option<QueryType>,
    pub expanded_question: Option<String>,
    /// Merged over the stored metadata map, key by key.
    pub metadata: Option<Map<String, Value>>,
}

/// Fields the execution worker writes back onto an analysis.
#[derive(Debug, Default)]
pub struct AnalysisUpdate {
    pub status: Option<AnalysisStatus>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub execution_time_ms: Option<u64>,
    pub executed_at: Option<String>,
    pub generated_script: Option<String>,
    pub parameters: Option<Map<String, Value>>,
}

impl StoreGateway {
    /// Wrap an open connection, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
        })
    }

    pub fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        Self::new(Connection::open(path)?)
    }

    /// In-memory store for tests.
    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    // --- sessions ----------------------------------------------------------

    pub fn create_session(&self, user_id: &str, title: Option<&str>) -> Result<ChatSession> {
        let now = now_rfc3339();
        let id = Uuid::now_v7().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO sessions (id, user_id, title, analysis_ids, created_at, updated_at)
             VALUES (?1, ?2, ?3, '[]', ?4, ?4)",
            rusqlite::params![id, user_id, title, now],
        )?;
        debug!(session_id = %id, user_id, "session created");
        Ok(ChatSession {
            id,
            user_id: user_id.to_string(),
            title: title.map(String::from),
            analysis_ids: Vec::new(),
            created_at: now.clone(),
            updated_at: now,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Option<ChatSession>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, user_id, title, analysis_ids, created_at, updated_at
             FROM sessions WHERE id = ?1",
            rusqlite::params![id],
            row_to_session,
        ) {
            Ok(s) => Ok(Some(s)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Record an analysis id on its owning session's list.
    pub fn append_session_analysis(&self, session_id: &str, analysis_id: &str) -> Result<()> {
        let now = now_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let raw: String = tx
            .query_row(
                "SELECT analysis_ids FROM sessions WHERE id = ?1",
                rusqlite::params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::SessionNotFound {
                    id: session_id.to_string(),
                },
                e => StoreError::Database(e),
            })?;
        let mut ids: Vec<String> = serde_json::from_str(&raw)?;
        if !ids.iter().any(|i| i == analysis_id) {
            ids.push(analysis_id.to_string());
        }
        tx.execute(
            "UPDATE sessions SET analysis_ids = ?1, updated_at = ?2 WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&ids)?, now, session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- messages ----------------------------------------------------------

    /// Insert a message and bump the owning session's `updated_at`.
    pub fn create_message(&self, msg: &ChatMessage) -> Result<()> {
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO messages
             (id, session_id, role, content, analysis_id, analysis_snapshot,
              generated_script, tool_calls, status, query_type, original_question,
              expanded_question, metadata, created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                msg.id,
                msg.session_id,
                msg.role.to_string(),
                msg.content,
                msg.analysis_id,
                msg.analysis_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                msg.generated_script,
                serde_json::to_string(&msg.tool_calls)?,
                msg.status.to_string(),
                msg.query_type.map(|q| q.to_string()),
                msg.original_question,
                msg.expanded_question,
                serde_json::to_string(&msg.metadata)?,
                msg.created_at,
                msg.updated_at,
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?1 WHERE id = ?2",
            rusqlite::params![msg.updated_at, msg.session_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_message(&self, id: &str) -> Result<Option<ChatMessage>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {MESSAGE_COLS} FROM messages WHERE id = ?1"),
            rusqlite::params![id],
            row_to_message,
        ) {
            Ok(m) => Ok(Some(m)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Status transition plus any extra fields. The write is unguarded —
    /// ordering of transitions is the caller's responsibility.
    pub fn update_message_status(
        &self,
        id: &str,
        status: MessageStatus,
        extra: MessageUpdate,
    ) -> Result<()> {
        let now = now_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        // Metadata merges over the stored map rather than replacing it.
        let metadata = match extra.metadata {
            Some(incoming) => {
                let raw: String = tx
                    .query_row(
                        "SELECT metadata FROM messages WHERE id = ?1",
                        rusqlite::params![id],
                        |row| row.get(0),
                    )
                    .map_err(|e| match e {
                        rusqlite::Error::QueryReturnedNoRows => StoreError::MessageNotFound {
                            id: id.to_string(),
                        },
                        e => StoreError::Database(e),
                    })?;
                let mut merged: Map<String, Value> = serde_json::from_str(&raw)?;
                merged.extend(incoming);
                Some(serde_json::to_string(&merged)?)
            }
            None => None,
        };

        let n = tx.execute(
            "UPDATE messages SET
                status            = ?1,
                analysis_id       = COALESCE(?2, analysis_id),
                analysis_snapshot = COALESCE(?3, analysis_snapshot),
                generated_script  = COALESCE(?4, generated_script),
                tool_calls        = COALESCE(?5, tool_calls),
                query_type        = COALESCE(?6, query_type),
                expanded_question = COALESCE(?7, expanded_question),
                metadata          = COALESCE(?8, metadata),
                updated_at        = ?9
             WHERE id = ?10",
            rusqlite::params![
                status.to_string(),
                extra.analysis_id,
                extra
                    .analysis_snapshot
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                extra.generated_script,
                extra
                    .tool_calls
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                extra.query_type.map(|q| q.to_string()),
                extra.expanded_question,
                metadata,
                now,
                id,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::MessageNotFound { id: id.to_string() });
        }
        tx.commit()?;
        Ok(())
    }

    /// The most recent `limit` messages of a session, in insertion order.
    pub fn list_session_messages(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {MESSAGE_COLS} FROM messages
             WHERE session_id = ?1
             ORDER BY created_at DESC, rowid DESC
             LIMIT ?2"
        ))?;
        let mut messages: Vec<ChatMessage> = stmt
            .query_map(rusqlite::params![session_id, limit as i64], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        messages.reverse();
        Ok(messages)
    }

    // --- analyses ----------------------------------------------------------

    pub fn create_analysis(&self, a: &Analysis) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO analyses
             (id, user_id, title, description, category, parameters, script_name,
              generated_script, mcp_calls, data_sources, result, status, error,
              execution_time_ms, executed_at, is_template, similar_queries, reuse_count,
              created_at, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20)",
            rusqlite::params![
                a.id,
                a.user_id,
                a.title,
                a.description,
                a.category,
                serde_json::to_string(&a.parameters)?,
                a.script_name,
                a.generated_script,
                serde_json::to_string(&a.mcp_calls)?,
                serde_json::to_string(&a.data_sources)?,
                a.result.as_ref().map(serde_json::to_string).transpose()?,
                a.status.to_string(),
                a.error,
                a.execution_time_ms.map(|v| v as i64),
                a.executed_at,
                a.is_template as i64,
                serde_json::to_string(&a.similar_queries)?,
                a.reuse_count as i64,
                a.created_at,
                a.updated_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_analysis(&self, id: &str) -> Result<Option<Analysis>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {ANALYSIS_COLS} FROM analyses WHERE id = ?1"),
            rusqlite::params![id],
            row_to_analysis,
        ) {
            Ok(a) => Ok(Some(a)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Write results, status and timings onto an analysis.
    pub fn update_analysis(&self, id: &str, fields: AnalysisUpdate) -> Result<()> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE analyses SET
                status            = COALESCE(?1, status),
                result            = COALESCE(?2, result),
                error             = COALESCE(?3, error),
                execution_time_ms = COALESCE(?4, execution_time_ms),
                executed_at       = COALESCE(?5, executed_at),
                generated_script  = COALESCE(?6, generated_script),
                parameters        = COALESCE(?7, parameters),
                updated_at        = ?8
             WHERE id = ?9",
            rusqlite::params![
                fields.status.map(|s| s.to_string()),
                fields.result.as_ref().map(serde_json::to_string).transpose()?,
                fields.error,
                fields.execution_time_ms.map(|v| v as i64),
                fields.executed_at,
                fields.generated_script,
                fields
                    .parameters
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                now,
                id,
            ],
        )?;
        if n == 0 {
            return Err(StoreError::AnalysisNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Bump the reuse counter and remember the query that matched.
    pub fn record_reuse(&self, id: &str, query: &str) -> Result<()> {
        let now = now_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let raw: String = tx
            .query_row(
                "SELECT similar_queries FROM analyses WHERE id = ?1",
                rusqlite::params![id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::AnalysisNotFound {
                    id: id.to_string(),
                },
                e => StoreError::Database(e),
            })?;
        let mut queries: Vec<String> = serde_json::from_str(&raw)?;
        if !queries.iter().any(|q| q == query) {
            queries.push(query.to_string());
        }
        tx.execute(
            "UPDATE analyses SET reuse_count = reuse_count + 1,
                                 similar_queries = ?1, updated_at = ?2
             WHERE id = ?3",
            rusqlite::params![serde_json::to_string(&queries)?, now, id],
        )?;
        tx.commit()?;
        Ok(())
    }

    // --- queue jobs --------------------------------------------------------

    pub fn enqueue_job(
        &self,
        queue: QueueName,
        payload: Value,
        priority: u8,
        max_attempts: u32,
    ) -> Result<Job> {
        let now = now_rfc3339();
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO jobs
             (id, queue, payload, status, priority, attempts, max_attempts,
              visible_after, claimed_by, last_error, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'queued', ?4, 0, ?5, ?6, NULL, NULL, ?6, ?6)",
            rusqlite::params![
                id,
                queue.as_str(),
                serde_json::to_string(&payload)?,
                priority as i64,
                max_attempts as i64,
                now,
            ],
        )?;
        debug!(job_id = %id, queue = %queue, priority, "job enqueued");
        Ok(Job {
            id,
            queue,
            payload,
            status: JobStatus::Queued,
            priority,
            attempts: 0,
            max_attempts,
            visible_after: now.clone(),
            claimed_by: None,
            last_error: None,
            created_at: now.clone(),
            updated_at: now,
        })
    }

    /// Atomic claim-or-reclaim.
    ///
    /// Finds the oldest eligible job (queued and visible, or running with an
    /// expired lease), marks it running under `worker_id` with a fresh
    /// visibility deadline, and increments `attempts` — all in one
    /// transaction, so two workers never observe the same job as claimable.
    /// `None` means the queue is empty, which is the normal idle case.
    pub fn claim_next(
        &self,
        queue: QueueName,
        worker_id: &str,
        visibility_seconds: u64,
    ) -> Result<Option<Job>> {
        let now = chrono::Utc::now();
        let now_str = now.to_rfc3339();
        let deadline = (now + chrono::Duration::seconds(visibility_seconds as i64)).to_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;

        let job = match tx.query_row(
            &format!(
                "SELECT {JOB_COLS} FROM jobs
                 WHERE queue = ?1
                   AND ((status = 'queued' AND visible_after <= ?2)
                     OR (status = 'running' AND visible_after < ?2))
                 ORDER BY priority ASC, visible_after ASC
                 LIMIT 1"
            ),
            rusqlite::params![queue.as_str(), now_str],
            row_to_job,
        ) {
            Ok(job) => job,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };

        tx.execute(
            "UPDATE jobs SET status = 'running', claimed_by = ?1,
                             visible_after = ?2, attempts = attempts + 1, updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![worker_id, deadline, now_str, job.id],
        )?;
        tx.commit()?;

        debug!(job_id = %job.id, queue = %queue, worker_id, "job claimed");

        Ok(Some(Job {
            status: JobStatus::Running,
            claimed_by: Some(worker_id.to_string()),
            visible_after: deadline,
            attempts: job.attempts + 1,
            updated_at: now_str,
            ..job
        }))
    }

    /// Extend a claim's lease. No-op (returns false) unless `worker_id`
    /// still holds the claim.
    pub fn heartbeat(&self, job_id: &str, worker_id: &str, visibility_seconds: u64) -> Result<bool> {
        let now = chrono::Utc::now();
        let deadline = (now + chrono::Duration::seconds(visibility_seconds as i64)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET visible_after = ?1, updated_at = ?2
             WHERE id = ?3 AND claimed_by = ?4 AND status = 'running'",
            rusqlite::params![deadline, now.to_rfc3339(), job_id, worker_id],
        )?;
        Ok(n == 1)
    }

    /// Terminal transition — the job becomes ineligible for further claims.
    pub fn complete_job(
        &self,
        job_id: &str,
        terminal: JobStatus,
        error: Option<&str>,
    ) -> Result<()> {
        debug_assert!(terminal.is_terminal());
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = ?1, last_error = COALESCE(?2, last_error), updated_at = ?3
             WHERE id = ?4",
            rusqlite::params![terminal.to_string(), error, now, job_id],
        )?;
        if n == 0 {
            return Err(StoreError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    /// Requeue with a delay while attempts remain, else park as failed.
    pub fn fail_with_retry(
        &self,
        job_id: &str,
        error: &str,
        delay_seconds: u64,
        max_attempts: u32,
    ) -> Result<JobStatus> {
        let now = chrono::Utc::now();
        let retry_at = (now + chrono::Duration::seconds(delay_seconds as i64)).to_rfc3339();
        let now_str = now.to_rfc3339();

        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        let attempts: u32 = tx
            .query_row(
                "SELECT attempts FROM jobs WHERE id = ?1",
                rusqlite::params![job_id],
                |row| row.get::<_, i64>(0).map(|v| v as u32),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::JobNotFound {
                    id: job_id.to_string(),
                },
                e => StoreError::Database(e),
            })?;

        let status = if attempts < max_attempts {
            tx.execute(
                "UPDATE jobs SET status = 'queued', claimed_by = NULL,
                                 visible_after = ?1, last_error = ?2, updated_at = ?3
                 WHERE id = ?4",
                rusqlite::params![retry_at, error, now_str, job_id],
            )?;
            JobStatus::Queued
        } else {
            tx.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?1, updated_at = ?2
                 WHERE id = ?3",
                rusqlite::params![error, now_str, job_id],
            )?;
            JobStatus::Failed
        };
        tx.commit()?;
        Ok(status)
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
            rusqlite::params![id],
            row_to_job,
        ) {
            Ok(j) => Ok(Some(j)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(StoreError::Database(e)),
        }
    }

    /// Admin reset of a terminal job back to `queued`. Returns false when the
    /// job does not exist or is not terminal.
    pub fn requeue_terminal(&self, job_id: &str) -> Result<bool> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE jobs SET status = 'queued', attempts = 0, claimed_by = NULL,
                             visible_after = ?1, last_error = NULL, updated_at = ?1
             WHERE id = ?2 AND status IN ('succeeded', 'failed', 'timeout')",
            rusqlite::params![now, job_id],
        )?;
        Ok(n == 1)
    }

    pub fn list_jobs(
        &self,
        queue: QueueName,
        status: Option<JobStatus>,
        limit: usize,
    ) -> Result<Vec<Job>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(&format!(
            "SELECT {JOB_COLS} FROM jobs
             WHERE queue = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY created_at DESC
             LIMIT ?3"
        ))?;
        let jobs = stmt
            .query_map(
                rusqlite::params![queue.as_str(), status.map(|s| s.to_string()), limit as i64],
                row_to_job,
            )?
            .filter_map(|r| r.ok())
            .collect();
        Ok(jobs)
    }

    /// Housekeeping: drop terminal jobs older than the given age.
    pub fn purge_terminal_jobs(&self, older_than_days: u32) -> Result<usize> {
        let cutoff =
            (chrono::Utc::now() - chrono::Duration::days(older_than_days as i64)).to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM jobs
             WHERE status IN ('succeeded', 'failed', 'timeout') AND updated_at < ?1",
            rusqlite::params![cutoff],
        )?;
        Ok(n)
    }

    // --- progress events ---------------------------------------------------

    pub fn append_progress_event(&self, event: &ProgressEvent) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO progress_events
             (id, session_id, event_type, level, message, details, processed, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                event.id,
                event.session_id,
                event.event_type.to_string(),
                event.level.to_string(),
                event.message,
                serde_json::to_string(&event.details)?,
                event.processed as i64,
                event.created_at,
            ],
        )?;
        Ok(())
    }

    /// Unprocessed events in append order (timestamp, then insertion).
    pub fn poll_unprocessed_events(&self, limit: usize) -> Result<Vec<ProgressEvent>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT id, session_id, event_type, level, message, details, processed, created_at
             FROM progress_events
             WHERE processed = 0
             ORDER BY created_at ASC, rowid ASC
             LIMIT ?1",
        )?;
        let events = stmt
            .query_map(rusqlite::params![limit as i64], row_to_event)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(events)
    }

    pub fn mark_processed(&self, event_id: &str) -> Result<()> {
        let db = self.db.lock().unwrap();
        db.execute(
            "UPDATE progress_events SET processed = 1 WHERE id = ?1",
            rusqlite::params![event_id],
        )?;
        Ok(())
    }

    // --- result cache ------------------------------------------------------

    /// Fetch a live cache entry. Expired rows are dropped and report a miss.
    pub fn cache_get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let now = now_rfc3339();
        let db = self.db.lock().unwrap();
        let entry = match db.query_row(
            "SELECT key, value, analysis_id, expires_at, created_at
             FROM result_cache WHERE key = ?1",
            rusqlite::params![key],
            row_to_cache_entry,
        ) {
            Ok(e) => e,
            Err(rusqlite::Error::QueryReturnedNoRows) => return Ok(None),
            Err(e) => return Err(StoreError::Database(e)),
        };
        if entry.expires_at <= now {
            db.execute(
                "DELETE FROM result_cache WHERE key = ?1",
                rusqlite::params![key],
            )?;
            return Ok(None);
        }
        Ok(Some(entry))
    }

    pub fn cache_put(
        &self,
        key: &str,
        value: &Value,
        analysis_id: Option<&str>,
        ttl_seconds: u64,
    ) -> Result<()> {
        let now = chrono::Utc::now();
        let expires = (now + chrono::Duration::seconds(ttl_seconds as i64)).to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO result_cache (key, value, analysis_id, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
               value = excluded.value,
               analysis_id = excluded.analysis_id,
               expires_at = excluded.expires_at",
            rusqlite::params![
                key,
                serde_json::to_string(value)?,
                analysis_id,
                expires,
                now.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Remove every cache entry that references the given analysis.
    pub fn cache_invalidate_by_analysis(&self, analysis_id: &str) -> Result<usize> {
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "DELETE FROM result_cache WHERE analysis_id = ?1",
            rusqlite::params![analysis_id],
        )?;
        Ok(n)
    }
}

/// Content-address for the result cache: SHA-256 over the question and the
/// parameter map. `serde_json::Map` keeps keys sorted, so equal parameter
/// sets hash equally regardless of insertion order.
pub fn cache_key(question: &str, parameters: &Map<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(question.as_bytes());
    hasher.update(b"\n");
    hasher.update(serde_json::to_string(parameters).unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

// --- row mappers -----------------------------------------------------------

const MESSAGE_COLS: &str = "id, session_id, role, content, analysis_id, analysis_snapshot, \
     generated_script, tool_calls, status, query_type, original_question, \
     expanded_question, metadata, created_at, updated_at";

const ANALYSIS_COLS: &str = "id, user_id, title, description, category, parameters, \
     script_name, generated_script, mcp_calls, data_sources, result, status, error, \
     execution_time_ms, executed_at, is_template, similar_queries, reuse_count, \
     created_at, updated_at";

const JOB_COLS: &str = "id, queue, payload, status, priority, attempts, max_attempts, \
     visible_after, claimed_by, last_error, created_at, updated_at";

/// Parse a TEXT column into an enum, surfacing bad values as conversion errors.
fn text_enum<T>(idx: usize, s: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    s.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("{e}").into(),
        )
    })
}

fn json_col<T: serde::de::DeserializeOwned>(idx: usize, s: &str) -> rusqlite::Result<T> {
    serde_json::from_str(s).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("{e}").into(),
        )
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    let analysis_ids: String = row.get(3)?;
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        analysis_ids: json_col(3, &analysis_ids)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role: String = row.get(2)?;
    let snapshot: Option<String> = row.get(5)?;
    let tool_calls: String = row.get(7)?;
    let status: String = row.get(8)?;
    let query_type: Option<String> = row.get(9)?;
    let metadata: String = row.get(12)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: text_enum::<Role>(2, &role)?,
        content: row.get(3)?,
        analysis_id: row.get(4)?,
        analysis_snapshot: snapshot.as_deref().map(|s| json_col(5, s)).transpose()?,
        generated_script: row.get(6)?,
        tool_calls: json_col(7, &tool_calls)?,
        status: text_enum::<MessageStatus>(8, &status)?,
        query_type: query_type
            .as_deref()
            .map(|s| text_enum::<QueryType>(9, s))
            .transpose()?,
        original_question: row.get(10)?,
        expanded_question: row.get(11)?,
        metadata: json_col(12, &metadata)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

fn row_to_analysis(row: &rusqlite::Row<'_>) -> rusqlite::Result<Analysis> {
    let parameters: String = row.get(5)?;
    let mcp_calls: String = row.get(8)?;
    let data_sources: String = row.get(9)?;
    let result: Option<String> = row.get(10)?;
    let status: String = row.get(11)?;
    let similar_queries: String = row.get(16)?;
    Ok(Analysis {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        parameters: json_col(5, &parameters)?,
        script_name: row.get(6)?,
        generated_script: row.get(7)?,
        mcp_calls: json_col(8, &mcp_calls)?,
        data_sources: json_col(9, &data_sources)?,
        result: result.as_deref().map(|s| json_col(10, s)).transpose()?,
        status: text_enum::<AnalysisStatus>(11, &status)?,
        error: row.get(12)?,
        execution_time_ms: row.get::<_, Option<i64>>(13)?.map(|v| v as u64),
        executed_at: row.get(14)?,
        is_template: row.get::<_, i64>(15)? != 0,
        similar_queries: json_col(16, &similar_queries)?,
        reuse_count: row.get::<_, i64>(17)? as u32,
        created_at: row.get(18)?,
        updated_at: row.get(19)?,
    })
}

fn row_to_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let queue: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let status: String = row.get(3)?;
    Ok(Job {
        id: row.get(0)?,
        queue: text_enum::<QueueName>(1, &queue)?,
        payload: json_col(2, &payload)?,
        status: text_enum::<JobStatus>(3, &status)?,
        priority: row.get::<_, i64>(4)? as u8,
        attempts: row.get::<_, i64>(5)? as u32,
        max_attempts: row.get::<_, i64>(6)? as u32,
        visible_after: row.get(7)?,
        claimed_by: row.get(8)?,
        last_error: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<ProgressEvent> {
    let event_type: String = row.get(2)?;
    let level: String = row.get(3)?;
    let details: String = row.get(5)?;
    Ok(ProgressEvent {
        id: row.get(0)?,
        session_id: row.get(1)?,
        event_type: text_enum::<ProgressEventType>(2, &event_type)?,
        level: text_enum::<ProgressLevel>(3, &level)?,
        message: row.get(4)?,
        details: json_col(5, &details)?,
        processed: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
    })
}

fn row_to_cache_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<CacheEntry> {
    let value: String = row.get(1)?;
    Ok(CacheEntry {
        key: row.get(0)?,
        value: json_col(1, &value)?,
        analysis_id: row.get(2)?,
        expires_at: row.get(3)?,
        created_at: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use finsight_core::types::PRIORITY_NORMAL;
    use serde_json::json;

    fn store() -> StoreGateway {
        StoreGateway::in_memory().expect("in-memory store")
    }

    #[test]
    fn session_and_message_roundtrip() {
        let s = store();
        let session = s.create_session("trader1", None).unwrap();

        let msg = ChatMessage::new(&session.id, Role::User, "What is AAPL volatility?");
        s.create_message(&msg).unwrap();

        let got = s.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(got.content, "What is AAPL volatility?");
        assert_eq!(got.original_question.as_deref(), Some("What is AAPL volatility?"));
        assert_eq!(got.status, MessageStatus::Pending);

        let listed = s.list_session_messages(&session.id, 20).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, msg.id);
    }

    #[test]
    fn message_status_update_merges_metadata() {
        let s = store();
        let session = s.create_session("trader1", None).unwrap();
        let msg = ChatMessage::new(&session.id, Role::User, "q");
        s.create_message(&msg).unwrap();

        let mut meta = Map::new();
        meta.insert("intent".into(), json!("direct_analysis"));
        s.update_message_status(
            &msg.id,
            MessageStatus::AnalysisStarted,
            MessageUpdate {
                metadata: Some(meta),
                ..Default::default()
            },
        )
        .unwrap();

        let mut meta2 = Map::new();
        meta2.insert("processing_time".into(), json!(12));
        s.update_message_status(
            &msg.id,
            MessageStatus::AnalysisCompleted,
            MessageUpdate {
                analysis_id: Some("a-1".into()),
                metadata: Some(meta2),
                ..Default::default()
            },
        )
        .unwrap();

        let got = s.get_message(&msg.id).unwrap().unwrap();
        assert_eq!(got.status, MessageStatus::AnalysisCompleted);
        assert_eq!(got.analysis_id.as_deref(), Some("a-1"));
        // Both keys survive: metadata merges, never replaces.
        assert_eq!(got.metadata["intent"], json!("direct_analysis"));
        assert_eq!(got.metadata["processing_time"], json!(12));
    }

    #[test]
    fn list_session_messages_returns_tail_in_insertion_order() {
        let s = store();
        let session = s.create_session("trader1", None).unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let msg = ChatMessage::new(&session.id, Role::User, format!("q{i}"));
            s.create_message(&msg).unwrap();
            ids.push(msg.id);
        }
        let tail = s.list_session_messages(&session.id, 3).unwrap();
        let got: Vec<_> = tail.iter().map(|m| m.id.clone()).collect();
        assert_eq!(got, ids[2..].to_vec());
    }

    #[test]
    fn claim_is_exclusive_and_increments_attempts() {
        let s = store();
        s.enqueue_job(QueueName::Analysis, json!({"n": 1}), PRIORITY_NORMAL, 3)
            .unwrap();

        let a = s.claim_next(QueueName::Analysis, "worker-a", 60).unwrap();
        let b = s.claim_next(QueueName::Analysis, "worker-b", 60).unwrap();
        let job = a.expect("worker-a claims the job");
        assert!(b.is_none(), "second worker must not observe the claimed job");
        assert_eq!(job.attempts, 1);
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.claimed_by.as_deref(), Some("worker-a"));
    }

    #[test]
    fn expired_lease_is_reclaimable() {
        let s = store();
        s.enqueue_job(QueueName::Execution, json!({}), PRIORITY_NORMAL, 3)
            .unwrap();

        // Zero-second visibility: the lease expires immediately.
        let first = s.claim_next(QueueName::Execution, "worker-a", 0).unwrap().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = s.claim_next(QueueName::Execution, "worker-b", 60).unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.attempts, 2);
        assert_eq!(second.claimed_by.as_deref(), Some("worker-b"));
    }

    #[test]
    fn priority_band_beats_age() {
        let s = store();
        let low = s
            .enqueue_job(QueueName::Analysis, json!({"which": "low"}), 3, 1)
            .unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let high = s
            .enqueue_job(QueueName::Analysis, json!({"which": "high"}), 1, 1)
            .unwrap();

        let first = s.claim_next(QueueName::Analysis, "w", 60).unwrap().unwrap();
        assert_eq!(first.id, high.id, "priority 1 claims before older priority 3");
        let second = s.claim_next(QueueName::Analysis, "w", 60).unwrap().unwrap();
        assert_eq!(second.id, low.id);
    }

    #[test]
    fn heartbeat_requires_ownership() {
        let s = store();
        let job = s
            .enqueue_job(QueueName::Analysis, json!({}), PRIORITY_NORMAL, 3)
            .unwrap();
        s.claim_next(QueueName::Analysis, "worker-a", 60).unwrap().unwrap();

        assert!(s.heartbeat(&job.id, "worker-a", 60).unwrap());
        assert!(!s.heartbeat(&job.id, "worker-b", 60).unwrap());
    }

    #[test]
    fn fail_with_retry_requeues_then_parks() {
        let s = store();
        let job = s
            .enqueue_job(QueueName::Analysis, json!({}), PRIORITY_NORMAL, 2)
            .unwrap();

        s.claim_next(QueueName::Analysis, "w", 60).unwrap().unwrap();
        let status = s.fail_with_retry(&job.id, "llm 500", 0, 2).unwrap();
        assert_eq!(status, JobStatus::Queued);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let reclaimed = s.claim_next(QueueName::Analysis, "w", 60).unwrap().unwrap();
        assert_eq!(reclaimed.attempts, 2);

        // Attempts exhausted: the poison payload parks as failed.
        let status = s.fail_with_retry(&job.id, "llm 500 again", 0, 2).unwrap();
        assert_eq!(status, JobStatus::Failed);
        assert!(s.claim_next(QueueName::Analysis, "w", 60).unwrap().is_none());
        let parked = s.get_job(&job.id).unwrap().unwrap();
        assert_eq!(parked.last_error.as_deref(), Some("llm 500 again"));
    }

    #[test]
    fn completed_job_is_not_claimable_until_requeued() {
        let s = store();
        let job = s
            .enqueue_job(QueueName::Execution, json!({}), PRIORITY_NORMAL, 1)
            .unwrap();
        s.claim_next(QueueName::Execution, "w", 60).unwrap().unwrap();
        s.complete_job(&job.id, JobStatus::Succeeded, None).unwrap();
        assert!(s.claim_next(QueueName::Execution, "w", 60).unwrap().is_none());

        assert!(s.requeue_terminal(&job.id).unwrap());
        let again = s.claim_next(QueueName::Execution, "w", 60).unwrap().unwrap();
        assert_eq!(again.id, job.id);
        assert_eq!(again.attempts, 1, "requeue resets the attempt counter");
    }

    #[test]
    fn enqueue_then_claim_preserves_payload() {
        let s = store();
        let payload = json!({"execution_id": "e-1", "parameters": {"timeframe": "weekly"}});
        s.enqueue_job(QueueName::Execution, payload.clone(), PRIORITY_NORMAL, 1)
            .unwrap();
        let job = s.claim_next(QueueName::Execution, "w", 60).unwrap().unwrap();
        assert_eq!(job.payload, payload);
    }

    #[test]
    fn progress_events_poll_in_append_order_and_mark() {
        let s = store();
        for i in 0..3 {
            let ev = ProgressEvent::info("s-1", format!("step {i}"));
            s.append_progress_event(&ev).unwrap();
        }
        let events = s.poll_unprocessed_events(10).unwrap();
        assert_eq!(events.len(), 3);
        let messages: Vec<_> = events.iter().map(|e| e.message.clone()).collect();
        assert_eq!(messages, vec!["step 0", "step 1", "step 2"]);

        s.mark_processed(&events[0].id).unwrap();
        let rest = s.poll_unprocessed_events(10).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].message, "step 1");
    }

    #[test]
    fn cache_roundtrip_and_expiry() {
        let s = store();
        let params = Map::new();
        let key = cache_key("top 5 volatile stocks", &params);

        s.cache_put(&key, &json!({"top5": ["NVDA"]}), Some("a-1"), 3600)
            .unwrap();
        let hit = s.cache_get(&key).unwrap().unwrap();
        assert_eq!(hit.value, json!({"top5": ["NVDA"]}));

        // Zero TTL expires immediately.
        s.cache_put(&key, &json!({"top5": []}), Some("a-1"), 0).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(s.cache_get(&key).unwrap().is_none());
    }

    #[test]
    fn cache_invalidate_by_analysis_removes_all_references() {
        let s = store();
        s.cache_put("k1", &json!(1), Some("a-1"), 3600).unwrap();
        s.cache_put("k2", &json!(2), Some("a-1"), 3600).unwrap();
        s.cache_put("k3", &json!(3), Some("a-2"), 3600).unwrap();

        assert_eq!(s.cache_invalidate_by_analysis("a-1").unwrap(), 2);
        assert!(s.cache_get("k1").unwrap().is_none());
        assert!(s.cache_get("k3").unwrap().is_some());
    }

    #[test]
    fn cache_key_ignores_parameter_order() {
        let mut a = Map::new();
        a.insert("symbol".into(), json!("QQQ"));
        a.insert("timeframe".into(), json!("weekly"));
        let mut b = Map::new();
        b.insert("timeframe".into(), json!("weekly"));
        b.insert("symbol".into(), json!("QQQ"));
        assert_eq!(cache_key("q", &a), cache_key("q", &b));
        assert_ne!(cache_key("q", &a), cache_key("other q", &a));
    }

    #[test]
    fn analysis_update_and_reuse_tracking() {
        let s = store();
        let mut a = Analysis::new("trader1", "Top movers");
        a.category = "volatility".into();
        s.create_analysis(&a).unwrap();

        s.update_analysis(
            &a.id,
            AnalysisUpdate {
                status: Some(AnalysisStatus::Success),
                result: Some(json!({"top5": ["NVDA", "AMD"]})),
                execution_time_ms: Some(420),
                executed_at: Some(now_rfc3339()),
                ..Default::default()
            },
        )
        .unwrap();

        s.record_reuse(&a.id, "what about weekly instead?").unwrap();

        let got = s.get_analysis(&a.id).unwrap().unwrap();
        assert_eq!(got.status, AnalysisStatus::Success);
        assert_eq!(got.execution_time_ms, Some(420));
        assert_eq!(got.reuse_count, 1);
        assert_eq!(got.similar_queries, vec!["what about weekly instead?"]);
    }
}
