use rusqlite::Connection;

use crate::error::Result;

/// Initialise the full orchestrator schema in `conn`.
///
/// Safe to call on every startup — uses `IF NOT EXISTS` throughout.
/// Timestamps are RFC3339 TEXT; they compare correctly as strings, which is
/// what the queue and progress polling queries rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS sessions (
            id           TEXT NOT NULL PRIMARY KEY,
            user_id      TEXT NOT NULL,
            title        TEXT,
            analysis_ids TEXT NOT NULL DEFAULT '[]',  -- JSON array of analysis ids
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id, updated_at DESC);

        CREATE TABLE IF NOT EXISTS messages (
            id                TEXT NOT NULL PRIMARY KEY,
            session_id        TEXT NOT NULL,
            role              TEXT NOT NULL,
            content           TEXT NOT NULL,
            analysis_id       TEXT,
            analysis_snapshot TEXT,               -- JSON, display replay only
            generated_script  TEXT,
            tool_calls        TEXT NOT NULL DEFAULT '[]',
            status            TEXT NOT NULL DEFAULT 'pending',
            query_type        TEXT,
            original_question TEXT,
            expanded_question TEXT,
            metadata          TEXT NOT NULL DEFAULT '{}',
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        -- Hydration and /session/{id} both read a session's tail in order.
        CREATE INDEX IF NOT EXISTS idx_messages_session
            ON messages(session_id, created_at);

        CREATE TABLE IF NOT EXISTS analyses (
            id                TEXT NOT NULL PRIMARY KEY,
            user_id           TEXT NOT NULL,
            title             TEXT NOT NULL,
            description       TEXT NOT NULL DEFAULT '',
            category          TEXT NOT NULL DEFAULT '',
            parameters        TEXT NOT NULL DEFAULT '{}',
            script_name       TEXT,
            generated_script  TEXT NOT NULL DEFAULT '',
            mcp_calls         TEXT NOT NULL DEFAULT '[]',
            data_sources      TEXT NOT NULL DEFAULT '[]',
            result            TEXT,
            status            TEXT NOT NULL DEFAULT 'pending',
            error             TEXT,
            execution_time_ms INTEGER,
            executed_at       TEXT,
            is_template       INTEGER NOT NULL DEFAULT 0,
            similar_queries   TEXT NOT NULL DEFAULT '[]',
            reuse_count       INTEGER NOT NULL DEFAULT 0,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_analyses_user
            ON analyses(user_id, created_at DESC);

        CREATE TABLE IF NOT EXISTS jobs (
            id            TEXT NOT NULL PRIMARY KEY,
            queue         TEXT NOT NULL,
            payload       TEXT NOT NULL,        -- opaque JSON
            status        TEXT NOT NULL DEFAULT 'queued',
            priority      INTEGER NOT NULL DEFAULT 2,
            attempts      INTEGER NOT NULL DEFAULT 0,
            max_attempts  INTEGER NOT NULL DEFAULT 1,
            visible_after TEXT NOT NULL,
            claimed_by    TEXT,
            last_error    TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        -- Claim query: eligible jobs by (priority, visible_after) within a queue.
        CREATE INDEX IF NOT EXISTS idx_jobs_claim
            ON jobs(queue, status, priority, visible_after);

        CREATE TABLE IF NOT EXISTS progress_events (
            id         TEXT NOT NULL PRIMARY KEY,
            session_id TEXT NOT NULL,
            event_type TEXT NOT NULL DEFAULT 'generic',
            level      TEXT NOT NULL DEFAULT 'info',
            message    TEXT NOT NULL,
            details    TEXT NOT NULL DEFAULT '{}',
            processed  INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );
        -- Monitor poll: WHERE processed = 0 ORDER BY created_at, rowid.
        CREATE INDEX IF NOT EXISTS idx_progress_unprocessed
            ON progress_events(processed, created_at);

        CREATE TABLE IF NOT EXISTS result_cache (
            key         TEXT NOT NULL PRIMARY KEY,
            value       TEXT NOT NULL,
            analysis_id TEXT,
            expires_at  TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_cache_analysis
            ON result_cache(analysis_id);
        ",
    )?;
    Ok(())
}
