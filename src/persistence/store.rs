use super::types::*;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Debug log ring capacity.
pub const DEBUG_LOG_CAP: u32 = 100;

const SCHEMA_SQL: &str = r"
    CREATE TABLE IF NOT EXISTS state (
        id INTEGER PRIMARY KEY CHECK (id = 1),
        batch_id TEXT NOT NULL,
        chunk_id TEXT NOT NULL,
        started_at INTEGER NOT NULL,
        completed_at INTEGER,
        phase TEXT NOT NULL,
        total_refs INTEGER NOT NULL DEFAULT 0,
        completed_refs INTEGER NOT NULL DEFAULT 0,
        failed_refs INTEGER NOT NULL DEFAULT 0,
        skipped_refs INTEGER NOT NULL DEFAULT 0,
        global_error TEXT,
        global_retry_count INTEGER NOT NULL DEFAULT 0,
        consecutive_errors INTEGER NOT NULL DEFAULT 0,
        backoff_until INTEGER
    );

    CREATE TABLE IF NOT EXISTS pis (
        pi TEXT PRIMARY KEY,
        entity_updated INTEGER NOT NULL DEFAULT 0,
        new_tip TEXT,
        new_version INTEGER,
        entity_error TEXT
    );

    CREATE TABLE IF NOT EXISTS refs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        pi TEXT NOT NULL,
        filename TEXT NOT NULL,
        cdn_url TEXT NOT NULL,
        original_cid TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        retry_count INTEGER NOT NULL DEFAULT 0,
        ref_data_json TEXT,
        result_cid TEXT,
        ocr_text_length INTEGER,
        error TEXT,
        UNIQUE (pi, filename)
    );

    CREATE INDEX IF NOT EXISTS idx_refs_status ON refs (status);
    CREATE INDEX IF NOT EXISTS idx_refs_pi ON refs (pi);

    CREATE TABLE IF NOT EXISTS debug_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        message TEXT NOT NULL
    );
";

/// Handle to one chunk's SQLite database.
///
/// Cheap to clone; all clones share the same connection. Lock scopes are kept
/// to single statements or one small transaction, so holding the mutex across
/// the async phase code is never necessary.
#[derive(Clone)]
pub struct ChunkDb {
    conn: Arc<Mutex<Connection>>,
}

impl ChunkDb {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating data dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("opening chunk database {}", path.display()))?;
        // Status reads open their own connection to the same file.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Clears any previous run and seeds the state row plus one PI row per
    /// entity. Used both for first acceptance and for re-acceptance after a
    /// terminal phase.
    pub fn init_chunk(&self, batch_id: &str, chunk_id: &str, pis: &[String]) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        tx.execute_batch(
            "DELETE FROM state; DELETE FROM pis; DELETE FROM refs; DELETE FROM debug_log;",
        )?;
        let state = ChunkState::new(batch_id, chunk_id);
        tx.execute(
            "INSERT INTO state (id, batch_id, chunk_id, started_at, phase) VALUES (1, ?1, ?2, ?3, ?4)",
            params![state.batch_id, state.chunk_id, state.started_at as i64, state.phase.as_str()],
        )?;
        for pi in pis {
            tx.execute(
                "INSERT OR IGNORE INTO pis (pi) VALUES (?1)",
                params![pi],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn load_state(&self) -> Result<Option<ChunkState>> {
        let guard = self.conn.lock().unwrap();
        read_state_row(&guard)
    }

    /// State row plus ref counts read inside one transaction, so the pair is
    /// a consistent snapshot even while the driver is committing batches.
    pub fn status_snapshot(&self) -> Result<Option<(ChunkState, RefCounts)>> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        let Some(state) = read_state_row(&tx)? else {
            return Ok(None);
        };
        let counts = read_ref_counts(&tx)?;
        tx.commit()?;
        Ok(Some((state, counts)))
    }

    pub fn update_state(&self, state: &ChunkState) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        write_state(&guard, state)?;
        Ok(())
    }

    /// Applies one processed batch (every ref outcome plus the updated state
    /// row) in a single transaction, so a concurrent status read never sees
    /// rows and counters out of step.
    pub fn apply_process_outcomes(
        &self,
        actions: &[RefAction],
        state: &ChunkState,
    ) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        for action in actions {
            match action {
                RefAction::Complete {
                    id,
                    status,
                    result_cid,
                    text_length,
                } => {
                    tx.execute(
                        "UPDATE refs SET status = ?1, result_cid = ?2,
                                ocr_text_length = ?3, error = NULL
                         WHERE id = ?4",
                        params![status.as_str(), result_cid, text_length, id],
                    )?;
                }
                RefAction::Requeue { id, bump_retry } => {
                    tx.execute(
                        "UPDATE refs SET status = 'pending',
                                retry_count = retry_count + ?1
                         WHERE id = ?2",
                        params![u32::from(*bump_retry), id],
                    )?;
                }
                RefAction::Fail {
                    id,
                    message,
                    bump_retry,
                } => {
                    tx.execute(
                        "UPDATE refs SET status = 'error', error = ?1,
                                retry_count = retry_count + ?2
                         WHERE id = ?3",
                        params![message, u32::from(*bump_retry), id],
                    )?;
                }
            }
        }
        write_state(&tx, state)?;
        tx.commit()?;
        Ok(())
    }

    pub fn insert_ref(&self, new_ref: &NewRef) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        guard.execute(
            "INSERT INTO refs (pi, filename, cdn_url, original_cid, status, ref_data_json)
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5)",
            params![
                new_ref.pi,
                new_ref.filename,
                new_ref.cdn_url,
                new_ref.original_cid,
                new_ref.ref_data_json,
            ],
        )?;
        Ok(())
    }

    /// Selects up to `limit` pending refs and atomically flips them to
    /// `processing`. The returned records already carry the flipped status.
    pub fn claim_pending_refs(&self, limit: usize) -> Result<Vec<RefRecord>> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        let mut claimed = {
            let mut stmt = tx.prepare(
                "SELECT id, pi, filename, cdn_url, original_cid, status, retry_count,
                        ref_data_json, result_cid, ocr_text_length, error
                 FROM refs WHERE status = 'pending' LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], row_to_raw_ref)?;
            let mut out = Vec::new();
            for row in rows {
                out.push(into_ref_record(row?)?);
            }
            out
        };
        for record in &mut claimed {
            tx.execute(
                "UPDATE refs SET status = 'processing' WHERE id = ?1",
                params![record.id],
            )?;
            record.status = RefStatus::Processing;
        }
        tx.commit()?;
        Ok(claimed)
    }

    pub fn ref_counts(&self) -> Result<RefCounts> {
        let guard = self.conn.lock().unwrap();
        read_ref_counts(&guard)
    }

    pub fn all_pis(&self) -> Result<Vec<PiRecord>> {
        self.query_pis("SELECT pi, entity_updated, new_tip, new_version, entity_error FROM pis")
    }

    pub fn pis_pending_publish(&self) -> Result<Vec<PiRecord>> {
        self.query_pis(
            "SELECT pi, entity_updated, new_tip, new_version, entity_error
             FROM pis WHERE entity_updated = 0",
        )
    }

    fn query_pis(&self, sql: &str) -> Result<Vec<PiRecord>> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare(sql)?;
        let rows = stmt.query_map([], |row| {
            Ok(PiRecord {
                pi: row.get(0)?,
                entity_updated: row.get::<_, i64>(1)? != 0,
                new_tip: row.get(2)?,
                new_version: row.get::<_, Option<i64>>(3)?.map(|v| v as u64),
                entity_error: row.get(4)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Completed components for one PI: `(filename, result_cid)` over rows
    /// with a terminal success status and a recorded result.
    pub fn completed_components(&self, pi: &str) -> Result<Vec<(String, String)>> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare(
            "SELECT filename, result_cid FROM refs
             WHERE pi = ?1 AND status IN ('done', 'skipped') AND result_cid IS NOT NULL
             ORDER BY filename",
        )?;
        let rows = stmt.query_map(params![pi], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn failed_refs_for_pi(&self, pi: &str) -> Result<Vec<(String, String)>> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare(
            "SELECT filename, COALESCE(error, '') FROM refs
             WHERE pi = ?1 AND status = 'error' ORDER BY filename",
        )?;
        let rows = stmt.query_map(params![pi], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// `(completed, failed)` ref counts for one PI; skipped refs count as
    /// completed for callback purposes.
    pub fn pi_ref_stats(&self, pi: &str) -> Result<(u32, u32)> {
        let guard = self.conn.lock().unwrap();
        let completed = guard.query_row(
            "SELECT COUNT(*) FROM refs WHERE pi = ?1 AND status IN ('done', 'skipped')",
            params![pi],
            |row| row.get::<_, u32>(0),
        )?;
        let failed = guard.query_row(
            "SELECT COUNT(*) FROM refs WHERE pi = ?1 AND status = 'error'",
            params![pi],
            |row| row.get::<_, u32>(0),
        )?;
        Ok((completed, failed))
    }

    pub fn mark_pi_published(&self, pi: &str, new_tip: &str, new_version: u64) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        guard.execute(
            "UPDATE pis SET entity_updated = 1, new_tip = ?1, new_version = ?2 WHERE pi = ?3",
            params![new_tip, new_version as i64, pi],
        )?;
        Ok(())
    }

    pub fn mark_pi_error(&self, pi: &str, error: &str) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        guard.execute(
            "UPDATE pis SET entity_updated = 1, entity_error = ?1 WHERE pi = ?2",
            params![error, pi],
        )?;
        Ok(())
    }

    /// Marks a PI updated with no version change (no completed refs, or a
    /// fetch failure that left it without refs).
    pub fn mark_pi_updated(&self, pi: &str) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        guard.execute("UPDATE pis SET entity_updated = 1 WHERE pi = ?1", params![pi])?;
        Ok(())
    }

    /// Returns rows stuck in `processing` to the queue. Only meaningful when
    /// resuming after a crash: a live driver always settles every row it
    /// claimed before its fire returns.
    pub fn requeue_inflight_refs(&self) -> Result<usize> {
        let guard = self.conn.lock().unwrap();
        let changed = guard.execute(
            "UPDATE refs SET status = 'pending' WHERE status = 'processing'",
            [],
        )?;
        Ok(changed)
    }

    /// Appends to the debug ring and trims it back to the cap.
    pub fn log_debug(&self, message: &str) -> Result<()> {
        let guard = self.conn.lock().unwrap();
        guard.execute(
            "INSERT INTO debug_log (ts, message) VALUES (?1, ?2)",
            params![now_ms() as i64, message],
        )?;
        guard.execute(
            "DELETE FROM debug_log WHERE id NOT IN
                 (SELECT id FROM debug_log ORDER BY id DESC LIMIT ?1)",
            params![DEBUG_LOG_CAP],
        )?;
        Ok(())
    }

    /// Most recent `limit` entries, oldest first, rendered as
    /// `"<rfc3339> <message>"`.
    pub fn debug_tail(&self, limit: u32) -> Result<Vec<String>> {
        let guard = self.conn.lock().unwrap();
        let mut stmt = guard.prepare(
            "SELECT ts, message FROM
                 (SELECT id, ts, message FROM debug_log ORDER BY id DESC LIMIT ?1)
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![limit], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (ts, message) = row?;
            let stamp = chrono::DateTime::from_timestamp_millis(ts)
                .map(|dt| dt.to_rfc3339())
                .unwrap_or_else(|| ts.to_string());
            out.push(format!("{stamp} {message}"));
        }
        Ok(out)
    }

    /// Drops every table. Called once the final callback has been delivered;
    /// a subsequent `load_state` sees an empty database. Empty tables are
    /// recreated in the same transaction so concurrent status reads and a
    /// later /process always find the schema in place.
    pub fn cleanup(&self) -> Result<()> {
        let mut guard = self.conn.lock().unwrap();
        let tx = guard.transaction()?;
        tx.execute_batch(
            "DROP TABLE IF EXISTS state;
             DROP TABLE IF EXISTS pis;
             DROP TABLE IF EXISTS refs;
             DROP TABLE IF EXISTS debug_log;",
        )?;
        tx.execute_batch(SCHEMA_SQL)?;
        tx.commit()?;
        Ok(())
    }

    #[cfg(test)]
    pub fn get_ref(&self, pi: &str, filename: &str) -> Result<Option<RefRecord>> {
        let guard = self.conn.lock().unwrap();
        let row = guard
            .query_row(
                "SELECT id, pi, filename, cdn_url, original_cid, status, retry_count,
                        ref_data_json, result_cid, ocr_text_length, error
                 FROM refs WHERE pi = ?1 AND filename = ?2",
                params![pi, filename],
                row_to_raw_ref,
            )
            .optional()?;
        row.map(into_ref_record).transpose()
    }
}

fn read_state_row(conn: &Connection) -> Result<Option<ChunkState>> {
    let row = conn
        .query_row(
            "SELECT batch_id, chunk_id, started_at, completed_at, phase, total_refs,
                    completed_refs, failed_refs, skipped_refs, global_error,
                    global_retry_count, consecutive_errors, backoff_until
             FROM state WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, u32>(5)?,
                    row.get::<_, u32>(6)?,
                    row.get::<_, u32>(7)?,
                    row.get::<_, u32>(8)?,
                    row.get::<_, Option<String>>(9)?,
                    row.get::<_, u32>(10)?,
                    row.get::<_, u32>(11)?,
                    row.get::<_, Option<i64>>(12)?,
                ))
            },
        )
        .optional()?;

    let Some((
        batch_id,
        chunk_id,
        started_at,
        completed_at,
        phase,
        total_refs,
        completed_refs,
        failed_refs,
        skipped_refs,
        global_error,
        global_retry_count,
        consecutive_errors,
        backoff_until,
    )) = row
    else {
        return Ok(None);
    };

    Ok(Some(ChunkState {
        batch_id,
        chunk_id,
        started_at: started_at as u64,
        completed_at: completed_at.map(|v| v as u64),
        phase: Phase::parse(&phase).ok_or_else(|| anyhow!("unknown phase: {phase}"))?,
        total_refs,
        completed_refs,
        failed_refs,
        skipped_refs,
        global_error,
        global_retry_count,
        consecutive_errors,
        backoff_until: backoff_until.map(|v| v as u64),
    }))
}

fn read_ref_counts(conn: &Connection) -> Result<RefCounts> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM refs GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, u32>(1)?))
    })?;
    let mut counts = RefCounts::default();
    for row in rows {
        let (status, count) = row?;
        match RefStatus::parse(&status).ok_or_else(|| anyhow!("unknown ref status: {status}"))? {
            RefStatus::Pending => counts.pending = count,
            RefStatus::Processing => counts.processing = count,
            RefStatus::Done => counts.done = count,
            RefStatus::Skipped => counts.skipped = count,
            RefStatus::Error => counts.error = count,
        }
    }
    Ok(counts)
}

fn write_state(conn: &Connection, state: &ChunkState) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE state SET completed_at = ?1, phase = ?2, total_refs = ?3,
                completed_refs = ?4, failed_refs = ?5, skipped_refs = ?6,
                global_error = ?7, global_retry_count = ?8,
                consecutive_errors = ?9, backoff_until = ?10
         WHERE id = 1",
        params![
            state.completed_at.map(|v| v as i64),
            state.phase.as_str(),
            state.total_refs,
            state.completed_refs,
            state.failed_refs,
            state.skipped_refs,
            state.global_error,
            state.global_retry_count,
            state.consecutive_errors,
            state.backoff_until.map(|v| v as i64),
        ],
    )
}

type RawRef = (
    i64,
    String,
    String,
    String,
    String,
    String,
    u32,
    Option<String>,
    Option<String>,
    Option<u32>,
    Option<String>,
);

fn row_to_raw_ref(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRef> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
    ))
}

fn into_ref_record(raw: RawRef) -> Result<RefRecord> {
    let (id, pi, filename, cdn_url, original_cid, status, retry_count, ref_data_json, result_cid, ocr_text_length, error) =
        raw;
    Ok(RefRecord {
        id,
        pi,
        filename,
        cdn_url,
        original_cid,
        status: RefStatus::parse(&status).ok_or_else(|| anyhow!("unknown ref status: {status}"))?,
        retry_count,
        ref_data_json,
        result_cid,
        ocr_text_length,
        error,
    })
}
