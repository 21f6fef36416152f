use crate::dispatch::{Job, JobQueue};
use crate::storage::open_connection;
use crate::Result;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::Path;

/// Job queue stored in the shared SQLite database
///
/// Workers in different processes pointed at the same file share the queue.
/// A dequeue selects and deletes the job inside one immediate transaction,
/// so two workers never take the same row.
pub struct SqliteQueue {
    conn: Mutex<Connection>,
}

impl SqliteQueue {
    pub fn new(path: &Path) -> rusqlite::Result<Self> {
        Ok(Self {
            conn: Mutex::new(open_connection(path)?),
        })
    }

    pub fn new_in_memory() -> rusqlite::Result<Self> {
        let conn = Connection::open_in_memory()?;
        crate::storage::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl JobQueue for SqliteQueue {
    fn enqueue(&self, job: Job) -> Result<()> {
        let payload = serde_json::to_string(&job)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO jobs (job_id, dataset, priority, not_before, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                job.id,
                job.dataset,
                job.priority,
                job.not_before.timestamp_millis(),
                payload
            ],
        )?;
        Ok(())
    }

    fn dequeue(&self) -> Result<Option<Job>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row: Option<(i64, String)> = tx
            .query_row(
                "SELECT id, payload FROM jobs
                 WHERE not_before <= ?1
                 ORDER BY priority DESC, id ASC
                 LIMIT 1",
                params![Utc::now().timestamp_millis()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((id, payload)) = row else {
            return Ok(None);
        };
        tx.execute("DELETE FROM jobs WHERE id = ?1", params![id])?;
        tx.commit()?;

        Ok(Some(serde_json::from_str(&payload)?))
    }

    fn cancel(&self, dataset: &str) -> Result<usize> {
        let conn = self.conn.lock();
        Ok(conn.execute("DELETE FROM jobs WHERE dataset = ?1", params![dataset])?)
    }

    fn pending(&self, dataset: Option<&str>) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = match dataset {
            Some(dataset) => conn.query_row(
                "SELECT COUNT(*) FROM jobs WHERE dataset = ?1",
                params![dataset],
                |row| row.get(0),
            )?,
            None => conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?,
        };
        Ok(count as usize)
    }

    fn next_ready_at(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn.lock();
        let millis: Option<i64> =
            conn.query_row("SELECT MIN(not_before) FROM jobs", [], |row| row.get(0))?;
        Ok(millis.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}
