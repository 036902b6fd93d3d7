//! Log sink: append-only, leveled log lines tied to an execution report.

use chrono::{DateTime, Utc};
use rusqlite::{Row, params};
use taskherd_core::error::Result;

use crate::persistence::{SchedulerDb, count_level, db_err, parse_col, ts};
use crate::report::{LogEntry, LogLevel};

/// Storage for per-run log lines.
///
/// Entries of a report are ordered by timestamp, then by insertion.
pub trait LogSink: Send + Sync {
    /// Append one line. Returns its id.
    fn write(
        &self,
        report_id: i64,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64>;

    /// All entries of a report, optionally restricted to one level.
    fn entries(&self, report_id: i64, level: Option<LogLevel>) -> Result<Vec<LogEntry>>;

    /// The last `n` entries, in chronological order.
    fn tail(&self, report_id: i64, n: usize) -> Result<Tail>;

    /// Entries from position `offset` onward, plus the total line count.
    fn read_from(&self, report_id: i64, offset: usize) -> Result<(Vec<LogEntry>, usize)>;

    fn count_by_level(&self, report_id: i64, level: LogLevel) -> Result<u32>;

    fn total(&self, report_id: i64) -> Result<usize>;

    /// Formatted lines, `"<timestamp> - <LEVEL> - <message>"`.
    fn log_lines(&self, report_id: i64, level: Option<LogLevel>) -> Result<Vec<String>> {
        Ok(self
            .entries(report_id, level)?
            .iter()
            .map(ToString::to_string)
            .collect())
    }
}

/// Result of [`LogSink::tail`].
#[derive(Debug, Clone, Default)]
pub struct Tail {
    /// Earlier entries left out.
    pub hidden: usize,
    pub entries: Vec<LogEntry>,
}

impl Tail {
    /// Formatted lines, led by `"<k> lines hidden ..."` when truncated.
    pub fn lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.entries.len() + 1);
        if self.hidden > 0 {
            out.push(format!("{} lines hidden ...", self.hidden));
        }
        out.extend(self.entries.iter().map(ToString::to_string));
        out
    }

    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

impl LogSink for SchedulerDb {
    fn write(
        &self,
        report_id: i64,
        level: LogLevel,
        message: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO logs (report_id, timestamp, level, message) VALUES (?1, ?2, ?3, ?4)",
            params![report_id, ts(&timestamp), level.as_str(), message],
        )
        .map_err(|e| db_err("write log", e))?;
        Ok(conn.last_insert_rowid())
    }

    fn entries(&self, report_id: i64, level: Option<LogLevel>) -> Result<Vec<LogEntry>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, report_id, timestamp, level, message FROM logs
                 WHERE report_id = ?1 AND (?2 IS NULL OR level = ?2)
                 ORDER BY timestamp, id",
            )
            .map_err(|e| db_err("read logs", e))?;
        let rows = stmt
            .query_map(params![report_id, level.map(|l| l.as_str())], entry_from_row)
            .map_err(|e| db_err("read logs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("read logs", e))?;
        Ok(rows)
    }

    fn tail(&self, report_id: i64, n: usize) -> Result<Tail> {
        let total = self.total(report_id)?;
        let skip = total.saturating_sub(n);
        let (entries, _) = self.read_from(report_id, skip)?;
        Ok(Tail {
            hidden: skip,
            entries,
        })
    }

    fn read_from(&self, report_id: i64, offset: usize) -> Result<(Vec<LogEntry>, usize)> {
        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE report_id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count logs", e))?;
        let mut stmt = conn
            .prepare(
                "SELECT id, report_id, timestamp, level, message FROM logs
                 WHERE report_id = ?1 ORDER BY timestamp, id LIMIT -1 OFFSET ?2",
            )
            .map_err(|e| db_err("read logs", e))?;
        let rows = stmt
            .query_map(params![report_id, offset as i64], entry_from_row)
            .map_err(|e| db_err("read logs", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("read logs", e))?;
        Ok((rows, total as usize))
    }

    fn count_by_level(&self, report_id: i64, level: LogLevel) -> Result<u32> {
        let conn = self.conn()?;
        count_level(&conn, report_id, level)
    }

    fn total(&self, report_id: i64) -> Result<usize> {
        let conn = self.conn()?;
        let total: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM logs WHERE report_id = ?1",
                params![report_id],
                |row| row.get(0),
            )
            .map_err(|e| db_err("count logs", e))?;
        Ok(total as usize)
    }
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LogEntry> {
    Ok(LogEntry {
        id: row.get(0)?,
        report_id: row.get(1)?,
        timestamp: parse_col(row, 2)?,
        level: parse_col(row, 3)?,
        message: row.get(4)?,
    })
}
