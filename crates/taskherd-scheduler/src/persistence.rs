//! SQLite-backed persistence for commands, tasks, execution reports and logs.
//!
//! Tasks own their reports and reports own their log lines; both relations
//! cascade on delete. Every path that removes reports re-derives the task's
//! cached summary through [`SchedulerDb::recompute_cache`].

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use taskherd_core::error::{Result, TaskherdError};

use crate::commands::CommandDefinition;
use crate::report::{ExecutionReport, InvocationResult, LogLevel};
use crate::tasks::{CacheFields, LatestReport, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, name, command, arguments, category, note, status, scheduling,
     repetition_period, repetition_rate, scheduled_job_id, last_invocation_datetime,
     last_invocation_result, last_invocation_n_errors, last_invocation_n_warnings,
     next_ride, created_at";

/// SQLite-backed persistence store for all scheduler data.
pub struct SchedulerDb {
    conn: Mutex<Connection>,
}

impl SchedulerDb {
    /// Open or create the scheduler database.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).map_err(|e| db_err("open", e))?;
        // WAL helps the gateway read while a worker writes.
        conn.execute_batch("PRAGMA journal_mode = WAL;").ok();
        Self::init(conn)
    }

    /// Private in-memory database, used by tests and dry runs.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| db_err("open", e))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        self.conn()?
            .execute_batch(
                "
            PRAGMA foreign_keys = ON;

            -- Predefined commands, synced from the command registry
            CREATE TABLE IF NOT EXISTS commands (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                namespace TEXT NOT NULL,
                active INTEGER NOT NULL DEFAULT 1,
                UNIQUE (namespace, name)
            );

            -- Schedulable tasks with their cached summary of the latest run
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                command TEXT NOT NULL,
                arguments TEXT NOT NULL DEFAULT '',
                category TEXT,
                note TEXT,
                status TEXT NOT NULL DEFAULT 'idle',
                scheduling TEXT,
                repetition_period TEXT,
                repetition_rate INTEGER,
                scheduled_job_id TEXT,
                last_invocation_datetime TEXT,
                last_invocation_result TEXT,
                last_invocation_n_errors INTEGER,
                last_invocation_n_warnings INTEGER,
                next_ride TEXT,
                created_at TEXT NOT NULL
            );

            -- One row per invocation
            CREATE TABLE IF NOT EXISTS reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id INTEGER NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
                invocation_result TEXT NOT NULL DEFAULT 'none',
                invocation_datetime TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_reports_task ON reports(task_id, id);

            -- Append-only run log
            CREATE TABLE IF NOT EXISTS logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                report_id INTEGER NOT NULL REFERENCES reports(id) ON DELETE CASCADE,
                timestamp TEXT NOT NULL,
                level TEXT NOT NULL,
                message TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_logs_report ON logs(report_id, timestamp, id);
         ",
            )
            .map_err(|e| db_err("migration", e))?;
        Ok(())
    }

    pub(crate) fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| TaskherdError::Database(format!("Lock: {e}")))
    }

    // ─── Commands ──────────────────────────────────────────────

    /// Insert a command definition, or update its active flag.
    pub fn upsert_command(&self, name: &str, namespace: &str, active: bool) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO commands (name, namespace, active) VALUES (?1, ?2, ?3)
             ON CONFLICT (namespace, name) DO UPDATE SET active = excluded.active",
            params![name, namespace, active as i32],
        )
        .map_err(|e| db_err("upsert command", e))?;
        conn.query_row(
            "SELECT id FROM commands WHERE namespace = ?1 AND name = ?2",
            params![namespace, name],
            |row| row.get(0),
        )
        .map_err(|e| db_err("upsert command", e))
    }

    /// Mark every command not in `keep` as inactive. Returns how many changed.
    pub fn deactivate_commands_except(&self, keep: &[(String, String)]) -> Result<usize> {
        let mut changed = 0;
        for def in self.list_commands()? {
            let kept = keep
                .iter()
                .any(|(ns, name)| *ns == def.namespace && *name == def.name);
            if !kept && def.active {
                self.upsert_command(&def.name, &def.namespace, false)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    pub fn list_commands(&self) -> Result<Vec<CommandDefinition>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT id, name, namespace, active FROM commands ORDER BY namespace, name")
            .map_err(|e| db_err("list commands", e))?;
        let rows = stmt
            .query_map([], command_from_row)
            .map_err(|e| db_err("list commands", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("list commands", e))?;
        Ok(rows)
    }

    /// Look up a command by name, preferring active definitions.
    pub fn get_command(&self, name: &str) -> Result<Option<CommandDefinition>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, name, namespace, active FROM commands WHERE name = ?1
             ORDER BY active DESC, id LIMIT 1",
            params![name],
            command_from_row,
        )
        .optional()
        .map_err(|e| db_err("get command", e))
    }

    // ─── Tasks ─────────────────────────────────────────────────

    /// Insert a new task and assign its id.
    pub fn insert_task(&self, task: &mut Task) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO tasks
             (name, command, arguments, category, note, status, scheduling, repetition_period,
              repetition_rate, scheduled_job_id, last_invocation_datetime, last_invocation_result,
              last_invocation_n_errors, last_invocation_n_warnings, next_ride, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                task.name,
                task.command,
                task.arguments,
                task.category,
                task.note,
                task.status.as_str(),
                task.scheduling.as_ref().map(ts),
                task.repetition_period.map(|p| p.as_str()),
                task.repetition_rate,
                task.scheduled_job_id,
                task.cache.last_invocation_datetime.as_ref().map(ts),
                task.cache.last_invocation_result.map(|r| r.as_str()),
                task.cache.last_invocation_n_errors,
                task.cache.last_invocation_n_warnings,
                task.next_ride.as_ref().map(ts),
                ts(&task.created_at),
            ],
        )
        .map_err(|e| db_err("insert task", e))?;
        task.id = conn.last_insert_rowid();
        Ok(task.id)
    }

    /// Write every column of an existing task.
    pub fn save_task(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE tasks SET name = ?2, command = ?3, arguments = ?4, category = ?5,
                 note = ?6, status = ?7, scheduling = ?8, repetition_period = ?9,
                 repetition_rate = ?10, scheduled_job_id = ?11, last_invocation_datetime = ?12,
                 last_invocation_result = ?13, last_invocation_n_errors = ?14,
                 last_invocation_n_warnings = ?15, next_ride = ?16
                 WHERE id = ?1",
                params![
                    task.id,
                    task.name,
                    task.command,
                    task.arguments,
                    task.category,
                    task.note,
                    task.status.as_str(),
                    task.scheduling.as_ref().map(ts),
                    task.repetition_period.map(|p| p.as_str()),
                    task.repetition_rate,
                    task.scheduled_job_id,
                    task.cache.last_invocation_datetime.as_ref().map(ts),
                    task.cache.last_invocation_result.map(|r| r.as_str()),
                    task.cache.last_invocation_n_errors,
                    task.cache.last_invocation_n_warnings,
                    task.next_ride.as_ref().map(ts),
                ],
            )
            .map_err(|e| db_err("save task", e))?;
        if updated == 0 {
            return Err(TaskherdError::TaskNotFound(task.id));
        }
        Ok(())
    }

    /// Persist only the queue-facing fields: status, job id and next ride.
    pub fn save_schedule(&self, task: &Task) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE tasks SET status = ?2, scheduled_job_id = ?3, next_ride = ?4 WHERE id = ?1",
                params![
                    task.id,
                    task.status.as_str(),
                    task.scheduled_job_id,
                    task.next_ride.as_ref().map(ts),
                ],
            )
            .map_err(|e| db_err("save schedule", e))?;
        if updated == 0 {
            return Err(TaskherdError::TaskNotFound(task.id));
        }
        Ok(())
    }

    pub fn set_status(&self, task_id: i64, status: TaskStatus) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE tasks SET status = ?2 WHERE id = ?1",
                params![task_id, status.as_str()],
            )
            .map_err(|e| db_err("set status", e))?;
        if updated == 0 {
            return Err(TaskherdError::TaskNotFound(task_id));
        }
        Ok(())
    }

    pub fn get_task(&self, id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        conn.query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![id],
            task_from_row,
        )
        .optional()
        .map_err(|e| db_err("get task", e))
    }

    /// Like [`get_task`](Self::get_task), but a missing row is an error.
    pub fn require_task(&self, id: i64) -> Result<Task> {
        self.get_task(id)?.ok_or(TaskherdError::TaskNotFound(id))
    }

    pub fn list_tasks(&self) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"))
            .map_err(|e| db_err("list tasks", e))?;
        let rows = stmt
            .query_map([], task_from_row)
            .map_err(|e| db_err("list tasks", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("list tasks", e))?;
        Ok(rows)
    }

    /// Delete a task with its reports and logs. Returns whether a row existed.
    pub fn delete_task(&self, id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let count = conn
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .map_err(|e| db_err("delete task", e))?;
        Ok(count > 0)
    }

    // ─── Execution reports ─────────────────────────────────────

    /// Create an unclassified report for a run that is about to start.
    pub fn create_report(&self, task_id: i64) -> Result<ExecutionReport> {
        let conn = self.conn()?;
        // Stored timestamps carry microseconds.
        let now = Utc::now().trunc_subsecs(6);
        conn.execute(
            "INSERT INTO reports (task_id, invocation_result, invocation_datetime)
             VALUES (?1, ?2, ?3)",
            params![task_id, InvocationResult::None.as_str(), ts(&now)],
        )
        .map_err(|e| db_err("create report", e))?;
        Ok(ExecutionReport {
            id: conn.last_insert_rowid(),
            task_id,
            invocation_result: InvocationResult::None,
            invocation_datetime: now,
        })
    }

    pub fn get_report(&self, id: i64) -> Result<Option<ExecutionReport>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, task_id, invocation_result, invocation_datetime FROM reports WHERE id = ?1",
            params![id],
            report_from_row,
        )
        .optional()
        .map_err(|e| db_err("get report", e))
    }

    pub fn require_report(&self, id: i64) -> Result<ExecutionReport> {
        self.get_report(id)?.ok_or(TaskherdError::ReportNotFound(id))
    }

    /// Record the final classification of a run.
    pub fn finalize_report(&self, id: i64, result: InvocationResult) -> Result<()> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE reports SET invocation_result = ?2 WHERE id = ?1",
                params![id, result.as_str()],
            )
            .map_err(|e| db_err("finalize report", e))?;
        if updated == 0 {
            return Err(TaskherdError::ReportNotFound(id));
        }
        Ok(())
    }

    /// Reports of a task, most recent first.
    pub fn list_reports(&self, task_id: i64) -> Result<Vec<ExecutionReport>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, task_id, invocation_result, invocation_datetime FROM reports
                 WHERE task_id = ?1 ORDER BY invocation_datetime DESC, id DESC",
            )
            .map_err(|e| db_err("list reports", e))?;
        let rows = stmt
            .query_map(params![task_id], report_from_row)
            .map_err(|e| db_err("list reports", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("list reports", e))?;
        Ok(rows)
    }

    /// Delete one report (and its logs), then refresh the owning task's cache.
    pub fn delete_report(&self, id: i64) -> Result<bool> {
        let Some(report) = self.get_report(id)? else {
            return Ok(false);
        };
        {
            let conn = self.conn()?;
            conn.execute("DELETE FROM reports WHERE id = ?1", params![id])
                .map_err(|e| db_err("delete report", e))?;
        }
        self.recompute_cache(report.task_id)?;
        Ok(true)
    }

    /// Keep only the `keep` most recent reports of a task; 0 keeps all.
    /// Returns how many were deleted and refreshes the task cache.
    pub fn prune_reports(&self, task_id: i64, keep: usize) -> Result<usize> {
        if keep == 0 {
            return Ok(0);
        }
        let deleted = {
            let conn = self.conn()?;
            conn.execute(
                "DELETE FROM reports WHERE task_id = ?1 AND id NOT IN (
                     SELECT id FROM reports WHERE task_id = ?1
                     ORDER BY invocation_datetime DESC, id DESC LIMIT ?2
                 )",
                params![task_id, keep as i64],
            )
            .map_err(|e| db_err("prune reports", e))?
        };
        self.recompute_cache(task_id)?;
        Ok(deleted)
    }

    /// Re-derive the task's cached summary from its most recent report and
    /// store it. This is the only writer of the cached fields. A task left
    /// without reports also loses its next ride.
    pub fn recompute_cache(&self, task_id: i64) -> Result<CacheFields> {
        let conn = self.conn()?;
        let latest = conn
            .query_row(
                "SELECT id, task_id, invocation_result, invocation_datetime FROM reports
                 WHERE task_id = ?1 ORDER BY invocation_datetime DESC, id DESC LIMIT 1",
                params![task_id],
                report_from_row,
            )
            .optional()
            .map_err(|e| db_err("recompute cache", e))?;

        let no_reports = latest.is_none();
        let latest = match latest {
            Some(report) => Some(LatestReport {
                invocation_datetime: report.invocation_datetime,
                invocation_result: report.invocation_result,
                n_errors: count_level(&conn, report.id, LogLevel::Error)?,
                n_warnings: count_level(&conn, report.id, LogLevel::Warning)?,
            }),
            None => None,
        };
        let cache = CacheFields::project(latest);

        conn.execute(
            "UPDATE tasks SET last_invocation_datetime = ?2, last_invocation_result = ?3,
             last_invocation_n_errors = ?4, last_invocation_n_warnings = ?5 WHERE id = ?1",
            params![
                task_id,
                cache.last_invocation_datetime.as_ref().map(ts),
                cache.last_invocation_result.map(|r| r.as_str()),
                cache.last_invocation_n_errors,
                cache.last_invocation_n_warnings,
            ],
        )
        .map_err(|e| db_err("recompute cache", e))?;
        if no_reports {
            // Refilled from the queue on the next run.
            conn.execute("UPDATE tasks SET next_ride = NULL WHERE id = ?1", params![task_id])
                .map_err(|e| db_err("recompute cache", e))?;
        }
        Ok(cache)
    }
}

pub(crate) fn count_level(conn: &Connection, report_id: i64, level: LogLevel) -> Result<u32> {
    conn.query_row(
        "SELECT COUNT(*) FROM logs WHERE report_id = ?1 AND level = ?2",
        params![report_id, level.as_str()],
        |row| row.get(0),
    )
    .map_err(|e| db_err("count logs", e))
}

pub(crate) fn db_err(context: &str, e: rusqlite::Error) -> TaskherdError {
    TaskherdError::Database(format!("{context}: {e}"))
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a text column. Malformed content fails the row instead of being
/// replaced by a default.
pub(crate) fn parse_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e: T::Err| conversion_err(idx, e))
}

/// [`parse_col`] for a nullable column.
pub(crate) fn parse_col_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| raw.parse().map_err(|e: T::Err| conversion_err(idx, e)))
        .transpose()
}

fn conversion_err(
    idx: usize,
    e: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

fn command_from_row(row: &Row<'_>) -> rusqlite::Result<CommandDefinition> {
    Ok(CommandDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        namespace: row.get(2)?,
        active: row.get::<_, i32>(3)? != 0,
    })
}

fn report_from_row(row: &Row<'_>) -> rusqlite::Result<ExecutionReport> {
    Ok(ExecutionReport {
        id: row.get(0)?,
        task_id: row.get(1)?,
        invocation_result: parse_col(row, 2)?,
        invocation_datetime: parse_col(row, 3)?,
    })
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    Ok(Task {
        id: row.get(0)?,
        name: row.get(1)?,
        command: row.get(2)?,
        arguments: row.get(3)?,
        category: row.get(4)?,
        note: row.get(5)?,
        status: parse_col(row, 6)?,
        scheduling: parse_col_opt(row, 7)?,
        repetition_period: parse_col_opt(row, 8)?,
        repetition_rate: row.get(9)?,
        scheduled_job_id: row.get(10)?,
        cache: CacheFields {
            last_invocation_datetime: parse_col_opt(row, 11)?,
            last_invocation_result: parse_col_opt(row, 12)?,
            last_invocation_n_errors: row.get(13)?,
            last_invocation_n_warnings: row.get(14)?,
        },
        next_ride: parse_col_opt(row, 15)?,
        created_at: parse_col(row, 16)?,
    })
}
