//! SQLite backend.
//!
//! Bucket increments are `INSERT .. ON CONFLICT DO UPDATE` upserts, and every
//! multi-statement operation runs inside a `BEGIN IMMEDIATE` transaction so
//! several processes sharing one database file still serialize their writes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use abt_core::{
    AbtError, Assignment, BucketDelta, BucketKey, ConversionOutcome, ErrorInfo, Experiment,
    ExperimentFilter, ExperimentId, FinishOutcome, Goal, HourlyLog, NewExperiment, PageId, Status,
    Variant,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{
    params, params_from_iter, Connection, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use tracing::debug;

use crate::schema::{init_schema, store_error};
use crate::{
    lock_poisoned, report_order, stale_transition, BucketStore, ExperimentStore, VisitorStore,
};

const EXPERIMENT_COLUMNS: &str = "id, page_id, name, hypothesis, goal_event, goal_page_id, \
     treatment_revision, sample_size, status, outcome, created_at, first_started_at, \
     last_started_at, finished_at, winning_variant";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Store backed by a SQLite database.
#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AbtError> {
        let path = path.as_ref();
        let conn = Connection::open(path).map_err(|err| {
            AbtError::Storage(
                ErrorInfo::new("store-open", "failed to open sqlite store")
                    .with_context("path", path.display())
                    .with_hint(err.to_string()),
            )
        })?;
        debug!(path = %path.display(), "opened sqlite store");
        Self::from_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> Result<Self, AbtError> {
        let conn =
            Connection::open_in_memory().map_err(|err| store_error("store-open", err))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, AbtError> {
        conn.busy_timeout(BUSY_TIMEOUT)
            .map_err(|err| store_error("store-open", err))?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, AbtError> {
        self.conn.lock().map_err(|_| lock_poisoned())
    }
}

fn immediate(conn: &mut Connection) -> Result<Transaction<'_>, AbtError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|err| store_error("store-transaction", err))
}

fn commit(tx: Transaction<'_>) -> Result<(), AbtError> {
    tx.commit().map_err(|err| store_error("store-commit", err))
}

struct RawExperiment {
    id: i64,
    page_id: i64,
    name: String,
    hypothesis: String,
    goal_event: String,
    goal_page_id: Option<i64>,
    treatment_revision: Option<i64>,
    sample_size: i64,
    status: String,
    outcome: Option<String>,
    created_at: DateTime<Utc>,
    first_started_at: Option<DateTime<Utc>>,
    last_started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    winning_variant: Option<String>,
}

impl RawExperiment {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            page_id: row.get(1)?,
            name: row.get(2)?,
            hypothesis: row.get(3)?,
            goal_event: row.get(4)?,
            goal_page_id: row.get(5)?,
            treatment_revision: row.get(6)?,
            sample_size: row.get(7)?,
            status: row.get(8)?,
            outcome: row.get(9)?,
            created_at: row.get(10)?,
            first_started_at: row.get(11)?,
            last_started_at: row.get(12)?,
            finished_at: row.get(13)?,
            winning_variant: row.get(14)?,
        })
    }

    fn into_experiment(self) -> Result<Experiment, AbtError> {
        Ok(Experiment {
            id: ExperimentId::from_raw(self.id),
            page: PageId::from_raw(self.page_id),
            name: self.name,
            hypothesis: self.hypothesis,
            goal: Goal {
                event: self.goal_event,
                page: self.goal_page_id.map(PageId::from_raw),
            },
            treatment_revision: self.treatment_revision,
            sample_size: self.sample_size as u64,
            status: self.status.parse()?,
            outcome: self
                .outcome
                .as_deref()
                .map(str::parse::<FinishOutcome>)
                .transpose()?,
            created_at: self.created_at,
            first_started_at: self.first_started_at,
            last_started_at: self.last_started_at,
            finished_at: self.finished_at,
            winning_variant: self
                .winning_variant
                .as_deref()
                .map(str::parse::<Variant>)
                .transpose()?,
        })
    }
}

fn query_experiments(
    conn: &Connection,
    clauses: &[&str],
    values: Vec<Value>,
) -> Result<Vec<Experiment>, AbtError> {
    let mut sql = format!("SELECT {EXPERIMENT_COLUMNS} FROM experiments");
    if !clauses.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    sql.push_str(" ORDER BY id");
    let mut stmt = conn
        .prepare(&sql)
        .map_err(|err| store_error("store-query", err))?;
    let rows = stmt
        .query_map(params_from_iter(values), RawExperiment::from_row)
        .map_err(|err| store_error("store-query", err))?;
    let raw = rows
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| store_error("store-query", err))?;
    raw.into_iter().map(RawExperiment::into_experiment).collect()
}

fn load_experiment(conn: &Connection, id: ExperimentId) -> Result<Experiment, AbtError> {
    query_experiments(conn, &["id = ?"], vec![Value::Integer(id.as_raw())])?
        .pop()
        .ok_or_else(|| AbtError::experiment_not_found(id))
}

fn active_on_page(
    conn: &Connection,
    page: PageId,
    except: Option<ExperimentId>,
) -> Result<Option<Experiment>, AbtError> {
    let status_clause = format!("status IN ({})", vec!["?"; Status::ACTIVE.len()].join(", "));
    let mut clauses = vec!["page_id = ?", status_clause.as_str()];
    let mut values = vec![Value::Integer(page.as_raw())];
    values.extend(
        Status::ACTIVE
            .iter()
            .map(|status| Value::Text(status.as_str().to_string())),
    );
    if let Some(id) = except {
        clauses.push("id != ?");
        values.push(Value::Integer(id.as_raw()));
    }
    Ok(query_experiments(conn, &clauses, values)?.into_iter().next())
}

fn require_running(conn: &Connection, id: ExperimentId) -> Result<(), AbtError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM experiments WHERE id = ?1",
            params![id.as_raw()],
            |row| row.get(0),
        )
        .optional()
        .map_err(|err| store_error("store-query", err))?;
    let status: Status = status
        .ok_or_else(|| AbtError::experiment_not_found(id))?
        .parse()?;
    if status != Status::Running {
        return Err(AbtError::not_active(id, status));
    }
    Ok(())
}

fn upsert_bucket(
    conn: &Connection,
    key: &BucketKey,
    delta: BucketDelta,
) -> Result<HourlyLog, AbtError> {
    let (participants, conversions): (i64, i64) = conn
        .query_row(
            "INSERT INTO hourly_logs(experiment_id, variant, date, hour, participants, conversions)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(experiment_id, variant, date, hour) DO UPDATE SET
                 participants = participants + excluded.participants,
                 conversions = conversions + excluded.conversions
             RETURNING participants, conversions",
            params![
                key.experiment.as_raw(),
                key.variant.as_str(),
                key.date,
                i64::from(key.hour),
                delta.participants as i64,
                delta.conversions as i64,
            ],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .map_err(|err| store_error("store-increment", err))?;
    Ok(HourlyLog {
        key: *key,
        participants: participants as u64,
        conversions: conversions as u64,
    })
}

impl ExperimentStore for SqliteStore {
    fn create_experiment(
        &self,
        page: PageId,
        new: &NewExperiment,
        now: DateTime<Utc>,
    ) -> Result<Experiment, AbtError> {
        let sample_size = i64::try_from(new.sample_size)
            .map_err(|_| AbtError::sample_size_too_large(new.sample_size))?;
        let mut conn = self.lock()?;
        let tx = immediate(&mut conn)?;
        if let Some(existing) = active_on_page(&tx, page, None)? {
            return Err(AbtError::duplicate_active(page, existing.id));
        }
        tx.execute(
            "INSERT INTO experiments(page_id, name, hypothesis, goal_event, goal_page_id,
                 treatment_revision, sample_size, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                page.as_raw(),
                &new.name,
                &new.hypothesis,
                &new.goal.event,
                new.goal.page.map(|p| p.as_raw()),
                new.treatment_revision,
                sample_size,
                Status::Draft.as_str(),
                now,
            ],
        )
        .map_err(|err| store_error("store-insert-experiment", err))?;
        let id = ExperimentId::from_raw(tx.last_insert_rowid());
        let experiment = load_experiment(&tx, id)?;
        commit(tx)?;
        Ok(experiment)
    }

    fn experiment(&self, id: ExperimentId) -> Result<Experiment, AbtError> {
        let conn = self.lock()?;
        load_experiment(&conn, id)
    }

    fn list_experiments(&self, filter: &ExperimentFilter) -> Result<Vec<Experiment>, AbtError> {
        let conn = self.lock()?;
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        if let Some(status) = filter.status {
            clauses.push("status = ?");
            values.push(Value::Text(status.as_str().to_string()));
        }
        if let Some(page) = filter.page {
            clauses.push("page_id = ?");
            values.push(Value::Integer(page.as_raw()));
        }
        let mut experiments = query_experiments(&conn, &clauses, values)?;
        experiments.sort_by(report_order);
        Ok(experiments)
    }

    fn active_for_page(&self, page: PageId) -> Result<Option<Experiment>, AbtError> {
        let conn = self.lock()?;
        active_on_page(&conn, page, None)
    }

    fn commit_transition(&self, expected: Status, updated: &Experiment) -> Result<(), AbtError> {
        let mut conn = self.lock()?;
        let tx = immediate(&mut conn)?;
        let current = load_experiment(&tx, updated.id)?;
        if current.status != expected {
            return Err(stale_transition(&current, expected));
        }
        if updated.status == Status::Running {
            if let Some(other) = active_on_page(&tx, updated.page, Some(updated.id))? {
                return Err(AbtError::duplicate_active(updated.page, other.id));
            }
        }
        tx.execute(
            "UPDATE experiments SET status = ?2, outcome = ?3, first_started_at = ?4,
                 last_started_at = ?5, finished_at = ?6, winning_variant = ?7
             WHERE id = ?1",
            params![
                updated.id.as_raw(),
                updated.status.as_str(),
                updated.outcome.map(|o| o.as_str()),
                updated.first_started_at,
                updated.last_started_at,
                updated.finished_at,
                updated.winning_variant.map(|v| v.as_str()),
            ],
        )
        .map_err(|err| store_error("store-update-experiment", err))?;
        commit(tx)
    }

    fn delete_experiment(&self, id: ExperimentId) -> Result<(), AbtError> {
        let conn = self.lock()?;
        let removed = conn
            .execute("DELETE FROM experiments WHERE id = ?1", params![id.as_raw()])
            .map_err(|err| store_error("store-delete-experiment", err))?;
        if removed == 0 {
            return Err(AbtError::experiment_not_found(id));
        }
        Ok(())
    }
}

impl BucketStore for SqliteStore {
    fn increment(&self, key: &BucketKey, delta: BucketDelta) -> Result<HourlyLog, AbtError> {
        let mut conn = self.lock()?;
        let tx = immediate(&mut conn)?;
        require_running(&tx, key.experiment)?;
        let log = upsert_bucket(&tx, key, delta)?;
        commit(tx)?;
        Ok(log)
    }

    fn hourly_logs(&self, experiment: ExperimentId) -> Result<Vec<HourlyLog>, AbtError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT variant, date, hour, participants, conversions FROM hourly_logs
                 WHERE experiment_id = ?1 ORDER BY date, hour, variant",
            )
            .map_err(|err| store_error("store-query", err))?;
        let rows = stmt
            .query_map(params![experiment.as_raw()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, NaiveDate>(1)?,
                    row.get::<_, u8>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                ))
            })
            .map_err(|err| store_error("store-query", err))?;
        let mut logs = Vec::new();
        for row in rows {
            let (variant, date, hour, participants, conversions) =
                row.map_err(|err| store_error("store-query", err))?;
            logs.push(HourlyLog {
                key: BucketKey {
                    experiment,
                    date,
                    hour,
                    variant: variant.parse()?,
                },
                participants: participants as u64,
                conversions: conversions as u64,
            });
        }
        Ok(logs)
    }
}

impl VisitorStore for SqliteStore {
    fn assignment(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
    ) -> Result<Option<Variant>, AbtError> {
        let conn = self.lock()?;
        let variant: Option<String> = conn
            .query_row(
                "SELECT variant FROM assignments WHERE experiment_id = ?1 AND visitor_key = ?2",
                params![experiment.as_raw(), visitor_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|err| store_error("store-query", err))?;
        variant.as_deref().map(str::parse).transpose()
    }

    fn assign_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        proposed: Variant,
        count_participant: bool,
        at: DateTime<Utc>,
    ) -> Result<Assignment, AbtError> {
        let mut conn = self.lock()?;
        let tx = immediate(&mut conn)?;
        require_running(&tx, experiment)?;
        let existing: Option<(String, bool)> = tx
            .query_row(
                "SELECT variant, counted FROM assignments
                 WHERE experiment_id = ?1 AND visitor_key = ?2",
                params![experiment.as_raw(), visitor_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| store_error("store-query", err))?;
        let variant = match existing {
            Some((variant, counted)) if counted || !count_participant => {
                return Ok(Assignment {
                    variant: variant.parse()?,
                    is_new: false,
                });
            }
            Some((variant, _)) => {
                tx.execute(
                    "UPDATE assignments SET counted = 1
                     WHERE experiment_id = ?1 AND visitor_key = ?2",
                    params![experiment.as_raw(), visitor_key],
                )
                .map_err(|err| store_error("store-assign", err))?;
                variant.parse()?
            }
            None => {
                tx.execute(
                    "INSERT INTO assignments(experiment_id, visitor_key, variant, counted)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        experiment.as_raw(),
                        visitor_key,
                        proposed.as_str(),
                        count_participant,
                    ],
                )
                .map_err(|err| store_error("store-assign", err))?;
                proposed
            }
        };
        if count_participant {
            upsert_bucket(
                &tx,
                &BucketKey::at(experiment, variant, at),
                BucketDelta::PARTICIPANT,
            )?;
        }
        commit(tx)?;
        Ok(Assignment {
            variant,
            is_new: true,
        })
    }

    fn convert_visitor(
        &self,
        experiment: ExperimentId,
        visitor_key: &str,
        at: DateTime<Utc>,
    ) -> Result<ConversionOutcome, AbtError> {
        let mut conn = self.lock()?;
        let tx = immediate(&mut conn)?;
        require_running(&tx, experiment)?;
        let record: Option<(String, bool)> = tx
            .query_row(
                "SELECT variant, converted FROM assignments
                 WHERE experiment_id = ?1 AND visitor_key = ?2",
                params![experiment.as_raw(), visitor_key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|err| store_error("store-query", err))?;
        let (variant, converted) = match record {
            None => return Ok(ConversionOutcome::NotAssigned),
            Some((variant, converted)) => (variant.parse::<Variant>()?, converted),
        };
        if converted {
            return Ok(ConversionOutcome::AlreadyConverted(variant));
        }
        tx.execute(
            "UPDATE assignments SET converted = 1 WHERE experiment_id = ?1 AND visitor_key = ?2",
            params![experiment.as_raw(), visitor_key],
        )
        .map_err(|err| store_error("store-convert", err))?;
        upsert_bucket(
            &tx,
            &BucketKey::at(experiment, variant, at),
            BucketDelta::CONVERSION,
        )?;
        commit(tx)?;
        Ok(ConversionOutcome::Recorded(variant))
    }
}
