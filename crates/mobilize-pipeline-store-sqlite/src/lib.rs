#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeMap;
use std::path::Path;

use mobilize_pipeline_core::{
    format_rfc3339, now_utc, parse_rfc3339_utc, AssignmentTransition, Contact, ContactType,
    Pipeline, PipelineContact, PipelineError, PipelineType, Stage, StageAssignment,
    StageAssignmentInput, StageCount, StageCountReport, StageHistoryRecord, TypeCompatibility,
};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

const PIPELINE_MIGRATION_VERSION: i64 = 1;
const DEFAULT_BUSY_TIMEOUT_MS: u32 = 5_000;

const SCHEMA_TABLES_V1: &str = r"
CREATE TABLE IF NOT EXISTS contacts (
  contact_id INTEGER PRIMARY KEY AUTOINCREMENT,
  contact_type TEXT NOT NULL CHECK (contact_type IN ('person', 'church')),
  owner TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipelines (
  pipeline_id INTEGER PRIMARY KEY AUTOINCREMENT,
  name TEXT NOT NULL,
  description TEXT,
  pipeline_type TEXT NOT NULL CHECK (pipeline_type IN ('people', 'church')),
  is_main_pipeline INTEGER NOT NULL DEFAULT 0 CHECK (is_main_pipeline IN (0, 1)),
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS pipeline_stages (
  stage_id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id INTEGER NOT NULL REFERENCES pipelines(pipeline_id),
  name TEXT NOT NULL,
  ordinal INTEGER NOT NULL CHECK (ordinal >= 1),
  UNIQUE (pipeline_id, ordinal)
);

CREATE TABLE IF NOT EXISTS pipeline_contacts (
  pipeline_contact_id INTEGER PRIMARY KEY AUTOINCREMENT,
  pipeline_id INTEGER NOT NULL REFERENCES pipelines(pipeline_id),
  contact_id INTEGER NOT NULL REFERENCES contacts(contact_id),
  current_stage_id INTEGER NOT NULL REFERENCES pipeline_stages(stage_id),
  entered_at TEXT NOT NULL,
  last_updated TEXT NOT NULL,
  UNIQUE (pipeline_id, contact_id)
);

CREATE TABLE IF NOT EXISTS pipeline_stage_history (
  history_seq INTEGER PRIMARY KEY AUTOINCREMENT,
  record_id TEXT NOT NULL UNIQUE,
  pipeline_id INTEGER NOT NULL REFERENCES pipelines(pipeline_id),
  contact_id INTEGER NOT NULL REFERENCES contacts(contact_id),
  from_stage_id INTEGER REFERENCES pipeline_stages(stage_id),
  to_stage_id INTEGER NOT NULL REFERENCES pipeline_stages(stage_id),
  moved_by TEXT NOT NULL,
  notes TEXT,
  moved_at TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pipeline_contacts_stage
  ON pipeline_contacts(pipeline_id, current_stage_id);
CREATE INDEX IF NOT EXISTS idx_stage_history_contact
  ON pipeline_stage_history(pipeline_id, contact_id, history_seq);
CREATE INDEX IF NOT EXISTS idx_pipelines_main
  ON pipelines(pipeline_type, is_main_pipeline);
";

// Installed after the created_at drift repair so the backfill UPDATE can
// still run against a legacy table.
const SCHEMA_HISTORY_GUARDS_V1: &str = r"
CREATE TRIGGER IF NOT EXISTS trg_stage_history_no_update
BEFORE UPDATE ON pipeline_stage_history
BEGIN
  SELECT RAISE(FAIL, 'pipeline_stage_history is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_stage_history_no_delete
BEFORE DELETE ON pipeline_stage_history
BEGIN
  SELECT RAISE(FAIL, 'pipeline_stage_history is append-only');
END;
";

const PIPELINE_COLUMNS: &str =
    "pipeline_id, name, description, pipeline_type, is_main_pipeline, created_at";
const STAGE_COLUMNS: &str = "stage_id, pipeline_id, name, ordinal";
const CONTACT_COLUMNS: &str = "contact_id, contact_type, owner, created_at";
const PIPELINE_CONTACT_COLUMNS: &str =
    "pipeline_contact_id, pipeline_id, contact_id, current_stage_id, entered_at, last_updated";
const HISTORY_COLUMNS: &str = "history_seq, record_id, pipeline_id, contact_id, from_stage_id, \
     to_stage_id, moved_by, notes, moved_at, created_at";

/// Outcome of a defensive schema patch. `Failed` is a value, not an error:
/// the caller decides whether the column is required.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EnsureColumn {
    Applied,
    AlreadyPresent,
    Failed { reason: String },
}

pub struct SqlitePipelineStore {
    conn: Connection,
    compatibility: TypeCompatibility,
}

impl SqlitePipelineStore {
    pub fn open(path: &Path, compatibility: TypeCompatibility) -> Result<Self, PipelineError> {
        Self::open_with_busy_timeout(path, compatibility, DEFAULT_BUSY_TIMEOUT_MS)
    }

    /// Opens a store with an explicit lock-wait bound. A writer that still
    /// holds the database past the bound surfaces as [`PipelineError::Timeout`].
    pub fn open_with_busy_timeout(
        path: &Path,
        compatibility: TypeCompatibility,
        busy_timeout_ms: u32,
    ) -> Result<Self, PipelineError> {
        let conn = Connection::open(path).map_err(|err| {
            PipelineError::Storage(format!(
                "failed to open sqlite database at {}: {err}",
                path.display()
            ))
        })?;

        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
        .map_err(|err| map_sqlite_error("failed to configure sqlite pragmas", &err))?;

        Ok(Self {
            conn,
            compatibility,
        })
    }

    #[must_use]
    pub fn compatibility(&self) -> &TypeCompatibility {
        &self.compatibility
    }

    /// Applies the base schema and the drift repairs. Safe to run from every
    /// process start; racing replicas converge on the same schema.
    pub fn migrate(&self) -> Result<(), PipelineError> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .map_err(|err| map_sqlite_error("failed to ensure schema_migrations exists", &err))?;

        self.conn
            .execute_batch(SCHEMA_TABLES_V1)
            .map_err(|err| map_sqlite_error("failed to apply pipeline schema", &err))?;

        // Deployed schemas predating the history fix lack created_at; the
        // engine cannot write correct history without it.
        match self.ensure_column("pipeline_stage_history", "created_at", "TEXT") {
            EnsureColumn::Applied | EnsureColumn::AlreadyPresent => {}
            EnsureColumn::Failed { reason } => {
                tracing::warn!(
                    table = "pipeline_stage_history",
                    column = "created_at",
                    reason = %reason,
                    "required column repair failed"
                );
                return Err(PipelineError::SchemaDrift {
                    table: "pipeline_stage_history".to_string(),
                    column: "created_at".to_string(),
                });
            }
        }
        self.backfill_history_created_at()?;

        // notes is optional; a failed repair degrades to history without
        // operator notes.
        if let EnsureColumn::Failed { reason } =
            self.ensure_column("pipeline_stage_history", "notes", "TEXT")
        {
            tracing::warn!(
                table = "pipeline_stage_history",
                column = "notes",
                reason = %reason,
                "optional column repair failed; proceeding without notes"
            );
        }

        self.conn
            .execute_batch(SCHEMA_HISTORY_GUARDS_V1)
            .map_err(|err| map_sqlite_error("failed to install history guards", &err))?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![PIPELINE_MIGRATION_VERSION, now],
            )
            .map_err(|err| map_sqlite_error("failed to register schema migration", &err))?;

        Ok(())
    }

    pub fn has_column(&self, table: &str, column: &str) -> Result<bool, PipelineError> {
        if !valid_identifier(table) || !valid_identifier(column) {
            return Err(PipelineError::Validation(format!(
                "invalid identifier: {table}.{column}"
            )));
        }

        let mut stmt = self
            .conn
            .prepare(&format!("PRAGMA table_info({table})"))
            .map_err(|err| {
                map_sqlite_error(&format!("failed to inspect table_info for {table}"), &err)
            })?;
        let mut rows = stmt
            .query([])
            .map_err(|err| map_sqlite_error("failed to query table_info", &err))?;

        while let Some(row) = rows
            .next()
            .map_err(|err| map_sqlite_error("failed to read table_info row", &err))?
        {
            let name: String = row
                .get(1)
                .map_err(|err| map_sqlite_error("failed to read column name", &err))?;
            if name == column {
                return Ok(true);
            }
        }

        Ok(false)
    }

    /// Idempotent defensive column patch. A duplicate-column error from a
    /// racing process start is `AlreadyPresent`, not `Failed`.
    pub fn ensure_column(&self, table: &str, column: &str, definition: &str) -> EnsureColumn {
        match self.has_column(table, column) {
            Ok(true) => return EnsureColumn::AlreadyPresent,
            Ok(false) => {}
            Err(err) => {
                return EnsureColumn::Failed {
                    reason: err.to_string(),
                }
            }
        }

        let alter = format!("ALTER TABLE {table} ADD COLUMN {column} {definition}");
        match self.conn.execute_batch(&alter) {
            Ok(()) => EnsureColumn::Applied,
            Err(err) if is_duplicate_column_error(&err) => EnsureColumn::AlreadyPresent,
            Err(err) => EnsureColumn::Failed {
                reason: err.to_string(),
            },
        }
    }

    fn backfill_history_created_at(&self) -> Result<(), PipelineError> {
        self.conn
            .execute(
                "UPDATE pipeline_stage_history
                 SET created_at = moved_at
                 WHERE created_at IS NULL AND moved_at IS NOT NULL",
                [],
            )
            .map_err(|err| map_sqlite_error("failed to backfill created_at from moved_at", &err))?;

        let now = format_rfc3339(now_utc())?;
        self.conn
            .execute(
                "UPDATE pipeline_stage_history SET created_at = ?1 WHERE created_at IS NULL",
                params![now],
            )
            .map_err(|err| map_sqlite_error("failed to default created_at", &err))?;

        Ok(())
    }

    pub fn create_pipeline(
        &self,
        name: &str,
        description: Option<&str>,
        pipeline_type: PipelineType,
        is_main_pipeline: bool,
    ) -> Result<Pipeline, PipelineError> {
        if name.trim().is_empty() {
            return Err(PipelineError::Validation(
                "pipeline name MUST be provided".to_string(),
            ));
        }

        let created_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO pipelines(name, description, pipeline_type, is_main_pipeline, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    name,
                    description,
                    pipeline_type.as_str(),
                    i64::from(is_main_pipeline),
                    format_rfc3339(created_at)?,
                ],
            )
            .map_err(|err| map_sqlite_error("failed to insert pipeline", &err))?;

        Ok(Pipeline {
            pipeline_id: self.conn.last_insert_rowid(),
            name: name.to_string(),
            description: description.map(ToString::to_string),
            pipeline_type,
            is_main_pipeline,
            created_at,
        })
    }

    pub fn add_stage(
        &self,
        pipeline_id: i64,
        name: &str,
        ordinal: i64,
    ) -> Result<Stage, PipelineError> {
        if name.trim().is_empty() {
            return Err(PipelineError::Validation(
                "stage name MUST be provided".to_string(),
            ));
        }
        if ordinal < 1 {
            return Err(PipelineError::Validation(
                "stage ordinal MUST be >= 1".to_string(),
            ));
        }

        let _ = self.get_pipeline(pipeline_id)?;

        let insert = self.conn.execute(
            "INSERT INTO pipeline_stages(pipeline_id, name, ordinal) VALUES (?1, ?2, ?3)",
            params![pipeline_id, name, ordinal],
        );
        match insert {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err, "pipeline_stages") => {
                return Err(PipelineError::Validation(format!(
                    "ordinal {ordinal} is already used in pipeline {pipeline_id}"
                )));
            }
            Err(err) => return Err(map_sqlite_error("failed to insert stage", &err)),
        }

        Ok(Stage {
            stage_id: self.conn.last_insert_rowid(),
            pipeline_id,
            name: name.to_string(),
            ordinal,
        })
    }

    pub fn register_contact(
        &self,
        contact_type: ContactType,
        owner: &str,
    ) -> Result<Contact, PipelineError> {
        if owner.trim().is_empty() {
            return Err(PipelineError::Validation(
                "contact owner MUST be provided".to_string(),
            ));
        }

        let created_at = now_utc();
        self.conn
            .execute(
                "INSERT INTO contacts(contact_type, owner, created_at) VALUES (?1, ?2, ?3)",
                params![contact_type.as_str(), owner, format_rfc3339(created_at)?],
            )
            .map_err(|err| map_sqlite_error("failed to insert contact", &err))?;

        Ok(Contact {
            contact_id: self.conn.last_insert_rowid(),
            contact_type,
            owner: owner.to_string(),
            created_at,
        })
    }

    pub fn list_pipelines(&self) -> Result<Vec<Pipeline>, PipelineError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PIPELINE_COLUMNS} FROM pipelines ORDER BY pipeline_id ASC"
            ))
            .map_err(|err| map_sqlite_error("failed to prepare pipeline listing", &err))?;

        let rows = stmt
            .query_map([], parse_pipeline_row)
            .map_err(|err| map_sqlite_error("failed to list pipelines", &err))?;

        collect_rows(rows)
    }

    pub fn get_pipeline(&self, pipeline_id: i64) -> Result<Pipeline, PipelineError> {
        pipeline_by_id(&self.conn, pipeline_id)?.ok_or(PipelineError::NotFound {
            entity: "pipeline",
            id: pipeline_id,
        })
    }

    pub fn get_contact(&self, contact_id: i64) -> Result<Contact, PipelineError> {
        contact_by_id(&self.conn, contact_id)?.ok_or(PipelineError::NotFound {
            entity: "contact",
            id: contact_id,
        })
    }

    pub fn stages_of(&self, pipeline_id: i64) -> Result<Vec<Stage>, PipelineError> {
        stages_of_pipeline(&self.conn, pipeline_id)
    }

    /// Lowest-ordinal stage; the default destination when a contact enters a
    /// pipeline without an explicit target.
    pub fn first_stage(&self, pipeline_id: i64) -> Result<Option<Stage>, PipelineError> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {STAGE_COLUMNS} FROM pipeline_stages
                 WHERE pipeline_id = ?1
                 ORDER BY ordinal ASC
                 LIMIT 1"
            ))
            .map_err(|err| map_sqlite_error("failed to prepare first-stage lookup", &err))?;

        stmt.query_row(params![pipeline_id], parse_stage_row)
            .optional()
            .map_err(|err| map_sqlite_error("failed to query first stage", &err))
    }

    /// Moves a contact to a stage as one read-modify-write transaction.
    ///
    /// Entry (no prior assignment) appends a history record with a null
    /// from-stage; re-assignment to the current stage is an idempotent no-op
    /// with no history row.
    pub fn assign_stage(
        &mut self,
        input: &StageAssignmentInput,
    ) -> Result<StageAssignment, PipelineError> {
        input.validate()?;
        let moved_at = input.moved_at.unwrap_or_else(now_utc);

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|err| map_sqlite_error("failed to start assignment transaction", &err))?;

        let pipeline = pipeline_by_id(&tx, input.pipeline_id)?.ok_or(PipelineError::NotFound {
            entity: "pipeline",
            id: input.pipeline_id,
        })?;

        let stage = stage_by_id(&tx, input.target_stage_id)?;
        let stage = match stage {
            Some(value) if value.pipeline_id == input.pipeline_id => value,
            _ => {
                return Err(PipelineError::StageNotFound {
                    stage_id: input.target_stage_id,
                    pipeline_id: input.pipeline_id,
                })
            }
        };

        let contact = contact_by_id(&tx, input.contact_id)?.ok_or(PipelineError::NotFound {
            entity: "contact",
            id: input.contact_id,
        })?;

        let expected = self
            .compatibility
            .pipeline_type_for(contact.contact_type)
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "contact type '{}' is absent from the compatibility table",
                    contact.contact_type
                ))
            })?;
        if expected != pipeline.pipeline_type {
            return Err(PipelineError::ContactTypeMismatch {
                contact_type: contact.contact_type,
                pipeline_type: pipeline.pipeline_type,
            });
        }

        let existing = pipeline_contact_by_key(&tx, input.pipeline_id, input.contact_id)?;

        let (pipeline_contact, transition, history_seq) = match existing {
            None => {
                let now = now_utc();
                let insert = tx.execute(
                    "INSERT INTO pipeline_contacts(
                        pipeline_id, contact_id, current_stage_id, entered_at, last_updated
                     ) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        input.pipeline_id,
                        input.contact_id,
                        stage.stage_id,
                        format_rfc3339(now)?,
                        format_rfc3339(now)?,
                    ],
                );
                match insert {
                    Ok(_) => {}
                    Err(err) if is_unique_violation(&err, "pipeline_contacts") => {
                        // Another writer completed the first assignment
                        // between our read and write.
                        return Err(PipelineError::ConcurrentModification);
                    }
                    Err(err) => {
                        return Err(map_sqlite_error("failed to insert pipeline contact", &err))
                    }
                }

                let pipeline_contact = PipelineContact {
                    pipeline_contact_id: tx.last_insert_rowid(),
                    pipeline_id: input.pipeline_id,
                    contact_id: input.contact_id,
                    current_stage_id: stage.stage_id,
                    entered_at: now,
                    last_updated: now,
                };
                let history_seq = append_history(
                    &tx,
                    input.pipeline_id,
                    input.contact_id,
                    None,
                    stage.stage_id,
                    &input.moved_by,
                    input.notes.as_deref(),
                    moved_at,
                )?;
                (
                    pipeline_contact,
                    AssignmentTransition::Entered,
                    Some(history_seq),
                )
            }
            Some(current) if current.current_stage_id == stage.stage_id => {
                (current, AssignmentTransition::Unchanged, None)
            }
            Some(current) => {
                let now = now_utc();
                let updated = tx
                    .execute(
                        "UPDATE pipeline_contacts
                         SET current_stage_id = ?1, last_updated = ?2
                         WHERE pipeline_contact_id = ?3 AND last_updated = ?4",
                        params![
                            stage.stage_id,
                            format_rfc3339(now)?,
                            current.pipeline_contact_id,
                            format_rfc3339(current.last_updated)?,
                        ],
                    )
                    .map_err(|err| map_sqlite_error("failed to update pipeline contact", &err))?;
                if updated == 0 {
                    return Err(PipelineError::ConcurrentModification);
                }

                let history_seq = append_history(
                    &tx,
                    input.pipeline_id,
                    input.contact_id,
                    Some(current.current_stage_id),
                    stage.stage_id,
                    &input.moved_by,
                    input.notes.as_deref(),
                    moved_at,
                )?;
                let pipeline_contact = PipelineContact {
                    current_stage_id: stage.stage_id,
                    last_updated: now,
                    ..current
                };
                (
                    pipeline_contact,
                    AssignmentTransition::Moved,
                    Some(history_seq),
                )
            }
        };

        tx.commit()
            .map_err(|err| map_sqlite_error("failed to commit assignment transaction", &err))?;

        Ok(StageAssignment {
            pipeline_contact,
            transition,
            history_seq,
        })
    }

    /// Re-executes the whole read-modify-write from scratch on a lost race,
    /// up to `attempts` times. Caller errors propagate immediately.
    pub fn assign_stage_with_retry(
        &mut self,
        input: &StageAssignmentInput,
        attempts: u32,
    ) -> Result<StageAssignment, PipelineError> {
        let attempts = attempts.max(1);
        let mut last_error = PipelineError::ConcurrentModification;

        for _ in 0..attempts {
            match self.assign_stage(input) {
                Err(err) if err.is_retryable() => last_error = err,
                other => return other,
            }
        }

        Err(last_error)
    }

    /// Places a contact at the pipeline's first stage; the intake path for
    /// newly created contacts.
    pub fn enter_pipeline(
        &mut self,
        contact_id: i64,
        pipeline_id: i64,
        moved_by: &str,
    ) -> Result<StageAssignment, PipelineError> {
        let first = self.first_stage(pipeline_id)?.ok_or_else(|| {
            PipelineError::Validation(format!("pipeline {pipeline_id} has no stages"))
        })?;

        self.assign_stage(&StageAssignmentInput {
            contact_id,
            pipeline_id,
            target_stage_id: first.stage_id,
            moved_by: moved_by.to_string(),
            notes: None,
            moved_at: None,
        })
    }

    /// Per-stage assignment counts. Every stage of the pipeline is present in
    /// the result, zeros included, so dashboards can render every column.
    pub fn count_by_stage(&self, pipeline_id: i64) -> Result<BTreeMap<i64, u64>, PipelineError> {
        let pipeline = self.get_pipeline(pipeline_id)?;
        let stages = self.stages_of(pipeline_id)?;

        let mut counts: BTreeMap<i64, u64> =
            stages.iter().map(|stage| (stage.stage_id, 0)).collect();

        let contact_types = self.compatibility.contact_types_for(pipeline.pipeline_type);
        if contact_types.is_empty() {
            tracing::warn!(
                pipeline_id,
                pipeline_type = %pipeline.pipeline_type,
                "no contact type maps to this pipeline type; counts are zero"
            );
            return Ok(counts);
        }

        // The join goes through the compatibility table, never string
        // equality: contact rows say 'person' while the pipeline says
        // 'people', and an equality join reports zero for a populated stage.
        let mut sql = String::from(
            "SELECT pc.current_stage_id, COUNT(*)
             FROM pipeline_contacts pc
             JOIN contacts c ON c.contact_id = pc.contact_id
             WHERE pc.pipeline_id = ?1 AND c.contact_type IN (",
        );
        for index in 0..contact_types.len() {
            if index > 0 {
                sql.push_str(", ");
            }
            sql.push_str(&format!("?{}", index + 2));
        }
        sql.push_str(") GROUP BY pc.current_stage_id");

        let mut values: Vec<rusqlite::types::Value> =
            vec![rusqlite::types::Value::Integer(pipeline_id)];
        values.extend(
            contact_types
                .iter()
                .map(|contact_type| rusqlite::types::Value::from(contact_type.as_str().to_string())),
        );

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| map_sqlite_error("failed to prepare stage counts", &err))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(values), |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|err| map_sqlite_error("failed to query stage counts", &err))?;

        for row in rows {
            let (stage_id, count) =
                row.map_err(|err| map_sqlite_error("failed to read stage count row", &err))?;
            let count = u64::try_from(count)
                .map_err(|_| PipelineError::Storage(format!("invalid stage count: {count}")))?;
            counts.insert(stage_id, count);
        }

        Ok(counts)
    }

    pub fn count_total(&self, pipeline_id: i64) -> Result<u64, PipelineError> {
        let counts = self.count_by_stage(pipeline_id)?;
        Ok(counts.values().sum())
    }

    /// Chart-ready counts in stage order for the rendering layer.
    pub fn stage_count_report(&self, pipeline_id: i64) -> Result<StageCountReport, PipelineError> {
        let pipeline = self.get_pipeline(pipeline_id)?;
        let stages = self.stages_of(pipeline_id)?;
        let counts = self.count_by_stage(pipeline_id)?;

        let stage_counts: Vec<StageCount> = stages
            .into_iter()
            .map(|stage| {
                let count = counts.get(&stage.stage_id).copied().unwrap_or(0);
                StageCount {
                    stage_id: stage.stage_id,
                    name: stage.name,
                    ordinal: stage.ordinal,
                    count,
                }
            })
            .collect();
        let total = stage_counts.iter().map(|stage| stage.count).sum();

        Ok(StageCountReport {
            pipeline_id,
            pipeline_name: pipeline.name,
            total,
            stages: stage_counts,
        })
    }

    /// Designated default pipeline for a contact type. Duplicate main flags
    /// are a data-integrity violation, not a failure: the lowest id wins and
    /// a consistency warning is logged, because new-contact intake depends on
    /// always getting an answer.
    pub fn resolve_main_pipeline(
        &self,
        contact_type: ContactType,
    ) -> Result<Option<Pipeline>, PipelineError> {
        let pipeline_type = self
            .compatibility
            .pipeline_type_for(contact_type)
            .ok_or_else(|| {
                PipelineError::Configuration(format!(
                    "contact type '{contact_type}' is absent from the compatibility table"
                ))
            })?;

        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {PIPELINE_COLUMNS} FROM pipelines
                 WHERE pipeline_type = ?1 AND is_main_pipeline = 1
                 ORDER BY pipeline_id ASC"
            ))
            .map_err(|err| map_sqlite_error("failed to prepare main-pipeline lookup", &err))?;
        let rows = stmt
            .query_map(params![pipeline_type.as_str()], parse_pipeline_row)
            .map_err(|err| map_sqlite_error("failed to query main pipelines", &err))?;

        let candidates = collect_rows(rows)?;
        if candidates.len() > 1 {
            let contenders: Vec<i64> = candidates
                .iter()
                .map(|pipeline| pipeline.pipeline_id)
                .collect();
            tracing::warn!(
                pipeline_type = %pipeline_type,
                ?contenders,
                winner = contenders[0],
                "multiple pipelines flagged as main for one type; picking lowest id"
            );
        }

        Ok(candidates.into_iter().next())
    }

    /// Transition log for one contact in one pipeline, oldest first.
    pub fn history_for(
        &self,
        contact_id: i64,
        pipeline_id: i64,
        limit: Option<usize>,
    ) -> Result<Vec<StageHistoryRecord>, PipelineError> {
        let mut sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM pipeline_stage_history
             WHERE contact_id = ?1 AND pipeline_id = ?2
             ORDER BY history_seq ASC"
        );
        if let Some(raw_limit) = limit {
            sql.push_str(" LIMIT ");
            sql.push_str(&raw_limit.to_string());
        }

        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|err| map_sqlite_error("failed to prepare history listing", &err))?;
        let rows = stmt
            .query_map(params![contact_id, pipeline_id], parse_history_row)
            .map_err(|err| map_sqlite_error("failed to query stage history", &err))?;

        collect_rows(rows)
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

fn pipeline_by_id(conn: &Connection, pipeline_id: i64) -> Result<Option<Pipeline>, PipelineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PIPELINE_COLUMNS} FROM pipelines WHERE pipeline_id = ?1"
        ))
        .map_err(|err| map_sqlite_error("failed to prepare pipeline lookup", &err))?;

    stmt.query_row(params![pipeline_id], parse_pipeline_row)
        .optional()
        .map_err(|err| map_sqlite_error("failed to query pipeline", &err))
}

fn stage_by_id(conn: &Connection, stage_id: i64) -> Result<Option<Stage>, PipelineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STAGE_COLUMNS} FROM pipeline_stages WHERE stage_id = ?1"
        ))
        .map_err(|err| map_sqlite_error("failed to prepare stage lookup", &err))?;

    stmt.query_row(params![stage_id], parse_stage_row)
        .optional()
        .map_err(|err| map_sqlite_error("failed to query stage", &err))
}

fn contact_by_id(conn: &Connection, contact_id: i64) -> Result<Option<Contact>, PipelineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CONTACT_COLUMNS} FROM contacts WHERE contact_id = ?1"
        ))
        .map_err(|err| map_sqlite_error("failed to prepare contact lookup", &err))?;

    stmt.query_row(params![contact_id], parse_contact_row)
        .optional()
        .map_err(|err| map_sqlite_error("failed to query contact", &err))
}

fn stages_of_pipeline(conn: &Connection, pipeline_id: i64) -> Result<Vec<Stage>, PipelineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {STAGE_COLUMNS} FROM pipeline_stages
             WHERE pipeline_id = ?1
             ORDER BY ordinal ASC"
        ))
        .map_err(|err| map_sqlite_error("failed to prepare stage listing", &err))?;
    let rows = stmt
        .query_map(params![pipeline_id], parse_stage_row)
        .map_err(|err| map_sqlite_error("failed to list stages", &err))?;

    collect_rows(rows)
}

fn pipeline_contact_by_key(
    conn: &Connection,
    pipeline_id: i64,
    contact_id: i64,
) -> Result<Option<PipelineContact>, PipelineError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {PIPELINE_CONTACT_COLUMNS} FROM pipeline_contacts
             WHERE pipeline_id = ?1 AND contact_id = ?2"
        ))
        .map_err(|err| map_sqlite_error("failed to prepare assignment lookup", &err))?;

    stmt.query_row(params![pipeline_id, contact_id], parse_pipeline_contact_row)
        .optional()
        .map_err(|err| map_sqlite_error("failed to query pipeline contact", &err))
}

#[allow(clippy::too_many_arguments)]
fn append_history(
    conn: &Connection,
    pipeline_id: i64,
    contact_id: i64,
    from_stage_id: Option<i64>,
    to_stage_id: i64,
    moved_by: &str,
    notes: Option<&str>,
    moved_at: time::OffsetDateTime,
) -> Result<i64, PipelineError> {
    // created_at is populated on every append; the backfill in migrate only
    // repairs rows written by deployments that predate the column.
    conn.execute(
        "INSERT INTO pipeline_stage_history(
            record_id, pipeline_id, contact_id, from_stage_id, to_stage_id,
            moved_by, notes, moved_at, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            Ulid::new().to_string(),
            pipeline_id,
            contact_id,
            from_stage_id,
            to_stage_id,
            moved_by,
            notes,
            format_rfc3339(moved_at)?,
            format_rfc3339(now_utc())?,
        ],
    )
    .map_err(|err| map_sqlite_error("failed to append stage history", &err))?;

    Ok(conn.last_insert_rowid())
}

fn parse_pipeline_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Pipeline> {
    let pipeline_type_raw: String = row.get(3)?;
    let pipeline_type = PipelineType::parse(&pipeline_type_raw)
        .ok_or_else(|| from_sql_error(3, format!("invalid pipeline_type: {pipeline_type_raw}")))?;

    Ok(Pipeline {
        pipeline_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        pipeline_type,
        is_main_pipeline: row.get::<_, i64>(4)? == 1,
        created_at: parse_timestamp_column(row, 5)?,
    })
}

fn parse_stage_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Stage> {
    Ok(Stage {
        stage_id: row.get(0)?,
        pipeline_id: row.get(1)?,
        name: row.get(2)?,
        ordinal: row.get(3)?,
    })
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    let contact_type_raw: String = row.get(1)?;
    let contact_type = ContactType::parse(&contact_type_raw)
        .ok_or_else(|| from_sql_error(1, format!("invalid contact_type: {contact_type_raw}")))?;

    Ok(Contact {
        contact_id: row.get(0)?,
        contact_type,
        owner: row.get(2)?,
        created_at: parse_timestamp_column(row, 3)?,
    })
}

fn parse_pipeline_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PipelineContact> {
    Ok(PipelineContact {
        pipeline_contact_id: row.get(0)?,
        pipeline_id: row.get(1)?,
        contact_id: row.get(2)?,
        current_stage_id: row.get(3)?,
        entered_at: parse_timestamp_column(row, 4)?,
        last_updated: parse_timestamp_column(row, 5)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StageHistoryRecord> {
    let record_id_raw: String = row.get(1)?;
    let record_id = Ulid::from_string(&record_id_raw)
        .map_err(|_| from_sql_error(1, format!("invalid record_id ULID: {record_id_raw}")))?;

    Ok(StageHistoryRecord {
        history_seq: row.get(0)?,
        record_id,
        pipeline_id: row.get(2)?,
        contact_id: row.get(3)?,
        from_stage_id: row.get(4)?,
        to_stage_id: row.get(5)?,
        moved_by: row.get(6)?,
        notes: row.get(7)?,
        moved_at: parse_timestamp_column(row, 8)?,
        created_at: parse_timestamp_column(row, 9)?,
    })
}

fn parse_timestamp_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> rusqlite::Result<time::OffsetDateTime> {
    let raw: String = row.get(index)?;
    parse_rfc3339_utc(&raw).map_err(|err| from_sql_error(index, err.to_string()))
}

fn from_sql_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>, PipelineError> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row.map_err(|err| map_sqlite_error("failed to read result row", &err))?);
    }
    Ok(values)
}

fn map_sqlite_error(context: &str, err: &rusqlite::Error) -> PipelineError {
    if let rusqlite::Error::SqliteFailure(inner, _) = err {
        if inner.code == rusqlite::ErrorCode::DatabaseBusy
            || inner.code == rusqlite::ErrorCode::DatabaseLocked
        {
            return PipelineError::Timeout;
        }
    }
    PipelineError::Storage(format!("{context}: {err}"))
}

fn is_unique_violation(err: &rusqlite::Error, table: &str) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, Some(message)) => {
            inner.code == rusqlite::ErrorCode::ConstraintViolation && message.contains(table)
        }
        _ => false,
    }
}

fn is_duplicate_column_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(_, Some(message)) => {
            message.contains("duplicate column name")
        }
        _ => false,
    }
}

fn valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|character| character.is_ascii_alphanumeric() || character == '_')
}
