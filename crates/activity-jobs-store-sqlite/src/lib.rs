use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use activity_jobs_core::{
    ActivitySummary, Datastore, Entity, EntityKind, JobError, JobReport, Record, RecordMeta,
    RightsRecord, SearchDocument, SearchIndexName, SearchIndexer,
};
use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use tracing::{debug, info};

const LATEST_SCHEMA_VERSION: i64 = 2;

const ENTITIES_FILE: &str = "entities.ndjson";
const JOB_RUNS_FILE: &str = "job_runs.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS records (
  kind TEXT NOT NULL CHECK (kind IN (
    'ExpSummaryModel',
    'CollectionSummaryModel',
    'CollectionRightsSnapshotContentModel',
    'ExplorationRightsSnapshotContentModel',
    'TopicRightsSnapshotContentModel',
    'ExplorationRightsSnapshotMetadataModel',
    'ExplorationCommitLogEntryModel'
  )),
  id TEXT NOT NULL,
  created_on TEXT NOT NULL,
  last_updated TEXT NOT NULL,
  revision INTEGER NOT NULL DEFAULT 0 CHECK (revision >= 0),
  record_json TEXT NOT NULL,
  PRIMARY KEY (kind, id)
);

CREATE TABLE IF NOT EXISTS rights_records (
  kind TEXT NOT NULL CHECK (kind IN (
    'CollectionRightsModel',
    'ExplorationRightsModel',
    'TopicRightsModel'
  )),
  id TEXT NOT NULL,
  created_on TEXT NOT NULL,
  last_updated TEXT NOT NULL,
  revision INTEGER NOT NULL DEFAULT 0 CHECK (revision >= 0),
  rights_json TEXT NOT NULL,
  PRIMARY KEY (kind, id)
);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE rights_records ADD COLUMN all_user_ids_json TEXT NOT NULL DEFAULT '[]';

CREATE TABLE IF NOT EXISTS search_documents (
  index_name TEXT NOT NULL CHECK (index_name IN ('explorations', 'collections')),
  id TEXT NOT NULL,
  rank INTEGER NOT NULL CHECK (rank >= 0),
  indexed_at TEXT NOT NULL,
  document_json TEXT NOT NULL,
  PRIMARY KEY (index_name, id)
);

CREATE TABLE IF NOT EXISTS job_runs (
  run_id TEXT PRIMARY KEY,
  job_name TEXT NOT NULL,
  dry_run INTEGER NOT NULL CHECK (dry_run IN (0, 1)),
  status TEXT NOT NULL CHECK (status IN ('completed', 'completed_with_failures')),
  started_at TEXT NOT NULL,
  finished_at TEXT NOT NULL,
  report_json TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_search_documents_rank
  ON search_documents(index_name, rank DESC, id);
CREATE INDEX IF NOT EXISTS idx_job_runs_started_at ON job_runs(started_at, run_id);
";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub imported_entities: usize,
    pub skipped_existing_entities: usize,
    pub imported_job_runs: usize,
    pub skipped_existing_job_runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_counts: BTreeMap<String, usize>,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexedDocument {
    pub index: SearchIndexName,
    pub indexed_at: String,
    pub document: SearchDocument,
}

/// A persisted job run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredJobReport {
    pub run_id: String,
    #[serde(flatten)]
    pub report: JobReport,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobRunSummary {
    pub run_id: String,
    pub job: String,
    pub dry_run: bool,
    pub status: String,
    pub started_at: String,
    pub finished_at: String,
}

/// Result of a revision-checked update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Written(RecordMeta),
    Missing,
    Stale { found: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Table {
    Records,
    Rights,
}

impl Table {
    fn for_kind(kind: EntityKind) -> Self {
        match kind {
            EntityKind::CollectionRightsModel
            | EntityKind::ExplorationRightsModel
            | EntityKind::TopicRightsModel => Self::Rights,
            _ => Self::Records,
        }
    }

    fn name(self) -> &'static str {
        match self {
            Self::Records => "records",
            Self::Rights => "rights_records",
        }
    }
}

struct RawRow {
    id: String,
    created_on: String,
    last_updated: String,
    revision: i64,
    body: String,
    all_user_ids_json: Option<String>,
}

impl SqliteStore {
    /// Open a SQLite-backed record store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version == 0 {
            version = self.bootstrap_schema_version()?;
        }

        if version < 2 {
            self.apply_migration_2()?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        debug!(version, "schema is current");
        Ok(())
    }

    fn bootstrap_schema_version(&self) -> Result<i64> {
        if !table_exists(&self.conn, "records")? {
            self.conn.execute_batch(MIGRATION_001_SQL).context("failed to apply migration v1")?;
            record_schema_version(&self.conn, 1)?;
            info!(version = 1, "applied schema migration");
            return Ok(1);
        }

        if !table_has_column(&self.conn, "records", "record_json")? {
            return Err(anyhow!("database schema is invalid: records has no record_json column"));
        }

        record_schema_version(&self.conn, 1)?;
        if table_has_column(&self.conn, "rights_records", "all_user_ids_json")? {
            // Tables already in v2 shape but migration rows are missing.
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }
        Ok(1)
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "rights_records", "all_user_ids_json")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to apply migration v2")?;
        tx.execute(
            "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
            params![2_i64, now_rfc3339()?],
        )
        .context("failed to record migration version 2")?;
        tx.commit().context("failed to commit migration v2")?;

        info!(version = 2, "applied schema migration");
        Ok(())
    }

    /// Insert a new record. Fails when a record with the same kind and id exists.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn insert_entity(&mut self, entity: &Entity) -> Result<()> {
        insert_entity_row(&self.conn, entity)
    }

    /// All records of one class ordered by id.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_entities(&self, kind: EntityKind) -> Result<Vec<Entity>> {
        let sql = match Table::for_kind(kind) {
            Table::Records => {
                "SELECT id, created_on, last_updated, revision, record_json, NULL
                 FROM records WHERE kind = ?1 ORDER BY id ASC"
            }
            Table::Rights => {
                "SELECT id, created_on, last_updated, revision, rights_json, all_user_ids_json
                 FROM rights_records WHERE kind = ?1 ORDER BY id ASC"
            }
        };
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(params![kind.as_str()], read_raw_row)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(decode_entity(kind, row?)?);
        }
        Ok(entities)
    }

    /// # Errors
    /// Returns an error when the row cannot be read or decoded.
    pub fn load_entity(&self, kind: EntityKind, id: &str) -> Result<Option<Entity>> {
        let sql = match Table::for_kind(kind) {
            Table::Records => {
                "SELECT id, created_on, last_updated, revision, record_json, NULL
                 FROM records WHERE kind = ?1 AND id = ?2"
            }
            Table::Rights => {
                "SELECT id, created_on, last_updated, revision, rights_json, all_user_ids_json
                 FROM rights_records WHERE kind = ?1 AND id = ?2"
            }
        };
        let row = self
            .conn
            .query_row(sql, params![kind.as_str(), id], read_raw_row)
            .optional()
            .with_context(|| format!("failed to load {kind} {id}"))?;
        row.map(|row| decode_entity(kind, row)).transpose()
    }

    /// Overwrite a record only if its stored revision still matches `entity.meta.revision`.
    ///
    /// # Errors
    /// Returns an error when serialization or the update itself fails.
    pub fn compare_and_swap(
        &mut self,
        entity: &Entity,
        update_last_updated_time: bool,
    ) -> Result<CasOutcome> {
        let kind = entity.kind();
        let meta = entity.meta.next(update_last_updated_time, OffsetDateTime::now_utc());
        let (body, all_user_ids_json) = encode_record(&entity.record)?;
        let last_updated = rfc3339(meta.last_updated)?;
        let new_revision = to_sql_revision(meta.revision)?;
        let expected_revision = to_sql_revision(entity.meta.revision)?;

        let tx = self.conn.transaction().context("failed to start write transaction")?;
        let changed = match Table::for_kind(kind) {
            Table::Records => tx.execute(
                "UPDATE records SET last_updated = ?1, revision = ?2, record_json = ?3
                 WHERE kind = ?4 AND id = ?5 AND revision = ?6",
                params![
                    last_updated,
                    new_revision,
                    body,
                    kind.as_str(),
                    entity.id(),
                    expected_revision
                ],
            ),
            Table::Rights => tx.execute(
                "UPDATE rights_records
                 SET last_updated = ?1, revision = ?2, rights_json = ?3, all_user_ids_json = ?4
                 WHERE kind = ?5 AND id = ?6 AND revision = ?7",
                params![
                    last_updated,
                    new_revision,
                    body,
                    all_user_ids_json.unwrap_or_else(|| "[]".to_string()),
                    kind.as_str(),
                    entity.id(),
                    expected_revision
                ],
            ),
        }
        .with_context(|| format!("failed to update {kind} {}", entity.id()))?;

        let outcome = if changed == 1 {
            CasOutcome::Written(meta)
        } else {
            let found = tx
                .query_row(
                    &format!(
                        "SELECT revision FROM {} WHERE kind = ?1 AND id = ?2",
                        Table::for_kind(kind).name()
                    ),
                    params![kind.as_str(), entity.id()],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            match found {
                Some(found) => CasOutcome::Stale { found: from_sql_revision(found)? },
                None => CasOutcome::Missing,
            }
        };
        tx.commit().context("failed to commit write transaction")?;
        Ok(outcome)
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn entity_exists(&self, kind: EntityKind, id: &str) -> Result<bool> {
        entity_row_exists(&self.conn, kind, id)
    }

    /// Replace the indexed documents with the same ids.
    ///
    /// # Errors
    /// Returns an error when serialization or any write in the transaction fails.
    pub fn upsert_search_documents(
        &mut self,
        index: SearchIndexName,
        documents: &[SearchDocument],
    ) -> Result<()> {
        let indexed_at = now_rfc3339()?;
        let tx = self.conn.transaction().context("failed to start transaction")?;
        for document in documents {
            tx.execute(
                "INSERT INTO search_documents(index_name, id, rank, indexed_at, document_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(index_name, id) DO UPDATE SET
                   rank = excluded.rank,
                   indexed_at = excluded.indexed_at,
                   document_json = excluded.document_json",
                params![
                    index.as_str(),
                    document.id,
                    document.rank,
                    indexed_at,
                    serde_json::to_string(document)
                        .context("failed to serialize search document")?,
                ],
            )
            .with_context(|| format!("failed to index {} into {}", document.id, index.as_str()))?;
        }
        tx.commit().context("failed to commit search documents")?;
        debug!(index = index.as_str(), documents = documents.len(), "indexed documents");
        Ok(())
    }

    /// Indexed documents, highest rank first within each index.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_search_documents(
        &self,
        index: Option<SearchIndexName>,
    ) -> Result<Vec<IndexedDocument>> {
        let mut stmt = self.conn.prepare(
            "SELECT index_name, indexed_at, document_json
             FROM search_documents
             WHERE ?1 IS NULL OR index_name = ?1
             ORDER BY index_name ASC, rank DESC, id ASC",
        )?;
        let rows = stmt.query_map(params![index.map(SearchIndexName::as_str)], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?;

        let mut documents = Vec::new();
        for row in rows {
            let (index_name, indexed_at, document_json) = row?;
            let index = SearchIndexName::parse(&index_name)
                .ok_or_else(|| anyhow!("unknown search index {index_name}"))?;
            let document = serde_json::from_str(&document_json)
                .context("failed to deserialize search document")?;
            documents.push(IndexedDocument { index, indexed_at, document });
        }
        Ok(documents)
    }

    /// Persist a finished job run under `run_id`.
    ///
    /// # Errors
    /// Returns an error when serialization or the insert fails.
    pub fn save_job_report(&mut self, run_id: &str, report: &JobReport) -> Result<()> {
        insert_job_run(&self.conn, run_id, report)
    }

    /// # Errors
    /// Returns an error when lookup or JSON deserialization fails.
    pub fn get_job_report(&self, run_id: &str) -> Result<Option<StoredJobReport>> {
        let value = self
            .conn
            .query_row(
                "SELECT report_json FROM job_runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match value {
            Some(json) => {
                let report =
                    serde_json::from_str(&json).context("failed to deserialize stored job report")?;
                Ok(Some(StoredJobReport { run_id: run_id.to_string(), report }))
            }
            None => Ok(None),
        }
    }

    /// Job runs in start order.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn list_job_reports(&self) -> Result<Vec<JobRunSummary>> {
        let mut stmt = self.conn.prepare(
            "SELECT run_id, job_name, dry_run, status, started_at, finished_at
             FROM job_runs ORDER BY started_at ASC, run_id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(JobRunSummary {
                run_id: row.get(0)?,
                job: row.get(1)?,
                dry_run: row.get::<_, i64>(2)? == 1,
                status: row.get(3)?,
                started_at: row.get(4)?,
                finished_at: row.get(5)?,
            })
        })?;

        let mut runs = Vec::new();
        for row in rows {
            runs.push(row?);
        }
        Ok(runs)
    }

    /// Load raw entity NDJSON (one serialized record per line).
    ///
    /// # Errors
    /// Returns an error when migration, parsing, duplicate handling, or writes fail.
    pub fn import_entities(&mut self, path: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let entities = read_ndjson_file::<Entity>(path)?;
        let mut summary = ImportSummary::default();
        let tx = self.conn.transaction().context("failed to start import transaction")?;
        for entity in &entities {
            if insert_unless_present(&tx, entity, skip_existing)? {
                summary.imported_entities += 1;
            } else {
                summary.skipped_existing_entities += 1;
            }
        }
        tx.commit().context("failed to commit entity import")?;
        info!(
            imported = summary.imported_entities,
            skipped = summary.skipped_existing_entities,
            "imported entities"
        );
        Ok(summary)
    }

    /// Export every record and job run as deterministic NDJSON plus manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let mut entities = Vec::new();
        for kind in EntityKind::ALL {
            entities.extend(self.list_entities(kind)?);
        }
        let mut job_runs = Vec::new();
        for run in self.list_job_reports()? {
            if let Some(stored) = self.get_job_report(&run.run_id)? {
                job_runs.push(stored);
            }
        }

        let entity_digest = write_ndjson_file(&out_dir.join(ENTITIES_FILE), &entities)?;
        let job_run_digest = write_ndjson_file(&out_dir.join(JOB_RUNS_FILE), &job_runs)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![
                ExportFileDigest {
                    path: ENTITIES_FILE.to_string(),
                    sha256: entity_digest.0,
                    records: entity_digest.1,
                },
                ExportFileDigest {
                    path: JOB_RUNS_FILE.to_string(),
                    sha256: job_run_digest.0,
                    records: job_run_digest.1,
                },
            ],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Import an exported snapshot directory into this database.
    ///
    /// # Errors
    /// Returns an error when migration, manifest validation, parsing, duplicate handling, or
    /// writes fail.
    pub fn import_snapshot(&mut self, in_dir: &Path, skip_existing: bool) -> Result<ImportSummary> {
        self.migrate()?;
        let manifest = read_export_manifest(&in_dir.join("manifest.json"))?;
        validate_import_manifest(in_dir, &manifest)?;

        let entities = read_ndjson_file::<Entity>(&in_dir.join(ENTITIES_FILE))?;
        let job_runs = read_ndjson_file::<StoredJobReport>(&in_dir.join(JOB_RUNS_FILE))?;

        // Dropping the transaction on any error rolls back every row written so far.
        let tx = self.conn.transaction().context("failed to start import transaction")?;
        let mut summary = ImportSummary::default();
        for entity in &entities {
            if insert_unless_present(&tx, entity, skip_existing)? {
                summary.imported_entities += 1;
            } else {
                summary.skipped_existing_entities += 1;
            }
        }

        for stored in &job_runs {
            if job_run_exists(&tx, &stored.run_id)? {
                if skip_existing {
                    summary.skipped_existing_job_runs += 1;
                    continue;
                }
                return Err(anyhow!("job run already exists: {}", stored.run_id));
            }
            insert_job_run(&tx, &stored.run_id, &stored.report)?;
            summary.imported_job_runs += 1;
        }
        tx.commit().context("failed to commit snapshot import")?;

        Ok(summary)
    }

    /// Run quick-check, per-table counts, and schema status health probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut record_counts = BTreeMap::new();
        for table in ["records", "rights_records", "search_documents", "job_runs"] {
            if !table_exists(&self.conn, table)? {
                continue;
            }
            let count = self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get::<_, i64>(0)
                })
                .with_context(|| format!("failed to count rows in {table}"))?;
            record_counts.insert(table.to_string(), usize::try_from(count)?);
        }

        let schema_status = self.schema_status()?;
        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_counts,
            schema_status,
        })
    }

}

fn insert_entity_row(conn: &Connection, entity: &Entity) -> Result<()> {
    let kind = entity.kind();
    let (body, all_user_ids_json) = encode_record(&entity.record)?;
    let created_on = rfc3339(entity.meta.created_on)?;
    let last_updated = rfc3339(entity.meta.last_updated)?;
    let revision = to_sql_revision(entity.meta.revision)?;

    match Table::for_kind(kind) {
        Table::Records => conn.execute(
            "INSERT INTO records(kind, id, created_on, last_updated, revision, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![kind.as_str(), entity.id(), created_on, last_updated, revision, body],
        ),
        Table::Rights => conn.execute(
            "INSERT INTO rights_records(
                kind, id, created_on, last_updated, revision, rights_json, all_user_ids_json
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                kind.as_str(),
                entity.id(),
                created_on,
                last_updated,
                revision,
                body,
                all_user_ids_json.unwrap_or_else(|| "[]".to_string()),
            ],
        ),
    }
    .with_context(|| format!("failed to insert {kind} {}", entity.id()))?;
    Ok(())
}

fn entity_row_exists(conn: &Connection, kind: EntityKind, id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {} WHERE kind = ?1 AND id = ?2)",
                Table::for_kind(kind).name()
            ),
            params![kind.as_str(), id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check whether {kind} {id} exists"))?;
    Ok(exists == 1)
}

fn insert_job_run(conn: &Connection, run_id: &str, report: &JobReport) -> Result<()> {
    let status = serde_json::to_value(report.status)
        .context("failed to serialize job status")?
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| anyhow!("job status did not serialize to a string"))?;
    conn.execute(
        "INSERT INTO job_runs(
            run_id, job_name, dry_run, status, started_at, finished_at, report_json
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            run_id,
            report.job,
            i64::from(report.dry_run),
            status,
            rfc3339(report.started_at)?,
            rfc3339(report.finished_at)?,
            serde_json::to_string(report).context("failed to serialize job report")?,
        ],
    )
    .with_context(|| format!("failed to persist job run {run_id}"))?;
    Ok(())
}

fn insert_unless_present(conn: &Connection, entity: &Entity, skip_existing: bool) -> Result<bool> {
    if entity_row_exists(conn, entity.kind(), entity.id())? {
        if skip_existing {
            return Ok(false);
        }
        return Err(anyhow!("record already exists: {} {}", entity.kind(), entity.id()));
    }
    insert_entity_row(conn, entity)?;
    Ok(true)
}

fn job_run_exists(conn: &Connection, run_id: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM job_runs WHERE run_id = ?1)",
            params![run_id],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check whether job run {run_id} exists"))?;
    Ok(exists == 1)
}

fn store_error(err: &anyhow::Error) -> JobError {
    JobError::Store(format!("{err:#}"))
}

impl Datastore for SqliteStore {
    fn scan(&self, kind: EntityKind) -> Result<Vec<Entity>, JobError> {
        self.list_entities(kind).map_err(|err| store_error(&err))
    }

    fn get_by_id(&self, kind: EntityKind, id: &str) -> Result<Entity, JobError> {
        self.load_entity(kind, id)
            .map_err(|err| store_error(&err))?
            .ok_or_else(|| JobError::NotFound { kind, id: id.to_string() })
    }

    fn put(
        &mut self,
        entity: &Entity,
        update_last_updated_time: bool,
    ) -> Result<RecordMeta, JobError> {
        match self
            .compare_and_swap(entity, update_last_updated_time)
            .map_err(|err| store_error(&err))?
        {
            CasOutcome::Written(meta) => Ok(meta),
            CasOutcome::Missing => {
                Err(JobError::NotFound { kind: entity.kind(), id: entity.id().to_string() })
            }
            CasOutcome::Stale { found } => Err(JobError::Conflict {
                kind: entity.kind(),
                id: entity.id().to_string(),
                expected: entity.meta.revision,
                found,
            }),
        }
    }
}

impl SearchIndexer for SqliteStore {
    fn index_exploration_summaries(
        &mut self,
        summaries: &[ActivitySummary],
    ) -> Result<(), JobError> {
        let documents: Vec<SearchDocument> =
            summaries.iter().map(SearchDocument::from_exploration_summary).collect();
        self.upsert_search_documents(SearchIndexName::Explorations, &documents)
            .map_err(|err| JobError::Index(format!("{err:#}")))
    }

    fn index_collection_summaries(
        &mut self,
        summaries: &[ActivitySummary],
    ) -> Result<(), JobError> {
        let documents: Vec<SearchDocument> =
            summaries.iter().map(SearchDocument::from_collection_summary).collect();
        self.upsert_search_documents(SearchIndexName::Collections, &documents)
            .map_err(|err| JobError::Index(format!("{err:#}")))
    }
}

fn read_raw_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        id: row.get(0)?,
        created_on: row.get(1)?,
        last_updated: row.get(2)?,
        revision: row.get(3)?,
        body: row.get(4)?,
        all_user_ids_json: row.get(5)?,
    })
}

/// Split a record into its stored body and, for rights records, the
/// `all_user_ids` column value.
fn encode_record(record: &Record) -> Result<(String, Option<String>)> {
    let Record::Rights(rights) = record else {
        let body = serde_json::to_string(record).context("failed to serialize record")?;
        return Ok((body, None));
    };

    let mut value = serde_json::to_value(rights).context("failed to serialize rights record")?;
    if let Some(fields) = value.get_mut("rights").and_then(Value::as_object_mut) {
        fields.remove("all_user_ids");
    }
    let all_user_ids =
        serde_json::to_string(rights.all_user_ids()).context("failed to serialize user ids")?;
    Ok((value.to_string(), Some(all_user_ids)))
}

fn decode_entity(kind: EntityKind, row: RawRow) -> Result<Entity> {
    let meta = RecordMeta {
        created_on: parse_rfc3339(&row.created_on)?,
        last_updated: parse_rfc3339(&row.last_updated)?,
        revision: from_sql_revision(row.revision)?,
    };

    let record = match row.all_user_ids_json {
        None => serde_json::from_str::<Record>(&row.body)
            .with_context(|| format!("failed to deserialize {kind} {}", row.id))?,
        Some(all_user_ids_json) => {
            let mut value: Value = serde_json::from_str(&row.body)
                .with_context(|| format!("failed to parse {kind} {}", row.id))?;
            let all_user_ids: Value = serde_json::from_str(&all_user_ids_json)
                .with_context(|| format!("failed to parse all_user_ids of {kind} {}", row.id))?;
            let Some(fields) = value.get_mut("rights").and_then(Value::as_object_mut) else {
                return Err(anyhow!("stored rights record {kind} {} has no rights object", row.id));
            };
            fields.insert("all_user_ids".to_string(), all_user_ids);
            let rights: RightsRecord = serde_json::from_value(value)
                .with_context(|| format!("failed to deserialize {kind} {}", row.id))?;
            Record::Rights(rights)
        }
    };

    if record.kind() != kind || record.id() != row.id {
        return Err(anyhow!(
            "stored row {kind} {} holds a {} record with id {}",
            row.id,
            record.kind(),
            record.id()
        ));
    }
    Ok(Entity::new(meta, record))
}

fn to_sql_revision(revision: u64) -> Result<i64> {
    i64::try_from(revision).with_context(|| format!("revision {revision} out of range"))
}

fn from_sql_revision(revision: i64) -> Result<u64> {
    u64::try_from(revision).with_context(|| format!("stored revision {revision} is negative"))
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "records")? {
        return Ok((0, false));
    }

    if !table_has_column(conn, "records", "record_json")? {
        return Err(anyhow!("database schema is invalid: records has no record_json column"));
    }

    if table_has_column(conn, "rights_records", "all_user_ids_json")? {
        return Ok((2, true));
    }
    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    rfc3339(OffsetDateTime::now_utc())
}

fn rfc3339(value: OffsetDateTime) -> Result<String> {
    value
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}

fn parse_rfc3339(value: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .with_context(|| format!("invalid RFC3339 timestamp: {value}"))
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

fn read_ndjson_file<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut values = Vec::new();

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value = serde_json::from_str(trimmed).with_context(|| {
            format!("failed to parse NDJSON row {} from {}", index + 1, path.display())
        })?;
        values.push(value);
    }

    Ok(values)
}

fn read_export_manifest(path: &Path) -> Result<ExportManifest> {
    let bytes = fs::read(path)
        .with_context(|| format!("failed to read manifest file {}", path.display()))?;
    serde_json::from_slice(&bytes)
        .with_context(|| format!("failed to parse manifest JSON {}", path.display()))
}

fn ndjson_digest_and_records(path: &Path) -> Result<(String, usize)> {
    let file = File::open(path)
        .with_context(|| format!("failed to open NDJSON file {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut records = 0_usize;

    for (index, line) in reader.lines().enumerate() {
        let line = line.with_context(|| {
            format!("failed to read line {} from {}", index + 1, path.display())
        })?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
        if !line.trim().is_empty() {
            records += 1;
        }
    }

    Ok((format!("{:x}", hasher.finalize()), records))
}

fn validate_import_manifest(in_dir: &Path, manifest: &ExportManifest) -> Result<()> {
    if manifest.schema_version != LATEST_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported export schema version {}; expected {LATEST_SCHEMA_VERSION}",
            manifest.schema_version
        ));
    }

    let mut by_path: BTreeMap<&str, &ExportFileDigest> = BTreeMap::new();
    for file in &manifest.files {
        if by_path.insert(file.path.as_str(), file).is_some() {
            return Err(anyhow!("manifest contains duplicate file entry: {}", file.path));
        }
    }

    for required in [ENTITIES_FILE, JOB_RUNS_FILE] {
        let Some(expected) = by_path.get(required) else {
            return Err(anyhow!("manifest is missing required file entry: {required}"));
        };
        let file_path = in_dir.join(required);
        if !file_path.exists() {
            return Err(anyhow!("manifest references missing file {}", file_path.display()));
        }

        let (actual_sha256, actual_records) = ndjson_digest_and_records(&file_path)?;
        if actual_sha256 != expected.sha256 {
            return Err(anyhow!(
                "manifest digest mismatch for {required}: expected {}, got {}",
                expected.sha256,
                actual_sha256
            ));
        }
        if actual_records != expected.records {
            return Err(anyhow!(
                "manifest record count mismatch for {required}: expected {}, got {}",
                expected.records,
                actual_records
            ));
        }
    }

    Ok(())
}
