use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use dictpack_core::{Status, WordListKey, WordListRecord, WordListType, PREINSTALLED_LOCAL_FILENAME};
use rusqlite::{params, Connection, DatabaseName, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::warn;

mod executor;

pub use executor::ActionExecutor;

const LATEST_SCHEMA_VERSION: i64 = 2;

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_WORD_LISTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS word_lists (
  word_list_id TEXT NOT NULL,
  version INTEGER NOT NULL,
  format_version INTEGER NOT NULL DEFAULT 0,
  list_type TEXT NOT NULL DEFAULT 'bulk',
  locale TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  status TEXT NOT NULL,
  local_filename TEXT,
  remote_filename TEXT,
  checksum TEXT NOT NULL DEFAULT '',
  file_size_bytes INTEGER NOT NULL DEFAULT 0,
  last_update_epoch_ms INTEGER NOT NULL DEFAULT 0,
  download_job_id INTEGER,
  flags INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (word_list_id, version)
);

CREATE INDEX IF NOT EXISTS idx_word_lists_status ON word_lists(status);
CREATE INDEX IF NOT EXISTS idx_word_lists_download_job ON word_lists(download_job_id);
";

const MIGRATION_001_DOWNLOAD_JOBS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS download_jobs (
  job_id INTEGER PRIMARY KEY AUTOINCREMENT,
  word_list_id TEXT NOT NULL,
  version INTEGER NOT NULL,
  created_at TEXT NOT NULL
);
";

const MIGRATION_001_CLIENTS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS clients (
  client_id TEXT PRIMARY KEY,
  metadata_uri TEXT NOT NULL DEFAULT '',
  additional_id TEXT NOT NULL DEFAULT '',
  last_sync_epoch_ms INTEGER NOT NULL DEFAULT 0
);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE word_lists ADD COLUMN raw_checksum TEXT NOT NULL DEFAULT '';
ALTER TABLE word_lists ADD COLUMN retry_count INTEGER NOT NULL DEFAULT 2;
";

const WORD_LIST_COLUMNS: &str = "word_list_id, version, format_version, list_type, locale, \
    description, status, local_filename, remote_filename, checksum, raw_checksum, retry_count, \
    file_size_bytes, last_update_epoch_ms, download_job_id, flags";

/// Which catalog a database file backs. Only the default namespace carries the `clients` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreScope {
    DefaultNamespace,
    ClientNamespace,
}

pub struct SqliteStore {
    conn: Connection,
    scope: StoreScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub word_list_rows: i64,
    pub unknown_status_rows: i64,
    pub downloading_without_job: i64,
    pub schema_status: SchemaStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRecord {
    pub client_id: String,
    pub metadata_uri: String,
    pub additional_id: String,
    pub last_sync_epoch_ms: i64,
}

impl SqliteStore {
    /// Open the catalog database of a non-default client namespace.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_scoped(path, StoreScope::ClientNamespace)
    }

    /// Open the default-namespace catalog database, which also holds the `clients` table.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_default_namespace(path: &Path) -> Result<Self> {
        Self::open_scoped(path, StoreScope::DefaultNamespace)
    }

    fn open_scoped(path: &Path, scope: StoreScope) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, scope })
    }

    #[must_use]
    pub fn scope(&self) -> StoreScope {
        self.scope
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

        if self.scope == StoreScope::DefaultNamespace {
            self.conn
                .execute_batch(MIGRATION_001_CLIENTS_SQL)
                .context("failed to apply clients table")?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn bootstrap_schema_version(&mut self) -> Result<i64> {
        if !table_exists(&self.conn, "word_lists")? {
            self.apply_migration_1()?;
            return Ok(1);
        }

        if table_has_column(&self.conn, "word_lists", "raw_checksum")? {
            // Tables already carry the v2 columns but the migration rows are missing.
            self.conn
                .execute_batch(MIGRATION_001_DOWNLOAD_JOBS_SQL)
                .context("failed to apply download_jobs table")?;
            record_schema_version(&self.conn, 1)?;
            record_schema_version(&self.conn, 2)?;
            return Ok(2);
        }

        if table_has_column(&self.conn, "word_lists", "word_list_id")? {
            self.conn
                .execute_batch(MIGRATION_001_DOWNLOAD_JOBS_SQL)
                .context("failed to apply download_jobs table")?;
            record_schema_version(&self.conn, 1)?;
            return Ok(1);
        }

        Err(anyhow!("database schema is invalid: word_lists has no word_list_id column"))
    }

    fn apply_migration_1(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start migration v1 transaction")?;
        tx.execute_batch(MIGRATION_001_WORD_LISTS_SQL).context("failed to apply word_lists table")?;
        tx.execute_batch(MIGRATION_001_DOWNLOAD_JOBS_SQL)
            .context("failed to apply download_jobs table")?;
        if self.scope == StoreScope::DefaultNamespace {
            tx.execute_batch(MIGRATION_001_CLIENTS_SQL).context("failed to apply clients table")?;
        }
        record_schema_version(&tx, 1)?;
        tx.commit().context("failed to commit migration v1")?;
        Ok(())
    }

    fn apply_migration_2(&mut self) -> Result<()> {
        if table_has_column(&self.conn, "word_lists", "raw_checksum")? {
            record_schema_version(&self.conn, 2)?;
            return Ok(());
        }

        let tx = self.conn.transaction().context("failed to start migration v2 transaction")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to add v2 word_lists columns")?;
        record_schema_version(&tx, 2)?;
        tx.commit().context("failed to commit migration v2")?;
        Ok(())
    }

    /// Load the row stored under `(id, version)`.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn get_record(&self, key: &WordListKey) -> Result<Option<WordListRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {WORD_LIST_COLUMNS} FROM word_lists
                     WHERE word_list_id = ?1 AND version = ?2"
                ),
                params![key.id, key.version],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load word list {key}"))
    }

    /// Load the DOWNLOADING row attached to a download job.
    ///
    /// # Errors
    /// Returns an error when the lookup query fails.
    pub fn find_downloading_by_job(&self, job_id: i64) -> Result<Option<WordListRecord>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {WORD_LIST_COLUMNS} FROM word_lists
                     WHERE download_job_id = ?1 AND status = ?2"
                ),
                params![job_id, Status::Downloading.as_str()],
                record_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load word list for download job {job_id}"))
    }

    /// Every row of the catalog, ordered by id then version.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_records(&self) -> Result<Vec<WordListRecord>> {
        self.query_records(
            &format!("SELECT {WORD_LIST_COLUMNS} FROM word_lists ORDER BY word_list_id, version"),
            [],
        )
    }

    /// Every version stored for one id, ordered by version.
    ///
    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_records_for_id(&self, id: &str) -> Result<Vec<WordListRecord>> {
        self.query_records(
            &format!(
                "SELECT {WORD_LIST_COLUMNS} FROM word_lists WHERE word_list_id = ?1 ORDER BY version"
            ),
            params![id],
        )
    }

    /// # Errors
    /// Returns an error when the query or row decoding fails.
    pub fn list_records_with_status(&self, status: Status) -> Result<Vec<WordListRecord>> {
        self.query_records(
            &format!(
                "SELECT {WORD_LIST_COLUMNS} FROM word_lists WHERE status = ?1
                 ORDER BY word_list_id, version"
            ),
            params![status.as_str()],
        )
    }

    fn query_records<P: rusqlite::Params>(&self, sql: &str, values: P) -> Result<Vec<WordListRecord>> {
        let mut stmt = self.conn.prepare(sql).context("failed to prepare word list query")?;
        let rows = stmt.query_map(values, record_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.context("failed to decode word list row")?);
        }
        Ok(out)
    }

    /// Insert a row unless one already exists for its `(id, version)`.
    /// Returns whether a row was written.
    ///
    /// # Errors
    /// Returns an error when the insert fails.
    pub fn insert_record_if_absent(&mut self, record: &WordListRecord) -> Result<bool> {
        let inserted = insert_record(&self.conn, record, "INSERT OR IGNORE")
            .with_context(|| format!("failed to insert word list {}", record.key()))?;
        Ok(inserted > 0)
    }

    /// Overwrite every column of the row sharing `record`'s `(id, version)`.
    /// Returns whether a row was updated.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_record(&mut self, record: &WordListRecord) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE word_lists SET
                    format_version = ?3, list_type = ?4, locale = ?5, description = ?6,
                    status = ?7, local_filename = ?8, remote_filename = ?9, checksum = ?10,
                    raw_checksum = ?11, retry_count = ?12, file_size_bytes = ?13,
                    last_update_epoch_ms = ?14, download_job_id = ?15, flags = ?16
                 WHERE word_list_id = ?1 AND version = ?2",
                params![
                    record.id,
                    record.version,
                    record.format_version,
                    record.list_type.as_str(),
                    record.locale,
                    record.description,
                    record.status.as_str(),
                    record.local_filename,
                    record.remote_filename,
                    record.checksum,
                    record.raw_checksum,
                    record.retry_count,
                    record.file_size_bytes,
                    record.last_update_epoch_ms,
                    record.download_job_id,
                    record.flags,
                ],
            )
            .with_context(|| format!("failed to update word list {}", record.key()))?;
        Ok(updated > 0)
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_record(&mut self, key: &WordListKey) -> Result<bool> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM word_lists WHERE word_list_id = ?1 AND version = ?2",
                params![key.id, key.version],
            )
            .with_context(|| format!("failed to delete word list {key}"))?;
        Ok(deleted > 0)
    }

    /// Allocate a download job id and move the row to DOWNLOADING under it.
    ///
    /// # Errors
    /// Returns an error when the row is missing or any write in the transaction fails.
    pub fn begin_download(&mut self, key: &WordListKey) -> Result<i64> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        tx.execute(
            "INSERT INTO download_jobs(word_list_id, version, created_at) VALUES (?1, ?2, ?3)",
            params![key.id, key.version, now_rfc3339()?],
        )
        .context("failed to allocate download job")?;
        let job_id = tx.last_insert_rowid();

        let updated = tx
            .execute(
                "UPDATE word_lists SET status = ?3, download_job_id = ?4
                 WHERE word_list_id = ?1 AND version = ?2",
                params![key.id, key.version, Status::Downloading.as_str(), job_id],
            )
            .with_context(|| format!("failed to mark {key} as downloading"))?;
        if updated == 0 {
            return Err(anyhow!("word list {key} disappeared before its download started"));
        }

        tx.commit().context("failed to commit download start")?;
        Ok(job_id)
    }

    /// Replace every row sharing `record.id` with `record` in one transaction.
    ///
    /// Returns the local filenames held by the replaced rows. Callers unlink them only after
    /// this returns, so a crash never leaves the catalog pointing at a removed file.
    ///
    /// # Errors
    /// Returns an error when any statement in the transaction fails; nothing is changed then.
    pub fn install_record(&mut self, record: &WordListRecord) -> Result<Vec<String>> {
        let tx = self.conn.transaction().context("failed to start transaction")?;

        let superseded = {
            let mut stmt = tx.prepare(
                "SELECT local_filename, status FROM word_lists
                 WHERE word_list_id = ?1 AND NOT (version = ?2)",
            )?;
            let rows = stmt.query_map(params![record.id, record.version], |row| {
                Ok((row.get::<_, Option<String>>(0)?, row.get::<_, String>(1)?))
            })?;

            let mut filenames = Vec::new();
            for row in rows {
                let (local_filename, status) = row?;
                let holds_payload = Status::parse(&status).is_some_and(Status::holds_payload);
                if let Some(local_filename) = local_filename {
                    if holds_payload
                        && !local_filename.is_empty()
                        && local_filename != PREINSTALLED_LOCAL_FILENAME
                        && Some(&local_filename) != record.local_filename.as_ref()
                    {
                        filenames.push(local_filename);
                    }
                }
            }
            filenames
        };

        tx.execute("DELETE FROM word_lists WHERE word_list_id = ?1", params![record.id])
            .with_context(|| format!("failed to clear rows for {}", record.id))?;
        insert_record(&tx, record, "INSERT")
            .with_context(|| format!("failed to insert installed word list {}", record.key()))?;

        tx.commit().context("failed to commit install")?;
        Ok(superseded)
    }

    /// Drop and recreate the word-list table, discarding the whole catalog.
    ///
    /// # Errors
    /// Returns an error when any statement in the transaction fails.
    pub fn reset_word_lists(&mut self) -> Result<()> {
        let tx = self.conn.transaction().context("failed to start transaction")?;
        tx.execute_batch("DROP TABLE IF EXISTS word_lists;")
            .context("failed to drop word_lists table")?;
        tx.execute_batch(MIGRATION_001_WORD_LISTS_SQL)
            .context("failed to recreate word_lists table")?;
        tx.execute_batch(MIGRATION_002_SQL).context("failed to recreate v2 word_lists columns")?;
        tx.execute("DELETE FROM download_jobs", []).context("failed to clear download jobs")?;
        tx.commit().context("failed to commit word list reset")?;
        Ok(())
    }

    fn require_clients_table(&self) -> Result<()> {
        if self.scope == StoreScope::DefaultNamespace {
            return Ok(());
        }
        Err(anyhow!("the clients table only exists in the default namespace"))
    }

    /// Insert or update the bookkeeping row of a client.
    ///
    /// # Errors
    /// Returns an error when `client_id` is empty, this is not the default namespace, or the
    /// write fails.
    pub fn register_client(
        &mut self,
        client_id: &str,
        metadata_uri: &str,
        additional_id: &str,
    ) -> Result<()> {
        self.require_clients_table()?;
        if client_id.is_empty() {
            return Err(anyhow!("client id MUST be provided"));
        }

        self.conn
            .execute(
                "INSERT INTO clients(client_id, metadata_uri, additional_id, last_sync_epoch_ms)
                 VALUES (?1, ?2, ?3, 0)
                 ON CONFLICT(client_id) DO UPDATE SET
                    metadata_uri = excluded.metadata_uri,
                    additional_id = excluded.additional_id",
                params![client_id, metadata_uri, additional_id],
            )
            .with_context(|| format!("failed to register client {client_id}"))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when this is not the default namespace or the lookup fails.
    pub fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        self.require_clients_table()?;
        self.conn
            .query_row(
                "SELECT client_id, metadata_uri, additional_id, last_sync_epoch_ms
                 FROM clients WHERE client_id = ?1",
                params![client_id],
                client_from_row,
            )
            .optional()
            .with_context(|| format!("failed to load client {client_id}"))
    }

    /// # Errors
    /// Returns an error when this is not the default namespace or the lookup fails.
    pub fn is_client_known(&self, client_id: &str) -> Result<bool> {
        Ok(self.get_client(client_id)?.is_some())
    }

    /// # Errors
    /// Returns an error when this is not the default namespace or the query fails.
    pub fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        self.require_clients_table()?;
        let mut stmt = self
            .conn
            .prepare(
                "SELECT client_id, metadata_uri, additional_id, last_sync_epoch_ms
                 FROM clients ORDER BY client_id",
            )
            .context("failed to prepare client query")?;
        let rows = stmt.query_map([], client_from_row)?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Epoch milliseconds of the last successful metadata sync of a client.
    ///
    /// # Errors
    /// Returns an error when this is not the default namespace or the lookup fails.
    pub fn last_sync_for_client(&self, client_id: &str) -> Result<Option<i64>> {
        Ok(self.get_client(client_id)?.map(|client| client.last_sync_epoch_ms))
    }

    /// Oldest last-sync time across every client that has a metadata source.
    ///
    /// # Errors
    /// Returns an error when this is not the default namespace or the query fails.
    pub fn oldest_sync_time(&self) -> Result<Option<i64>> {
        self.require_clients_table()?;
        self.conn
            .query_row(
                "SELECT MIN(last_sync_epoch_ms) FROM clients WHERE metadata_uri <> ''",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )
            .context("failed to read oldest sync time")
    }

    /// Stamp every client reading from `metadata_uri` as synced at `epoch_ms`.
    /// Returns how many clients were stamped.
    ///
    /// # Errors
    /// Returns an error when this is not the default namespace or the update fails.
    pub fn mark_metadata_synced(&mut self, metadata_uri: &str, epoch_ms: i64) -> Result<usize> {
        self.require_clients_table()?;
        self.conn
            .execute(
                "UPDATE clients SET last_sync_epoch_ms = ?2 WHERE metadata_uri = ?1",
                params![metadata_uri, epoch_ms],
            )
            .with_context(|| format!("failed to mark metadata {metadata_uri} as synced"))
    }

    /// # Errors
    /// Returns an error when this is not the default namespace or the delete fails.
    pub fn remove_client(&mut self, client_id: &str) -> Result<bool> {
        self.require_clients_table()?;
        let deleted = self
            .conn
            .execute("DELETE FROM clients WHERE client_id = ?1", params![client_id])
            .with_context(|| format!("failed to remove client {client_id}"))?;
        Ok(deleted > 0)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(anyhow!("backup file does not exist: {}", in_file.display()));
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()?;
        Ok(())
    }

    /// Run quick-check, catalog consistency checks, and schema status.
    ///
    /// # Errors
    /// Returns an error when any integrity check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let (word_list_rows, unknown_status_rows, downloading_without_job): (i64, i64, i64) =
            if table_exists(&self.conn, "word_lists")? {
                self.conn
                    .query_row(
                        "SELECT
                            COUNT(*),
                            COALESCE(SUM(CASE WHEN status NOT IN (
                                'available', 'downloading', 'installed',
                                'disabled', 'deleting', 'retrying'
                            ) THEN 1 ELSE 0 END), 0),
                            COALESCE(SUM(CASE WHEN status = 'downloading'
                                AND download_job_id IS NULL THEN 1 ELSE 0 END), 0)
                         FROM word_lists",
                        [],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )
                    .context("failed to check word_lists consistency")?
            } else {
                (0, 0, 0)
            };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            word_list_rows,
            unknown_status_rows,
            downloading_without_job,
            schema_status,
        })
    }
}

/// Resolve a stored local filename inside `payload_dir`.
///
/// Returns `None` for the pre-installed placeholder and for names that would escape the
/// payload directory.
#[must_use]
pub fn resolve_payload_path(payload_dir: &Path, local_filename: &str) -> Option<PathBuf> {
    if local_filename.is_empty() || local_filename == PREINSTALLED_LOCAL_FILENAME {
        return None;
    }

    let relative = Path::new(local_filename);
    let confined = relative.components().all(|component| matches!(component, Component::Normal(_)));
    if !confined {
        warn!(local_filename, "refusing payload path outside the payload directory");
        return None;
    }

    Some(payload_dir.join(relative))
}

fn insert_record(conn: &Connection, record: &WordListRecord, verb: &str) -> rusqlite::Result<usize> {
    conn.execute(
        &format!(
            "{verb} INTO word_lists({WORD_LIST_COLUMNS}) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16
            )"
        ),
        params![
            record.id,
            record.version,
            record.format_version,
            record.list_type.as_str(),
            record.locale,
            record.description,
            record.status.as_str(),
            record.local_filename,
            record.remote_filename,
            record.checksum,
            record.raw_checksum,
            record.retry_count,
            record.file_size_bytes,
            record.last_update_epoch_ms,
            record.download_job_id,
            record.flags,
        ],
    )
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<WordListRecord> {
    let id: String = row.get(0)?;
    let version: u32 = row.get(1)?;

    let raw_type: String = row.get(3)?;
    let list_type = WordListType::parse(&raw_type).unwrap_or_else(|| {
        warn!(word_list_id = %id, version, list_type = %raw_type, "unknown word list type");
        WordListType::Bulk
    });
    let raw_status: String = row.get(6)?;
    let status = Status::parse(&raw_status).unwrap_or_else(|| {
        warn!(word_list_id = %id, version, status = %raw_status, "unparseable word list status");
        Status::Unknown
    });

    Ok(WordListRecord {
        id,
        version,
        format_version: row.get(2)?,
        list_type,
        locale: row.get(4)?,
        description: row.get(5)?,
        status,
        local_filename: row.get(7)?,
        remote_filename: row.get(8)?,
        checksum: row.get(9)?,
        raw_checksum: row.get(10)?,
        retry_count: row.get(11)?,
        file_size_bytes: row.get(12)?,
        last_update_epoch_ms: row.get(13)?,
        download_job_id: row.get(14)?,
        flags: row.get(15)?,
    })
}

fn client_from_row(row: &Row<'_>) -> rusqlite::Result<ClientRecord> {
    Ok(ClientRecord {
        client_id: row.get(0)?,
        metadata_uri: row.get(1)?,
        additional_id: row.get(2)?,
        last_sync_epoch_ms: row.get(3)?,
    })
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

    if !table_exists(conn, "word_lists")? {
        return Ok((0, false));
    }

    if table_has_column(conn, "word_lists", "raw_checksum")? {
        return Ok((2, true));
    }

    if table_has_column(conn, "word_lists", "word_list_id")? {
        return Ok((1, true));
    }

    Err(anyhow!("database schema is invalid: word_lists has no word_list_id column"))
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
    OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .context("failed to format RFC3339 timestamp")
}
