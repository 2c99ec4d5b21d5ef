use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use dictpack_core::{
    complete_with_defaults, plan_reconciliation, prepare_remote_feed, select_for_locale, Action,
    BatchReport, CatalogError, ClientWordListFields, LogProblemReporter, ProblemReporter,
    PublicWordList, ReconcileOptions, RemoteWordList, ResolvedWordList, Status,
    StrictProblemReporter, WordListKey, WordListRecord,
};
use dictpack_store_sqlite::{resolve_payload_path, ActionExecutor, SqliteStore};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{error, info, warn};

mod protocol;
mod registry;

pub use protocol::{CatalogRoute, ProtocolVersion};
pub use dictpack_store_sqlite::{ClientRecord, IntegrityReport, SchemaStatus};
pub use registry::{CatalogConfig, CatalogRegistry, ClientCatalog, DEFAULT_CLIENT_ID};

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub client_id: String,
    pub dry_run: bool,
    pub planned: Vec<Action>,
    pub report: Option<BatchReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingDownload {
    pub job_id: i64,
    pub word_list_id: String,
    pub version: u32,
    pub locale: String,
    pub remote_filename: String,
    pub checksum: String,
    pub raw_checksum: String,
    pub file_size_bytes: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DownloadOutcome {
    Succeeded { local_filename: String },
    Failed { reason: String },
}

/// User-facing state request for one word list.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MarkRequest {
    Used,
    Unused,
    Deleting,
    Deleted,
}

impl MarkRequest {
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "used" => Some(Self::Used),
            "unused" => Some(Self::Unused),
            "deleting" => Some(Self::Deleting),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientRegistration {
    #[serde(default)]
    pub metadata_uri: String,
    #[serde(default)]
    pub additional_id: String,
}

/// What an open-payload request resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadHandle {
    /// The word list is being deleted; the consumer should overwrite its copy with nothing.
    Empty,
    File(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "items", rename_all = "snake_case")]
pub enum QueryResult {
    WordLists(Vec<PublicWordList>),
    Resolved(Vec<ResolvedWordList>),
    Client(Option<ClientRecord>),
}

/// Serving facade over every client catalog.
#[derive(Clone)]
pub struct CatalogService {
    registry: Arc<CatalogRegistry>,
}

impl CatalogService {
    #[must_use]
    pub fn new(registry: Arc<CatalogRegistry>) -> Self {
        Self { registry }
    }

    /// Open a registry for `config` and wrap it.
    ///
    /// # Errors
    /// Returns an error when the registry cannot be opened.
    pub fn open(config: CatalogConfig) -> Result<Self> {
        Ok(Self::new(Arc::new(CatalogRegistry::open(config)?)))
    }

    #[must_use]
    pub fn registry(&self) -> &CatalogRegistry {
        &self.registry
    }

    fn payload_dir(&self) -> &Path {
        &self.registry.config().payload_dir
    }

    fn reporter(&self) -> &'static dyn ProblemReporter {
        if self.registry.config().strict {
            &StrictProblemReporter
        } else {
            &LogProblemReporter
        }
    }

    fn run_actions(&self, client_id: &str, actions: Vec<Action>) -> Result<BatchReport> {
        let catalog = self.registry.catalog(client_id)?;
        let mut store = catalog.writer()?;
        let executor = ActionExecutor::new(self.payload_dir(), self.reporter());
        Ok(executor.run(&mut store, actions))
    }

    fn read_rows(&self, client_id: &str) -> Result<Vec<WordListRecord>> {
        match self.registry.existing_catalog(client_id)? {
            Some(catalog) => catalog.reader()?.list_records(),
            None => Ok(Vec::new()),
        }
    }

    /// Only a real file under the payload directory counts. A pre-installed row (`"_"`) has
    /// nothing the consumer could open, so it is never advertised.
    fn payload_present(&self, record: &WordListRecord) -> bool {
        record
            .local_filename
            .as_deref()
            .and_then(|local_filename| resolve_payload_path(self.payload_dir(), local_filename))
            .is_some_and(|path| path.is_file())
    }

    /// Public view of every word list of a client. Never fails: store errors are logged and
    /// yield an empty list.
    #[must_use]
    pub fn list_public(&self, client_id: &str) -> Vec<PublicWordList> {
        match self.read_rows(client_id) {
            Ok(rows) => rows
                .iter()
                .filter(|row| !row.locale.is_empty())
                .map(WordListRecord::public_view)
                .collect(),
            Err(err) => {
                error!(client_id, error = %format!("{err:#}"), "failed to list word lists");
                Vec::new()
            }
        }
    }

    /// At most one word list per category for `requested_locale`. Never fails: store errors
    /// are logged and yield an empty list.
    #[must_use]
    pub fn resolve_for_locale(&self, client_id: &str, requested_locale: &str) -> Vec<ResolvedWordList> {
        match self.read_rows(client_id) {
            Ok(rows) => {
                select_for_locale(&rows, requested_locale, |row| self.payload_present(row))
            }
            Err(err) => {
                error!(
                    client_id,
                    requested_locale,
                    error = %format!("{err:#}"),
                    "failed to resolve word lists"
                );
                Vec::new()
            }
        }
    }

    /// Locate the payload of the installed or deleting version of `word_list_id`.
    ///
    /// # Errors
    /// Returns `CatalogError::NotFound` when no servable payload exists, including when the
    /// store cannot be read.
    pub fn open_payload(&self, client_id: &str, word_list_id: &str) -> Result<PayloadHandle, CatalogError> {
        let row = match self.servable_row(client_id, word_list_id) {
            Ok(row) => row,
            Err(err) => {
                error!(client_id, word_list_id, error = %format!("{err:#}"), "failed to open payload");
                None
            }
        };
        let not_found = || CatalogError::NotFound(format!("no payload for word list {word_list_id}"));
        let row = row.ok_or_else(not_found)?;

        if row.status == Status::Deleting {
            return Ok(PayloadHandle::Empty);
        }
        row.local_filename
            .as_deref()
            .and_then(|local_filename| resolve_payload_path(self.payload_dir(), local_filename))
            .filter(|path| path.is_file())
            .map(PayloadHandle::File)
            .ok_or_else(not_found)
    }

    fn servable_row(&self, client_id: &str, word_list_id: &str) -> Result<Option<WordListRecord>> {
        let Some(catalog) = self.registry.existing_catalog(client_id)? else {
            return Ok(None);
        };
        let rows = catalog.reader()?.list_records_for_id(word_list_id)?;
        Ok(rows
            .into_iter()
            .filter(|row| matches!(row.status, Status::Installed | Status::Deleting))
            .max_by_key(|row| row.version))
    }

    /// Register a word list the client ships itself, as INSTALLED.
    ///
    /// # Errors
    /// Returns `CatalogError::Validation` (wrapped) when id or locale is missing, or an error
    /// when the catalog cannot be written.
    pub fn insert_from_client(&self, client_id: &str, fields: ClientWordListFields) -> Result<BatchReport> {
        let record = complete_with_defaults(fields)?;
        info!(client_id, word_list_id = %record.id, version = record.version, "client inserted word list");
        self.run_actions(client_id, vec![Action::MarkPreInstalled { record }])
    }

    /// Drop every word list of a client and forget the client itself.
    /// Returns whether a client row existed.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be reset or bookkeeping cannot be updated.
    pub fn delete_metadata_namespace(&self, client_id: &str) -> Result<bool> {
        if let Some(catalog) = self.registry.existing_catalog(client_id)? {
            catalog.writer()?.reset_word_lists()?;
        }
        if client_id != DEFAULT_CLIENT_ID {
            self.registry.evict(client_id)?;
        }
        let existed = self.registry.default_catalog().writer()?.remove_client(client_id)?;
        info!(client_id, existed, "client namespace deleted");
        Ok(existed)
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be written.
    pub fn register_client(&self, client_id: &str, registration: &ClientRegistration) -> Result<()> {
        self.registry.default_catalog().writer()?.register_client(
            client_id,
            &registration.metadata_uri,
            &registration.additional_id,
        )
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be read.
    pub fn is_client_known(&self, client_id: &str) -> Result<bool> {
        self.registry.default_catalog().reader()?.is_client_known(client_id)
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be read.
    pub fn get_client(&self, client_id: &str) -> Result<Option<ClientRecord>> {
        self.registry.default_catalog().reader()?.get_client(client_id)
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be read.
    pub fn list_clients(&self) -> Result<Vec<ClientRecord>> {
        self.registry.default_catalog().reader()?.list_clients()
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be read.
    pub fn last_sync_for_client(&self, client_id: &str) -> Result<Option<i64>> {
        self.registry.default_catalog().reader()?.last_sync_for_client(client_id)
    }

    /// # Errors
    /// Returns an error when bookkeeping cannot be read.
    pub fn oldest_sync_time(&self) -> Result<Option<i64>> {
        self.registry.default_catalog().reader()?.oldest_sync_time()
    }

    /// Diff a client catalog against a freshly fetched remote feed and, unless `dry_run`,
    /// execute the planned actions. Planning and execution share one writer lock.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read or sync bookkeeping cannot be written.
    /// Individual action failures are reported in the batch instead.
    pub fn reconcile(
        &self,
        client_id: &str,
        remote: Vec<RemoteWordList>,
        dry_run: bool,
    ) -> Result<ReconcileOutcome> {
        let catalog = self.registry.catalog(client_id)?;
        let options = ReconcileOptions {
            auto_download_updates: self.registry.config().auto_download_updates,
        };
        let remote = prepare_remote_feed(remote);

        let (planned, report) = {
            let mut store = catalog.writer()?;
            let planned = plan_reconciliation(&store.list_records()?, &remote, options);
            if dry_run {
                (planned, None)
            } else {
                let executor = ActionExecutor::new(self.payload_dir(), self.reporter());
                let report = executor.run(&mut store, planned.clone());
                (planned, Some(report))
            }
        };
        info!(client_id, dry_run, planned = planned.len(), "reconciliation finished");

        if !dry_run {
            self.stamp_sync(client_id)?;
        }

        Ok(ReconcileOutcome { client_id: client_id.to_string(), dry_run, planned, report })
    }

    fn stamp_sync(&self, client_id: &str) -> Result<()> {
        let default_catalog = self.registry.default_catalog();
        let mut store = default_catalog.writer()?;
        let Some(client) = store.get_client(client_id)? else {
            return Ok(());
        };
        if client.metadata_uri.is_empty() {
            return Ok(());
        }
        store.mark_metadata_synced(&client.metadata_uri, now_epoch_ms()?)?;
        Ok(())
    }

    /// DOWNLOADING rows the download collaborator should be transferring.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be read.
    pub fn pending_downloads(&self, client_id: &str) -> Result<Vec<PendingDownload>> {
        let Some(catalog) = self.registry.existing_catalog(client_id)? else {
            return Ok(Vec::new());
        };
        let rows = catalog.reader()?.list_records_with_status(Status::Downloading)?;
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                let job_id = row.download_job_id?;
                Some(PendingDownload {
                    job_id,
                    word_list_id: row.id,
                    version: row.version,
                    locale: row.locale,
                    remote_filename: row.remote_filename.unwrap_or_default(),
                    checksum: row.checksum,
                    raw_checksum: row.raw_checksum,
                    file_size_bytes: row.file_size_bytes,
                })
            })
            .collect())
    }

    /// Record the result of one download job.
    ///
    /// # Errors
    /// Returns an error when no DOWNLOADING row carries `job_id` for a successful download, or
    /// the catalog cannot be accessed.
    pub fn download_finished(
        &self,
        client_id: &str,
        job_id: i64,
        outcome: DownloadOutcome,
    ) -> Result<BatchReport> {
        let action = match outcome {
            DownloadOutcome::Succeeded { local_filename } => {
                let catalog = self.registry.catalog(client_id)?;
                let row = catalog.reader()?.find_downloading_by_job(job_id)?.ok_or_else(|| {
                    anyhow!(CatalogError::NotFound(format!("no download in flight for job {job_id}")))
                })?;
                Action::Install { key: row.key(), local_filename }
            }
            DownloadOutcome::Failed { reason } => {
                warn!(client_id, job_id, reason = %reason, "download failed");
                Action::DiscardFailedDownload { job_id }
            }
        };
        self.run_actions(client_id, vec![action])
    }

    /// Spend one retry on a corrupt payload and queue a fresh download while budget remains.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be accessed.
    pub fn report_corrupt_payload(&self, client_id: &str, key: &WordListKey) -> Result<BatchReport> {
        warn!(client_id, word_list_id = %key.id, version = key.version, "corrupt payload reported");
        let mut report =
            self.run_actions(client_id, vec![Action::MaybeMarkRetrying { key: key.clone() }])?;

        let retrying = self
            .registry
            .catalog(client_id)?
            .reader()?
            .get_record(key)?
            .is_some_and(|row| row.status == Status::Retrying);
        if retrying {
            let follow_up =
                self.run_actions(client_id, vec![Action::StartDownload { key: key.clone() }])?;
            merge_reports(&mut report, follow_up);
        }
        Ok(report)
    }

    /// Apply a user-facing state request to one word list.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be accessed.
    pub fn mark(&self, client_id: &str, key: &WordListKey, request: MarkRequest) -> Result<BatchReport> {
        let actions = match request {
            MarkRequest::Used => {
                let current = self.registry.catalog(client_id)?.reader()?.get_record(key)?;
                match current.map(|row| row.status) {
                    Some(Status::Available | Status::Retrying) => {
                        vec![Action::StartDownload { key: key.clone() }]
                    }
                    _ => vec![Action::Enable { key: key.clone() }],
                }
            }
            MarkRequest::Unused => vec![Action::Disable { key: key.clone() }],
            MarkRequest::Deleting => vec![
                Action::Disable { key: key.clone() },
                Action::StartDelete { key: key.clone() },
            ],
            MarkRequest::Deleted => vec![Action::FinishDelete { key: key.clone() }],
        };
        self.run_actions(client_id, actions)
    }

    /// Consumer-side delete of a payload. Returns how many payloads were affected.
    ///
    /// A DELETING row completes its two-phase delete. An INSTALLED row loses its local file,
    /// and a `failure` result first spends a retry on it.
    ///
    /// # Errors
    /// Returns an error when the catalog cannot be accessed.
    pub fn delete_payload(&self, client_id: &str, word_list_id: &str, failure: bool) -> Result<usize> {
        let Some(row) = self.servable_row(client_id, word_list_id)? else {
            return Ok(0);
        };

        match row.status {
            Status::Deleting => {
                self.run_actions(client_id, vec![Action::FinishDelete { key: row.key() }])?;
                Ok(1)
            }
            Status::Installed => {
                if failure {
                    self.report_corrupt_payload(client_id, &row.key())?;
                }
                let removed = row
                    .local_filename
                    .as_deref()
                    .is_some_and(|local_filename| self.remove_local_payload(client_id, local_filename));
                Ok(usize::from(removed))
            }
            _ => Ok(0),
        }
    }

    fn remove_local_payload(&self, client_id: &str, local_filename: &str) -> bool {
        let Some(path) = resolve_payload_path(self.payload_dir(), local_filename) else {
            return false;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => false,
            Err(err) => {
                warn!(client_id, path = %path.display(), error = %err, "failed to remove payload");
                false
            }
        }
    }

    /// Route a protocol query.
    ///
    /// # Errors
    /// Returns `CatalogError::Unsupported` for routes that cannot be queried.
    pub fn query(&self, version: ProtocolVersion, path: &str) -> Result<QueryResult, CatalogError> {
        let route = CatalogRoute::parse(version, path)?;
        match route {
            CatalogRoute::WholeList { client_id } => {
                Ok(QueryResult::WordLists(self.list_public(&client_id)))
            }
            CatalogRoute::DictInfo { client_id, locale } => {
                if version == ProtocolVersion::V2 && !self.client_known_or_log(&client_id) {
                    return Ok(QueryResult::Resolved(Vec::new()));
                }
                Ok(QueryResult::Resolved(self.resolve_for_locale(&client_id, &locale)))
            }
            CatalogRoute::Metadata { client_id } => match self.get_client(&client_id) {
                Ok(client) => Ok(QueryResult::Client(client)),
                Err(err) => {
                    error!(client_id, error = %format!("{err:#}"), "failed to read client metadata");
                    Ok(QueryResult::Client(None))
                }
            },
            CatalogRoute::Datafile { .. } => Err(CatalogError::Unsupported(
                "datafile routes are opened, not queried".to_string(),
            )),
        }
    }

    fn client_known_or_log(&self, client_id: &str) -> bool {
        match self.is_client_known(client_id) {
            Ok(known) => known,
            Err(err) => {
                error!(client_id, error = %format!("{err:#}"), "failed to read client bookkeeping");
                false
            }
        }
    }

    /// Route a protocol open.
    ///
    /// # Errors
    /// Returns `CatalogError::Unsupported` for non-payload routes and `NotFound` when no
    /// payload can be served.
    pub fn open_route(&self, version: ProtocolVersion, path: &str) -> Result<PayloadHandle, CatalogError> {
        let route = CatalogRoute::parse(version, path)?;
        let Some(word_list_id) = route.payload_id(version) else {
            return Err(CatalogError::Unsupported(format!("cannot open {path:?}")));
        };
        self.open_payload(route.client_id(), word_list_id)
    }

    /// Route a protocol insert. The route decides how `body` is decoded: a metadata route
    /// takes a `ClientRegistration`, a dict route takes `ClientWordListFields`.
    ///
    /// # Errors
    /// Returns an error for V1 inserts, unsupported routes, undecodable bodies, invalid fields,
    /// or store failures.
    pub fn insert(
        &self,
        version: ProtocolVersion,
        path: &str,
        body: serde_json::Value,
    ) -> Result<Option<BatchReport>> {
        if version == ProtocolVersion::V1 {
            return Err(anyhow!(CatalogError::Unsupported(
                "protocol 1 does not accept inserts".to_string()
            )));
        }
        match CatalogRoute::parse(version, path)? {
            CatalogRoute::Metadata { client_id } => {
                let registration = serde_json::from_value::<ClientRegistration>(body)
                    .context("invalid client registration body")?;
                self.register_client(&client_id, &registration)?;
                Ok(None)
            }
            CatalogRoute::DictInfo { client_id, .. } => {
                let fields = serde_json::from_value::<ClientWordListFields>(body)
                    .context("invalid word list body")?;
                self.insert_from_client(&client_id, fields).map(Some)
            }
            route => Err(anyhow!(CatalogError::Unsupported(format!(
                "cannot insert into {route:?}"
            )))),
        }
    }

    /// Route a protocol delete. Returns how many entries were affected.
    ///
    /// # Errors
    /// Returns an error for unsupported routes or store failures.
    pub fn delete(&self, version: ProtocolVersion, path: &str, failure: bool) -> Result<usize> {
        let route = CatalogRoute::parse(version, path)?;
        if let (ProtocolVersion::V2, CatalogRoute::Metadata { client_id }) = (version, &route) {
            return self.delete_metadata_namespace(client_id).map(usize::from);
        }
        match route.payload_id(version) {
            Some(word_list_id) => self.delete_payload(route.client_id(), word_list_id, failure),
            None => Err(anyhow!(CatalogError::Unsupported(format!("cannot delete {path:?}")))),
        }
    }

    /// # Errors
    /// Returns an error when the catalog cannot be opened or queried.
    pub fn schema_status(&self, client_id: &str) -> Result<SchemaStatus> {
        self.registry.catalog(client_id)?.reader()?.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, client_id: &str, dry_run: bool) -> Result<MigrateResult> {
        let db_path = self.registry.config().db_path_for(client_id);
        let mut store = if client_id == DEFAULT_CLIENT_ID {
            SqliteStore::open_default_namespace(&db_path)?
        } else {
            SqliteStore::open(&db_path)?
        };
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                inferred_from_legacy: before.inferred_from_legacy,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// # Errors
    /// Returns an error when any integrity check fails.
    pub fn integrity_check(&self, client_id: &str) -> Result<IntegrityReport> {
        self.registry.catalog(client_id)?.reader()?.integrity_check()
    }

    /// # Errors
    /// Returns an error when the backup cannot be written.
    pub fn backup(&self, client_id: &str, out_file: &Path) -> Result<()> {
        self.registry.catalog(client_id)?.writer()?.backup_database(out_file)
    }

    /// # Errors
    /// Returns an error when the backup is missing or cannot be restored.
    pub fn restore(&self, client_id: &str, in_file: &Path) -> Result<()> {
        self.registry.catalog(client_id)?.writer()?.restore_database(in_file)
    }
}

fn merge_reports(into: &mut BatchReport, other: BatchReport) {
    into.applied += other.applied;
    into.skipped += other.skipped;
    into.failed += other.failed;
    into.problems.extend(other.problems);
}

fn now_epoch_ms() -> Result<i64> {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).context("current time does not fit epoch milliseconds")
}
