use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Remaining re-download attempts granted to a freshly listed word list.
pub const DICTIONARY_RETRY_THRESHOLD: u32 = 2;

/// Highest dictionary format this catalog knows how to serve.
pub const MAXIMUM_SUPPORTED_FORMAT_VERSION: u32 = 86_736_212;

pub const ID_CATEGORY_SEPARATOR: char = ':';

/// Local filename recorded for word lists that ship inside the client package.
pub const PREINSTALLED_LOCAL_FILENAME: &str = "_";

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum CatalogError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unknown,
    Available,
    Downloading,
    Installed,
    Disabled,
    Deleting,
    Retrying,
}

impl Status {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Available => "available",
            Self::Downloading => "downloading",
            Self::Installed => "installed",
            Self::Disabled => "disabled",
            Self::Deleting => "deleting",
            Self::Retrying => "retrying",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "unknown" => Some(Self::Unknown),
            "available" => Some(Self::Available),
            "downloading" => Some(Self::Downloading),
            "installed" => Some(Self::Installed),
            "disabled" => Some(Self::Disabled),
            "deleting" => Some(Self::Deleting),
            "retrying" => Some(Self::Retrying),
            _ => None,
        }
    }

    /// Statuses that count toward the one-live-version-per-id rule.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Installed | Self::Downloading | Self::Disabled)
    }

    /// Statuses whose payload may still exist on the consumer side.
    #[must_use]
    pub fn holds_payload(self) -> bool {
        matches!(self, Self::Installed | Self::Disabled | Self::Deleting)
    }
}

impl Display for Status {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum WordListType {
    Metadata,
    Bulk,
    Update,
}

impl WordListType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Metadata => "metadata",
            Self::Bulk => "bulk",
            Self::Update => "update",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "metadata" => Some(Self::Metadata),
            "bulk" => Some(Self::Bulk),
            "update" => Some(Self::Update),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct WordListKey {
    pub id: String,
    pub version: u32,
}

impl WordListKey {
    #[must_use]
    pub fn new(id: impl Into<String>, version: u32) -> Self {
        Self { id: id.into(), version }
    }
}

impl Display for WordListKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct WordListRecord {
    pub id: String,
    pub version: u32,
    pub format_version: u32,
    pub list_type: WordListType,
    pub locale: String,
    pub description: String,
    pub status: Status,
    pub local_filename: Option<String>,
    /// `Some("")` means "never fetch automatically", distinct from unset.
    pub remote_filename: Option<String>,
    pub checksum: String,
    pub raw_checksum: String,
    pub retry_count: u32,
    pub file_size_bytes: i64,
    pub last_update_epoch_ms: i64,
    pub download_job_id: Option<i64>,
    pub flags: u32,
}

impl WordListRecord {
    #[must_use]
    pub fn key(&self) -> WordListKey {
        WordListKey::new(self.id.clone(), self.version)
    }

    #[must_use]
    pub fn category(&self) -> &str {
        category_of(&self.id)
    }

    #[must_use]
    pub fn has_remote_source(&self) -> bool {
        self.remote_filename.as_deref().is_some_and(|remote| !remote.is_empty())
    }

    #[must_use]
    pub fn public_view(&self) -> PublicWordList {
        PublicWordList {
            id: self.id.clone(),
            locale: self.locale.clone(),
            description: self.description.clone(),
            status: self.status,
            last_update_epoch_ms: self.last_update_epoch_ms,
            file_size_bytes: self.file_size_bytes,
            version: self.version,
        }
    }

    fn with_status(&self, status: Status) -> Self {
        Self { status, ..self.clone() }
    }
}

/// Catalog entry as exposed to consumers. Filesystem locations never appear here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct PublicWordList {
    pub id: String,
    pub locale: String,
    pub description: String,
    pub status: Status,
    pub last_update_epoch_ms: i64,
    pub file_size_bytes: i64,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ResolvedWordList {
    pub id: String,
    pub locale: String,
    pub raw_checksum: String,
    pub status: Status,
    pub match_level: MatchLevel,
}

/// One entry of the remote metadata feed. Every field except `rawChecksum` is required.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct RemoteWordList {
    pub id: String,
    pub locale: String,
    pub description: String,
    #[serde(rename = "update")]
    pub last_update_epoch_ms: i64,
    #[serde(rename = "filesize")]
    pub file_size_bytes: i64,
    pub checksum: String,
    #[serde(rename = "rawChecksum", default)]
    pub raw_checksum: Option<String>,
    #[serde(rename = "url")]
    pub remote_filename: String,
    pub version: u32,
    #[serde(rename = "formatversion")]
    pub format_version: u32,
}

impl RemoteWordList {
    #[must_use]
    pub fn into_record(self) -> WordListRecord {
        WordListRecord {
            id: self.id,
            version: self.version,
            format_version: self.format_version,
            list_type: WordListType::Bulk,
            locale: self.locale,
            description: self.description,
            status: Status::Available,
            local_filename: None,
            remote_filename: Some(self.remote_filename),
            checksum: self.checksum,
            raw_checksum: self.raw_checksum.unwrap_or_default(),
            retry_count: DICTIONARY_RETRY_THRESHOLD,
            file_size_bytes: self.file_size_bytes,
            last_update_epoch_ms: self.last_update_epoch_ms,
            download_job_id: None,
            flags: 0,
        }
    }
}

/// Convert a parsed remote feed into planner input, dropping entries without a locale.
#[must_use]
pub fn prepare_remote_feed(entries: Vec<RemoteWordList>) -> Vec<WordListRecord> {
    entries
        .into_iter()
        .filter(|entry| {
            if entry.locale.is_empty() {
                debug!(word_list_id = %entry.id, "dropping remote word list without locale");
                return false;
            }
            true
        })
        .map(RemoteWordList::into_record)
        .collect()
}

/// Fields a client may supply when registering a word list it ships itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ClientWordListFields {
    pub id: Option<String>,
    pub locale: Option<String>,
    pub list_type: Option<WordListType>,
    pub description: Option<String>,
    pub local_filename: Option<String>,
    pub remote_filename: Option<String>,
    pub last_update_epoch_ms: Option<i64>,
    pub raw_checksum: Option<String>,
    pub retry_count: Option<u32>,
    pub checksum: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub version: Option<u32>,
    pub format_version: Option<u32>,
    pub flags: Option<u32>,
}

/// Fill every optional field of a client insert with its default.
///
/// # Errors
/// Returns `CatalogError::Validation` when `id` or `locale` is missing.
pub fn complete_with_defaults(fields: ClientWordListFields) -> Result<WordListRecord, CatalogError> {
    let Some(id) = fields.id.filter(|id| !id.is_empty()) else {
        return Err(CatalogError::Validation("word list id MUST be provided".to_string()));
    };
    let Some(locale) = fields.locale else {
        return Err(CatalogError::Validation(format!("locale MUST be provided for {id}")));
    };

    Ok(WordListRecord {
        id,
        version: fields.version.unwrap_or(1),
        format_version: fields.format_version.unwrap_or(0),
        list_type: fields.list_type.unwrap_or(WordListType::Bulk),
        locale,
        description: fields.description.unwrap_or_default(),
        status: Status::Installed,
        local_filename: Some(
            fields.local_filename.unwrap_or_else(|| PREINSTALLED_LOCAL_FILENAME.to_string()),
        ),
        remote_filename: Some(fields.remote_filename.unwrap_or_default()),
        checksum: fields.checksum.unwrap_or_default(),
        raw_checksum: fields.raw_checksum.unwrap_or_default(),
        retry_count: fields.retry_count.unwrap_or(DICTIONARY_RETRY_THRESHOLD),
        file_size_bytes: fields.file_size_bytes.unwrap_or(0),
        last_update_epoch_ms: fields.last_update_epoch_ms.unwrap_or(0),
        download_job_id: None,
        flags: fields.flags.unwrap_or(0),
    })
}

#[must_use]
pub fn category_of(id: &str) -> &str {
    id.split(ID_CATEGORY_SEPARATOR).next().unwrap_or(id)
}

/// How well a candidate locale serves a requested locale. Higher is better.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct MatchLevel(pub u8);

impl MatchLevel {
    pub const NO_MATCH: Self = Self(0);
    /// Languages agree, countries differ, or the request lacks the required country.
    pub const LANGUAGE_MATCH_COUNTRY_DIFFER: Self = Self(3);
    /// Language and country agree, variants differ, or the request lacks the required variant.
    pub const LANGUAGE_AND_COUNTRY_MATCH_VARIANT_DIFFER: Self = Self(6);
    /// Empty candidate locale against a non-empty request.
    pub const ANY_MATCH: Self = Self(10);
    /// Languages agree and the request is more specific than the candidate.
    pub const LANGUAGE_MATCH: Self = Self(15);
    /// Language and country agree and the request carries an extra variant.
    pub const LANGUAGE_AND_COUNTRY_MATCH: Self = Self(20);
    pub const FULL_MATCH: Self = Self(30);

    #[must_use]
    pub fn is_match(self) -> bool {
        self >= Self::ANY_MATCH
    }
}

/// Score how well `candidate` (a word-list locale) serves `requested`.
///
/// The requested locale has to match every part the candidate specifies. A candidate more
/// general than the request is a match; a more specific or conflicting one is not.
#[must_use]
pub fn match_level(candidate: &str, requested: &str) -> MatchLevel {
    if candidate.is_empty() {
        return if requested.is_empty() { MatchLevel::FULL_MATCH } else { MatchLevel::ANY_MATCH };
    }

    let candidate_parts = candidate.splitn(3, '_').collect::<Vec<_>>();
    let requested_parts = requested.splitn(3, '_').collect::<Vec<_>>();
    if candidate_parts[0] != requested_parts[0] {
        return MatchLevel::NO_MATCH;
    }

    match candidate_parts.len() {
        1 => {
            if requested_parts.len() == 1 {
                MatchLevel::FULL_MATCH
            } else {
                MatchLevel::LANGUAGE_MATCH
            }
        }
        2 => {
            if requested_parts.len() == 1 || candidate_parts[1] != requested_parts[1] {
                MatchLevel::LANGUAGE_MATCH_COUNTRY_DIFFER
            } else if requested_parts.len() == 3 {
                MatchLevel::LANGUAGE_AND_COUNTRY_MATCH
            } else {
                MatchLevel::FULL_MATCH
            }
        }
        _ => {
            if requested_parts.len() == 1 || candidate_parts[1] != requested_parts[1] {
                MatchLevel::LANGUAGE_MATCH_COUNTRY_DIFFER
            } else if requested_parts.len() == 2 || candidate_parts[2] != requested_parts[2] {
                MatchLevel::LANGUAGE_AND_COUNTRY_MATCH_VARIANT_DIFFER
            } else {
                MatchLevel::FULL_MATCH
            }
        }
    }
}

#[must_use]
pub fn is_match(level: MatchLevel) -> bool {
    level.is_match()
}

/// Pick at most one word list per category for `requested_locale`.
///
/// Only AVAILABLE, INSTALLED and DELETING rows compete. INSTALLED rows whose payload is gone
/// (per `payload_present`) are skipped; DELETING rows always compete so the consumer can
/// finish removing its copy. A later candidate replaces the current pick only on a strictly
/// better score.
pub fn select_for_locale<'a, I, F>(
    candidates: I,
    requested_locale: &str,
    payload_present: F,
) -> Vec<ResolvedWordList>
where
    I: IntoIterator<Item = &'a WordListRecord>,
    F: Fn(&WordListRecord) -> bool,
{
    let mut best: BTreeMap<&'a str, (MatchLevel, &'a WordListRecord)> = BTreeMap::new();

    for record in candidates {
        if record.id.is_empty() {
            continue;
        }
        if !matches!(record.status, Status::Available | Status::Installed | Status::Deleting) {
            continue;
        }

        let level = match_level(&record.locale, requested_locale);
        if !level.is_match() {
            continue;
        }
        if record.status == Status::Installed && !payload_present(record) {
            continue;
        }

        let category = record.category();
        let replace = best.get(category).map_or(true, |(current, _)| level > *current);
        if replace {
            best.insert(category, (level, record));
        }
    }

    best.into_values()
        .map(|(level, record)| ResolvedWordList {
            id: record.id.clone(),
            locale: record.locale.clone(),
            raw_checksum: record.raw_checksum.clone(),
            status: record.status,
            match_level: level,
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    MakeAvailable { record: WordListRecord },
    MarkPreInstalled { record: WordListRecord },
    UpdateData { record: WordListRecord },
    Forget { key: WordListKey, has_newer_version: bool },
    Enable { key: WordListKey },
    Disable { key: WordListKey },
    StartDownload { key: WordListKey },
    StartDelete { key: WordListKey },
    FinishDelete { key: WordListKey },
    Install { key: WordListKey, local_filename: String },
    DiscardFailedDownload { job_id: i64 },
    MaybeMarkRetrying { key: WordListKey },
}

/// Row an action must locate before it can run.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ActionTarget<'a> {
    Key(WordListKey),
    DownloadJob(i64),
    Record(&'a WordListRecord),
}

/// Outcome of re-validating an action against the row it targets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Precondition {
    Satisfied,
    Warning(String),
    Missing,
}

/// Storage-level effect of one action, computed from the row it targets.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Mutation {
    /// Insert the row unless `(id, version)` already exists.
    Insert(WordListRecord),
    /// Overwrite the row with the same `(id, version)`.
    Update(WordListRecord),
    Delete(WordListKey),
    /// Mark DOWNLOADING under a freshly allocated download job id.
    BeginDownload(WordListRecord),
    /// Replace every row sharing the id with this INSTALLED row, then unlink old payloads.
    Install(WordListRecord),
    Nothing,
}

impl Action {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::MakeAvailable { .. } => "make_available",
            Self::MarkPreInstalled { .. } => "mark_pre_installed",
            Self::UpdateData { .. } => "update_data",
            Self::Forget { .. } => "forget",
            Self::Enable { .. } => "enable",
            Self::Disable { .. } => "disable",
            Self::StartDownload { .. } => "start_download",
            Self::StartDelete { .. } => "start_delete",
            Self::FinishDelete { .. } => "finish_delete",
            Self::Install { .. } => "install",
            Self::DiscardFailedDownload { .. } => "discard_failed_download",
            Self::MaybeMarkRetrying { .. } => "maybe_mark_retrying",
        }
    }

    #[must_use]
    pub fn target(&self) -> ActionTarget<'_> {
        match self {
            Self::MakeAvailable { record }
            | Self::MarkPreInstalled { record }
            | Self::UpdateData { record } => ActionTarget::Record(record),
            Self::Forget { key, .. }
            | Self::Enable { key }
            | Self::Disable { key }
            | Self::StartDownload { key }
            | Self::StartDelete { key }
            | Self::FinishDelete { key }
            | Self::Install { key, .. }
            | Self::MaybeMarkRetrying { key } => ActionTarget::Key(key.clone()),
            Self::DiscardFailedDownload { job_id } => ActionTarget::DownloadJob(*job_id),
        }
    }

    #[must_use]
    pub fn target_label(&self) -> String {
        match self.target() {
            ActionTarget::Key(key) => key.to_string(),
            ActionTarget::Record(record) => record.key().to_string(),
            ActionTarget::DownloadJob(job_id) => format!("download job {job_id}"),
        }
    }

    /// Re-validate the action against the row currently stored for its target.
    #[must_use]
    pub fn check(&self, current: Option<&WordListRecord>) -> Precondition {
        match (self, current) {
            (Self::MakeAvailable { .. } | Self::MarkPreInstalled { .. }, None) => {
                Precondition::Satisfied
            }
            (Self::MakeAvailable { .. } | Self::MarkPreInstalled { .. }, Some(existing)) => {
                Precondition::Warning(format!(
                    "row already exists with status {}; keeping it",
                    existing.status
                ))
            }
            (_, None) => Precondition::Missing,
            (Self::UpdateData { .. } | Self::DiscardFailedDownload { .. }, Some(_)) => {
                Precondition::Satisfied
            }
            (Self::Forget { has_newer_version, .. }, Some(existing)) => {
                if *has_newer_version && existing.status != Status::Available {
                    Precondition::Warning(format!(
                        "superseded word list is {} rather than available",
                        existing.status
                    ))
                } else {
                    Precondition::Satisfied
                }
            }
            (Self::Enable { .. }, Some(existing)) => match existing.status {
                Status::Disabled | Status::Deleting | Status::Available | Status::Retrying => {
                    Precondition::Satisfied
                }
                other => Precondition::Warning(format!("cannot enable from {other}")),
            },
            (Self::Disable { .. }, Some(existing)) => match existing.status {
                Status::Installed | Status::Downloading => Precondition::Satisfied,
                other => Precondition::Warning(format!("cannot disable from {other}")),
            },
            (Self::StartDownload { .. }, Some(existing)) => match existing.status {
                Status::Available | Status::Retrying => Precondition::Satisfied,
                Status::Downloading => {
                    Precondition::Warning("download already in flight; restarting".to_string())
                }
                other => Precondition::Warning(format!("starting download from {other}")),
            },
            (Self::StartDelete { .. }, Some(existing)) => {
                if existing.status.holds_payload() {
                    Precondition::Satisfied
                } else {
                    Precondition::Warning(format!("deleting a word list that is {}", existing.status))
                }
            }
            (Self::FinishDelete { .. }, Some(existing)) => {
                if existing.status == Status::Deleting {
                    Precondition::Satisfied
                } else {
                    Precondition::Warning(format!(
                        "finishing delete of a word list that is {}",
                        existing.status
                    ))
                }
            }
            (Self::Install { .. }, Some(existing)) => {
                if existing.status == Status::Downloading {
                    Precondition::Satisfied
                } else {
                    Precondition::Warning(format!(
                        "installing a word list that is {}",
                        existing.status
                    ))
                }
            }
            (Self::MaybeMarkRetrying { .. }, Some(existing)) => match existing.status {
                Status::Installed | Status::Downloading => Precondition::Satisfied,
                other => Precondition::Warning(format!("retrying a word list that is {other}")),
            },
        }
    }

    /// Compute the storage effect of this action. Call only when `check` did not return
    /// `Precondition::Missing`.
    #[must_use]
    pub fn mutation(&self, current: Option<&WordListRecord>) -> Mutation {
        match (self, current) {
            (Self::MakeAvailable { record }, None) => Mutation::Insert(WordListRecord {
                status: Status::Available,
                local_filename: None,
                download_job_id: None,
                ..record.clone()
            }),
            (Self::MarkPreInstalled { record }, None) => Mutation::Insert(WordListRecord {
                status: Status::Installed,
                download_job_id: None,
                ..record.clone()
            }),
            (_, None) | (Self::MakeAvailable { .. } | Self::MarkPreInstalled { .. }, Some(_)) => {
                Mutation::Nothing
            }
            (Self::UpdateData { record }, Some(existing)) => Mutation::Update(WordListRecord {
                list_type: existing.list_type,
                status: existing.status,
                local_filename: existing.local_filename.clone(),
                download_job_id: existing.download_job_id,
                ..record.clone()
            }),
            (Self::Forget { .. }, Some(existing)) => {
                if existing.status.holds_payload() {
                    Mutation::Update(WordListRecord {
                        status: Status::Deleting,
                        remote_filename: Some(String::new()),
                        ..existing.clone()
                    })
                } else {
                    Mutation::Delete(existing.key())
                }
            }
            (Self::Enable { .. }, Some(existing)) => match existing.status {
                Status::Available | Status::Retrying => Mutation::BeginDownload(existing.clone()),
                Status::Downloading => Mutation::Nothing,
                _ => Mutation::Update(existing.with_status(Status::Installed)),
            },
            (Self::Disable { .. }, Some(existing)) => match existing.status {
                Status::Installed => Mutation::Update(existing.with_status(Status::Disabled)),
                Status::Downloading => Mutation::Update(WordListRecord {
                    status: Status::Available,
                    download_job_id: None,
                    ..existing.clone()
                }),
                _ => Mutation::Nothing,
            },
            (Self::StartDownload { .. }, Some(existing)) => {
                Mutation::BeginDownload(existing.clone())
            }
            (Self::StartDelete { .. }, Some(existing)) => Mutation::Update(WordListRecord {
                status: Status::Deleting,
                remote_filename: Some(String::new()),
                ..existing.clone()
            }),
            (Self::FinishDelete { .. }, Some(existing)) => {
                if existing.has_remote_source() {
                    Mutation::Update(WordListRecord {
                        status: Status::Available,
                        local_filename: None,
                        download_job_id: None,
                        ..existing.clone()
                    })
                } else {
                    Mutation::Delete(existing.key())
                }
            }
            (Self::Install { local_filename, .. }, Some(existing)) => {
                Mutation::Install(WordListRecord {
                    status: Status::Installed,
                    local_filename: Some(local_filename.clone()),
                    download_job_id: None,
                    ..existing.clone()
                })
            }
            (Self::DiscardFailedDownload { .. }, Some(existing)) => {
                Mutation::Delete(existing.key())
            }
            (Self::MaybeMarkRetrying { .. }, Some(existing)) => {
                if existing.retry_count > 1 {
                    Mutation::Update(WordListRecord {
                        status: Status::Retrying,
                        retry_count: existing.retry_count - 1,
                        ..existing.clone()
                    })
                } else {
                    Mutation::Delete(existing.key())
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Problem {
    pub action: String,
    pub target: String,
    pub severity: Severity,
    pub message: String,
}

/// What the executor does with an action whose precondition produced a warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum WarningPolicy {
    Proceed,
    Skip,
}

pub trait ProblemReporter {
    fn warning(&self, problem: &Problem) -> WarningPolicy;
    fn error(&self, problem: &Problem);
}

/// Logs every problem and lets warned actions run.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogProblemReporter;

impl ProblemReporter for LogProblemReporter {
    fn warning(&self, problem: &Problem) -> WarningPolicy {
        warn!(
            action = %problem.action,
            target = %problem.target,
            "{}",
            problem.message
        );
        WarningPolicy::Proceed
    }

    fn error(&self, problem: &Problem) {
        error!(action = %problem.action, target = %problem.target, "{}", problem.message);
    }
}

/// Logs every problem and refuses to run warned actions.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictProblemReporter;

impl ProblemReporter for StrictProblemReporter {
    fn warning(&self, problem: &Problem) -> WarningPolicy {
        warn!(
            action = %problem.action,
            target = %problem.target,
            "{}; skipped in strict mode",
            problem.message
        );
        WarningPolicy::Skip
    }

    fn error(&self, problem: &Problem) {
        error!(action = %problem.action, target = %problem.target, "{}", problem.message);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchReport {
    pub batch_id: String,
    pub applied: usize,
    pub skipped: usize,
    pub failed: usize,
    pub problems: Vec<Problem>,
}

impl BatchReport {
    #[must_use]
    pub fn new(batch_id: impl Into<String>) -> Self {
        Self { batch_id: batch_id.into(), ..Self::default() }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed == 0 && self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReconcileOptions {
    /// Queue a download of the new version when the superseded one was installed or disabled.
    pub auto_download_updates: bool,
}

/// Diff the local catalog against the remote feed and produce an ordered action list.
///
/// Ids are visited in sorted order. For a newer remote version the superseded row is always
/// forgotten before the new one is made available.
#[must_use]
pub fn plan_reconciliation(
    local: &[WordListRecord],
    remote: &[WordListRecord],
    options: ReconcileOptions,
) -> Vec<Action> {
    let ids = local
        .iter()
        .chain(remote.iter())
        .map(|record| record.id.as_str())
        .collect::<BTreeSet<_>>();

    let mut actions = Vec::new();
    for id in ids {
        let current = find_supported_by_id(local, id);
        let offered = find_supported_by_id(remote, id);

        match (current, offered) {
            (None, None) => {
                info!(
                    word_list_id = id,
                    max_format_version = MAXIMUM_SUPPORTED_FORMAT_VERSION,
                    "skipping word list with unsupported format version"
                );
            }
            (None, Some(new)) => {
                actions.push(Action::MakeAvailable { record: new.clone() });
            }
            (Some(old), None) => {
                actions.push(Action::Forget { key: old.key(), has_newer_version: false });
            }
            (Some(old), Some(new)) => match new.version.cmp(&old.version) {
                Ordering::Equal => {
                    let mut record = new.clone();
                    if record.remote_filename == old.remote_filename {
                        record.retry_count = old.retry_count;
                    }
                    actions.push(Action::UpdateData { record });
                }
                Ordering::Greater => {
                    actions.push(Action::Forget { key: old.key(), has_newer_version: true });
                    actions.push(Action::MakeAvailable { record: new.clone() });
                    if options.auto_download_updates
                        && matches!(old.status, Status::Installed | Status::Disabled)
                    {
                        actions.push(Action::StartDownload { key: new.key() });
                    }
                }
                Ordering::Less => {
                    debug!(
                        word_list_id = id,
                        local_version = old.version,
                        remote_version = new.version,
                        "remote word list is older than the local one"
                    );
                }
            },
        }
    }

    actions
}

fn find_supported_by_id<'a>(records: &'a [WordListRecord], id: &str) -> Option<&'a WordListRecord> {
    records
        .iter()
        .filter(|record| {
            record.id == id && record.format_version <= MAXIMUM_SUPPORTED_FORMAT_VERSION
        })
        .max_by(|lhs, rhs| {
            lhs.version
                .cmp(&rhs.version)
                .then_with(|| lhs.format_version.cmp(&rhs.format_version))
        })
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn mk_record(id: &str, version: u32, locale: &str, status: Status) -> WordListRecord {
        WordListRecord {
            id: id.to_string(),
            version,
            format_version: 2,
            list_type: WordListType::Bulk,
            locale: locale.to_string(),
            description: format!("{locale} dictionary"),
            status,
            local_filename: Some(format!("{id}-{version}.dict")),
            remote_filename: Some(format!("https://dict.example/{id}/{version}")),
            checksum: "c0ffee".to_string(),
            raw_checksum: "raw-c0ffee".to_string(),
            retry_count: DICTIONARY_RETRY_THRESHOLD,
            file_size_bytes: 4096,
            last_update_epoch_ms: 1_700_000_000_000,
            download_job_id: None,
            flags: 0,
        }
    }

    fn mk_remote(id: &str, version: u32, locale: &str) -> WordListRecord {
        WordListRecord {
            local_filename: None,
            ..mk_record(id, version, locale, Status::Available)
        }
    }

    // Test IDs: TLOC-001
    #[test]
    fn language_only_candidate_matches_regional_request() {
        assert!(match_level("en", "en_US").is_match());
        assert!(!match_level("en_GB", "en_US").is_match());
        assert!(match_level("en_US", "en_US") > match_level("en", "en_US"));
    }

    // Test IDs: TLOC-002
    #[test]
    fn match_levels_follow_documented_ladder() {
        assert_eq!(match_level("en", "en_US"), MatchLevel::LANGUAGE_MATCH);
        assert_eq!(match_level("en_US", "en"), MatchLevel::LANGUAGE_MATCH_COUNTRY_DIFFER);
        assert_eq!(
            match_level("en_US_POSIX", "en_US_Android"),
            MatchLevel::LANGUAGE_AND_COUNTRY_MATCH_VARIANT_DIFFER
        );
        assert_eq!(match_level("en_US", "en_US_Android"), MatchLevel::LANGUAGE_AND_COUNTRY_MATCH);
        assert_eq!(match_level("sp_US", "en_US"), MatchLevel::NO_MATCH);
        assert_eq!(match_level("de", "de"), MatchLevel::FULL_MATCH);
        assert_eq!(match_level("en_US", "en_US"), MatchLevel::FULL_MATCH);
        assert_eq!(match_level("", "en_US"), MatchLevel::ANY_MATCH);
        assert_eq!(match_level("", ""), MatchLevel::FULL_MATCH);
        assert!(is_match(MatchLevel::ANY_MATCH));
        assert!(!is_match(MatchLevel::LANGUAGE_AND_COUNTRY_MATCH_VARIANT_DIFFER));
    }

    // Test IDs: TLOC-003
    #[test]
    fn resolution_prefers_language_match_over_conflicting_region() {
        let records = vec![
            mk_record("main:fr", 1, "fr", Status::Installed),
            mk_record("main:fr_FR", 1, "fr_FR", Status::Installed),
            mk_record("main:es", 1, "es", Status::Installed),
        ];

        let resolved = select_for_locale(&records, "fr_CA", |_| true);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "main:fr");
        assert_eq!(resolved[0].match_level, MatchLevel::LANGUAGE_MATCH);
    }

    // Test IDs: TLOC-004
    #[test]
    fn resolution_picks_one_winner_per_category() {
        let records = vec![
            mk_record("main:en", 1, "en", Status::Installed),
            mk_record("main:en_US", 1, "en_US", Status::Installed),
            mk_record("emoji:en", 1, "en", Status::Available),
            mk_record("contacts:de", 1, "de", Status::Installed),
        ];

        let resolved = select_for_locale(&records, "en_US", |_| true);
        let ids = resolved.iter().map(|item| item.id.as_str()).collect::<Vec<_>>();

        assert_eq!(ids, vec!["emoji:en", "main:en_US"]);
    }

    // Test IDs: TLOC-005
    #[test]
    fn resolution_skips_installed_rows_without_payload_but_keeps_tombstones() {
        let records = vec![
            mk_record("main:en", 1, "en", Status::Installed),
            mk_record("spell:en", 1, "en", Status::Deleting),
            mk_record("extra:en", 1, "en", Status::Disabled),
        ];

        let resolved = select_for_locale(&records, "en", |_| false);
        let ids = resolved.iter().map(|item| item.id.as_str()).collect::<Vec<_>>();

        assert_eq!(ids, vec!["spell:en"]);
        assert_eq!(resolved[0].status, Status::Deleting);
    }

    // Test IDs: TLOC-006
    #[test]
    fn resolution_keeps_earlier_pick_on_equal_score() {
        let records = vec![
            mk_record("main:first", 1, "en", Status::Installed),
            mk_record("main:second", 1, "en", Status::Installed),
        ];

        let resolved = select_for_locale(&records, "en_US", |_| true);

        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, "main:first");
    }

    // Test IDs: TLOC-007
    #[test]
    fn category_is_prefix_before_separator() {
        assert_eq!(category_of("main:en_US"), "main");
        assert_eq!(category_of("standalone"), "standalone");
        assert_eq!(category_of(":odd"), "");
    }

    // Test IDs: TPLN-001
    #[test]
    fn planner_supersedes_installed_version_before_making_new_one_available() {
        let local = vec![mk_record("en_US:main", 1, "en_US", Status::Installed)];
        let remote = vec![mk_remote("en_US:main", 2, "en_US")];

        let actions = plan_reconciliation(&local, &remote, ReconcileOptions::default());

        assert_eq!(actions.len(), 2);
        assert_eq!(
            actions[0],
            Action::Forget { key: WordListKey::new("en_US:main", 1), has_newer_version: true }
        );
        match &actions[1] {
            Action::MakeAvailable { record } => assert_eq!(record.version, 2),
            other => panic!("expected make_available, got {other:?}"),
        }
    }

    // Test IDs: TPLN-002
    #[test]
    fn planner_handles_new_removed_and_unchanged_ids() {
        let local = vec![
            mk_record("main:de", 3, "de", Status::Installed),
            mk_record("main:it", 1, "it", Status::Available),
        ];
        let remote = vec![mk_remote("main:de", 3, "de"), mk_remote("main:fr", 1, "fr")];

        let actions = plan_reconciliation(&local, &remote, ReconcileOptions::default());
        let names = actions.iter().map(Action::name).collect::<Vec<_>>();

        assert_eq!(names, vec!["update_data", "make_available", "forget"]);
        assert_eq!(
            actions[2],
            Action::Forget { key: WordListKey::new("main:it", 1), has_newer_version: false }
        );
    }

    // Test IDs: TPLN-003
    #[test]
    fn planner_preserves_retry_budget_when_remote_url_is_unchanged() {
        let mut local_row = mk_record("main:en", 1, "en", Status::Installed);
        local_row.retry_count = 1;
        let mut moved = mk_remote("main:en", 1, "en");
        moved.remote_filename = Some("https://mirror.example/main-en".to_string());

        let same_url = plan_reconciliation(
            &[local_row.clone()],
            &[mk_remote("main:en", 1, "en")],
            ReconcileOptions::default(),
        );
        let new_url = plan_reconciliation(&[local_row], &[moved], ReconcileOptions::default());

        match (&same_url[0], &new_url[0]) {
            (Action::UpdateData { record: kept }, Action::UpdateData { record: reset }) => {
                assert_eq!(kept.retry_count, 1);
                assert_eq!(reset.retry_count, DICTIONARY_RETRY_THRESHOLD);
            }
            other => panic!("expected two update_data actions, got {other:?}"),
        }
    }

    // Test IDs: TPLN-004
    #[test]
    fn planner_ignores_unsupported_formats_and_older_remote_versions() {
        let mut future = mk_remote("main:ja", 1, "ja");
        future.format_version = MAXIMUM_SUPPORTED_FORMAT_VERSION + 1;
        let local = vec![mk_record("main:ko", 4, "ko", Status::Installed)];
        let remote = vec![future, mk_remote("main:ko", 3, "ko")];

        let actions = plan_reconciliation(&local, &remote, ReconcileOptions::default());

        assert!(actions.is_empty());
    }

    // Test IDs: TPLN-005
    #[test]
    fn planner_queues_download_for_installed_update_when_enabled() {
        let local = vec![mk_record("main:en", 1, "en", Status::Disabled)];
        let remote = vec![mk_remote("main:en", 2, "en")];

        let actions = plan_reconciliation(
            &local,
            &remote,
            ReconcileOptions { auto_download_updates: true },
        );
        let names = actions.iter().map(Action::name).collect::<Vec<_>>();

        assert_eq!(names, vec!["forget", "make_available", "start_download"]);
        assert_eq!(actions[2], Action::StartDownload { key: WordListKey::new("main:en", 2) });
    }

    // Test IDs: TACT-001
    #[test]
    fn forget_tombstones_rows_that_hold_payloads() {
        let installed = mk_record("main:en", 1, "en", Status::Installed);
        let available = mk_record("main:en", 1, "en", Status::Available);
        let action =
            Action::Forget { key: WordListKey::new("main:en", 1), has_newer_version: true };

        assert!(matches!(action.check(Some(&installed)), Precondition::Warning(_)));
        match action.mutation(Some(&installed)) {
            Mutation::Update(row) => {
                assert_eq!(row.status, Status::Deleting);
                assert_eq!(row.remote_filename.as_deref(), Some(""));
            }
            other => panic!("expected update, got {other:?}"),
        }

        assert_eq!(action.check(Some(&available)), Precondition::Satisfied);
        assert_eq!(
            action.mutation(Some(&available)),
            Mutation::Delete(WordListKey::new("main:en", 1))
        );
        assert_eq!(action.check(None), Precondition::Missing);
    }

    // Test IDs: TACT-002
    #[test]
    fn enable_and_disable_follow_transition_table() {
        let key = WordListKey::new("main:en", 1);
        let enable = Action::Enable { key: key.clone() };
        let disable = Action::Disable { key };

        let disabled = mk_record("main:en", 1, "en", Status::Disabled);
        let available = mk_record("main:en", 1, "en", Status::Available);
        let downloading = WordListRecord {
            download_job_id: Some(7),
            ..mk_record("main:en", 1, "en", Status::Downloading)
        };
        let installed = mk_record("main:en", 1, "en", Status::Installed);

        assert!(matches!(
            enable.mutation(Some(&disabled)),
            Mutation::Update(WordListRecord { status: Status::Installed, .. })
        ));
        assert!(matches!(enable.mutation(Some(&available)), Mutation::BeginDownload(_)));
        assert!(matches!(enable.check(Some(&downloading)), Precondition::Warning(_)));
        assert_eq!(enable.mutation(Some(&downloading)), Mutation::Nothing);

        assert!(matches!(
            disable.mutation(Some(&installed)),
            Mutation::Update(WordListRecord { status: Status::Disabled, .. })
        ));
        assert!(matches!(
            disable.mutation(Some(&downloading)),
            Mutation::Update(WordListRecord {
                status: Status::Available,
                download_job_id: None,
                ..
            })
        ));
        assert!(matches!(disable.check(Some(&available)), Precondition::Warning(_)));
    }

    // Test IDs: TACT-003
    #[test]
    fn finish_delete_reverts_to_available_only_with_remote_source() {
        let key = WordListKey::new("main:en", 1);
        let action = Action::FinishDelete { key: key.clone() };
        let with_url = mk_record("main:en", 1, "en", Status::Deleting);
        let without_url = WordListRecord {
            remote_filename: Some(String::new()),
            ..mk_record("main:en", 1, "en", Status::Deleting)
        };

        assert!(matches!(
            action.mutation(Some(&with_url)),
            Mutation::Update(WordListRecord {
                status: Status::Available,
                local_filename: None,
                ..
            })
        ));
        assert_eq!(action.mutation(Some(&without_url)), Mutation::Delete(key));
    }

    // Test IDs: TACT-004
    #[test]
    fn retry_budget_decrements_then_drops_row() {
        let key = WordListKey::new("main:en", 1);
        let action = Action::MaybeMarkRetrying { key: key.clone() };
        let fresh = mk_record("main:en", 1, "en", Status::Installed);
        let exhausted =
            WordListRecord { retry_count: 1, ..mk_record("main:en", 1, "en", Status::Downloading) };

        match action.mutation(Some(&fresh)) {
            Mutation::Update(row) => {
                assert_eq!(row.status, Status::Retrying);
                assert_eq!(row.retry_count, DICTIONARY_RETRY_THRESHOLD - 1);
            }
            other => panic!("expected update, got {other:?}"),
        }
        assert_eq!(action.mutation(Some(&exhausted)), Mutation::Delete(key));
    }

    // Test IDs: TACT-005
    #[test]
    fn make_available_keeps_existing_row() {
        let record = mk_remote("main:en", 1, "en");
        let action = Action::MakeAvailable { record: record.clone() };
        let existing = mk_record("main:en", 1, "en", Status::Installed);

        assert!(matches!(action.check(Some(&existing)), Precondition::Warning(_)));
        assert_eq!(action.mutation(Some(&existing)), Mutation::Nothing);
        assert!(matches!(
            action.mutation(None),
            Mutation::Insert(WordListRecord { status: Status::Available, .. })
        ));
    }

    // Test IDs: TACT-006
    #[test]
    fn update_data_keeps_local_state_columns() {
        let mut existing = mk_record("main:en", 1, "en", Status::Disabled);
        existing.download_job_id = Some(11);
        let mut incoming = mk_remote("main:en", 1, "en");
        incoming.description = "English (refreshed)".to_string();

        let action = Action::UpdateData { record: incoming };
        let Mutation::Update(first) = action.mutation(Some(&existing)) else {
            panic!("expected update mutation");
        };
        let Mutation::Update(second) = action.mutation(Some(&first)) else {
            panic!("expected update mutation");
        };

        assert_eq!(first, second);
        assert_eq!(first.status, Status::Disabled);
        assert_eq!(first.local_filename, existing.local_filename);
        assert_eq!(first.download_job_id, Some(11));
        assert_eq!(first.description, "English (refreshed)");
    }

    // Test IDs: TACT-007
    #[test]
    fn install_clears_the_finished_download_job() {
        let mut downloading = mk_record("main:en", 2, "en", Status::Downloading);
        downloading.local_filename = None;
        downloading.download_job_id = Some(42);
        let action = Action::Install {
            key: downloading.key(),
            local_filename: "main-en-2.dict".to_string(),
        };

        assert_eq!(action.check(Some(&downloading)), Precondition::Satisfied);
        let Mutation::Install(installed) = action.mutation(Some(&downloading)) else {
            panic!("expected install mutation");
        };
        assert_eq!(installed.status, Status::Installed);
        assert_eq!(installed.local_filename.as_deref(), Some("main-en-2.dict"));
        assert_eq!(installed.download_job_id, None);
    }

    // Test IDs: TINS-001
    #[test]
    fn client_insert_requires_id_and_locale() {
        let missing_locale =
            ClientWordListFields { id: Some("main:en".to_string()), ..Default::default() };
        let missing_id = ClientWordListFields { locale: Some("en".to_string()), ..Default::default() };

        assert!(matches!(complete_with_defaults(missing_locale), Err(CatalogError::Validation(_))));
        assert!(matches!(complete_with_defaults(missing_id), Err(CatalogError::Validation(_))));
    }

    // Test IDs: TINS-002
    #[test]
    fn client_insert_fills_defaults() -> Result<(), CatalogError> {
        let record = complete_with_defaults(ClientWordListFields {
            id: Some("main:en".to_string()),
            locale: Some("en".to_string()),
            ..Default::default()
        })?;

        assert_eq!(record.status, Status::Installed);
        assert_eq!(record.list_type, WordListType::Bulk);
        assert_eq!(record.version, 1);
        assert_eq!(record.local_filename.as_deref(), Some(PREINSTALLED_LOCAL_FILENAME));
        assert_eq!(record.remote_filename.as_deref(), Some(""));
        assert_eq!(record.retry_count, DICTIONARY_RETRY_THRESHOLD);
        Ok(())
    }

    // Test IDs: TFEED-001
    #[test]
    fn remote_feed_rejects_missing_fields_and_drops_empty_locales() {
        let complete = serde_json::json!([
            {
                "id": "main:en",
                "locale": "en",
                "description": "English",
                "update": 1_700_000_000_000_i64,
                "filesize": 1024,
                "checksum": "abc",
                "url": "https://dict.example/main-en",
                "version": 3,
                "formatversion": 2
            },
            {
                "id": "main:none",
                "locale": "",
                "description": "Nothing",
                "update": 0,
                "filesize": 1,
                "checksum": "def",
                "rawChecksum": "raw",
                "url": "https://dict.example/none",
                "version": 1,
                "formatversion": 2
            }
        ]);
        let missing_url = serde_json::json!([{
            "id": "main:en",
            "locale": "en",
            "description": "English",
            "update": 0,
            "filesize": 1024,
            "checksum": "abc",
            "version": 3,
            "formatversion": 2
        }]);

        let parsed = serde_json::from_value::<Vec<RemoteWordList>>(complete);
        let records = match parsed {
            Ok(entries) => prepare_remote_feed(entries),
            Err(err) => panic!("complete feed should parse: {err}"),
        };
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, Status::Available);
        assert_eq!(records[0].retry_count, DICTIONARY_RETRY_THRESHOLD);
        assert!(serde_json::from_value::<Vec<RemoteWordList>>(missing_url).is_err());
    }

    fn locale_strategy() -> impl Strategy<Value = String> {
        (
            prop::sample::select(vec!["en", "fr", "de", ""]),
            prop::option::of(prop::sample::select(vec!["US", "GB", "CA"])),
            prop::option::of(prop::sample::select(vec!["POSIX", "Android"])),
        )
            .prop_map(|(language, country, variant)| match (country, variant) {
                (Some(country), Some(variant)) => format!("{language}_{country}_{variant}"),
                (Some(country), None) => format!("{language}_{country}"),
                (None, _) => language.to_string(),
            })
    }

    // Test IDs: TLOC-008
    proptest! {
        #[test]
        fn property_identical_locales_fully_match(locale in locale_strategy()) {
            prop_assert_eq!(match_level(&locale, &locale), MatchLevel::FULL_MATCH);
        }
    }

    // Test IDs: TLOC-009
    proptest! {
        #[test]
        fn property_dropping_the_last_part_never_breaks_a_match(requested in locale_strategy()) {
            if let Some((general, _)) = requested.rsplit_once('_') {
                prop_assert!(match_level(general, &requested).is_match());
                prop_assert!(match_level(general, &requested) <= match_level(&requested, &requested));
            }
        }
    }

    // Test IDs: TPLN-006
    proptest! {
        #[test]
        fn property_planner_never_leaves_two_live_versions(
            local_version in 1_u32..5,
            remote_version in 1_u32..5,
            status_index in 0_usize..6,
        ) {
            let statuses = [
                Status::Available,
                Status::Downloading,
                Status::Installed,
                Status::Disabled,
                Status::Deleting,
                Status::Retrying,
            ];
            let local = vec![mk_record("main:en", local_version, "en", statuses[status_index])];
            let remote = vec![mk_remote("main:en", remote_version, "en")];

            let mut rows = local.clone();
            for action in plan_reconciliation(&local, &remote, ReconcileOptions::default()) {
                let current = match action.target() {
                    ActionTarget::Key(key) => rows.iter().find(|row| row.key() == key).cloned(),
                    ActionTarget::Record(record) => {
                        rows.iter().find(|row| row.key() == record.key()).cloned()
                    }
                    ActionTarget::DownloadJob(_) => None,
                };
                match action.mutation(current.as_ref()) {
                    Mutation::Insert(row) => rows.push(row),
                    Mutation::Update(row) => {
                        rows.retain(|existing| existing.key() != row.key());
                        rows.push(row);
                    }
                    Mutation::Delete(key) => rows.retain(|existing| existing.key() != key),
                    _ => {}
                }
            }

            let live = rows.iter().filter(|row| row.status.is_active()).count();
            prop_assert!(live <= 1);
            let keys = rows.iter().map(WordListRecord::key).collect::<BTreeSet<_>>();
            prop_assert_eq!(keys.len(), rows.len());
        }
    }
}
