use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::{anyhow, Result};
use dictpack_core::{
    Action, ActionTarget, BatchReport, Mutation, Precondition, Problem, ProblemReporter, Severity,
    WarningPolicy, WordListRecord,
};
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::{resolve_payload_path, SqliteStore};

/// Applies action batches to one catalog, one action at a time.
///
/// A failing action is reported and the batch moves on. Warnings go to the reporter, whose
/// answer decides whether the warned action still runs.
pub struct ActionExecutor<'a, R: ProblemReporter + ?Sized> {
    payload_dir: &'a Path,
    reporter: &'a R,
}

impl<'a, R: ProblemReporter + ?Sized> ActionExecutor<'a, R> {
    #[must_use]
    pub fn new(payload_dir: &'a Path, reporter: &'a R) -> Self {
        Self { payload_dir, reporter }
    }

    #[tracing::instrument(
        skip(self, store, actions),
        fields(batch_id = tracing::field::Empty, action_count = actions.len())
    )]
    pub fn run(&self, store: &mut SqliteStore, actions: Vec<Action>) -> BatchReport {
        let mut report = BatchReport::new(Ulid::new().to_string());
        tracing::Span::current().record("batch_id", report.batch_id.as_str());

        for action in actions {
            self.run_one(store, &action, &mut report);
        }

        info!(
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "action batch finished"
        );
        report
    }

    fn run_one(&self, store: &mut SqliteStore, action: &Action, report: &mut BatchReport) {
        let current = match lookup_target(store, action) {
            Ok(current) => current,
            Err(err) => {
                self.fail(action, format!("failed to load target row: {err:#}"), report);
                return;
            }
        };

        match action.check(current.as_ref()) {
            Precondition::Satisfied => {}
            Precondition::Missing => {
                let problem = problem(action, Severity::Error, "target word list not found");
                self.reporter.error(&problem);
                report.problems.push(problem);
                report.skipped += 1;
                return;
            }
            Precondition::Warning(message) => {
                let problem = problem(action, Severity::Warning, message);
                let policy = self.reporter.warning(&problem);
                report.problems.push(problem);
                if policy == WarningPolicy::Skip {
                    report.skipped += 1;
                    return;
                }
            }
        }

        match self.apply(store, action.mutation(current.as_ref())) {
            Ok(()) => {
                debug!(action = action.name(), target = %action.target_label(), "action applied");
                report.applied += 1;
            }
            Err(err) => self.fail(action, format!("{err:#}"), report),
        }
    }

    fn apply(&self, store: &mut SqliteStore, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Insert(record) => {
                store.insert_record_if_absent(&record)?;
            }
            Mutation::Update(record) => {
                if !store.update_record(&record)? {
                    return Err(anyhow!("word list {} vanished during update", record.key()));
                }
            }
            Mutation::Delete(key) => {
                store.delete_record(&key)?;
            }
            Mutation::BeginDownload(record) => {
                let job_id = store.begin_download(&record.key())?;
                info!(word_list_id = %record.id, version = record.version, job_id, "download started");
            }
            Mutation::Install(record) => {
                let superseded = store.install_record(&record)?;
                for local_filename in superseded {
                    self.unlink_payload(&local_filename);
                }
            }
            Mutation::Nothing => {}
        }
        Ok(())
    }

    // Runs after the install transaction committed; failures only leak a file.
    fn unlink_payload(&self, local_filename: &str) {
        let Some(path) = resolve_payload_path(self.payload_dir, local_filename) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed superseded payload"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove payload"),
        }
    }

    fn fail(&self, action: &Action, message: String, report: &mut BatchReport) {
        let problem = problem(action, Severity::Error, message);
        self.reporter.error(&problem);
        report.problems.push(problem);
        report.failed += 1;
    }
}

fn lookup_target(store: &SqliteStore, action: &Action) -> Result<Option<WordListRecord>> {
    match action.target() {
        ActionTarget::Key(key) => store.get_record(&key),
        ActionTarget::Record(record) => store.get_record(&record.key()),
        ActionTarget::DownloadJob(job_id) => store.find_downloading_by_job(job_id),
    }
}

fn problem(action: &Action, severity: Severity, message: impl Into<String>) -> Problem {
    Problem {
        action: action.name().to_string(),
        target: action.target_label(),
        severity,
        message: message.into(),
    }
}
