//! Support bundles: one `.tar.gz` per trial holding its logs, the master's
//! logs and the raw trial/experiment API responses.
//!
//! Every source is fetched into a private staging directory first. The
//! archive is written next to its final path under a temporary name and only
//! renamed into place once the gzip stream is complete, so a failed run never
//! leaves a bundle behind.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDateTime;
use serde::Serialize;

use crate::api::{MasterLogSource, MetadataSource, TrialLogQuery, TrialLogSource, TrialLogStream};
use crate::app::{ProgressEvent, ProgressSink};
use crate::archive::ArchiveWriter;
use crate::domain::{MasterLogLine, TrialId};
use crate::error::DetError;
use crate::session::Session;

pub const TRIAL_LOGS_ENTRY: &str = "trial_logs.txt";
pub const MASTER_LOGS_ENTRY: &str = "master_logs.txt";
pub const TRIAL_CALL_ENTRY: &str = "api_trial_call.json";
pub const EXPERIMENT_CALL_ENTRY: &str = "api_experiment_call.json";

/// Archive members, in the order they are written.
pub const BUNDLE_ENTRIES: [&str; 4] = [
    TRIAL_LOGS_ENTRY,
    MASTER_LOGS_ENTRY,
    TRIAL_CALL_ENTRY,
    EXPERIMENT_CALL_ENTRY,
];

#[derive(Debug, Clone)]
pub struct BundleRequest {
    pub trial_id: TrialId,
    pub output_directory: Option<Utf8PathBuf>,
}

pub trait Clock {
    fn now(&self) -> NaiveDateTime;
}

/// Wall-clock local time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

pub fn bundle_file_name(trial_id: TrialId, created_at: NaiveDateTime) -> String {
    format!(
        "det-bundle-trial-{trial_id}-{}.tar.gz",
        created_at.format("%Y%m%dT%H%M%S")
    )
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleResult {
    pub trial_id: TrialId,
    pub experiment_id: u64,
    pub path: Utf8PathBuf,
    pub trial_log_lines: usize,
    pub master_log_lines: usize,
}

pub struct BundleAssembler<'a, S, C = SystemClock> {
    source: &'a S,
    session: &'a Session,
    clock: C,
    staging_root: Option<PathBuf>,
}

impl<'a, S> BundleAssembler<'a, S, SystemClock>
where
    S: TrialLogSource + MasterLogSource + MetadataSource,
{
    pub fn new(source: &'a S, session: &'a Session) -> Self {
        Self::with_clock(source, session, SystemClock)
    }
}

impl<'a, S, C> BundleAssembler<'a, S, C>
where
    S: TrialLogSource + MasterLogSource + MetadataSource,
    C: Clock,
{
    pub fn with_clock(source: &'a S, session: &'a Session, clock: C) -> Self {
        Self {
            source,
            session,
            clock,
            staging_root: None,
        }
    }

    /// Stage files under `root` instead of the system temp directory.
    pub fn staging_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.staging_root = Some(root.into());
        self
    }

    pub fn assemble(
        &self,
        request: &BundleRequest,
        sink: &dyn ProgressSink,
    ) -> Result<BundleResult, DetError> {
        let trial_id = request.trial_id;
        let output_dir = resolve_output_dir(request.output_directory.as_deref())?;

        let prefix = format!("det-bundle-{trial_id}-");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);
        let staging = match &self.staging_root {
            Some(root) => builder.tempdir_in(root),
            None => builder.tempdir(),
        }
        .map_err(|err| DetError::Filesystem(format!("create staging directory: {err}")))?;
        let staged = |entry: &str| staging.path().join(entry);

        sink.event(ProgressEvent::phase(format!(
            "phase=Fetch; trial {trial_id} logs"
        )));
        let stream =
            self.source
                .trial_logs(self.session, trial_id, &TrialLogQuery::default())?;
        let trial_log_lines = write_trial_logs(stream, &staged(TRIAL_LOGS_ENTRY))?;

        sink.event(ProgressEvent::phase("phase=Fetch; master logs"));
        let master_logs = self.source.master_logs(self.session)?;
        write_master_logs(&master_logs, &staged(MASTER_LOGS_ENTRY))?;

        sink.event(ProgressEvent::phase(format!(
            "phase=Fetch; trial {trial_id} metadata"
        )));
        let trial = self.source.get_trial(self.session, trial_id)?;
        let experiment_id = trial.experiment_id()?;
        let experiment = self.source.get_experiment(self.session, experiment_id)?;
        write_json(trial.raw(), &staged(TRIAL_CALL_ENTRY))?;
        write_json(experiment.raw(), &staged(EXPERIMENT_CALL_ENTRY))?;

        let file_name = bundle_file_name(trial_id, self.clock.now());
        let path = output_dir.join(file_name);
        sink.event(ProgressEvent::phase(format!("phase=Archive; {path}")));

        let mut archive = ArchiveWriter::create(&path)?;
        for entry in BUNDLE_ENTRIES {
            archive.append_file(entry, &staged(entry))?;
        }
        archive.commit()?;

        let staging_path = staging.path().to_path_buf();
        if let Err(err) = staging.close() {
            tracing::warn!(
                path = %staging_path.display(),
                error = %err,
                "failed to remove bundle staging directory"
            );
        }

        tracing::info!(
            trial_id = trial_id.get(),
            experiment_id = experiment_id.get(),
            trial_log_lines,
            master_log_lines = master_logs.len(),
            path = %path,
            "support bundle written"
        );

        Ok(BundleResult {
            trial_id,
            experiment_id: experiment_id.get(),
            path,
            trial_log_lines,
            master_log_lines: master_logs.len(),
        })
    }
}

fn resolve_output_dir(requested: Option<&Utf8Path>) -> Result<Utf8PathBuf, DetError> {
    let dir = match requested {
        Some(dir) => dir.to_path_buf(),
        None => {
            let cwd =
                std::env::current_dir().map_err(|err| DetError::Filesystem(err.to_string()))?;
            Utf8PathBuf::from_path_buf(cwd).map_err(|_| {
                DetError::Filesystem("current directory is not valid UTF-8".to_string())
            })?
        }
    };
    if !dir.as_std_path().is_dir() {
        return Err(DetError::Filesystem(format!(
            "output directory does not exist: {dir}"
        )));
    }
    Ok(dir)
}

/// Messages are written verbatim; the master keeps their trailing newlines.
fn write_trial_logs(stream: TrialLogStream, path: &Path) -> Result<usize, DetError> {
    let mut writer = create_staged(path)?;
    let mut lines = 0usize;
    for line in stream {
        let line = line?;
        writer
            .write_all(line.message.as_bytes())
            .map_err(|err| DetError::Filesystem(err.to_string()))?;
        lines += 1;
    }
    writer
        .flush()
        .map_err(|err| DetError::Filesystem(err.to_string()))?;
    Ok(lines)
}

fn write_master_logs(entries: &[MasterLogLine], path: &Path) -> Result<(), DetError> {
    let mut writer = create_staged(path)?;
    for (index, entry) in entries.iter().enumerate() {
        if index > 0 {
            writer
                .write_all(b"\n")
                .map_err(|err| DetError::Filesystem(err.to_string()))?;
        }
        write!(writer, "{entry}").map_err(|err| DetError::Filesystem(err.to_string()))?;
    }
    writer
        .flush()
        .map_err(|err| DetError::Filesystem(err.to_string()))
}

fn write_json<T: Serialize>(value: &T, path: &Path) -> Result<(), DetError> {
    let mut writer = create_staged(path)?;
    serde_json::to_writer_pretty(&mut writer, value)
        .map_err(|err| DetError::Filesystem(err.to_string()))?;
    writer
        .flush()
        .map_err(|err| DetError::Filesystem(err.to_string()))
}

fn create_staged(path: &Path) -> Result<BufWriter<File>, DetError> {
    let file = File::create(path)
        .map_err(|err| DetError::Filesystem(format!("create {}: {err}", path.display())))?;
    Ok(BufWriter::new(file))
}
