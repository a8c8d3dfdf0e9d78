use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::Value;

use crate::api::{MasterApi, TrialLogQuery, TrialLogStream};
use crate::archive::list_archive_entries;
use crate::bundle::{BundleAssembler, BundleRequest, BundleResult, Clock, SystemClock};
use crate::domain::TrialId;
use crate::error::DetError;
use crate::session::Session;

#[derive(Debug, Clone, Serialize)]
pub struct DescribeResult {
    pub trial: Value,
    pub workloads: Vec<WorkloadRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkloadRow {
    pub kind: String,
    pub total_batches: Option<u64>,
    pub state: Option<String>,
    pub end_time: Option<String>,
    pub checkpoint_uuid: Option<String>,
    pub metrics: Option<Value>,
}

impl WorkloadRow {
    /// Workloads arrive as `{"training": {...}}`, `{"validation": {...}}` or
    /// `{"checkpoint": {...}}`; the first non-null key decides the kind.
    pub fn from_api(value: &Value) -> Option<Self> {
        let object = value.as_object()?;
        let (kind, body) = ["training", "validation", "checkpoint"]
            .into_iter()
            .find_map(|kind| {
                object
                    .get(kind)
                    .filter(|body| !body.is_null())
                    .map(|body| (kind, body))
            })?;
        let text = |key: &str| body.get(key).and_then(Value::as_str).map(str::to_string);
        Some(Self {
            kind: kind.to_string(),
            total_batches: body.get("totalBatches").and_then(Value::as_u64),
            state: text("state"),
            end_time: text("endTime"),
            checkpoint_uuid: text("uuid"),
            metrics: body.get("metrics").filter(|metrics| !metrics.is_null()).cloned(),
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KillResult {
    pub trial_id: TrialId,
    pub killed: bool,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn phase(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Reports progress as `tracing` events.
pub struct TracingProgress;

impl ProgressSink for TracingProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}

pub struct App<C: MasterApi> {
    client: C,
    session: Session,
}

impl<C: MasterApi> App<C> {
    pub fn new(client: C, session: Session) -> Self {
        Self { client, session }
    }

    pub fn describe(
        &self,
        trial_id: TrialId,
        sink: &dyn ProgressSink,
    ) -> Result<DescribeResult, DetError> {
        sink.event(ProgressEvent::phase(format!("phase=Fetch; trial {trial_id}")));
        let trial = self.client.get_trial(&self.session, trial_id)?;
        sink.event(ProgressEvent::phase(format!(
            "phase=Fetch; trial {trial_id} workloads"
        )));
        let workloads = self
            .client
            .trial_workloads(&self.session, trial_id)?
            .iter()
            .filter_map(WorkloadRow::from_api)
            .collect();
        Ok(DescribeResult {
            trial: trial.raw().clone(),
            workloads,
        })
    }

    pub fn logs(&self, trial_id: TrialId, query: &TrialLogQuery) -> Result<TrialLogStream, DetError> {
        query.validate()?;
        self.client.trial_logs(&self.session, trial_id, query)
    }

    pub fn kill(&self, trial_id: TrialId, sink: &dyn ProgressSink) -> Result<KillResult, DetError> {
        sink.event(ProgressEvent::phase(format!("phase=Kill; trial {trial_id}")));
        self.client.kill_trial(&self.session, trial_id)?;
        Ok(KillResult {
            trial_id,
            killed: true,
        })
    }

    pub fn support_bundle(
        &self,
        request: &BundleRequest,
        sink: &dyn ProgressSink,
    ) -> Result<BundleReport, DetError> {
        self.support_bundle_with_clock(request, SystemClock, sink)
    }

    pub fn support_bundle_with_clock<K: Clock>(
        &self,
        request: &BundleRequest,
        clock: K,
        sink: &dyn ProgressSink,
    ) -> Result<BundleReport, DetError> {
        let started = Instant::now();
        let bundle = BundleAssembler::with_clock(&self.client, &self.session, clock)
            .assemble(request, sink)?;
        let entries = list_archive_entries(&bundle.path)?;
        sink.event(ProgressEvent {
            message: format!("phase=Done; {} entries", entries.len()),
            elapsed: Some(started.elapsed()),
        });
        Ok(BundleReport { bundle, entries })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BundleReport {
    #[serde(flatten)]
    pub bundle: BundleResult,
    pub entries: Vec<String>,
}
