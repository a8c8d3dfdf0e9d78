#![allow(dead_code)]

use std::sync::Mutex;

use serde_json::{Value, json};
use url::Url;

use det_trial_cli::api::{
    ExperimentSnapshot, MasterLogSource, MetadataSource, TrialControl, TrialLogQuery,
    TrialLogSource, TrialLogStream, TrialSnapshot, WorkloadSource,
};
use det_trial_cli::domain::{ExperimentId, MasterLogLine, TrialId, TrialLogLine};
use det_trial_cli::error::DetError;
use det_trial_cli::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailAt {
    TrialLogs,
    TrialLogsMidStream,
    MasterLogs,
    Trial,
    Experiment,
}

pub struct FakeMaster {
    pub trial_logs: Vec<String>,
    pub master_logs: Vec<MasterLogLine>,
    pub experiment_id: u64,
    pub workloads: Vec<Value>,
    pub fail_at: Option<FailAt>,
    pub killed: Mutex<Vec<u64>>,
    pub experiment_calls: Mutex<Vec<u64>>,
}

impl Default for FakeMaster {
    fn default() -> Self {
        Self {
            trial_logs: vec!["a".to_string(), "b".to_string(), "c".to_string()],
            master_logs: vec![master_line("t0", "INFO", "m")],
            experiment_id: 3,
            workloads: Vec::new(),
            fail_at: None,
            killed: Mutex::new(Vec::new()),
            experiment_calls: Mutex::new(Vec::new()),
        }
    }
}

impl FakeMaster {
    pub fn failing_at(fail_at: FailAt) -> Self {
        Self {
            fail_at: Some(fail_at),
            ..Self::default()
        }
    }

    fn fails(&self, step: FailAt) -> bool {
        self.fail_at == Some(step)
    }
}

pub fn master_line(timestamp: &str, level: &str, message: &str) -> MasterLogLine {
    MasterLogLine {
        timestamp: timestamp.to_string(),
        level: level.to_string(),
        message: message.to_string(),
    }
}

pub fn not_found(what: &str) -> DetError {
    DetError::MasterStatus {
        status: 404,
        message: format!("{what} not found"),
    }
}

pub fn session() -> Session {
    Session::new(
        Url::parse("http://localhost:8080/").unwrap(),
        Some("test-token".to_string()),
    )
}

impl TrialLogSource for FakeMaster {
    fn trial_logs(
        &self,
        _session: &Session,
        trial_id: TrialId,
        _query: &TrialLogQuery,
    ) -> Result<TrialLogStream, DetError> {
        if self.fails(FailAt::TrialLogs) {
            return Err(not_found(&format!("trial {trial_id}")));
        }
        let mut lines: Vec<Result<TrialLogLine, DetError>> = self
            .trial_logs
            .iter()
            .map(|message| Ok(TrialLogLine::new(message.clone())))
            .collect();
        if self.fails(FailAt::TrialLogsMidStream) {
            lines.push(Err(DetError::MasterStream("stream reset".to_string())));
        }
        Ok(Box::new(lines.into_iter()))
    }
}

impl MasterLogSource for FakeMaster {
    fn master_logs(&self, _session: &Session) -> Result<Vec<MasterLogLine>, DetError> {
        if self.fails(FailAt::MasterLogs) {
            return Err(DetError::MasterHttp("connection refused".to_string()));
        }
        Ok(self.master_logs.clone())
    }
}

impl MetadataSource for FakeMaster {
    fn get_trial(&self, _session: &Session, trial_id: TrialId) -> Result<TrialSnapshot, DetError> {
        if self.fails(FailAt::Trial) {
            return Err(not_found(&format!("trial {trial_id}")));
        }
        Ok(TrialSnapshot::new(json!({
            "id": trial_id.get(),
            "experimentId": self.experiment_id,
            "state": "STATE_COMPLETED",
            "hparams": {"lr": 0.01},
            "startTime": "2024-01-01T00:00:00Z",
            "endTime": "2024-01-01T01:00:00Z",
        })))
    }

    fn get_experiment(
        &self,
        _session: &Session,
        experiment_id: ExperimentId,
    ) -> Result<ExperimentSnapshot, DetError> {
        self.experiment_calls
            .lock()
            .unwrap()
            .push(experiment_id.get());
        if self.fails(FailAt::Experiment) {
            return Err(not_found(&format!("experiment {experiment_id}")));
        }
        Ok(ExperimentSnapshot::new(json!({
            "experiment": {"id": experiment_id.get(), "name": "mnist", "state": "STATE_COMPLETED"},
            "jobSummary": null,
        })))
    }
}

impl WorkloadSource for FakeMaster {
    fn trial_workloads(
        &self,
        _session: &Session,
        _trial_id: TrialId,
    ) -> Result<Vec<Value>, DetError> {
        Ok(self.workloads.clone())
    }
}

impl TrialControl for FakeMaster {
    fn kill_trial(&self, _session: &Session, trial_id: TrialId) -> Result<(), DetError> {
        self.killed.lock().unwrap().push(trial_id.get());
        Ok(())
    }
}
