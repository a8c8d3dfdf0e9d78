use std::io::{BufRead, BufReader};
use std::time::Duration;

use reqwest::Method;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::domain::{ExperimentId, LogLevel, MasterLogLine, Rfc3339, TrialId, TrialLogLine};
use crate::error::DetError;
use crate::session::Session;

pub type TrialLogStream = Box<dyn Iterator<Item = Result<TrialLogLine, DetError>>>;

/// Raw `GET /api/v1/trials/{id}` payload (the `trial` object).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct TrialSnapshot(Value);

impl TrialSnapshot {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }

    pub fn experiment_id(&self) -> Result<ExperimentId, DetError> {
        self.0
            .get("experimentId")
            .or_else(|| self.0.get("experiment_id"))
            .and_then(Value::as_u64)
            .and_then(ExperimentId::new)
            .ok_or(DetError::MissingExperimentId)
    }
}

/// Raw `GET /api/v1/experiments/{id}` payload, kept whole.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ExperimentSnapshot(Value);

impl ExperimentSnapshot {
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn raw(&self) -> &Value {
        &self.0
    }
}

/// Filters accepted by the trial log endpoint.
#[derive(Debug, Clone, Default)]
pub struct TrialLogQuery {
    pub head: Option<u64>,
    pub tail: Option<u64>,
    pub follow: bool,
    pub agent_ids: Vec<String>,
    pub container_ids: Vec<String>,
    pub rank_ids: Vec<i64>,
    pub sources: Vec<String>,
    pub stdtypes: Vec<String>,
    pub level: Option<LogLevel>,
    pub timestamp_before: Option<Rfc3339>,
    pub timestamp_after: Option<Rfc3339>,
}

impl TrialLogQuery {
    pub fn validate(&self) -> Result<(), DetError> {
        if self.head.is_some() && self.tail.is_some() {
            return Err(DetError::InvalidQuery(
                "--head and --tail cannot be combined".to_string(),
            ));
        }
        Ok(())
    }

    /// The finite part of a `--tail --follow` query: the newest `tail` lines.
    pub fn backlog(&self) -> Self {
        Self {
            follow: false,
            ..self.clone()
        }
    }

    /// The live part of a `--tail --follow` query, resuming after the newest
    /// backlog line. An empty backlog keeps the caller's own lower bound.
    pub fn resume_after(&self, last: Option<&TrialLogLine>) -> Self {
        let timestamp_after = last
            .and_then(|line| line.timestamp.as_deref())
            .and_then(|timestamp| timestamp.parse::<Rfc3339>().ok())
            .or_else(|| self.timestamp_after.clone());
        Self {
            head: None,
            tail: None,
            follow: true,
            timestamp_after,
            ..self.clone()
        }
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(head) = self.head {
            params.push(("limit", head.to_string()));
        }
        if let Some(tail) = self.tail {
            params.push(("limit", tail.to_string()));
            params.push(("order_by", "ORDER_BY_DESC".to_string()));
        }
        if self.follow {
            params.push(("follow", "true".to_string()));
        }
        for value in &self.agent_ids {
            params.push(("agent_ids", value.clone()));
        }
        for value in &self.container_ids {
            params.push(("container_ids", value.clone()));
        }
        for value in &self.rank_ids {
            params.push(("rank_ids", value.to_string()));
        }
        for value in &self.sources {
            params.push(("sources", value.clone()));
        }
        for value in &self.stdtypes {
            params.push(("stdtypes", value.clone()));
        }
        if let Some(level) = self.level {
            for value in level.at_or_above() {
                params.push(("levels", value.api_name()));
            }
        }
        if let Some(before) = &self.timestamp_before {
            params.push(("timestamp_before", before.as_str().to_string()));
        }
        if let Some(after) = &self.timestamp_after {
            params.push(("timestamp_after", after.as_str().to_string()));
        }
        params
    }
}

pub trait TrialLogSource {
    fn trial_logs(
        &self,
        session: &Session,
        trial_id: TrialId,
        query: &TrialLogQuery,
    ) -> Result<TrialLogStream, DetError>;
}

pub trait MasterLogSource {
    fn master_logs(&self, session: &Session) -> Result<Vec<MasterLogLine>, DetError>;
}

pub trait MetadataSource {
    fn get_trial(&self, session: &Session, trial_id: TrialId) -> Result<TrialSnapshot, DetError>;
    fn get_experiment(
        &self,
        session: &Session,
        experiment_id: ExperimentId,
    ) -> Result<ExperimentSnapshot, DetError>;
}

pub trait WorkloadSource {
    fn trial_workloads(&self, session: &Session, trial_id: TrialId)
    -> Result<Vec<Value>, DetError>;
}

pub trait TrialControl {
    fn kill_trial(&self, session: &Session, trial_id: TrialId) -> Result<(), DetError>;
}

/// Everything the CLI needs from the master.
pub trait MasterApi:
    TrialLogSource + MasterLogSource + MetadataSource + WorkloadSource + TrialControl
{
}

impl<T> MasterApi for T where
    T: TrialLogSource + MasterLogSource + MetadataSource + WorkloadSource + TrialControl
{
}

#[derive(Clone)]
pub struct MasterHttpClient {
    client: Client,
}

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

impl MasterHttpClient {
    pub fn new() -> Result<Self, DetError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("det-trial/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| DetError::MasterHttp(err.to_string()))?,
        );
        // Log streams can stay open for as long as the trial runs, so only
        // connecting is bounded client-wide; plain calls set REQUEST_TIMEOUT.
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(Duration::from_secs(10))
            .timeout(None::<Duration>)
            .build()
            .map_err(|err| DetError::MasterHttp(err.to_string()))?;
        Ok(Self { client })
    }

    fn request(
        &self,
        session: &Session,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, DetError> {
        let token = session.require_token()?;
        let url = session.endpoint(path)?;
        tracing::debug!(%method, %url, "master request");
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    fn send(request: RequestBuilder) -> Result<Response, DetError> {
        let response = request
            .send()
            .map_err(|err| DetError::MasterHttp(err.to_string()))?;
        Self::handle_status(response)
    }

    fn handle_status(response: Response) -> Result<Response, DetError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status().as_u16();
        let message = response
            .text()
            .ok()
            .map(|body| extract_error_message(&body))
            .unwrap_or_else(|| "master request failed".to_string());
        Err(DetError::MasterStatus { status, message })
    }

    fn get_json(&self, session: &Session, path: &str) -> Result<Value, DetError> {
        let request = self
            .request(session, Method::GET, path)?
            .timeout(REQUEST_TIMEOUT);
        let response = Self::send(request)?;
        response
            .json::<Value>()
            .map_err(|err| DetError::Decode(err.to_string()))
    }
}

impl TrialLogSource for MasterHttpClient {
    fn trial_logs(
        &self,
        session: &Session,
        trial_id: TrialId,
        query: &TrialLogQuery,
    ) -> Result<TrialLogStream, DetError> {
        query.validate()?;
        if query.tail.is_none() {
            return self.open_trial_logs(session, trial_id, query);
        }
        // Tail is fetched newest-first; restore chronological order.
        let mut lines = self
            .open_trial_logs(session, trial_id, &query.backlog())?
            .collect::<Result<Vec<_>, DetError>>()?;
        lines.reverse();
        if !query.follow {
            return Ok(Box::new(lines.into_iter().map(Ok)));
        }
        let live = self.open_trial_logs(session, trial_id, &query.resume_after(lines.last()))?;
        Ok(Box::new(lines.into_iter().map(Ok).chain(live)))
    }
}

impl MasterHttpClient {
    fn open_trial_logs(
        &self,
        session: &Session,
        trial_id: TrialId,
        query: &TrialLogQuery,
    ) -> Result<TrialLogStream, DetError> {
        let path = format!("api/v1/trials/{trial_id}/logs");
        let request = self
            .request(session, Method::GET, &path)?
            .query(&query.to_params());
        let response = Self::send(request)?;
        Ok(decode_trial_log_stream(BufReader::new(response)))
    }
}

impl MasterLogSource for MasterHttpClient {
    fn master_logs(&self, session: &Session) -> Result<Vec<MasterLogLine>, DetError> {
        let request = self.request(session, Method::GET, "api/v1/master/logs")?;
        let response = Self::send(request)?;
        decode_master_log_stream(BufReader::new(response))
    }
}

impl MetadataSource for MasterHttpClient {
    fn get_trial(&self, session: &Session, trial_id: TrialId) -> Result<TrialSnapshot, DetError> {
        let mut body = self.get_json(session, &format!("api/v1/trials/{trial_id}"))?;
        let trial = body
            .get_mut("trial")
            .map(Value::take)
            .ok_or_else(|| DetError::Decode("response has no `trial` field".to_string()))?;
        Ok(TrialSnapshot::new(trial))
    }

    fn get_experiment(
        &self,
        session: &Session,
        experiment_id: ExperimentId,
    ) -> Result<ExperimentSnapshot, DetError> {
        let body = self.get_json(session, &format!("api/v1/experiments/{experiment_id}"))?;
        Ok(ExperimentSnapshot::new(body))
    }
}

impl WorkloadSource for MasterHttpClient {
    fn trial_workloads(
        &self,
        session: &Session,
        trial_id: TrialId,
    ) -> Result<Vec<Value>, DetError> {
        let mut body = self.get_json(session, &format!("api/v1/trials/{trial_id}/workloads"))?;
        match body.get_mut("workloads").map(Value::take) {
            Some(Value::Array(workloads)) => Ok(workloads),
            Some(Value::Null) | None => Ok(Vec::new()),
            Some(other) => Err(DetError::Decode(format!(
                "expected workloads array, got {other}"
            ))),
        }
    }
}

impl TrialControl for MasterHttpClient {
    fn kill_trial(&self, session: &Session, trial_id: TrialId) -> Result<(), DetError> {
        let request = self
            .request(session, Method::POST, &format!("api/v1/trials/{trial_id}/kill"))?
            .timeout(REQUEST_TIMEOUT);
        Self::send(request)?;
        Ok(())
    }
}

/// Lazily decodes a newline-delimited `{"result": {...}}` trial log stream.
pub fn decode_trial_log_stream<R: BufRead + 'static>(reader: R) -> TrialLogStream {
    Box::new(reader.lines().filter_map(|line| match line {
        Err(err) => Some(Err(DetError::MasterHttp(err.to_string()))),
        Ok(line) if line.trim().is_empty() => None,
        Ok(line) => Some(decode_stream_line::<TrialLogLine>(&line, None)),
    }))
}

/// Drains a newline-delimited `{"result": {"logEntry": {...}}}` master log stream.
pub fn decode_master_log_stream<R: BufRead>(reader: R) -> Result<Vec<MasterLogLine>, DetError> {
    let mut entries = Vec::new();
    for line in reader.lines() {
        let line = line.map_err(|err| DetError::MasterHttp(err.to_string()))?;
        if line.trim().is_empty() {
            continue;
        }
        entries.push(decode_stream_line::<MasterLogLine>(&line, Some("logEntry"))?);
    }
    Ok(entries)
}

fn decode_stream_line<T: DeserializeOwned>(line: &str, inner: Option<&str>) -> Result<T, DetError> {
    let value: Value =
        serde_json::from_str(line).map_err(|err| DetError::Decode(err.to_string()))?;
    if let Some(error) = value.get("error").filter(|error| !error.is_null()) {
        return Err(DetError::MasterStream(extract_error_message(&error.to_string())));
    }
    let mut payload = match value {
        Value::Object(mut map) if map.contains_key("result") => {
            map.remove("result").unwrap_or(Value::Null)
        }
        other => other,
    };
    if let Some(key) = inner {
        payload = payload
            .get_mut(key)
            .map(Value::take)
            .ok_or_else(|| DetError::Decode(format!("stream entry has no `{key}` field")))?;
    }
    serde_json::from_value(payload).map_err(|err| DetError::Decode(err.to_string()))
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|value| {
            value
                .get("message")
                .or_else(|| value.get("error").and_then(|error| error.get("message")))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}
