use chrono::{DateTime, Local};
use crossterm::style::Stylize;
use serde_json::Value;

use crate::app::{DescribeResult, WorkloadRow};
use crate::domain::{LogLevel, TrialLogLine};
use crate::error::DetError;

pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &[&str]) -> Self {
        Self {
            headers: headers.iter().map(|header| header.to_string()).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    /// Plain-text grid; multi-line cells grow the row instead of the column.
    pub fn render(&self) -> String {
        let columns = self.headers.len();
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (index, cell) in row.iter().enumerate().take(columns) {
                let width = cell.lines().map(|line| line.chars().count()).max().unwrap_or(0);
                widths[index] = widths[index].max(width);
            }
        }

        let mut out = String::new();
        push_line(&mut out, &self.headers.iter().map(String::as_str).collect::<Vec<_>>(), &widths);
        let rule = widths
            .iter()
            .map(|width| "-".repeat(*width))
            .collect::<Vec<_>>()
            .join("-+-");
        out.push_str(rule.trim_end());
        out.push('\n');

        for row in &self.rows {
            let cells: Vec<Vec<&str>> = (0..columns)
                .map(|index| row.get(index).map(|cell| cell.lines().collect()).unwrap_or_default())
                .collect();
            let height = cells.iter().map(Vec::len).max().unwrap_or(0).max(1);
            for line in 0..height {
                let parts: Vec<&str> = cells
                    .iter()
                    .map(|cell| cell.get(line).copied().unwrap_or(""))
                    .collect();
                push_line(&mut out, &parts, &widths);
            }
        }
        out
    }

    pub fn to_csv(&self) -> Result<String, DetError> {
        let mut writer = csv::Writer::from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .map_err(|err| DetError::Output(err.to_string()))?;
        for row in &self.rows {
            writer
                .write_record(row)
                .map_err(|err| DetError::Output(err.to_string()))?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|err| DetError::Output(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| DetError::Output(err.to_string()))
    }
}

fn push_line(out: &mut String, parts: &[&str], widths: &[usize]) {
    let line = parts
        .iter()
        .zip(widths)
        .map(|(part, width)| format!("{part:<width$}", width = *width))
        .collect::<Vec<_>>()
        .join(" | ");
    out.push_str(line.trim_end());
    out.push('\n');
}

/// RFC 3339 → local `YYYY-MM-DD HH:MM:SS±zzzz`; anything unparsable is shown as-is.
pub fn format_time(raw: Option<&str>) -> String {
    let Some(raw) = raw.filter(|value| !value.is_empty()) else {
        return String::new();
    };
    match DateTime::parse_from_rfc3339(raw) {
        Ok(parsed) => parsed
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M:%S%z")
            .to_string(),
        Err(_) => raw.to_string(),
    }
}

fn field<'a>(value: &'a Value, camel: &str, snake: &str) -> Option<&'a Value> {
    value
        .get(camel)
        .or_else(|| value.get(snake))
        .filter(|found| !found.is_null())
}

fn display_value(value: Option<&Value>) -> String {
    match value {
        None => String::new(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

pub fn trial_table(trial: &Value) -> Table {
    let mut table = Table::new(&["Experiment ID", "State", "H-Params", "Start Time", "End Time"]);
    let hparams = field(trial, "hparams", "hparams")
        .and_then(|hparams| serde_json::to_string_pretty(hparams).ok())
        .unwrap_or_default();
    table.push(vec![
        display_value(field(trial, "experimentId", "experiment_id")),
        display_value(field(trial, "state", "state")),
        hparams,
        format_time(field(trial, "startTime", "start_time").and_then(Value::as_str)),
        format_time(field(trial, "endTime", "end_time").and_then(Value::as_str)),
    ]);
    table
}

pub fn workload_table(workloads: &[WorkloadRow], with_metrics: bool) -> Table {
    let mut headers = vec!["# of Batches", "Kind", "State", "Report Time", "Checkpoint UUID"];
    if with_metrics {
        headers.push("Metrics");
    }
    let mut table = Table::new(&headers);
    for workload in workloads {
        let mut row = vec![
            workload
                .total_batches
                .map(|batches| batches.to_string())
                .unwrap_or_default(),
            workload.kind.clone(),
            workload.state.clone().unwrap_or_default(),
            format_time(workload.end_time.as_deref()),
            workload.checkpoint_uuid.clone().unwrap_or_default(),
        ];
        if with_metrics {
            row.push(
                workload
                    .metrics
                    .as_ref()
                    .and_then(|metrics| serde_json::to_string_pretty(metrics).ok())
                    .unwrap_or_default(),
            );
        }
        table.push(row);
    }
    table
}

pub fn describe_text(result: &DescribeResult, with_metrics: bool, csv: bool) -> Result<String, DetError> {
    let trial = trial_table(&result.trial);
    let workloads = workload_table(&result.workloads, with_metrics);
    let (trial, workloads) = if csv {
        (trial.to_csv()?, workloads.to_csv()?)
    } else {
        (trial.render(), workloads.render())
    };
    Ok(format!("{trial}\nWorkloads:\n{workloads}"))
}

/// The message verbatim, tinted by level when writing to a terminal.
pub fn format_log_line(line: &TrialLogLine, colour: bool) -> String {
    let level = line
        .level
        .as_deref()
        .and_then(|level| level.parse::<LogLevel>().ok());
    if !colour {
        return line.message.clone();
    }
    match level {
        Some(LogLevel::Critical | LogLevel::Error) => line.message.clone().red().to_string(),
        Some(LogLevel::Warning) => line.message.clone().yellow().to_string(),
        Some(LogLevel::Trace | LogLevel::Debug) => line.message.clone().dark_grey().to_string(),
        Some(LogLevel::Info) | None => line.message.clone(),
    }
}
