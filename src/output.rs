use std::io::{self, Write};

use serde::Serialize;

use crate::app::{BundleReport, DescribeResult, KillResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Interactive,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_describe(result: &DescribeResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_kill(result: &KillResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_bundle(result: &BundleReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_json<T: Serialize + ?Sized>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl crate::app::ProgressSink for JsonOutput {
    fn event(&self, _event: crate::app::ProgressEvent) {}
}
