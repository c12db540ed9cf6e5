use std::io::{self, Write};

use serde::Serialize;

use crate::app::{DeleteReport, GeographyReport, ProgressEvent, ProgressSink};
use crate::companies::CompanyReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_geography(report: &GeographyReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_companies(report: &CompanyReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_delete(report: &DeleteReport) -> io::Result<()> {
        Self::print_json(report)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}
