use crate::domain::orchestration::StatusReport;
use crate::error::Result;
use serde::Serialize;
use std::io::Write;

#[derive(Serialize)]
struct ReportRow<'a> {
    instance: &'a str,
    status: &'a str,
    success: Option<bool>,
    message: &'a str,
}

/// Writes status reports as `instance,status,success,message` CSV rows.
pub struct StatusReportWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> StatusReportWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    /// Writes all reports and flushes. Failed instances carry their failure
    /// reason in the message column.
    pub fn write_reports<I>(&mut self, reports: I) -> Result<()>
    where
        I: IntoIterator<Item = StatusReport>,
    {
        let mut wrote_any = false;
        for report in reports {
            let message = match (&report.result, &report.failure) {
                (Some(result), _) => result.message.as_str(),
                (None, Some(failure)) => failure.as_str(),
                (None, None) => "",
            };
            self.writer.serialize(ReportRow {
                instance: report.instance_id.as_str(),
                status: report.status.as_str(),
                success: report.result.as_ref().map(|result| result.success),
                message,
            })?;
            wrote_any = true;
        }
        if !wrote_any {
            self.writer
                .write_record(["instance", "status", "success", "message"])?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
