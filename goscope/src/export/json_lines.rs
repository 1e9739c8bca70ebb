use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::domain::ExportError;
use crate::trace_data::LifecycleRecord;

/// One exported line
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportedEvent {
    pub task_id: i64,
    /// `"spawned"` or `"exited"`
    pub kind: String,
    pub timestamp_ns: u64,
    pub pid: u32,
    pub tid: u32,
    /// Hex instruction pointers, innermost first
    pub stack: Vec<String>,
}

impl From<&LifecycleRecord> for ExportedEvent {
    fn from(record: &LifecycleRecord) -> Self {
        Self {
            task_id: record.task_id.0,
            kind: record.kind.as_str().to_string(),
            timestamp_ns: record.timestamp_ns,
            pid: record.pid.0,
            tid: record.tid,
            stack: record.stack.iter().map(|addr| format!("0x{addr:x}")).collect(),
        }
    }
}

/// Streams events as JSON lines to any writer
pub struct JsonLinesExporter<W: Write> {
    writer: W,
    /// Lines written so far
    pub written: u64,
}

/// Exporter used by the CLI
pub type EventExporter = JsonLinesExporter<BufWriter<File>>;

impl JsonLinesExporter<BufWriter<File>> {
    /// Create (or truncate) the export file
    ///
    /// # Errors
    /// Returns an error if the file cannot be created
    pub fn create(path: &Path) -> Result<Self, ExportError> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> JsonLinesExporter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    /// Append one event
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails
    pub fn write(&mut self, record: &LifecycleRecord) -> Result<(), ExportError> {
        serde_json::to_writer(&mut self.writer, &ExportedEvent::from(record))?;
        self.writer.write_all(b"\n")?;
        self.written += 1;
        Ok(())
    }

    /// Flush buffered lines and return the writer
    ///
    /// # Errors
    /// Returns an error if the flush fails
    pub fn finish(mut self) -> Result<W, ExportError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{LifecycleKind, Pid, TaskId};
    use std::time::Instant;

    #[test]
    fn test_line_format() {
        let record = LifecycleRecord {
            task_id: TaskId(21),
            kind: LifecycleKind::Exited,
            timestamp_ns: 5_000,
            pid: Pid(100),
            tid: 101,
            stack: vec![0x46_1f20, 0x40_0a00],
            observed_at: Instant::now(),
        };
        let mut exporter = JsonLinesExporter::new(Vec::new());
        exporter.write(&record).unwrap();
        assert_eq!(exporter.written, 1);

        let output = String::from_utf8(exporter.finish().unwrap()).unwrap();
        assert_eq!(
            output,
            "{\"task_id\":21,\"kind\":\"exited\",\"timestamp_ns\":5000,\"pid\":100,\"tid\":101,\
             \"stack\":[\"0x461f20\",\"0x400a00\"]}\n"
        );
    }
}
