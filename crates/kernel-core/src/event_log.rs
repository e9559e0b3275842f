//! Append-only event log sinks. The narrator serializes all appends; a
//! record, once written, is never mutated.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use contracts::{EventRecord, KernelError};

pub trait EventSink: Send {
    fn append(&mut self, record: &EventRecord) -> Result<(), KernelError>;
}

/// One JSON object per line, flushed on every append. IO failures here are
/// fatal to the run.
pub struct JsonlEventSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlEventSink {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KernelError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|err| KernelError::io(format!("create {}: {err}", parent.display())))?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| KernelError::io(format!("open {}: {err}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EventSink for JsonlEventSink {
    fn append(&mut self, record: &EventRecord) -> Result<(), KernelError> {
        let line = serde_json::to_string(record)
            .map_err(|err| KernelError::io(format!("encode event record: {err}")))?;
        self.writer
            .write_all(line.as_bytes())
            .and_then(|_| self.writer.write_all(b"\n"))
            .and_then(|_| self.writer.flush())
            .map_err(|err| KernelError::io(format!("append {}: {err}", self.path.display())))
    }
}

/// Scans an existing log for the last recorded tick; used to validate
/// `--resume-from` against the monotone-time invariant.
pub fn last_logged_tick(path: impl AsRef<Path>) -> Result<Option<u64>, KernelError> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let file = File::open(path)
        .map_err(|err| KernelError::io(format!("open {}: {err}", path.display())))?;
    let mut last = None;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|err| KernelError::io(format!("read {}: {err}", path.display())))?;
        if line.trim().is_empty() {
            continue;
        }
        let record: EventRecord = serde_json::from_str(&line)
            .map_err(|err| KernelError::io(format!("corrupt log line in {}: {err}", path.display())))?;
        last = Some(record.tick());
    }
    Ok(last)
}

/// In-memory sink with a shared handle, for tests.
#[derive(Clone, Default)]
pub struct MemoryEventSink {
    records: Arc<Mutex<Vec<EventRecord>>>,
}

impl MemoryEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.records.lock().expect("sink lock poisoned").clone()
    }
}

impl EventSink for MemoryEventSink {
    fn append(&mut self, record: &EventRecord) -> Result<(), KernelError> {
        self.records
            .lock()
            .expect("sink lock poisoned")
            .push(record.clone());
        Ok(())
    }
}
