// Bib time ledger: (identifier, timestamp) pairs read off the raster.

use crate::error::{Result, SlitScanError};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Default ledger file name inside a run directory.
pub const DEFAULT_LEDGER_FILE: &str = "results.csv";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BibEntry {
    pub identifier: String,
    /// Formatted `HH:MM:SS.ffffff` wall-clock time
    pub timestamp: String,
}

impl BibEntry {
    pub fn new(identifier: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            timestamp: timestamp.into(),
        }
    }
}

/// Durable backing store for the ledger. Every call receives the full,
/// sorted entry list and replaces whatever was stored before.
pub trait LedgerSink {
    fn persist(&mut self, entries: &[BibEntry]) -> Result<()>;

    fn load(&mut self) -> Result<Vec<BibEntry>>;
}

/// Plain delimited text file: one `identifier, timestamp` line per entry, no header.
pub struct CsvFileSink {
    path: PathBuf,
}

impl CsvFileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn unavailable(&self, source: io::Error) -> SlitScanError {
        SlitScanError::SinkUnavailable {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| DEFAULT_LEDGER_FILE.into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl LedgerSink for CsvFileSink {
    fn persist(&mut self, entries: &[BibEntry]) -> Result<()> {
        let tmp = self.temp_path();
        let file = fs::File::create(&tmp).map_err(|e| self.unavailable(e))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        for entry in entries {
            let timestamp = format!(" {}", entry.timestamp);
            writer
                .write_record([entry.identifier.as_str(), timestamp.as_str()])
                .map_err(|e| self.unavailable(io::Error::other(e)))?;
        }
        let file = writer
            .into_inner()
            .map_err(|e| self.unavailable(e.into_error()))?;
        file.sync_all().map_err(|e| self.unavailable(e))?;
        drop(file);

        // Readers see either the previous file or the complete new one.
        fs::rename(&tmp, &self.path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            self.unavailable(e)
        })?;
        tracing::debug!("Ledger: wrote {} entries to {:?}", entries.len(), self.path);
        Ok(())
    }

    fn load(&mut self) -> Result<Vec<BibEntry>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.unavailable(e)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(file);

        let mut entries = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| self.unavailable(io::Error::other(e)))?;
            match (record.get(0), record.get(1)) {
                (Some(id), Some(ts)) => entries.push(BibEntry::new(id, ts)),
                _ => tracing::warn!("Ledger: skipping malformed line in {:?}", self.path),
            }
        }
        Ok(entries)
    }
}

/// Append-only, timestamp-ordered list of bib entries.
pub struct BibTimeLedger<S: LedgerSink> {
    entries: Vec<BibEntry>,
    sink: S,
}

impl<S: LedgerSink> BibTimeLedger<S> {
    /// Empty ledger; nothing is read from the sink.
    pub fn new(sink: S) -> Self {
        Self {
            entries: Vec::new(),
            sink,
        }
    }

    /// Ledger seeded with whatever the sink already holds.
    pub fn open(mut sink: S) -> Result<Self> {
        let mut entries = sink.load()?;
        sort_entries(&mut entries);
        Ok(Self { entries, sink })
    }

    /// Inserts an entry and rewrites the sink.
    ///
    /// On `SinkUnavailable` the entry stays in memory; call [`flush`](Self::flush)
    /// to retry.
    pub fn add(
        &mut self,
        identifier: impl Into<String>,
        timestamp: impl Into<String>,
    ) -> Result<()> {
        self.entries.push(BibEntry::new(identifier, timestamp));
        sort_entries(&mut self.entries);
        self.flush()
    }

    pub fn flush(&mut self) -> Result<()> {
        if let Err(e) = self.sink.persist(&self.entries) {
            tracing::warn!(
                "Ledger: persist failed, {} entries held in memory: {}",
                self.entries.len(),
                e
            );
            return Err(e);
        }
        Ok(())
    }

    pub fn entries(&self) -> &[BibEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }
}

fn sort_entries(entries: &mut [BibEntry]) {
    // Stable, so equal times keep insertion order.
    entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
}
