//! VM roster sources.
//!
//! The roster is a flat list of VMs, read from a CSV file (`id,name,ip,ollama_port`)
//! or given inline in the config. Rows missing an id or host cannot take part
//! in orchestration and are dropped with a warning.

use crate::types::VmRecord;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{info, warn};

/// Errors from loading a roster
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("no roster source configured")]
    NotConfigured,

    #[error("failed to read roster file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed roster: {0}")]
    Csv(#[from] csv::Error),
}

/// One roster row as written by operators. Every field is optional so that
/// incomplete rows can be reported instead of failing the whole load.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, alias = "ip")]
    pub host: Option<String>,
    #[serde(default, alias = "ollama_port")]
    pub port: Option<u16>,
}

impl RosterEntry {
    /// Convert to a record, or `None` when id or host is missing.
    pub fn to_record(&self, default_port: u16) -> Option<VmRecord> {
        let id = non_empty(self.id.as_deref())?;
        let host = non_empty(self.host.as_deref())?;
        let name = non_empty(self.name.as_deref()).unwrap_or(id);
        Some(VmRecord::new(
            id,
            name,
            host,
            self.port.unwrap_or(default_port),
        ))
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Validate entries in order, dropping incomplete rows and duplicate ids.
pub fn records_from_entries<'a>(
    entries: impl IntoIterator<Item = &'a RosterEntry>,
    default_port: u16,
) -> Vec<VmRecord> {
    let mut seen = HashSet::new();
    let mut records = Vec::new();

    for entry in entries {
        let Some(record) = entry.to_record(default_port) else {
            warn!(row = ?entry, "Skipping VM row due to missing IP or ID");
            continue;
        };
        if !seen.insert(record.id.clone()) {
            warn!(id = %record.id, "Skipping duplicate VM id in roster");
            continue;
        }
        records.push(record);
    }

    records
}

/// Parse roster CSV contents. A bad header fails the load; bad rows are skipped.
pub fn parse_csv(contents: &str, default_port: u16) -> Result<Vec<VmRecord>, RosterError> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());
    reader.headers()?;

    let mut entries = Vec::new();
    for (index, row) in reader.deserialize::<RosterEntry>().enumerate() {
        match row {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(row = index + 1, error = %e, "Skipping unparseable VM row"),
        }
    }

    Ok(records_from_entries(&entries, default_port))
}

/// Provides the list of VMs to manage.
#[async_trait]
pub trait RosterSource: Send + Sync {
    async fn load(&self) -> Result<Vec<VmRecord>, RosterError>;

    /// Short description for logs.
    fn describe(&self) -> String;
}

/// Roster read from a CSV file on every load.
#[derive(Debug, Clone)]
pub struct CsvRoster {
    path: PathBuf,
    default_port: u16,
}

impl CsvRoster {
    pub fn new(path: impl Into<PathBuf>, default_port: u16) -> Self {
        Self {
            path: path.into(),
            default_port,
        }
    }
}

#[async_trait]
impl RosterSource for CsvRoster {
    async fn load(&self) -> Result<Vec<VmRecord>, RosterError> {
        let contents =
            tokio::fs::read_to_string(&self.path)
                .await
                .map_err(|source| RosterError::Io {
                    path: self.path.clone(),
                    source,
                })?;
        let records = parse_csv(&contents, self.default_port)?;
        info!(
            count = records.len(),
            path = %self.path.display(),
            "Loaded VM roster"
        );
        Ok(records)
    }

    fn describe(&self) -> String {
        format!("csv:{}", self.path.display())
    }
}

/// Fixed roster, e.g. from the inline `vms` config section.
#[derive(Debug, Clone, Default)]
pub struct StaticRoster {
    records: Vec<VmRecord>,
}

impl StaticRoster {
    pub fn new(records: Vec<VmRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl RosterSource for StaticRoster {
    async fn load(&self) -> Result<Vec<VmRecord>, RosterError> {
        Ok(self.records.clone())
    }

    fn describe(&self) -> String {
        format!("inline:{} vms", self.records.len())
    }
}
