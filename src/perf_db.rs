//! Durable store of tuned solver configs.
//!
//! One JSON record per line, `{"key": .., "solver": .., "config": ..}`.
//! Readers skip lines they cannot parse, so a torn or hand-edited file
//! degrades into cache misses. Writers only ever append one whole line, so
//! concurrent writers (threads or processes) never drop each other's keys;
//! for one key the last appended record wins.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::problem::ProblemSignature;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerfRecord {
    pub key: String,
    pub solver: String,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct PerfDb {
    path: PathBuf,
}

impl PerfDb {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stored config for `(signature, solver_id)`, if any decodes as `C`.
    pub fn load<C: DeserializeOwned>(&self, signature: &ProblemSignature, solver_id: &str) -> Option<C> {
        let record = self
            .records()
            .into_iter()
            .rev()
            .find(|r| r.key == signature.as_str() && r.solver == solver_id)?;
        match serde_json::from_value(record.config) {
            Ok(config) => {
                log::debug!("perf db hit: {} / {}", signature, solver_id);
                Some(config)
            }
            Err(e) => {
                log::warn!("perf db record for {} / {} is unreadable: {}", signature, solver_id, e);
                None
            }
        }
    }

    /// Appends `config` for `(signature, solver_id)`. The newest record for a
    /// key shadows older ones, so writers never touch each other's lines.
    pub fn store<C: Serialize>(&self, signature: &ProblemSignature, solver_id: &str, config: &C) -> Result<()> {
        let record = PerfRecord {
            key: signature.as_str().to_string(),
            solver: solver_id.to_string(),
            config: serde_json::to_value(config)?,
        };
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.append_line(line)?;
        log::info!("perf db saved {} / {} to {:?}", signature, solver_id, self.path);
        Ok(())
    }

    /// The newest well-formed record per key, in order of first appearance.
    pub fn records(&self) -> Vec<PerfRecord> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(_) => return Vec::new(),
        };
        let mut out: Vec<PerfRecord> = Vec::new();
        let mut slots: HashMap<(String, String), usize> = HashMap::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = match line {
                Ok(l) => l,
                Err(e) => {
                    log::warn!("perf db {:?} unreadable after line {}: {}", self.path, lineno, e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let record = match serde_json::from_str::<PerfRecord>(&line) {
                Ok(record) => record,
                Err(e) => {
                    log::warn!("perf db {:?}:{} skipped: {}", self.path, lineno + 1, e);
                    continue;
                }
            };
            match slots.get(&(record.key.clone(), record.solver.clone())) {
                Some(&i) => out[i] = record,
                None => {
                    slots.insert((record.key.clone(), record.solver.clone()), out.len());
                    out.push(record);
                }
            }
        }
        out
    }

    /// One `write_all` on an append-mode handle, so concurrent writers
    /// interleave whole lines.
    fn append_line(&self, mut line: Vec<u8>) -> io::Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() {
                fs::create_dir_all(dir)?;
            }
        }
        let mut f = OpenOptions::new().create(true).append(true).read(true).open(&self.path)?;
        // A torn last line must not swallow the new record.
        let len = f.metadata()?.len();
        if len > 0 {
            let mut last = [0u8; 1];
            f.seek(SeekFrom::Start(len - 1))?;
            f.read_exact(&mut last)?;
            if last[0] != b'\n' {
                line.insert(0, b'\n');
            }
        }
        f.write_all(&line)?;
        f.sync_data()?;
        Ok(())
    }
}
