//! Configuration surface: a recognised set of runtime options,
//! validated eagerly before the engine opens any file. Parses a small
//! `key=value` property file (one option per line, `#` comments,
//! blank lines ignored) the way a plain embeddable engine's config
//! usually looks, and rejects bad values up front.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{PersistitError, PtResult};
use crate::page::PAGE_SIZES;

/// A `(min, max, reserved, fraction)` buffer-memory specification for
/// a `buffer.memory.<size>` config option.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BufferMemorySpec {
    pub min: usize,
    pub max: usize,
    pub reserved: usize,
    pub fraction: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferSpec {
    Count(usize),
    Memory(BufferMemorySpec),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Block size for journal files (`journalsize`). Default 64 MiB.
    pub journal_size: u64,
    /// `buffer.count.<size>` / `buffer.memory.<size>`, keyed by page size.
    pub buffers: HashMap<usize, BufferSpec>,
    /// Suppresses copy-back, used to take consistent backup snapshots.
    pub append_only: bool,
    /// Cadence of automatic checkpoints.
    pub checkpoint_interval: Duration,
    /// Poll interval shared by background workers unless overridden.
    pub poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        let mut buffers = HashMap::new();
        buffers.insert(16384usize, BufferSpec::Count(1024));
        Config {
            journal_size: 64 * 1024 * 1024,
            buffers,
            append_only: false,
            checkpoint_interval: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Parse a property file, validating every recognised option
    /// before returning. No file handle for the engine itself is
    /// opened here; a bad value never gets the chance to reach disk.
    pub fn from_file(path: impl AsRef<Path>) -> PtResult<Config> {
        let text = std::fs::read_to_string(path)?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> PtResult<Config> {
        let mut cfg = Config::default();
        cfg.buffers.clear();

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or_else(|| {
                PersistitError::Configuration(format!(
                    "line {}: expected key=value, got {:?}",
                    lineno + 1,
                    raw
                ))
            })?;
            cfg.apply(key.trim(), value.trim())?;
        }

        if cfg.buffers.is_empty() {
            cfg.buffers.insert(16384, BufferSpec::Count(1024));
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn apply(&mut self, key: &str, value: &str) -> PtResult<()> {
        if key == "journalsize" {
            self.journal_size = parse_size(value)?;
        } else if key == "appendOnly" {
            self.append_only = parse_bool(value)?;
        } else if key == "checkpointInterval" {
            self.checkpoint_interval = parse_duration(value)?;
        } else if key == "pollInterval" {
            self.poll_interval = parse_duration(value)?;
        } else if let Some(size_str) = key.strip_prefix("buffer.count.") {
            let page_size = parse_page_size(size_str)?;
            let count: usize = value.parse().map_err(|_| {
                PersistitError::Configuration(format!("buffer.count.{}: not a number", size_str))
            })?;
            if count == 0 {
                return Err(PersistitError::Configuration(format!(
                    "buffer.count.{}: must be positive",
                    size_str
                )));
            }
            self.buffers.insert(page_size, BufferSpec::Count(count));
        } else if let Some(size_str) = key.strip_prefix("buffer.memory.") {
            let page_size = parse_page_size(size_str)?;
            let spec = parse_memory_spec(value)?;
            self.buffers.insert(page_size, BufferSpec::Memory(spec));
        } else {
            return Err(PersistitError::Configuration(format!(
                "unrecognised configuration key: {}",
                key
            )));
        }
        Ok(())
    }

    /// Resolves a configured buffer count for an exact page size, if
    /// one was given as `buffer.count.<size>` rather than a memory
    /// budget (`buffer.memory.<size>` sizing is left to the caller).
    pub fn buffer_count_for(&self, page_size: usize) -> Option<usize> {
        match self.buffers.get(&page_size) {
            Some(BufferSpec::Count(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn validate(&self) -> PtResult<()> {
        if self.journal_size < 64 * 1024 {
            return Err(PersistitError::Configuration(
                "journalsize must be at least 64KiB".into(),
            ));
        }
        for (page_size, spec) in &self.buffers {
            if !PAGE_SIZES.contains(page_size) {
                return Err(PersistitError::Configuration(format!(
                    "{} is not a valid page size, must be one of {:?}",
                    page_size, PAGE_SIZES
                )));
            }
            if let BufferSpec::Memory(m) = spec {
                if m.min > m.max {
                    return Err(PersistitError::Configuration(format!(
                        "buffer.memory.{}: min ({}) exceeds max ({})",
                        page_size, m.min, m.max
                    )));
                }
                if !(0.0..=1.0).contains(&m.fraction) {
                    return Err(PersistitError::Configuration(format!(
                        "buffer.memory.{}: fraction {} out of range 0.0-1.0",
                        page_size, m.fraction
                    )));
                }
            }
        }
        Ok(())
    }
}

fn parse_page_size(s: &str) -> PtResult<usize> {
    s.parse().map_err(|_| {
        PersistitError::Configuration(format!("{} is not a valid page size suffix", s))
    })
}

fn parse_bool(s: &str) -> PtResult<bool> {
    match s {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(PersistitError::Configuration(format!(
            "expected boolean, got {:?}",
            s
        ))),
    }
}

fn parse_duration(s: &str) -> PtResult<Duration> {
    let millis: u64 = s.parse().map_err(|_| {
        PersistitError::Configuration(format!("expected milliseconds, got {:?}", s))
    })?;
    Ok(Duration::from_millis(millis))
}

fn parse_size(s: &str) -> PtResult<u64> {
    let (digits, mult) = if let Some(d) = s.strip_suffix('K') {
        (d, 1024u64)
    } else if let Some(d) = s.strip_suffix('M') {
        (d, 1024 * 1024)
    } else if let Some(d) = s.strip_suffix('G') {
        (d, 1024 * 1024 * 1024)
    } else {
        (s, 1)
    };
    let n: u64 = digits
        .parse()
        .map_err(|_| PersistitError::Configuration(format!("invalid size: {:?}", s)))?;
    Ok(n * mult)
}

fn parse_memory_spec(s: &str) -> PtResult<BufferMemorySpec> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return Err(PersistitError::Configuration(format!(
            "buffer.memory spec needs min,max,reserved,fraction, got {:?}",
            s
        )));
    }
    Ok(BufferMemorySpec {
        min: parts[0]
            .trim()
            .parse()
            .map_err(|_| PersistitError::Configuration("invalid min".into()))?,
        max: parts[1]
            .trim()
            .parse()
            .map_err(|_| PersistitError::Configuration("invalid max".into()))?,
        reserved: parts[2]
            .trim()
            .parse()
            .map_err(|_| PersistitError::Configuration("invalid reserved".into()))?,
        fraction: parts[3]
            .trim()
            .parse()
            .map_err(|_| PersistitError::Configuration("invalid fraction".into()))?,
    })
}
