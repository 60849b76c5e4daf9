//! Staleness decisions, and the database that persists them across builds.
//!
//! The scheduler only knows the Oracle trait.  ManifestOracle is the default:
//! per node it remembers one hash over the command fingerprint and the
//! modification times of every input and output, as of the last successful
//! run, together with the inputs that run discovered (the headers a compile
//! read).  Discovered inputs are hashed like declared ones on the next check.

use crate::fs::{FileSystem, MTime};
use crate::hash::{Hash, TerseHash};
use crate::publish;
use anyhow::Context;
use dashmap::DashMap;
use rustc_hash::FxHasher;
use std::hash::BuildHasherDefault;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Freshness {
    Current,
    Stale,
}

/// What the oracle is told about a node.  Paths are relative to the build
/// root and name the declared (not staged) locations.
pub struct Query<'a> {
    /// Stable identity of the node across invocations.
    pub key: &'a str,
    pub inputs: &'a [PathBuf],
    pub outputs: &'a [PathBuf],
    pub fingerprint: Hash,
}

pub trait Oracle: Sync {
    fn check(&self, query: &Query) -> anyhow::Result<Freshness>;

    /// Called after a node's outputs were published.  `discovered` lists
    /// inputs the action reported beyond the declared ones.
    fn record(&self, query: &Query, discovered: &[PathBuf]) -> anyhow::Result<()>;
}

type FxDashMap<K, V> = DashMap<K, V, BuildHasherDefault<FxHasher>>;

const MAGIC: &[u8; 8] = b"xforgedb";
const VERSION: u32 = 2;

/// What is remembered about one node.
#[derive(Debug, Clone, PartialEq)]
struct Entry {
    hash: Hash,
    discovered: Vec<PathBuf>,
}

pub struct ManifestOracle<F: FileSystem> {
    fs: F,
    /// stat() results for this invocation; an entry is dropped whenever a
    /// node republishes the file.
    stats: FxDashMap<PathBuf, MTime>,
    entries: FxDashMap<String, Entry>,
    dirty: AtomicBool,
}

impl<F: FileSystem> ManifestOracle<F> {
    pub fn new(fs: F) -> Self {
        ManifestOracle {
            fs,
            stats: FxDashMap::default(),
            entries: FxDashMap::default(),
            dirty: AtomicBool::new(false),
        }
    }

    /// Open the database at `path`.  A missing database is an empty one; an
    /// unreadable one is discarded with a warning, which costs a full
    /// rebuild but nothing worse.
    pub fn load(fs: F, path: &Path) -> anyhow::Result<Self> {
        let oracle = Self::new(fs);
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(oracle),
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        };
        match decode(&data) {
            Ok(records) => {
                for (key, entry) in records {
                    oracle.entries.insert(key, entry);
                }
            }
            Err(err) => {
                tracing::warn!("discarding build database {}: {}", path.display(), err);
                // Force a rewrite so the bad file does not linger.
                oracle.dirty.store(true, Ordering::Relaxed);
            }
        }
        Ok(oracle)
    }

    /// Write the database back if anything was recorded.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if !self.dirty.load(Ordering::Relaxed) {
            return Ok(());
        }
        let mut records: Vec<(String, Entry)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        records.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        let data = encode(&records)?;
        publish::write_atomic(path, &data).with_context(|| format!("write {}", path.display()))?;
        self.dirty.store(false, Ordering::Relaxed);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn stat(&self, path: &Path) -> anyhow::Result<MTime> {
        if let Some(mtime) = self.stats.get(path) {
            return Ok(*mtime);
        }
        let mtime = self
            .fs
            .stat(path)
            .with_context(|| format!("stat {}", path.display()))?;
        self.stats.insert(path.to_path_buf(), mtime);
        Ok(mtime)
    }

    fn hash(&self, query: &Query, discovered: &[PathBuf]) -> anyhow::Result<Hash> {
        let mut h = TerseHash::default();
        h.write_hash(query.fingerprint);
        for path in query.inputs.iter().chain(discovered) {
            h.write_file(path, self.stat(path)?);
        }
        h.write_separator();
        for path in query.outputs {
            h.write_file(path, self.stat(path)?);
        }
        Ok(h.finish())
    }
}

impl<F: FileSystem> Oracle for ManifestOracle<F> {
    fn check(&self, query: &Query) -> anyhow::Result<Freshness> {
        for path in query.outputs {
            if !self.stat(path)?.exists() {
                tracing::debug!(
                    "{}: stale, {} missing",
                    query.key.escape_debug(),
                    path.display()
                );
                return Ok(Freshness::Stale);
            }
        }
        let previous = match self.entries.get(query.key) {
            None => {
                tracing::debug!("{}: stale, never built", query.key.escape_debug());
                return Ok(Freshness::Stale);
            }
            Some(entry) => entry.value().clone(),
        };
        if previous.hash != self.hash(query, &previous.discovered)? {
            tracing::debug!("{}: stale, inputs or command changed", query.key.escape_debug());
            return Ok(Freshness::Stale);
        }
        Ok(Freshness::Current)
    }

    fn record(&self, query: &Query, discovered: &[PathBuf]) -> anyhow::Result<()> {
        for path in query.outputs {
            self.stats.remove(path);
        }
        let entry = Entry {
            hash: self.hash(query, discovered)?,
            discovered: discovered.to_vec(),
        };
        self.entries.insert(query.key.to_string(), entry);
        self.dirty.store(true, Ordering::Relaxed);
        Ok(())
    }
}

fn write_str(out: &mut Vec<u8>, s: &str) -> anyhow::Result<()> {
    let len = u16::try_from(s.len())
        .map_err(|_| anyhow::anyhow!("string too long: {}", s.escape_debug()))?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(s.as_bytes());
    Ok(())
}

/// Records are "key hash count path...", strings as u16 length plus bytes.
fn encode(records: &[(String, Entry)]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(12 + records.len() * 48);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    for (key, entry) in records {
        write_str(&mut out, key)?;
        out.extend_from_slice(&entry.hash.0.to_le_bytes());
        let count = u32::try_from(entry.discovered.len())?;
        out.extend_from_slice(&count.to_le_bytes());
        for path in &entry.discovered {
            // A path that is not UTF-8 comes back as one that never exists,
            // which keeps the node stale rather than wrongly current.
            write_str(&mut out, &path.to_string_lossy())?;
        }
    }
    Ok(out)
}

/// Reads through a byte slice, failing on truncation.
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.buf.len() < n {
            anyhow::bail!("truncated");
        }
        let (head, rest) = self.buf.split_at(n);
        self.buf = rest;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let mut a = [0u8; N];
        a.copy_from_slice(self.take(N)?);
        Ok(a)
    }

    fn string(&mut self) -> anyhow::Result<String> {
        let len = u16::from_le_bytes(self.array()?) as usize;
        Ok(std::str::from_utf8(self.take(len)?)?.to_string())
    }
}

fn decode(data: &[u8]) -> anyhow::Result<Vec<(String, Entry)>> {
    let mut r = Reader { buf: data };
    if r.take(MAGIC.len())? != MAGIC {
        anyhow::bail!("not a build database");
    }
    let version = u32::from_le_bytes(r.array()?);
    if version != VERSION {
        anyhow::bail!("version {}, expected {}", version, VERSION);
    }
    let mut records = Vec::new();
    while !r.buf.is_empty() {
        let key = r.string()?;
        let hash = Hash(u64::from_le_bytes(r.array()?));
        let count = u32::from_le_bytes(r.array()?);
        let mut discovered = Vec::new();
        for _ in 0..count {
            discovered.push(PathBuf::from(r.string()?));
        }
        records.push((key, Entry { hash, discovered }));
    }
    Ok(records)
}
