//! A single hash over input attributes is recorded and used to determine when
//! those inputs change.
//!
//! See "Manifests instead of mtime order" in
//!   https://neugierig.org/software/blog/2022/03/n2.html

use crate::fs::MTime;
use crate::process::Invocation;
use rustc_hash::FxHasher;
use std::hash::{Hash as _, Hasher};
use std::path::Path;
use std::time::UNIX_EPOCH;

/// Hash value used to identify a given instance of a node's execution;
/// compared to verify whether a node is up to date.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Hash(pub u64);

const UNIT_SEPARATOR: u8 = 0x1F;

/// Hasher over the parts of a node's state, designed to not serialize too
/// much.
#[derive(Default)]
pub struct TerseHash(FxHasher);

impl TerseHash {
    fn write_bytes(&mut self, bytes: &[u8]) {
        bytes.hash(&mut self.0);
    }

    pub fn write_separator(&mut self) {
        self.0.write_u8(UNIT_SEPARATOR);
    }

    pub fn write_hash(&mut self, hash: Hash) {
        self.0.write_u64(hash.0);
        self.write_separator();
    }

    /// A path and its stat result.  Missing files hash differently from every
    /// present one.
    pub fn write_file(&mut self, path: &Path, mtime: MTime) {
        self.write_bytes(path.as_os_str().as_encoded_bytes());
        match mtime {
            MTime::Missing => self.0.write_u8(0),
            MTime::Stamp(t) => {
                self.0.write_u8(1);
                // Times before the epoch collapse to zero; they never come
                // from a real build.
                let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
                self.0.write_u64(since.as_secs());
                self.0.write_u32(since.subsec_nanos());
            }
        }
    }

    pub fn finish(&self) -> Hash {
        Hash(self.0.finish())
    }
}

/// Fingerprint of a resolved command: program, arguments and working
/// directory.  Output paths appear in the arguments as their final names, so
/// the fingerprint does not depend on where a run staged them.
pub fn fingerprint(invocation: &Invocation) -> Hash {
    let mut h = TerseHash::default();
    h.write_bytes(invocation.program.as_os_str().as_encoded_bytes());
    h.write_separator();
    for arg in &invocation.args {
        h.write_bytes(arg.as_encoded_bytes());
    }
    h.write_separator();
    h.write_bytes(invocation.cwd.as_os_str().as_encoded_bytes());
    h.finish()
}
