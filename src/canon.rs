//! Path canonicalization.
//!
//! Node identity is the tuple of declared output paths, so two spellings of
//! the same file ("build/./a.o", "build/x/../a.o") must compare equal before
//! they are used as graph keys.

use std::path::{Component, Path, PathBuf};

/// Lexically canonicalize a path, removing redundant components.
/// Does not access the disk, so symlinks are not resolved; only things like
/// "foo/./bar" => "foo/bar" and "foo/../bar" => "bar" are simplified.
/// Leading ".." components that cannot be backed out of are kept.
pub fn canon_path<P: AsRef<Path>>(inpath: P) -> PathBuf {
    let mut out: Vec<Component> = Vec::new();
    for comp in inpath.as_ref().components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => match out.last() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                // "/.." is "/".
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(comp),
            },
            _ => out.push(comp),
        }
    }
    if out.is_empty() {
        return PathBuf::from(".");
    }
    out.iter().collect()
}

/// Render a path with forward slashes, for display and for hashing.
/// Hashes must not depend on the platform separator.
pub fn to_slash(path: &Path) -> String {
    let s = path.to_string_lossy();
    if std::path::MAIN_SEPARATOR == '/' {
        s.into_owned()
    } else {
        s.replace(std::path::MAIN_SEPARATOR, "/")
    }
}
