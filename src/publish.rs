//! Staged publishing of node outputs.
//!
//! An action never writes its declared output path directly.  It writes a
//! uniquely named temporary file in the same directory, and only a successful
//! run renames that file over the declared path.  Rename within a directory
//! is atomic, so readers see either the previous complete file or the new
//! one.  Dropping a Staged without publishing removes the temporary, which
//! covers errors, panics and interrupted children; a hard kill can at worst
//! leave a stray temporary behind, never a torn output.

use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempPath;

/// Prefix of every staging file name, so strays are recognizable.
pub const STAGING_PREFIX: &str = ".xforge-";

/// A reserved temporary location for one output.
pub struct Staged {
    temp: TempPath,
    dest: PathBuf,
    executable: bool,
}

impl Staged {
    /// Reserve a temporary next to `dest`, creating `dest`'s directory if
    /// needed.  The reservation is an empty file; tools may overwrite or
    /// replace it.
    pub fn acquire(dest: &Path, executable: bool) -> std::io::Result<Staged> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir)?;
        let name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let prefix = format!("{}{}.", STAGING_PREFIX, name);
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".tmp");
        // The mode of any new file under the umask, not tempfile's 0600.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            builder.permissions(std::fs::Permissions::from_mode(0o666));
        }
        let file = builder.tempfile_in(&dir)?;
        Ok(Staged {
            temp: file.into_temp_path(),
            dest: dest.to_path_buf(),
            executable,
        })
    }

    /// Where the action should write.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }

    /// Replace the staged content with `data`.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut f = std::fs::File::create(self.path())?;
        f.write_all(data)?;
        f.sync_all()
    }

    /// Promote the staged file to its destination.  On error the temporary
    /// is removed and the destination keeps its previous content.
    pub fn publish(self) -> std::io::Result<PathBuf> {
        if !self.path().exists() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "action removed its output without writing it",
            ));
        }
        #[cfg(unix)]
        if self.executable {
            use std::os::unix::fs::PermissionsExt;
            // Execute wherever read is allowed, as chmod +x under the umask.
            let mut perms = std::fs::metadata(self.path())?.permissions();
            perms.set_mode(perms.mode() | ((perms.mode() & 0o444) >> 2));
            std::fs::set_permissions(self.path(), perms)?;
        }
        let dest = self.dest;
        self.temp.persist(&dest).map_err(|err| err.error)?;
        Ok(dest)
    }
}

/// Publish a group of staged outputs, all or nothing as far as the action is
/// concerned: every staging is checked before the first rename.
pub fn publish_all(staged: Vec<Staged>) -> Result<Vec<PathBuf>, (PathBuf, std::io::Error)> {
    for s in &staged {
        if !s.path().exists() {
            return Err((
                s.dest.clone(),
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "action removed its output without writing it",
                ),
            ));
        }
    }
    let mut published = Vec::with_capacity(staged.len());
    for s in staged {
        let dest = s.dest.clone();
        published.push(s.publish().map_err(|err| (dest, err))?);
    }
    Ok(published)
}

/// Write `data` to `dest` through a staging file.
pub fn write_atomic(dest: &Path, data: &[u8]) -> std::io::Result<()> {
    let staged = Staged::acquire(dest, false)?;
    staged.write(data)?;
    staged.publish()?;
    Ok(())
}
