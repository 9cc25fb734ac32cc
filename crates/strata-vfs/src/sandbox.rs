//! Allow-list sandboxing wrapper around any VFS.
//!
//! Every call re-validates its path: absolutize, lexically normalize `..`
//! components, resolve symlinks where the file exists, and check the result
//! against the allowed roots both before and after symlink resolution. A
//! denied existence probe answers "does not exist" rather than revealing
//! that something lives outside the sandbox.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use strata_error::{Result, StrataError};
use strata_types::cx::Cx;
use strata_types::flags::{AccessFlags, SyncFlags, VfsOpenFlags};
use tracing::warn;

use crate::traits::{Vfs, VfsFile};

/// A VFS restricting all file access to a set of allowed root directories.
pub struct SandboxVfs<V> {
    inner: V,
    allowed_roots: Vec<PathBuf>,
}

impl<V: Vfs> SandboxVfs<V> {
    /// Wrap `inner`, permitting access only beneath `roots`.
    ///
    /// Roots that cannot be canonicalized are dropped with a warning rather
    /// than silently widening the sandbox.
    pub fn new(inner: V, roots: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut allowed_roots = Vec::new();
        for root in roots {
            let normalized = lexical_normalize(&root);
            match std::fs::canonicalize(&normalized) {
                Ok(resolved) => allowed_roots.push(resolved),
                Err(_) => {
                    // Accept not-yet-existing roots in their normalized form.
                    if normalized.is_absolute() {
                        allowed_roots.push(normalized);
                    } else {
                        warn!(root = %root.display(), "dropping non-absolute sandbox root");
                    }
                }
            }
        }
        Self {
            inner,
            allowed_roots,
        }
    }

    /// The wrapped VFS.
    pub fn inner(&self) -> &V {
        &self.inner
    }

    fn is_within_roots(&self, path: &Path) -> bool {
        self.allowed_roots.iter().any(|root| path.starts_with(root))
    }

    /// Canonicalize and validate, re-checking after symlink resolution.
    fn validate(&self, path: &Path) -> Result<PathBuf> {
        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir().map_err(StrataError::Io)?.join(path)
        };
        let normalized = lexical_normalize(&absolute);
        if !self.is_within_roots(&normalized) {
            return Err(StrataError::AccessDenied {
                path: path.to_path_buf(),
            });
        }

        // Resolve symlinks for the longest existing prefix, then re-append
        // the not-yet-existing suffix (new database files are legitimate).
        let resolved = resolve_existing_prefix(&normalized);
        if !self.is_within_roots(&resolved) {
            return Err(StrataError::AccessDenied {
                path: path.to_path_buf(),
            });
        }
        Ok(resolved)
    }
}

/// Normalize `.` and `..` components without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalize the longest prefix of `path` that exists and re-append the
/// remainder, so symlinked ancestors cannot smuggle a path out of the
/// sandbox even when the leaf does not exist yet.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut prefix = path.to_path_buf();
    let mut suffix: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match std::fs::canonicalize(&prefix) {
            Ok(resolved) => {
                let mut out = resolved;
                for part in suffix.iter().rev() {
                    out.push(part);
                }
                return out;
            }
            Err(_) => match (prefix.file_name(), prefix.parent()) {
                (Some(name), Some(parent)) => {
                    suffix.push(name.to_os_string());
                    prefix = parent.to_path_buf();
                }
                _ => return path.to_path_buf(),
            },
        }
    }
}

impl<V: Vfs> Vfs for SandboxVfs<V> {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn open(&self, cx: &Cx, path: &Path, flags: VfsOpenFlags) -> Result<Box<dyn VfsFile>> {
        let validated = self.validate(path)?;
        self.inner.open(cx, &validated, flags)
    }

    fn delete(&self, cx: &Cx, path: &Path, sync_dir: bool) -> Result<()> {
        let validated = self.validate(path)?;
        self.inner.delete(cx, &validated, sync_dir)
    }

    fn access(&self, cx: &Cx, path: &Path, flags: AccessFlags) -> Result<bool> {
        // Denied paths read as absent.
        match self.validate(path) {
            Ok(validated) => self.inner.access(cx, &validated, flags),
            Err(StrataError::AccessDenied { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn full_pathname(&self, cx: &Cx, path: &Path) -> Result<PathBuf> {
        let validated = self.validate(path)?;
        self.inner.full_pathname(cx, &validated)
    }

    fn randomness(&self, cx: &Cx, buf: &mut [u8]) {
        self.inner.randomness(cx, buf);
    }

    fn current_time(&self, cx: &Cx) -> SystemTime {
        self.inner.current_time(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unix::UnixVfs;

    fn create_flags() -> VfsOpenFlags {
        VfsOpenFlags::MAIN_DB | VfsOpenFlags::CREATE | VfsOpenFlags::READWRITE
    }

    #[test]
    fn allows_paths_under_root() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);

        let path = dir.path().join("ok.db");
        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.write(&cx, b"in sandbox", 0).unwrap();
        file.close(&cx).unwrap();
        assert!(vfs.access(&cx, &path, AccessFlags::EXISTS).unwrap());
    }

    #[test]
    fn denies_paths_outside_root() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);

        let outside = other.path().join("no.db");
        assert!(matches!(
            vfs.open(&cx, &outside, create_flags()).unwrap_err(),
            StrataError::AccessDenied { .. }
        ));
    }

    #[test]
    fn denies_dotdot_escape() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);

        let sneaky = dir.path().join("sub").join("..").join("..").join("out.db");
        assert!(matches!(
            vfs.open(&cx, &sneaky, create_flags()).unwrap_err(),
            StrataError::AccessDenied { .. }
        ));
    }

    #[test]
    fn dotdot_within_root_is_fine() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);

        let path = dir.path().join("sub").join("..").join("fine.db");
        let mut file = vfs.open(&cx, &path, create_flags()).unwrap();
        file.close(&cx).unwrap();
        assert!(dir.path().join("fine.db").exists());
    }

    #[cfg(unix)]
    #[test]
    fn denies_symlink_escape() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);

        // in-sandbox symlink pointing out of the sandbox
        let link = dir.path().join("escape");
        std::os::unix::fs::symlink(other.path(), &link).unwrap();

        let through_link = link.join("x.db");
        assert!(matches!(
            vfs.open(&cx, &through_link, create_flags()).unwrap_err(),
            StrataError::AccessDenied { .. }
        ));
    }

    #[test]
    fn denied_existence_probe_reads_as_absent() {
        let cx = Cx::new();
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let present = other.path().join("secret.db");
        std::fs::write(&present, b"hidden").unwrap();

        let vfs = SandboxVfs::new(UnixVfs::new(), [dir.path().to_path_buf()]);
        assert!(!vfs.access(&cx, &present, AccessFlags::EXISTS).unwrap());
    }

    #[test]
    fn lexical_normalize_pops_parents() {
        assert_eq!(
            lexical_normalize(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(lexical_normalize(Path::new("/a/../../b")), PathBuf::from("/b"));
    }
}
