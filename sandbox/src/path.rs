use std::fs;
use std::path::{Component, Path, PathBuf};

use crate::errors::{Result, SandboxError};

/// The single directory every tool operation is confined to.
///
/// Containment is lexical: `.` and `..` are folded before the prefix check and
/// symlinks are neither followed nor resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SandboxRoot {
    base_dir: PathBuf,
}

impl SandboxRoot {
    pub fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base = ensure_absolute_base(base_dir.as_ref())?;
        fs::create_dir_all(&base)?;
        Ok(Self { base_dir: base })
    }

    pub fn as_path(&self) -> &Path {
        &self.base_dir
    }

    pub fn resolve(&self, requested: impl AsRef<Path>) -> Result<PathBuf> {
        resolve(&self.base_dir, requested)
    }
}

pub fn ensure_absolute_base(base_dir: &Path) -> Result<PathBuf> {
    if base_dir.is_relative() {
        return Err(SandboxError::InvalidOperation(
            "sandbox base directory must be absolute".to_string(),
        ));
    }
    Ok(normalize(base_dir))
}

pub fn resolve(base_dir: &Path, requested: impl AsRef<Path>) -> Result<PathBuf> {
    let requested = requested.as_ref();
    if requested.components().count() == 0 {
        return Err(SandboxError::InvalidOperation(
            "path must not be empty".to_string(),
        ));
    }

    let resolved = normalize(&base_dir.join(requested));
    if !resolved.starts_with(base_dir) {
        return Err(SandboxError::OutsideRoot(
            requested.to_string_lossy().into_owned(),
        ));
    }
    Ok(resolved)
}

fn normalize(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => clean.push(component.as_os_str()),
            Component::CurDir => continue,
            // popping past the root leaves the root in place
            Component::ParentDir => {
                clean.pop();
            }
            Component::Normal(part) => clean.push(part),
        }
    }
    clean
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> PathBuf {
        PathBuf::from("/srv/sandbox")
    }

    #[test]
    fn resolves_nested_relative_paths() {
        let resolved = resolve(&base(), "pkg/./calc.py").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/sandbox/pkg/calc.py"));
    }

    #[test]
    fn allows_parent_segments_that_stay_inside() {
        let resolved = resolve(&base(), "pkg/../main.py").unwrap();
        assert_eq!(resolved, PathBuf::from("/srv/sandbox/main.py"));
    }

    #[test]
    fn rejects_traversal_out_of_root() {
        let err = resolve(&base(), "../../etc/passwd").unwrap_err();
        assert!(err.is_containment());
        let err = resolve(&base(), "pkg/../../escape.py").unwrap_err();
        assert!(err.is_containment());
    }

    #[test]
    fn rejects_absolute_paths_elsewhere() {
        let err = resolve(&base(), "/etc/passwd").unwrap_err();
        assert!(err.is_containment());
    }

    #[test]
    fn sibling_with_shared_prefix_is_outside() {
        let err = resolve(&base(), "../sandbox2/x.py").unwrap_err();
        assert!(err.is_containment());
    }

    #[test]
    fn rejects_empty_path() {
        let err = resolve(&base(), "").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidOperation(_)));
    }

    #[test]
    fn base_must_be_absolute() {
        assert!(ensure_absolute_base(Path::new("relative/root")).is_err());
        assert_eq!(
            ensure_absolute_base(Path::new("/srv/./sandbox/")).unwrap(),
            base()
        );
    }
}
