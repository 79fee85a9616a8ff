use std::path::{Path, PathBuf};

use stacked_errors::StackableErr;
use tokio::fs;

use crate::error::{BuildError, Result};

/// Build file names looked for, in order, when none is requested
pub const DEFAULT_BUILD_FILE_NAMES: [&str; 2] = ["Containerfile", "Dockerfile"];

/// The name a build file is staged under when it has no name of its own or
/// lives outside of the context
pub fn staged_build_file_name() -> String {
    format!(".containerfile.{}", uuid::Uuid::new_v4().simple())
}

/// Canonicalizes `dir` and checks that it is a directory
pub async fn acquire_context_dir(dir: impl AsRef<Path>) -> Result<PathBuf> {
    let dir = dir.as_ref();
    let path = fs::canonicalize(dir)
        .await
        .map_err(|e| BuildError::config(format!("context directory {dir:?}: {e}")))?;
    if path.is_dir() {
        // no UNC paths on windows
        Ok(dunce::simplified(&path).to_owned())
    } else {
        Err(BuildError::config(format!(
            "context directory {dir:?} is not a directory"
        )))
    }
}

/// A build file that was copied into a context root. The copy is removed
/// when this is dropped.
#[derive(Debug)]
pub struct CopiedBuildFile {
    path: PathBuf,
}

impl CopiedBuildFile {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for CopiedBuildFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            tracing::warn!("could not remove copied build file {:?}: {e}", self.path);
        }
    }
}

/// A build file as the daemon will see it
#[derive(Debug)]
pub struct ResolvedBuildFile {
    /// Slash separated path relative to the context root
    pub name: String,
    pub copied: Option<CopiedBuildFile>,
}

fn relative_name(root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let parts = rel
        .components()
        .map(|c| c.as_os_str().to_str())
        .collect::<Option<Vec<_>>>()?;
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Finds the build file for the canonical context directory `root`.
///
/// `requested` is resolved relative to `root` (absolute paths are taken as
/// they are). With nothing requested `Containerfile` and then `Dockerfile` are
/// tried. A build file outside of `root` is copied into it under a generated
/// name.
#[tracing::instrument(skip_all, fields(root = ?root, requested = ?requested))]
pub async fn resolve_build_file(root: &Path, requested: Option<&str>) -> Result<ResolvedBuildFile> {
    let candidate = match requested {
        Some(requested) => {
            let candidate = root.join(requested);
            if !fs::try_exists(&candidate).await.unwrap_or(false) {
                return Err(BuildError::config(format!(
                    "build file {requested:?} does not exist relative to {root:?}"
                )))
            }
            candidate
        }
        None => {
            let mut found = None;
            for name in DEFAULT_BUILD_FILE_NAMES {
                let candidate = root.join(name);
                if fs::try_exists(&candidate).await.unwrap_or(false) {
                    found = Some(candidate);
                    break
                }
            }
            found.ok_or_else(|| {
                BuildError::config(format!(
                    "no Containerfile or Dockerfile found in {root:?}, name one explicitly"
                ))
            })?
        }
    };
    let file = fs::canonicalize(&candidate)
        .await
        .stack_err_with(|| format!("resolve_build_file -> canonicalize {candidate:?}"))?;
    let file = dunce::simplified(&file).to_owned();
    if !file.is_file() {
        return Err(BuildError::config(format!(
            "build file {candidate:?} is not a file"
        )))
    }

    if let Some(name) = relative_name(root, &file) {
        return Ok(ResolvedBuildFile { name, copied: None })
    }

    let name = staged_build_file_name();
    let dest = root.join(&name);
    fs::copy(&file, &dest)
        .await
        .stack_err_with(|| format!("resolve_build_file -> copying {file:?} to {dest:?}"))?;
    tracing::debug!("copied build file {file:?} into the context as {name}");
    Ok(ResolvedBuildFile {
        name,
        copied: Some(CopiedBuildFile { path: dest }),
    })
}
