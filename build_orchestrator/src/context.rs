mod build_file;
mod ignore;
mod tarball;

use std::{
    fmt,
    io::Cursor,
    path::{Path, PathBuf},
};

use async_compression::tokio::bufread::GzipEncoder;
pub use build_file::*;
pub use ignore::*;
use stacked_errors::StackableErr;
pub use tarball::*;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    error::{BuildError, Result},
    options::{BuildOptions, BuildParams},
    transport::ArchiveBody,
};

/// What the daemon builds from. Exactly one source per build.
pub enum BuildContext {
    /// A prebuilt tar archive sent as it is. The build file name must be set
    /// in [BuildOptions::dockerfile], the archive is never scanned for one.
    Archive(Box<dyn AsyncRead + Send + Unpin>),
    /// The content of a lone build file, the context holds nothing else
    Contents(Vec<u8>),
    /// A directory on the local filesystem
    Directory(PathBuf),
    /// A URI the daemon fetches the context from itself
    Remote(String),
}

impl BuildContext {
    pub fn archive(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Archive(Box::new(reader))
    }

    pub fn contents(contents: impl Into<Vec<u8>>) -> Self {
        Self::Contents(contents.into())
    }

    pub fn directory(dir: impl Into<PathBuf>) -> Self {
        Self::Directory(dir.into())
    }

    pub fn remote(uri: impl Into<String>) -> Self {
        Self::Remote(uri.into())
    }
}

impl fmt::Debug for BuildContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Archive(_) => write!(f, "BuildContext::Archive"),
            Self::Contents(contents) => {
                write!(f, "BuildContext::Contents({} bytes)", contents.len())
            }
            Self::Directory(dir) => write!(f, "BuildContext::Directory({dir:?})"),
            Self::Remote(uri) => write!(f, "BuildContext::Remote({uri})"),
        }
    }
}

/// The context inputs as loose fields, of which the first set one in the
/// order `custom_context` (with `fileobj`), `fileobj`, `path`, `remote` is
/// used
#[derive(Default)]
pub struct ContextSources {
    pub path: Option<PathBuf>,
    pub fileobj: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub remote: Option<String>,
    /// `fileobj` is a complete context archive rather than a build file
    pub custom_context: bool,
}

impl fmt::Debug for ContextSources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextSources")
            .field("path", &self.path)
            .field("fileobj", &self.fileobj.as_ref().map(|_| ".."))
            .field("remote", &self.remote)
            .field("custom_context", &self.custom_context)
            .finish()
    }
}

impl ContextSources {
    /// Picks the context. A loose build file is read into memory here.
    pub async fn into_context(self) -> Result<BuildContext> {
        if self.custom_context {
            return match self.fileobj {
                Some(reader) => Ok(BuildContext::Archive(reader)),
                None => Err(BuildError::config(
                    "custom context requires `fileobj` to be a reader of a build directory tarball",
                )),
            }
        }
        if let Some(mut reader) = self.fileobj {
            let mut contents = Vec::new();
            reader
                .read_to_end(&mut contents)
                .await
                .stack_err("ContextSources::into_context -> reading `fileobj`")?;
            return Ok(BuildContext::Contents(contents))
        }
        if let Some(path) = self.path {
            return Ok(BuildContext::Directory(path))
        }
        if let Some(remote) = self.remote {
            return Ok(BuildContext::Remote(remote))
        }
        Err(BuildError::config(
            "either `path`, `fileobj` or `remote` must be provided",
        ))
    }
}

/// A context ready to be sent, along with whatever backs it on the
/// filesystem. Dropping this removes the staging directory and any build file
/// copied into the context.
#[derive(Debug)]
pub struct PackagedContext {
    body: Option<ArchiveBody>,
    dockerfile: Option<String>,
    remote: Option<String>,
    staging: Option<TempDir>,
    copied: Option<CopiedBuildFile>,
}

impl PackagedContext {
    /// Takes the request body, `None` for remote contexts
    pub fn take_body(&mut self) -> Option<ArchiveBody> {
        self.body.take()
    }

    /// The build file name to report to the daemon
    pub fn dockerfile(&self) -> Option<&str> {
        self.dockerfile.as_deref()
    }

    pub fn remote(&self) -> Option<&str> {
        self.remote.as_deref()
    }

    /// The private directory a loose build file was staged in
    pub fn staging_dir(&self) -> Option<&Path> {
        self.staging.as_ref().map(TempDir::path)
    }

    /// Where a build file from outside of a directory context was copied to
    pub fn copied_build_file(&self) -> Option<&Path> {
        self.copied.as_ref().map(CopiedBuildFile::path)
    }

    /// Overrides `dockerfile` with the resolved name and adds `remote`
    pub fn apply_params(&self, params: &mut BuildParams) {
        if let Some(dockerfile) = &self.dockerfile {
            params.set("dockerfile", dockerfile.as_str());
        }
        if let Some(remote) = &self.remote {
            params.set("remote", remote.as_str());
        }
    }
}

/// Loads the exclusion rules of a context directory from its ignore file
pub async fn load_exclude_patterns(root: &Path) -> Result<ExcludePatterns> {
    Ok(ExcludePatterns::load(root).await?)
}

/// Compresses an archive as it is read
pub fn gzip_body(tarball: Vec<u8>) -> ArchiveBody {
    ArchiveBody::Reader(Box::new(GzipEncoder::new(Cursor::new(tarball))))
}

async fn archive_dir(root: PathBuf, excludes: ExcludePatterns) -> Result<Vec<u8>> {
    let tarball = tokio::task::spawn_blocking(move || {
        create_archive(&root, &excludes)
            .stack_err_with(|| format!("archiving build context {root:?}"))?
            .into_tarball()
    })
    .await
    .stack()??;
    Ok(tarball)
}

fn local_body(tarball: Vec<u8>, options: &BuildOptions) -> ArchiveBody {
    if options.gzip {
        gzip_body(tarball)
    } else {
        ArchiveBody::Bytes(tarball)
    }
}

/// Turns a [BuildContext] into a request body and the build file name the
/// daemon should use
#[tracing::instrument(skip_all, fields(context = ?context))]
pub async fn package(context: BuildContext, options: &BuildOptions) -> Result<PackagedContext> {
    match context {
        BuildContext::Archive(reader) => {
            let Some(dockerfile) = options.dockerfile.clone() else {
                return Err(BuildError::config(
                    "custom context requires the name of the build file (typically `Dockerfile` \
                     or `Containerfile`)",
                ))
            };
            Ok(PackagedContext {
                body: Some(ArchiveBody::Reader(reader)),
                dockerfile: Some(dockerfile),
                remote: None,
                staging: None,
                copied: None,
            })
        }
        BuildContext::Contents(contents) => {
            let dockerfile = options
                .dockerfile
                .clone()
                .unwrap_or_else(staged_build_file_name);
            let staging = tempfile::Builder::new()
                .prefix("build_orchestrator")
                .tempdir()
                .stack_err("package -> creating staging directory")?;
            let file = staging.path().join(&dockerfile);
            if !file.starts_with(staging.path()) || dockerfile.split('/').any(|c| c == "..") {
                return Err(BuildError::config(format!(
                    "build file name {dockerfile:?} escapes the context"
                )))
            }
            if let Some(parent) = file.parent() {
                tokio::fs::create_dir_all(parent).await.stack()?;
            }
            tokio::fs::write(&file, &contents)
                .await
                .stack_err_with(|| format!("package -> staging build file {file:?}"))?;
            let tarball = archive_dir(staging.path().to_owned(), ExcludePatterns::default()).await?;
            Ok(PackagedContext {
                body: Some(local_body(tarball, options)),
                dockerfile: Some(dockerfile),
                remote: None,
                staging: Some(staging),
                copied: None,
            })
        }
        BuildContext::Directory(dir) => {
            let root = acquire_context_dir(&dir).await?;
            let resolved = resolve_build_file(&root, options.dockerfile.as_deref()).await?;
            let mut excludes = load_exclude_patterns(&root)
                .await?
                .keep(resolved.name.clone());
            for name in IGNORE_FILE_NAMES {
                excludes = excludes.keep(name);
            }
            let tarball = archive_dir(root, excludes).await?;
            Ok(PackagedContext {
                body: Some(local_body(tarball, options)),
                dockerfile: Some(resolved.name),
                remote: None,
                staging: None,
                copied: resolved.copied,
            })
        }
        BuildContext::Remote(uri) => Ok(PackagedContext {
            body: None,
            dockerfile: options.dockerfile.clone(),
            remote: Some(uri),
            staging: None,
            copied: None,
        }),
    }
}
