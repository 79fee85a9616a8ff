use std::{collections::BTreeSet, path::Path};

use stacked_errors::{Result, StackableErr};
use walkdir::WalkDir;

use crate::context::ExcludePatterns;

/// A tar archive of a build context, built in memory
pub struct Tarball {
    tar: tar::Builder<Vec<u8>>,
    paths: BTreeSet<String>,
}

impl Default for Tarball {
    /// An empty tarball
    fn default() -> Self {
        let mut tar = tar::Builder::new(Vec::new());
        // symlinks in a context are sent as links, the daemon resolves them
        tar.follow_symlinks(false);
        Self {
            tar,
            paths: Default::default(),
        }
    }
}

// avoid the `tar::Builder`s
impl std::fmt::Debug for Tarball {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tarball {{ {} }}",
            self.paths
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join("\n")
        )
    }
}

impl Tarball {
    /// Append a file that will go to the given `path`, with `mode` and the
    /// bytes of the `content` of the file
    pub fn append_file_bytes(
        &mut self,
        path: impl ToString,
        mode: u32,
        content: &[u8],
    ) -> Result<()> {
        let path = path.to_string();
        let header = &mut tar::Header::new_gnu();
        header.set_size(content.len() as _);
        header.set_mode(mode);
        header.set_cksum();
        self.tar
            .append_data(header, &path, content)
            .stack_err_with(|| format!("Tarball::append_file_bytes(path: {path})"))?;
        self.paths.insert(path);
        Ok(())
    }

    /// Appends whatever is at `fs_path` (file, directory entry, or symlink)
    /// under the archive path `path`, using its metadata
    pub fn append_path(&mut self, path: impl ToString, fs_path: &Path) -> Result<()> {
        let path = path.to_string();
        let res = if fs_path.is_dir() && !fs_path.is_symlink() {
            self.tar.append_dir(&path, fs_path)
        } else {
            self.tar.append_path_with_name(fs_path, &path)
        };
        res.stack_err_with(|| format!("Tarball::append_path(path: {path}, fs_path: {fs_path:?})"))?;
        self.paths.insert(path);
        Ok(())
    }

    /// Every archive path appended so far
    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Get the bytes of a tarball
    pub fn into_tarball(self) -> Result<Vec<u8>> {
        self.tar.into_inner().stack()
    }
}

/// Archives everything under `root` that `excludes` does not exclude. Paths in
/// the archive are relative to `root`, in a stable order.
///
/// This does blocking filesystem work.
pub fn create_archive(root: &Path, excludes: &ExcludePatterns) -> Result<Tarball> {
    let mut tarball = Tarball::default();
    let mut walk = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();
    while let Some(entry) = walk.next() {
        let entry = entry.stack_err_with(|| format!("create_archive(root: {root:?})"))?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .stack()?
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<Vec<_>>>()
            .stack_err_with(|| format!("non UTF-8 path in build context: {:?}", entry.path()))?
            .join("/");
        let is_dir = entry.file_type().is_dir();
        if excludes.is_excluded(&rel) {
            // a later `!` pattern or a kept path may still want something
            // beneath
            if is_dir && !excludes.has_exceptions() && !excludes.keeps_beneath(&rel) {
                walk.skip_current_dir();
            }
            continue
        }
        tarball.append_path(rel, entry.path()).stack()?;
    }
    tracing::debug!("archived build context: {tarball:?}");
    Ok(tarball)
}
