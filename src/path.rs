use crate::error::AklogError;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use tracing::{debug, error, trace};

/// Separates the cell from the volume in a mount point.
const VOLMARKER: char = ':';

/// Questions asked of the AFS client about a path.
pub trait FilesystemProbe {
    /// The mount point string of `last` inside `dir`, such as `#cell:volume.`,
    /// or `None` when it is not a mount point.
    fn stat_mount_point(&self, dir: &Path, last: &str) -> Option<String>;

    /// The cell the file at `path` lives in.
    fn owning_cell(&self, path: &Path) -> Option<String>;

    /// The servers holding the volume `path` lives in.
    fn volume_hosts(&self, path: &Path) -> Vec<Ipv4Addr>;
}

/// Make `path` absolute against the current directory.
pub fn absolute_path(path: &str) -> Result<String, AklogError> {
    if path.starts_with('/') {
        return Ok(path.to_string());
    }
    let cwd = std::env::current_dir().map_err(|err| {
        error!(?err, "Unable to find current working directory, try an absolute pathname");
        AklogError::NoWorkingDirectory
    })?;
    Ok(format!("{}/{}", cwd.display(), path))
}

/// Walks down a path one directory at a time, following symbolic links.
/// Each item is the next directory to check, with every link before it
/// already replaced by its target.
#[derive(Debug)]
pub struct PathWalker {
    path: String,
    /// Start of the remaining components in `path`. `None` once exhausted.
    cursor: Option<usize>,
    checked: String,
    symlinks: usize,
    max_symlinks: usize,
}

impl PathWalker {
    /// `path` must be absolute.
    pub fn new(path: &str, max_symlinks: usize) -> Self {
        PathWalker {
            path: path.to_string(),
            cursor: Some(0),
            checked: String::new(),
            symlinks: 0,
            max_symlinks,
        }
    }

    fn step(&mut self, mut start: usize) -> Result<String, AklogError> {
        loop {
            while self.path[start..].starts_with('/') {
                self.checked.push('/');
                start += 1;
            }
            let end = self.path[start..].find('/').map(|i| start + i);
            self.checked
                .push_str(&self.path[start..end.unwrap_or(self.path.len())]);

            let target = match fs::read_link(&self.checked) {
                Ok(target) => target,
                Err(_) => {
                    self.cursor = end;
                    return Ok(self.checked.clone());
                }
            };

            self.symlinks += 1;
            if self.symlinks > self.max_symlinks {
                error!(
                    path = %self.checked,
                    max = self.max_symlinks,
                    "Too many levels of symbolic links"
                );
                return Err(AklogError::TooManySymlinks);
            }

            let target = target.to_string_lossy();
            let rest = end.map(|e| &self.path[e..]).unwrap_or("");
            trace!(link = %self.checked, %target, "following symbolic link");

            if target.starts_with('/') {
                self.path = format!("{target}{rest}");
                self.checked.clear();
                start = 0;
            } else {
                // Only the link itself is replaced by a relative target.
                self.path = format!("{}{target}{rest}", &self.path[..start]);
                match self.checked.rfind('/') {
                    Some(idx) => self.checked.truncate(idx + 1),
                    None => self.checked.clear(),
                }
            }
        }
    }
}

impl Iterator for PathWalker {
    type Item = Result<String, AklogError>;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.cursor?;
        let result = self.step(start);
        if result.is_err() {
            self.cursor = None;
        }
        Some(result)
    }
}

/// The mount point at `path`, with the owning cell spliced in if the mount
/// point itself does not name one.
pub fn mount_point(probe: &dyn FilesystemProbe, path: &str) -> Option<String> {
    let (parent, last) = match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (".", path),
    };

    let mut mp = probe.stat_mount_point(Path::new(parent), last)?;
    if !mp.contains(VOLMARKER) {
        if let Some(cell) = probe.owning_cell(Path::new(path)) {
            let marker_len = mp.chars().next().map(char::len_utf8).unwrap_or(0);
            mp = format!("{}{cell}{VOLMARKER}{}", &mp[..marker_len], &mp[marker_len..]);
        }
    }
    debug!(%path, %mp, "found mount point");
    Some(mp)
}

/// `cell:volume` of a mount point string, the marker character removed.
pub fn mount_point_target(mp: &str) -> &str {
    let marker_len = mp.chars().next().map(char::len_utf8).unwrap_or(0);
    &mp[marker_len..]
}

/// The cell named by a mount point target, if it names one.
pub fn mount_point_cell(target: &str) -> Option<&str> {
    target.split_once(VOLMARKER).map(|(cell, _)| cell)
}

/// Paths that are not mount points must be directories. Links are not followed.
pub fn check_directory(path: &str) -> Result<(), AklogError> {
    let metadata = fs::symlink_metadata(path).map_err(|err| {
        error!(?err, %path, "stat failed");
        AklogError::BadPath
    })?;
    if !metadata.is_dir() {
        error!(%path, "Not a directory");
        return Err(AklogError::BadPath);
    }
    Ok(())
}
