//! Per-request temporary files in the shared download directory.
//!
//! Every buffered download reserves a fresh random stem. The guard owns every
//! file whose name starts with `<stem>.` (the final output as well as any
//! `.part`/`.ytdl` leftovers) and removes them exactly once, when it is
//! released or dropped. Nothing outside that stem is ever touched, so
//! concurrent requests sharing the directory cannot delete each other's files.

use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use anyhow::{Context, Result};
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug)]
pub struct TempArtifact {
    dir: PathBuf,
    stem: String,
    path: Option<PathBuf>,
    released: bool,
}

impl TempArtifact {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            stem: Uuid::new_v4().simple().to_string(),
            path: None,
            released: false,
        }
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// yt-dlp output template; the extractor substitutes the extension.
    pub fn output_template(&self) -> PathBuf {
        self.dir.join(format!("{}.%(ext)s", self.stem))
    }

    /// True when `path` sits directly in the download directory and carries
    /// this artifact's stem.
    pub fn owns(&self, path: &Path) -> bool {
        let in_dir = path.parent().is_some_and(|parent| parent == self.dir);
        in_dir && self.owns_name(path)
    }

    fn owns_name(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(self.stem.as_str()))
            .is_some_and(|rest| rest.starts_with('.'))
    }

    pub fn bind(&mut self, path: PathBuf) {
        self.path = Some(path);
    }

    /// Finds a finished output file for this stem, skipping partial downloads.
    pub fn find_output(&self) -> Option<PathBuf> {
        let entries = fs::read_dir(&self.dir).ok()?;
        entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| self.owns_name(path) && path.is_file())
            .find(|path| !is_partial(path))
    }

    /// Removes every file owned by this artifact. Later calls (and the drop)
    /// are no-ops.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        if let Some(path) = self.path.take() {
            remove_quietly(&path);
        }

        let Ok(entries) = fs::read_dir(&self.dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if self.owns_name(&path) {
                remove_quietly(&path);
            }
        }
    }
}

impl Drop for TempArtifact {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_partial(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some("part" | "ytdl" | "temp" | "tmp")
    )
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed temp file {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("could not remove temp file {}: {err}", path.display()),
    }
}

/// Creates the download directory and clears files older than `max_age` that a
/// previous process left behind. Only meant to run before the listener starts.
pub fn prepare_download_dir(dir: &Path, max_age: Duration) -> Result<usize> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let now = SystemTime::now();
    let mut removed = 0;
    let entries = fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))?;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let stale = meta
            .modified()
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age >= max_age);
        if stale && fs::remove_file(entry.path()).is_ok() {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn stems_are_unique() {
        let dir = tempdir().unwrap();
        let a = TempArtifact::new(dir.path());
        let b = TempArtifact::new(dir.path());
        assert_ne!(a.stem(), b.stem());
        assert!(
            a.output_template()
                .to_string_lossy()
                .ends_with(".%(ext)s")
        );
    }

    #[test]
    fn drop_removes_bound_file_and_leftovers() {
        let dir = tempdir().unwrap();
        let mut artifact = TempArtifact::new(dir.path());
        let output = dir.path().join(format!("{}.mp4", artifact.stem()));
        let partial = dir.path().join(format!("{}.f137.mp4.part", artifact.stem()));
        fs::write(&output, b"video").unwrap();
        fs::write(&partial, b"vid").unwrap();
        artifact.bind(output.clone());

        drop(artifact);
        assert!(!output.exists());
        assert!(!partial.exists());
    }

    #[test]
    fn release_leaves_foreign_files_alone() {
        let dir = tempdir().unwrap();
        let mut mine = TempArtifact::new(dir.path());
        let theirs = TempArtifact::new(dir.path());
        let my_file = dir.path().join(format!("{}.webm", mine.stem()));
        let their_file = dir.path().join(format!("{}.webm", theirs.stem()));
        let prefix_clash = dir.path().join(format!("{}x.webm", mine.stem()));
        fs::write(&my_file, b"a").unwrap();
        fs::write(&their_file, b"b").unwrap();
        fs::write(&prefix_clash, b"c").unwrap();

        mine.release();
        assert!(!my_file.exists());
        assert!(their_file.exists());
        assert!(prefix_clash.exists());
        drop(theirs);
        assert!(!their_file.exists());
    }

    #[test]
    fn release_runs_once() {
        let dir = tempdir().unwrap();
        let mut artifact = TempArtifact::new(dir.path());
        let output = dir.path().join(format!("{}.mp4", artifact.stem()));
        fs::write(&output, b"first").unwrap();
        artifact.release();
        assert!(!output.exists());

        fs::write(&output, b"second").unwrap();
        drop(artifact);
        assert!(output.exists());
    }

    #[test]
    fn owns_checks_directory_and_stem() {
        let dir = tempdir().unwrap();
        let artifact = TempArtifact::new(dir.path());
        let stem = artifact.stem().to_string();
        assert!(artifact.owns(&dir.path().join(format!("{stem}.mp4"))));
        assert!(!artifact.owns(&dir.path().join("other.mp4")));
        assert!(!artifact.owns(&dir.path().join("nested").join(format!("{stem}.mp4"))));
        assert!(!artifact.owns(&dir.path().join(&stem)));
    }

    #[test]
    fn find_output_skips_partials() {
        let dir = tempdir().unwrap();
        let artifact = TempArtifact::new(dir.path());
        fs::write(dir.path().join(format!("{}.mp4.part", artifact.stem())), b"x").unwrap();
        assert!(artifact.find_output().is_none());

        let done = dir.path().join(format!("{}.mp4", artifact.stem()));
        fs::write(&done, b"x").unwrap();
        assert_eq!(artifact.find_output(), Some(done));
    }

    #[test]
    fn prepare_download_dir_creates_and_clears_stale() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("downloads");
        assert_eq!(prepare_download_dir(&target, Duration::from_secs(3600)).unwrap(), 0);
        assert!(target.is_dir());

        fs::write(target.join("old.mp4"), b"x").unwrap();
        assert_eq!(prepare_download_dir(&target, Duration::ZERO).unwrap(), 1);
        assert!(!target.join("old.mp4").exists());
    }

    #[test]
    fn prepare_download_dir_keeps_fresh_files() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("fresh.mp4"), b"x").unwrap();
        assert_eq!(
            prepare_download_dir(dir.path(), Duration::from_secs(3600)).unwrap(),
            0
        );
        assert!(dir.path().join("fresh.mp4").exists());
    }
}
