//! Canonical image retention.
//!
//! Each subject has at most one retained snapshot anywhere under
//! `<root>/temp`, stored at `<root>/temp/<weekday-folder>/<roll_no>.jpg`.
//! The weekday folders are NOT a seven-day rotation: archiving a new image
//! deletes every other copy for that subject, whatever folder it lives in.

use chrono::{Datelike, NaiveDate};
use image::{DynamicImage, ImageFormat};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;
use thiserror::Error;

/// Folder names indexed by days from Sunday, so listings sort by weekday.
const WEEKDAY_FOLDERS: [&str; 7] = [
    "1sunday",
    "2monday",
    "3tuesday",
    "4wednesday",
    "5thursday",
    "6friday",
    "7saturday",
];

const TEMP_DIR: &str = "temp";
const UPLOAD_DIR: &str = "uploads";
const REGISTRATION_DIR: &str = "subjects";

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("no image found for subject {0}")]
    NotFound(String),
    #[error("subject id {0:?} cannot be used as a file name")]
    InvalidSubjectId(String),
    #[error("image encoding failed: {0}")]
    Encode(#[from] image::ImageError),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// Whether the archived source survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    Copy,
    Move,
}

pub fn weekday_folder(date: NaiveDate) -> &'static str {
    WEEKDAY_FOLDERS[date.weekday().num_days_from_sunday() as usize]
}

/// Per-subject single-slot image store.
pub struct ImageArchiver {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ImageArchiver {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn temp_root(&self) -> PathBuf {
        self.root.join(TEMP_DIR)
    }

    pub fn canonical_path(&self, roll_no: &str, date: NaiveDate) -> PathBuf {
        self.temp_root()
            .join(weekday_folder(date))
            .join(file_name(roll_no))
    }

    pub fn registration_path(&self, roll_no: &str) -> PathBuf {
        self.root.join(REGISTRATION_DIR).join(file_name(roll_no))
    }

    /// Write an uploaded image as JPEG under a unique name outside the temp
    /// tree, so concurrent uploads for one subject never collide.
    pub fn stage_upload(
        &self,
        roll_no: &str,
        image: &DynamicImage,
    ) -> Result<PathBuf, ArchiveError> {
        check_subject_id(roll_no)?;
        let dir = self.root.join(UPLOAD_DIR);
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{roll_no}-{}.jpg", uuid::Uuid::new_v4().simple()));
        write_jpeg(&path, image)?;
        Ok(path)
    }

    /// Keep the subject's registration image.
    pub fn save_registration(
        &self,
        roll_no: &str,
        image: &DynamicImage,
    ) -> Result<PathBuf, ArchiveError> {
        check_subject_id(roll_no)?;
        let path = self.registration_path(roll_no);
        self.with_lock(roll_no, || {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            write_jpeg(&path, image)
        })?;
        Ok(path)
    }

    /// Make `source` the subject's only retained image.
    ///
    /// A missing source falls back to the newest `<roll_no>.jpg` already in
    /// the temp tree. Returns the canonical path for `date`.
    pub fn archive(
        &self,
        source: Option<&Path>,
        roll_no: &str,
        date: NaiveDate,
        transfer: Transfer,
    ) -> Result<PathBuf, ArchiveError> {
        check_subject_id(roll_no)?;
        self.with_lock(roll_no, || self.archive_locked(source, roll_no, date, transfer))
    }

    fn archive_locked(
        &self,
        source: Option<&Path>,
        roll_no: &str,
        date: NaiveDate,
        transfer: Transfer,
    ) -> Result<PathBuf, ArchiveError> {
        let source = match source.filter(|p| p.is_file()) {
            Some(p) => p.to_path_buf(),
            None => self
                .find_latest(roll_no)?
                .ok_or_else(|| ArchiveError::NotFound(roll_no.to_string()))?,
        };

        let dest = self.canonical_path(roll_no, date);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }

        if !same_file(&source, &dest) {
            match transfer {
                Transfer::Copy => copy_atomic(&source, &dest)?,
                Transfer::Move => move_file(&source, &dest)?,
            }
        }

        let removed = self.purge_others(roll_no, &dest)?;
        tracing::debug!(roll_no, dest = %dest.display(), removed, "canonical image archived");
        Ok(dest)
    }

    /// Newest `<roll_no>.jpg` directly under the temp root or one folder down.
    fn find_latest(&self, roll_no: &str) -> Result<Option<PathBuf>, ArchiveError> {
        let temp = self.temp_root();
        let name = file_name(roll_no);
        let mut candidates = Vec::new();

        let direct = temp.join(&name);
        if direct.is_file() {
            candidates.push(direct);
        }
        if temp.is_dir() {
            for entry in fs::read_dir(&temp)? {
                let sub = entry?.path();
                if sub.is_dir() {
                    let p = sub.join(&name);
                    if p.is_file() {
                        candidates.push(p);
                    }
                }
            }
        }

        let mut newest: Option<(SystemTime, PathBuf)> = None;
        for p in candidates {
            let modified = fs::metadata(&p)?.modified()?;
            if newest.as_ref().map_or(true, |(t, _)| modified > *t) {
                newest = Some((modified, p));
            }
        }
        Ok(newest.map(|(_, p)| p))
    }

    /// Delete every `<roll_no>.jpg` (case-insensitive) in the temp tree except `keep`.
    fn purge_others(&self, roll_no: &str, keep: &Path) -> Result<usize, ArchiveError> {
        let temp = self.temp_root();
        if !temp.is_dir() {
            return Ok(0);
        }
        let name = file_name(roll_no);
        let keep = fs::canonicalize(keep)?;
        let mut removed = 0;
        let mut pending = vec![temp];

        while let Some(dir) = pending.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    pending.push(path);
                    continue;
                }
                let matches = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.eq_ignore_ascii_case(&name));
                if !matches || fs::canonicalize(&path).ok().as_deref() == Some(keep.as_path()) {
                    continue;
                }
                match fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "failed to remove stale image"
                        );
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Run `f` while holding the subject's slot. The slot is dropped from the
    /// map once nobody else holds or waits on it.
    fn with_lock<R>(&self, roll_no: &str, f: impl FnOnce() -> R) -> R {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(roll_no.to_string()).or_default())
        };
        let result = {
            let _guard = slot.lock().unwrap_or_else(|e| e.into_inner());
            f()
        };
        drop(slot);

        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if locks.get(roll_no).is_some_and(|s| Arc::strong_count(s) == 1) {
            locks.remove(roll_no);
        }
        result
    }

    #[cfg(test)]
    fn held_slots(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

fn file_name(roll_no: &str) -> String {
    format!("{roll_no}.jpg")
}

fn check_subject_id(roll_no: &str) -> Result<(), ArchiveError> {
    let bad = roll_no.is_empty()
        || roll_no == "."
        || roll_no == ".."
        || roll_no.contains(['/', '\\', '\0']);
    if bad {
        return Err(ArchiveError::InvalidSubjectId(roll_no.to_string()));
    }
    Ok(())
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

fn part_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    dest.with_file_name(name)
}

/// Copy via a `.part` sibling and rename, so readers never see a torn file.
fn copy_atomic(src: &Path, dest: &Path) -> io::Result<()> {
    let part = part_path(dest);
    fs::copy(src, &part)?;
    fs::rename(&part, dest)
}

fn move_file(src: &Path, dest: &Path) -> io::Result<()> {
    match fs::rename(src, dest) {
        Ok(()) => Ok(()),
        // Cross-device: fall back to copy + delete.
        Err(_) => {
            copy_atomic(src, dest)?;
            fs::remove_file(src)
        }
    }
}

pub fn write_jpeg(path: &Path, image: &DynamicImage) -> Result<(), ArchiveError> {
    let part = part_path(path);
    DynamicImage::ImageRgb8(image.to_rgb8()).save_with_format(&part, ImageFormat::Jpeg)?;
    fs::rename(&part, path)?;
    Ok(())
}
