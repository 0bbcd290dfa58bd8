//! Working-Directory Manager.
//!
//! Every run gets one scratch directory per external program, owned by a
//! [`WorkingDirs`] guard. Releasing the guard (or dropping it on an error
//! path) removes everything the run created unless retention is requested.

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PathsConfig;
use crate::TmcError;

/// Marks a directory as created by this tool, so a leftover can be told
/// apart from foreign data.
const OWNER_MARKER: &str = ".fission-tmc-run";

#[derive(Debug, Clone)]
pub struct WorkdirManager {
    fission_root: PathBuf,
    evaporation_root: PathBuf,
    fragment_library: Option<PathBuf>,
    fission_template: Option<PathBuf>,
    evaporation_template: Option<PathBuf>,
    active: Arc<Mutex<HashSet<String>>>,
}

impl WorkdirManager {
    pub fn new(paths: &PathsConfig) -> Self {
        Self {
            fission_root: paths.work_root.join("fission"),
            evaporation_root: paths.work_root.join("evaporation"),
            fragment_library: paths.fragment_library.clone(),
            fission_template: paths.fission_template.clone(),
            evaporation_template: paths.evaporation_template.clone(),
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Allocates and seeds both scratch directories for `label`.
    pub fn prepare(&self, label: &str) -> Result<WorkingDirs, TmcError> {
        let fission = self.fission_root.join(label);
        let evaporation = self.evaporation_root.join(label);

        if !self.active.lock().insert(label.to_string()) {
            return Err(TmcError::DirectoryConflict { path: fission });
        }

        // From here on the guard owns the label and releases it on failure.
        let mut dirs = WorkingDirs {
            label: label.to_string(),
            fragment_dir: self
                .fragment_library
                .clone()
                .unwrap_or_else(|| evaporation.clone()),
            fission,
            evaporation,
            external: Vec::new(),
            active: Arc::clone(&self.active),
            owned: Vec::new(),
            released: false,
        };

        for dir in [dirs.fission.clone(), dirs.evaporation.clone()] {
            claim_directory(&dir)?;
            dirs.owned.push(dir);
        }

        if let Some(template) = &self.fission_template {
            copy_tree(template, &dirs.fission)?;
        }
        if let Some(template) = &self.evaporation_template {
            copy_tree(template, &dirs.evaporation)?;
        }
        if let Some(library) = &self.fragment_library {
            fs::create_dir_all(library).map_err(TmcError::io(library))?;
        }

        debug!(label, "working directories prepared");
        Ok(dirs)
    }

    pub fn cleanup(&self, dirs: WorkingDirs, retain: bool) -> Result<CleanupReport, TmcError> {
        dirs.release(retain)
    }
}

fn claim_directory(dir: &Path) -> Result<(), TmcError> {
    if dir.exists() {
        if !dir.join(OWNER_MARKER).is_file() {
            return Err(TmcError::DirectoryConflict {
                path: dir.to_path_buf(),
            });
        }
        warn!(path = %dir.display(), "removing stale working directory from an aborted run");
        fs::remove_dir_all(dir).map_err(TmcError::io(dir))?;
    }

    fs::create_dir_all(dir).map_err(TmcError::io(dir))?;
    let marker = dir.join(OWNER_MARKER);
    fs::write(&marker, b"").map_err(TmcError::io(&marker))?;
    Ok(())
}

fn copy_tree(from: &Path, to: &Path) -> Result<(), TmcError> {
    for entry in fs::read_dir(from).map_err(TmcError::io(from))? {
        let entry = entry.map_err(TmcError::io(from))?;
        let source = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type().map_err(TmcError::io(&source))?;
        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(TmcError::io(&target))?;
            copy_tree(&source, &target)?;
        } else {
            fs::copy(&source, &target).map_err(TmcError::io(&target))?;
        }
    }
    Ok(())
}

/// Scratch directories of one run.
#[derive(Debug)]
pub struct WorkingDirs {
    label: String,
    fission: PathBuf,
    evaporation: PathBuf,
    fragment_dir: PathBuf,
    external: Vec<PathBuf>,
    active: Arc<Mutex<HashSet<String>>>,
    /// Directories this guard created and must remove.
    owned: Vec<PathBuf>,
    released: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingDirPaths {
    pub fission: PathBuf,
    pub evaporation: PathBuf,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    /// Paths that had already disappeared when cleanup ran.
    pub missing: Vec<PathBuf>,
    pub retained: bool,
}

impl WorkingDirs {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn fission_dir(&self) -> &Path {
        &self.fission
    }

    pub fn evaporation_dir(&self) -> &Path {
        &self.evaporation
    }

    /// Where fragment files for the evaporation code are written.
    pub fn fragment_dir(&self) -> &Path {
        &self.fragment_dir
    }

    pub fn paths(&self) -> WorkingDirPaths {
        WorkingDirPaths {
            fission: self.fission.clone(),
            evaporation: self.evaporation.clone(),
        }
    }

    /// Registers a run-scoped file living outside both scratch directories.
    pub fn track_external(&mut self, path: PathBuf) {
        if !path.starts_with(&self.fission) && !path.starts_with(&self.evaporation) {
            self.external.push(path);
        }
    }

    pub fn release(mut self, retain: bool) -> Result<CleanupReport, TmcError> {
        self.released = true;
        let result = self.remove_all(retain);
        self.active.lock().remove(&self.label);
        result
    }

    fn remove_all(&self, retain: bool) -> Result<CleanupReport, TmcError> {
        let mut report = CleanupReport {
            retained: retain,
            ..Default::default()
        };
        if retain {
            return Ok(report);
        }

        for file in &self.external {
            match fs::remove_file(file) {
                Ok(()) => report.removed.push(file.clone()),
                Err(err) if err.kind() == ErrorKind::NotFound => report.missing.push(file.clone()),
                Err(source) => {
                    return Err(TmcError::Io {
                        path: file.clone(),
                        source,
                    })
                }
            }
        }

        for dir in &self.owned {
            match fs::remove_dir_all(dir) {
                Ok(()) => report.removed.push(dir.clone()),
                Err(err) if err.kind() == ErrorKind::NotFound => report.missing.push(dir.clone()),
                Err(source) => {
                    return Err(TmcError::Io {
                        path: dir.clone(),
                        source,
                    })
                }
            }
        }

        for path in &report.missing {
            warn!(label = %self.label, path = %path.display(), "run-scoped path vanished before cleanup");
        }

        Ok(report)
    }
}

impl Drop for WorkingDirs {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.remove_all(false) {
            warn!(label = %self.label, error = %err, "cleanup of abandoned working directories failed");
        }
        self.active.lock().remove(&self.label);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(root: &Path) -> WorkdirManager {
        WorkdirManager::new(&PathsConfig {
            work_root: root.join("runtime"),
            ..Default::default()
        })
    }

    #[test]
    fn prepare_creates_distinct_directories_per_label() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());

        let a = manager.prepare("TMC_0").expect("prepare a");
        let b = manager.prepare("TMC_1").expect("prepare b");

        assert!(a.fission_dir().is_dir());
        assert!(a.evaporation_dir().is_dir());
        assert_ne!(a.fission_dir(), b.fission_dir());
        assert_ne!(a.evaporation_dir(), b.evaporation_dir());
        assert_ne!(a.fission_dir(), a.evaporation_dir());
        assert_eq!(manager.active_count(), 2);
    }

    #[test]
    fn active_label_cannot_be_allocated_twice() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());

        let first = manager.prepare("Param_kappa_0").expect("prepare");
        let err = manager.prepare("Param_kappa_0").unwrap_err();
        assert!(matches!(err, TmcError::DirectoryConflict { .. }));

        first.release(false).expect("release");
        assert!(manager.prepare("Param_kappa_0").is_ok());
    }

    #[test]
    fn stale_directories_are_replaced_but_foreign_ones_conflict() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());

        let stale = tmp.path().join("runtime/fission/TMC_0");
        fs::create_dir_all(&stale).expect("mkdir");
        fs::write(stale.join(OWNER_MARKER), b"").expect("marker");
        fs::write(stale.join("leftover.lmd"), b"old").expect("leftover");

        let dirs = manager.prepare("TMC_0").expect("stale dir is reclaimed");
        assert!(!dirs.fission_dir().join("leftover.lmd").exists());
        drop(dirs);

        let foreign = tmp.path().join("runtime/evaporation/TMC_1");
        fs::create_dir_all(&foreign).expect("mkdir");
        let err = manager.prepare("TMC_1").unwrap_err();
        assert!(matches!(err, TmcError::DirectoryConflict { .. }));
        assert!(foreign.is_dir());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn release_removes_everything_and_reports_missing_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        let library = tmp.path().join("library");
        fs::create_dir_all(&library).expect("mkdir");

        let mut dirs = manager.prepare("TMC_2").expect("prepare");
        let staged = library.join("U236_6.00e+00MeV_gef_tmc_2.ff");
        fs::write(&staged, b"# Z").expect("write");
        dirs.track_external(staged.clone());
        dirs.track_external(library.join("never_written.ff"));
        fs::remove_dir_all(dirs.evaporation_dir()).expect("simulate anomaly");

        let fission = dirs.fission_dir().to_path_buf();
        let report = dirs.release(false).expect("release");

        assert!(!fission.exists());
        assert!(!staged.exists());
        assert_eq!(report.missing.len(), 2);
        assert!(report.removed.contains(&fission));
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn retained_directories_survive_release() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        let dirs = manager.prepare("Unperturbed").expect("prepare");
        let paths = dirs.paths();

        let report = manager.cleanup(dirs, true).expect("cleanup");
        assert!(report.retained);
        assert!(paths.fission.is_dir());
        assert!(paths.evaporation.is_dir());
    }

    #[test]
    fn dropping_the_guard_cleans_up() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let manager = manager(tmp.path());
        let paths = {
            let dirs = manager.prepare("TMC_9").expect("prepare");
            dirs.paths()
        };
        assert!(!paths.fission.exists());
        assert!(!paths.evaporation.exists());
        assert_eq!(manager.active_count(), 0);
    }

    #[test]
    fn templates_are_copied_into_fresh_directories() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let template = tmp.path().join("gef-template");
        fs::create_dir_all(template.join("in")).expect("mkdir");
        fs::write(template.join("in/extra.dat"), b"1").expect("write");

        let manager = WorkdirManager::new(&PathsConfig {
            work_root: tmp.path().join("runtime"),
            fission_template: Some(template),
            ..Default::default()
        });
        let dirs = manager.prepare("TMC_0").expect("prepare");
        assert!(dirs.fission_dir().join("in/extra.dat").is_file());
    }
}
