//! Filesystem rendezvous between the master writer and its peers.
//!
//! All coordination happens through files: the begin-token advertises the
//! work directory, the published config releases the peers, per-process
//! UUID subdirectories make writers countable, and finish markers gate the
//! merge. Nothing here blocks except the bounded polling loops.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::trace;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::SlabResult;

/// Default extension of the packed archive.
pub(crate) const SLAB_EXT: &str = "slab";
const BEGIN_SUFFIX: &str = ".__slabbegin__";
const WORK_SUFFIX: &str = ".__slabwork__";

/// Per-process variable log file name.
pub(crate) const VARCFG_FILE: &str = "__varcfg__";
/// Per-process finish marker file name.
pub(crate) const FINISH_FILE: &str = "__finished__";
/// Finish marker payload.
pub(crate) const FINISH_PAYLOAD: &[u8] = b"FINISHED";

/// Length of a process directory name (a UUID in simple form).
pub(crate) const PROC_NAME_LEN: usize = 32;

pub(crate) const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
pub(crate) const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(100);
pub(crate) const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Derive `(slab path, begin-token path, work path)` from the path a caller
/// opened. The token and the default work directory are siblings of the
/// archive so every process in the cohort computes the same names.
pub(crate) fn write_paths(
    slab_path: &Path,
    workdir: Option<PathBuf>,
) -> (PathBuf, PathBuf, PathBuf) {
    let (slab_path, base) = if slab_path.extension() == Some(std::ffi::OsStr::new(SLAB_EXT)) {
        (slab_path.to_path_buf(), slab_path.with_extension(""))
    } else {
        (suffixed(slab_path, ".slab"), slab_path.to_path_buf())
    };
    let begin_path = suffixed(&base, BEGIN_SUFFIX);
    let work_path = workdir.unwrap_or_else(|| suffixed(&base, WORK_SUFFIX));
    (slab_path, begin_path, work_path)
}

fn suffixed(base: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(base.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// Whether a work-directory child looks like a process subdirectory.
pub(crate) fn is_proc_name(name: &str) -> bool {
    name.len() == PROC_NAME_LEN && name.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Enumerate the process subdirectories currently present, sorted by name.
pub(crate) fn scan_proc_dirs(work_path: &Path) -> SlabResult<Vec<PathBuf>> {
    let mut procs = Vec::new();
    for entry in fs::read_dir(work_path)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_proc_name(name) && entry.file_type()?.is_dir() {
            procs.push(entry.path());
        }
    }
    procs.sort();
    Ok(procs)
}

/// A bounded polling loop with a fixed probe interval.
///
/// The deadline is absolute, so one poller can be threaded through several
/// successive waits that share a single timeout budget (the close barrier
/// waits first for the cohort, then for each finish marker).
pub(crate) struct Poller {
    deadline: Instant,
    interval: Duration,
}

impl Poller {
    pub(crate) fn new(timeout: Duration, interval: Duration) -> Self {
        Poller {
            deadline: Instant::now() + timeout,
            interval,
        }
    }

    /// Probe until `probe` yields a value or the deadline passes. Returns
    /// `None` on timeout; probe errors abort the wait immediately.
    pub(crate) fn wait<T>(
        &self,
        mut probe: impl FnMut() -> SlabResult<Option<T>>,
    ) -> SlabResult<Option<T>> {
        loop {
            if let Some(found) = probe()? {
                return Ok(Some(found));
            }
            if Instant::now() >= self.deadline {
                trace!("poll deadline passed");
                return Ok(None);
            }
            std::thread::sleep(self.interval);
        }
    }
}

/// Serialize `value` as JSON at `path`, atomically: written to a temp
/// sibling, fsynced, then renamed into place so concurrent pollers never
/// observe a partial document.
pub(crate) fn dump_json<T: Serialize>(path: &Path, value: &T) -> SlabResult<()> {
    let tmp = suffixed(path, ".tmp");
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer(&mut file, value)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON document written by [`dump_json`].
pub(crate) fn load_json<T: DeserializeOwned>(path: &Path) -> SlabResult<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Remove every entry inside `dir`, leaving the directory itself.
pub(crate) fn clean_dir(dir: &Path) -> SlabResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
