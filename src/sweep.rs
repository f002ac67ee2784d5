use std::{
    fs,
    path::Path,
    time::{Duration, SystemTime},
};

use log::warn;

// age-based garbage collection of job workspaces; best effort, runs
// piggybacked on each incoming job rather than on a timer
//
// per-entry failures(permission, concurrent deletion) are swallowed so
// maintenance never breaks a foreground job; returns the number of
// workspaces actually removed
pub fn sweep_expired(jobs_root: &Path, expiry: Duration) -> usize {
    let entries = match fs::read_dir(jobs_root) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let now = SystemTime::now();
    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let expired = entry
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|mtime| now.duration_since(mtime).ok())
            .map(|age| age > expiry)
            .unwrap_or(false);
        if !expired {
            continue;
        }
        match fs::remove_dir_all(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to remove expired job `{}`: `{e}`", path.display()),
        }
    }
    removed
}
