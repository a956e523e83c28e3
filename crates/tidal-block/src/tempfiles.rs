//! Lifetime-bound temp files for oversize remote fetches
//!
//! A fetched block that was too large for memory lands in a local temp
//! file, but the file's lifetime belongs to the in-memory consumer reading
//! from it. Each consumer holds a [`TempFileGuard`]; when the guard drops,
//! the path is handed to a background cleaner thread that deletes it. An
//! explicit `dispose` deletes synchronously.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use tidal_cluster::transport::DownloadFileManager;

use crate::disk::DiskBlockManager;

/// Cleaner thread poll interval
const CLEANUP_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn delete_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Deleted remote-fetch temp file {:?}", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to delete temp file {:?}: {}", path, e),
    }
}

/// Tracks temp files created for oversize fetches and deletes each one when
/// its consumer lets go of the guard
pub struct RemoteBlockTempFileManager {
    disk_manager: Arc<DiskBlockManager>,
    sender: Sender<PathBuf>,
    stopped: Arc<AtomicBool>,
    cleaner: Mutex<Option<JoinHandle<()>>>,
}

impl RemoteBlockTempFileManager {
    #[must_use]
    pub fn new(disk_manager: Arc<DiskBlockManager>) -> Self {
        let (sender, receiver) = unbounded::<PathBuf>();
        let stopped = Arc::new(AtomicBool::new(false));

        let cleaner_stopped = Arc::clone(&stopped);
        let cleaner = std::thread::Builder::new()
            .name("tidal-temp-file-cleaner".to_string())
            .spawn(move || cleaner_loop(&receiver, &cleaner_stopped))
            .expect("cleaner thread spawn");

        Self {
            disk_manager,
            sender,
            stopped,
            cleaner: Mutex::new(Some(cleaner)),
        }
    }

    /// Couple `path` to a guard. `None` once the manager has stopped, in
    /// which case the caller owns the deletion.
    #[must_use]
    pub fn wrap(&self, path: PathBuf) -> Option<TempFileGuard> {
        if self.stopped.load(Ordering::SeqCst) {
            return None;
        }
        Some(TempFileGuard {
            path,
            sender: self.sender.clone(),
            stopped: Arc::clone(&self.stopped),
            disposed: false,
        })
    }

    /// Stop the cleaner thread. Guards dropped afterwards delete their
    /// files synchronously.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.cleaner.lock().take() {
            let _ = handle.join();
        }
    }
}

impl DownloadFileManager for RemoteBlockTempFileManager {
    fn create_temp_file(&self) -> PathBuf {
        self.disk_manager
            .create_temp_file("remote-block")
            .unwrap_or_else(|_| {
                std::env::temp_dir().join(format!("remote-block-{}", uuid::Uuid::new_v4()))
            })
    }

    fn register_temp_file_to_clean(&self, _path: PathBuf) -> bool {
        // Responsibility transfers through the guard the fetch path wraps
        // around the file; here we only answer whether we still manage.
        !self.stopped.load(Ordering::SeqCst)
    }
}

fn cleaner_loop(receiver: &Receiver<PathBuf>, stopped: &AtomicBool) {
    loop {
        match receiver.recv_timeout(CLEANUP_POLL_INTERVAL) {
            Ok(path) => delete_file(&path),
            Err(RecvTimeoutError::Timeout) => {
                if stopped.load(Ordering::SeqCst) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if stopped.load(Ordering::SeqCst) && receiver.is_empty() {
            break;
        }
    }
    debug!("Temp file cleaner exiting");
}

/// Holds a temp file alive for exactly as long as its consumer
pub struct TempFileGuard {
    path: PathBuf,
    sender: Sender<PathBuf>,
    stopped: Arc<AtomicBool>,
    disposed: bool,
}

impl TempFileGuard {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file now instead of waiting for the cleaner
    pub fn dispose(mut self) {
        delete_file(&self.path);
        self.disposed = true;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if self.disposed {
            return;
        }
        // Cleaner gone means we delete in place
        if self.stopped.load(Ordering::SeqCst) || self.sender.send(self.path.clone()).is_err() {
            delete_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn new_manager() -> (RemoteBlockTempFileManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(
            DiskBlockManager::new(&[dir.path().to_string_lossy().to_string()], 64, true).unwrap(),
        );
        (RemoteBlockTempFileManager::new(disk), dir)
    }

    fn wait_until_gone(path: &Path) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if !path.exists() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn dropping_the_guard_deletes_the_file() {
        let (manager, _dir) = new_manager();
        let path = manager.create_temp_file();
        std::fs::write(&path, b"fetched").unwrap();

        let guard = manager.wrap(path.clone()).unwrap();
        assert!(path.exists());
        drop(guard);

        assert!(wait_until_gone(&path));
        manager.stop();
    }

    #[test]
    fn dispose_deletes_immediately() {
        let (manager, _dir) = new_manager();
        let path = manager.create_temp_file();
        std::fs::write(&path, b"fetched").unwrap();

        let guard = manager.wrap(path.clone()).unwrap();
        guard.dispose();
        assert!(!path.exists());
        manager.stop();
    }

    #[test]
    fn stopped_manager_refuses_new_guards() {
        let (manager, _dir) = new_manager();
        manager.stop();
        assert!(manager.wrap(PathBuf::from("/tmp/whatever")).is_none());
        assert!(!manager.register_temp_file_to_clean(PathBuf::from("/tmp/whatever")));
    }

    #[test]
    fn guard_dropped_after_stop_still_deletes() {
        let (manager, _dir) = new_manager();
        let path = manager.create_temp_file();
        std::fs::write(&path, b"fetched").unwrap();

        let guard = manager.wrap(path.clone()).unwrap();
        manager.stop();
        drop(guard);
        assert!(wait_until_gone(&path));
    }

    #[test]
    fn temp_files_get_distinct_paths() {
        let (manager, _dir) = new_manager();
        assert_ne!(manager.create_temp_file(), manager.create_temp_file());
        manager.stop();
    }
}
