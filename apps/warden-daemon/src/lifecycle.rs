use std::fs::{File, OpenOptions};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use warden_shared::{Error, Result};

/// Advisory exclusive lock on `<temp_path>/lock`, held for the daemon's
/// lifetime. A second instance failing to take it is fatal.
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(Error::unexpected)?;
        file.try_lock_exclusive().map_err(|_| {
            Error::Unexpected("only one instance should run at the same time".into())
        })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn release(self) {
        let _ = FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

type SyncCallback = Box<dyn FnOnce() + Send>;
type AsyncCallback = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Registry of termination work: synchronous callbacks, asynchronous
/// callbacks and child processes to join. Runs once, no matter how many
/// signals arrive.
#[derive(Default)]
pub struct Cleanup {
    sync_callbacks: Mutex<Vec<SyncCallback>>,
    async_callbacks: Mutex<Vec<AsyncCallback>>,
    children: Mutex<Vec<tokio::process::Child>>,
    cleaning: AtomicBool,
}

impl Cleanup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, callback: impl FnOnce() + Send + 'static) {
        self.sync_callbacks.lock().unwrap().push(Box::new(callback));
    }

    pub fn add_async(&self, callback: impl Future<Output = ()> + Send + 'static) {
        self.async_callbacks
            .lock()
            .unwrap()
            .push(Box::pin(callback));
    }

    /// Registers a child process to be terminated and joined on cleanup.
    pub fn adopt(&self, child: tokio::process::Child) {
        self.children.lock().unwrap().push(child);
    }

    pub fn is_cleaning(&self) -> bool {
        self.cleaning.load(Ordering::Relaxed)
    }

    /// Runs the registered work once. `propagate_term` is set when the
    /// initiating signal was not delivered to the whole process group by
    /// the terminal, so the children need an explicit SIGTERM.
    pub async fn run(&self, propagate_term: bool) {
        if self.cleaning.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("waiting for the scheduled tasks to finish");

        let children = std::mem::take(&mut *self.children.lock().unwrap());
        for mut child in children {
            if propagate_term {
                if let Some(pid) = child.id() {
                    // SAFETY: plain signal send to a child we spawned.
                    unsafe {
                        libc::kill(pid as libc::pid_t, libc::SIGTERM);
                    }
                }
            }
            if let Err(error) = child.wait().await {
                warn!("failed to join a child process: {error}");
            }
        }

        let sync_callbacks = std::mem::take(&mut *self.sync_callbacks.lock().unwrap());
        for callback in sync_callbacks {
            callback();
        }
        let async_callbacks = std::mem::take(&mut *self.async_callbacks.lock().unwrap());
        futures::future::join_all(async_callbacks).await;

        debug!("the scheduled tasks are finished successfully");
    }
}

/// Listens for SIGINT and SIGTERM. The first signal triggers cleanup and
/// a clean exit; a second one during cleanup fast-exits with the
/// signal's numeric code.
pub fn listen(cleanup: Arc<Cleanup>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Ok(mut interrupt) = signal(SignalKind::interrupt()) else {
            warn!("failed to install the SIGINT handler");
            return;
        };
        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            warn!("failed to install the SIGTERM handler");
            return;
        };

        let first = tokio::select! {
            _ = interrupt.recv() => SignalKind::interrupt(),
            _ = terminate.recv() => SignalKind::terminate(),
        };
        // SIGINT from the terminal already reached the process group;
        // anything else must be forwarded to the children explicitly.
        let propagate_term = first != SignalKind::interrupt();
        let pending = cleanup.run(propagate_term);

        tokio::select! {
            () = pending => std::process::exit(0),
            _ = interrupt.recv() => {
                warn!("the pending tasks are cancelled");
                std::process::exit(SignalKind::interrupt().as_raw_value());
            }
            _ = terminate.recv() => {
                warn!("the pending tasks are cancelled");
                std::process::exit(SignalKind::terminate().as_raw_value());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    #[test]
    fn second_instance_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("lock");
        let first = InstanceLock::acquire(&path).unwrap();
        assert!(InstanceLock::acquire(&path).is_err());
        first.release();
        assert!(!path.exists());
        let reacquired = InstanceLock::acquire(&path).unwrap();
        reacquired.release();
    }

    #[tokio::test]
    async fn cleanup_runs_callbacks_once() {
        let cleanup = Cleanup::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let seen = Arc::clone(&counter);
        cleanup.add(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let seen = Arc::clone(&counter);
        cleanup.add_async(async move {
            seen.fetch_add(10, Ordering::SeqCst);
        });

        cleanup.run(false).await;
        cleanup.run(false).await;
        assert_eq!(counter.load(Ordering::SeqCst), 11);
        assert!(cleanup.is_cleaning());
    }

    #[tokio::test]
    async fn cleanup_joins_children() {
        let cleanup = Cleanup::new();
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        cleanup.adopt(child);

        let started = std::time::Instant::now();
        cleanup.run(true).await;
        // SIGTERM ends the child well before its sleep elapses.
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }
}
