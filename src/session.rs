//! Upload sessions shared between the request that streams a body and the
//! requests that poll its progress.
//!
//! A session has a single writer, the ingesting request, which owns every
//! mutation through crate-private methods. Pollers only read snapshots,
//! block on [`UploadSession::wait_terminal`] and acknowledge the terminal
//! state with [`UploadSession::mark_handled`].

use std::{
    collections::HashMap,
    fmt, fs, io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, SystemTime},
};

use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::{Error, FilePart, Limits, Result};

pub(crate) const EXPIRED_MESSAGE: &str = "The upload session has expired or does not exist.";

#[derive(Debug, Default)]
struct Inner {
    total_bytes: u64,
    received_bytes: u64,
    progress: f64,
    current_file: Option<String>,
    aborted: bool,
    completed: bool,
    handled: bool,
    receiving: bool,
    error: Option<String>,
    boundary: Option<String>,
    started: Option<SystemTime>,
    files: Vec<FilePart>,
    pending: Option<PathBuf>,
}

impl Inner {
    fn is_terminal(&self) -> bool {
        self.aborted || self.completed
    }

    fn is_streaming(&self) -> bool {
        self.receiving && !self.is_terminal()
    }
}

/// Shared state of one upload, addressed by the client's upload identifier.
pub struct UploadSession {
    id: String,
    temp_dir: PathBuf,
    limits: Limits,
    debug: bool,
    created: SystemTime,
    inner: Mutex<Inner>,
    signal: Condvar,
}

/// A completed file as seen by a poller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileInfo {
    /// The filename sent by the client.
    pub name: String,
    /// The content type of the part.
    pub content_type: Option<String>,
    /// The payload size.
    pub size: u64,
}

/// A point-in-time view of an [`UploadSession`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStatus {
    /// The upload identifier.
    pub upload_id: String,
    /// Progress fraction in `0..=1`.
    pub progress: f64,
    /// Bytes received so far.
    pub received_bytes: u64,
    /// Declared body size.
    pub total_bytes: u64,
    /// The file currently being received.
    pub current_file: Option<String>,
    /// Human-readable error.
    pub error: Option<String>,
    /// Whether the upload was aborted.
    pub aborted: bool,
    /// Whether the upload finished.
    pub completed: bool,
    /// Files received so far.
    pub files: Vec<FileInfo>,
}

impl SessionStatus {
    /// Completed or aborted.
    pub fn is_terminal(&self) -> bool {
        self.aborted || self.completed
    }
}

impl UploadSession {
    /// Creates a session writing its temp files under `temp_dir`.
    pub fn new(id: impl Into<String>, temp_dir: impl Into<PathBuf>, limits: Limits) -> Self {
        Self {
            id: id.into(),
            temp_dir: temp_dir.into(),
            limits,
            debug: false,
            created: SystemTime::now(),
            inner: Mutex::default(),
            signal: Condvar::new(),
        }
    }

    /// Reports detailed error messages instead of a generic one.
    #[must_use]
    pub fn debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// A terminal session standing in for an unknown identifier.
    pub(crate) fn expired(id: &str) -> Self {
        let session = Self::new(id, std::env::temp_dir(), Limits::default());
        session.fail(&Error::SessionExpired(id.to_string()));
        session
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Gets the upload identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Gets the temp folder.
    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Gets the limits.
    pub fn limits(&self) -> &Limits {
        &self.limits
    }

    /// Gets the debug flag.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Gets the creation time.
    pub fn created(&self) -> SystemTime {
        self.created
    }

    /// Gets the time the body started streaming.
    pub fn started(&self) -> Option<SystemTime> {
        self.lock().started
    }

    /// Gets the multipart boundary.
    pub fn boundary(&self) -> Option<String> {
        self.lock().boundary.clone()
    }

    /// Gets the progress fraction.
    pub fn progress(&self) -> f64 {
        self.lock().progress
    }

    /// Gets the bytes received so far.
    pub fn received_bytes(&self) -> u64 {
        self.lock().received_bytes
    }

    /// Gets the declared body size.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Gets the name of the file being received.
    pub fn current_file(&self) -> Option<String> {
        self.lock().current_file.clone()
    }

    /// Gets the error message.
    pub fn error(&self) -> Option<String> {
        self.lock().error.clone()
    }

    /// Gets the abort flag.
    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Gets the completion flag.
    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    /// Gets the handled flag.
    pub fn is_handled(&self) -> bool {
        self.lock().handled
    }

    /// Counts the completed files still held by the session.
    pub fn file_count(&self) -> usize {
        self.lock().files.len()
    }

    /// Takes a snapshot.
    pub fn status(&self) -> SessionStatus {
        self.snapshot(&self.lock())
    }

    fn snapshot(&self, inner: &Inner) -> SessionStatus {
        SessionStatus {
            upload_id: self.id.clone(),
            progress: inner.progress,
            received_bytes: inner.received_bytes,
            total_bytes: inner.total_bytes,
            current_file: inner.current_file.clone(),
            error: inner.error.clone(),
            aborted: inner.aborted,
            completed: inner.completed,
            files: inner
                .files
                .iter()
                .map(|f| FileInfo {
                    name: f.name.clone(),
                    content_type: f.content_type.as_ref().map(ToString::to_string),
                    size: f.size().unwrap_or_default(),
                })
                .collect(),
        }
    }

    /// Blocks until the session completes or aborts, or `timeout` elapses.
    pub fn wait_terminal(&self, timeout: Duration) -> SessionStatus {
        let (inner, _) = self
            .signal
            .wait_timeout_while(self.lock(), timeout, |inner| !inner.is_terminal())
            .unwrap_or_else(PoisonError::into_inner);
        self.snapshot(&inner)
    }

    /// Acknowledges that the terminal state has been observed.
    pub fn mark_handled(&self) {
        self.lock().handled = true;
        self.signal.notify_all();
    }

    /// Moves the completed files to the caller, they are no longer cleaned up
    /// with the session.
    pub fn take_files(&self) -> Vec<FilePart> {
        std::mem::take(&mut self.lock().files)
    }

    /// Deletes every temp file the session still references.
    pub fn dispose(&self) {
        let (files, pending) = {
            let mut inner = self.lock();
            (std::mem::take(&mut inner.files), inner.pending.take())
        };

        for mut file in files {
            if let Err(e) = file.delete() {
                warn!("failed to delete {}: {}", file.path().display(), e);
            }
        }

        if let Some(path) = pending {
            match fs::remove_file(&path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => {
                    warn!("failed to delete {}: {}", path.display(), e);
                }
                _ => trace!("deleted partial {}", path.display()),
            }
        }
    }

    /// Claims the session for the request streaming its body.
    pub(crate) fn claim(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.receiving {
            return Err(Error::SessionBusy(self.id.clone()));
        }
        inner.receiving = true;
        Ok(())
    }

    pub(crate) fn begin(&self, boundary: &str) {
        let mut inner = self.lock();
        inner.boundary.replace(boundary.to_string());
        inner.started.replace(SystemTime::now());
    }

    /// Records that `consumed` of `total` bytes have been processed.
    pub(crate) fn advance(&self, consumed: u64, total: u64) {
        let mut inner = self.lock();
        inner.total_bytes = total;
        if total == 0 {
            return;
        }
        let received = consumed.min(total);
        #[allow(clippy::cast_precision_loss)]
        let progress = received as f64 / inner.total_bytes as f64;
        inner.received_bytes = inner.received_bytes.max(received);
        inner.progress = inner.progress.max(progress);
    }

    pub(crate) fn pin_progress(&self) {
        self.lock().progress = 1.0;
    }

    pub(crate) fn begin_file(&self, name: &str, path: &Path) {
        let mut inner = self.lock();
        inner.current_file.replace(name.to_string());
        inner.pending.replace(path.to_path_buf());
    }

    pub(crate) fn complete_file(&self, part: FilePart) {
        let mut inner = self.lock();
        inner.pending = None;
        inner.files.push(part);
    }

    /// Counts every file part seen so far, including the open one.
    pub(crate) fn opened_files(&self) -> usize {
        let inner = self.lock();
        inner.files.len() + usize::from(inner.pending.is_some())
    }

    pub(crate) fn complete(&self) {
        {
            let mut inner = self.lock();
            inner.completed = true;
            inner.progress = 1.0;
        }
        self.signal.notify_all();
    }

    pub(crate) fn fail(&self, error: &Error) {
        let message = if self.debug {
            error.to_string()
        } else {
            match error {
                Error::SessionExpired(_) => EXPIRED_MESSAGE.to_string(),
                _ => "An error occurred while uploading the file.".to_string(),
            }
        };

        debug!("upload {} aborted: {}", self.id, error);

        {
            let mut inner = self.lock();
            inner.aborted = true;
            inner.error.replace(message);
        }
        self.signal.notify_all();
    }

    /// The client went away, nothing more will arrive.
    pub(crate) fn disconnect(&self) {
        debug!("upload {} disconnected", self.id);
        self.lock().aborted = true;
        self.signal.notify_all();
    }

    /// Blocks until a poller marks the session handled, or `timeout` elapses.
    pub(crate) fn wait_handled(&self, timeout: Duration) -> bool {
        let (inner, _) = self
            .signal
            .wait_timeout_while(self.lock(), timeout, |inner| !inner.handled)
            .unwrap_or_else(PoisonError::into_inner);
        inner.handled
    }
}

impl fmt::Debug for UploadSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadSession")
            .field("id", &self.id)
            .field("temp_dir", &self.temp_dir)
            .field("limits", &self.limits)
            .field("debug", &self.debug)
            .field("inner", &*self.lock())
            .finish()
    }
}

/// Process-wide sessions keyed by upload identifier.
#[derive(Debug, Clone, Default)]
pub struct SessionStore {
    sessions: Arc<Mutex<HashMap<String, Arc<UploadSession>>>>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<UploadSession>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Creates and registers a session.
    pub fn create(
        &self,
        id: impl Into<String>,
        temp_dir: impl Into<PathBuf>,
        limits: Limits,
    ) -> Arc<UploadSession> {
        let session = Arc::new(UploadSession::new(id, temp_dir, limits));
        self.insert(session.clone());
        session
    }

    /// Registers a session, a replaced session is disposed.
    pub fn insert(&self, session: Arc<UploadSession>) {
        let replaced = self.lock().insert(session.id().to_string(), session);
        if let Some(old) = replaced {
            old.dispose();
        }
    }

    /// Gets a session.
    pub fn get(&self, id: &str) -> Option<Arc<UploadSession>> {
        self.lock().get(id).cloned()
    }

    /// Removes a session and deletes its unclaimed temp files.
    pub fn remove(&self, id: &str) -> Option<Arc<UploadSession>> {
        let session = self.lock().remove(id)?;
        session.dispose();
        debug!("upload {} removed", id);
        Some(session)
    }

    /// Removes `session` if it is still the one registered under its id, and
    /// deletes its unclaimed temp files either way.
    pub fn release(&self, session: &Arc<UploadSession>) -> bool {
        let removed = {
            let mut sessions = self.lock();
            match sessions.get(session.id()) {
                Some(current) if Arc::ptr_eq(current, session) => {
                    sessions.remove(session.id()).is_some()
                }
                _ => false,
            }
        };

        session.dispose();
        trace!("upload {} released, removed {}", session.id(), removed);
        removed
    }

    /// Removes every session older than `max_age` whose body is not streaming.
    ///
    /// Returns the number of removed sessions.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let stale = {
            let mut sessions = self.lock();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, s)| {
                    s.created.elapsed().is_ok_and(|age| age >= max_age) && !s.lock().is_streaming()
                })
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id))
                .collect::<Vec<_>>()
        };

        for session in &stale {
            session.dispose();
        }

        stale.len()
    }

    /// Counts the sessions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Checks if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
