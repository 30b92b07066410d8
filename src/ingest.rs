use std::{
    fmt,
    io::{self, Read},
    ops::Deref,
    sync::Arc,
    time::Duration,
};

use bytes::{Buf, Bytes, BytesMut};
use http::{
    header::{CONTENT_LENGTH, CONTENT_TYPE},
    Request,
};
use tracing::{debug, trace, warn};

use crate::{
    utils::{parse_boundary, parse_content_type, query_param},
    Error, Parser, Result, SessionStore, UploadSession,
};

/// Incremental access to a raw request body.
pub trait RawBody {
    /// Takes the bytes the host buffered before the handler started reading.
    fn preloaded(&mut self) -> Option<Bytes> {
        None
    }

    /// Reads the next bytes of the body, `Ok(0)` once the client is gone.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Whether the client is still connected.
    fn is_connected(&self) -> bool {
        true
    }
}

/// A [`RawBody`] over any reader.
pub struct ReadBody<R> {
    preloaded: Option<Bytes>,
    io: R,
}

impl<R> ReadBody<R> {
    /// Creates a body reading from `io`.
    pub fn new(io: R) -> Self {
        Self {
            preloaded: None,
            io,
        }
    }

    /// Creates a body whose first bytes were already buffered by the host.
    pub fn with_preloaded(preloaded: impl Into<Bytes>, io: R) -> Self {
        Self {
            preloaded: Some(preloaded.into()).filter(|b: &Bytes| !b.is_empty()),
            io,
        }
    }
}

impl<R: Read> RawBody for ReadBody<R> {
    fn preloaded(&mut self) -> Option<Bytes> {
        self.preloaded.take()
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.io.read(buf)
    }
}

impl<R> fmt::Debug for ReadBody<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBody")
            .field("preloaded", &self.preloaded.as_ref().map(Bytes::len))
            .finish()
    }
}

/// A request recognized as an upload.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// The upload identifier.
    pub upload_id: String,
    /// The `multipart/form-data` content type.
    pub content_type: mime::Mime,
    /// The declared body size.
    pub content_length: Option<u64>,
}

/// The claim of one request on its [`UploadSession`].
///
/// Dropping the guard removes the session from the store, unless it has
/// been replaced since, and deletes the temp files not taken with
/// [`UploadSession::take_files`].
#[must_use = "the session is removed when the guard is dropped"]
pub struct RequestGuard {
    store: SessionStore,
    session: Arc<UploadSession>,
}

impl RequestGuard {
    /// Gets the claimed session.
    pub fn session(&self) -> &Arc<UploadSession> {
        &self.session
    }
}

impl Deref for RequestGuard {
    type Target = UploadSession;

    fn deref(&self) -> &UploadSession {
        &self.session
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        trace!("request for upload {} ended", self.session.id());
        self.store.release(&self.session);
    }
}

impl fmt::Debug for RequestGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestGuard")
            .field("upload_id", &self.session.id())
            .finish()
    }
}

/// Drives upload requests through the [`Parser`].
///
/// Every request runs on its own thread and is handled synchronously. The
/// outcome of a claimed request is recorded on the [`UploadSession`], where
/// the polling side observes it.
#[derive(Debug, Clone)]
pub struct Ingestion {
    store: SessionStore,
    upload_param: String,
    handled_timeout: Duration,
}

impl Ingestion {
    /// Query parameter carrying the upload identifier, defaults to `upload_id`.
    pub const DEFAULT_UPLOAD_PARAM: &'static str = "upload_id";

    /// How long to wait for a poller to acknowledge the terminal state, defaults to 10s.
    pub const DEFAULT_HANDLED_TIMEOUT: Duration = Duration::from_secs(10);

    /// Creates a coordinator over `store`.
    pub fn new(store: SessionStore) -> Self {
        Self {
            store,
            upload_param: Self::DEFAULT_UPLOAD_PARAM.to_string(),
            handled_timeout: Self::DEFAULT_HANDLED_TIMEOUT,
        }
    }

    /// Query parameter carrying the upload identifier
    #[must_use]
    pub fn upload_param(mut self, name: impl Into<String>) -> Self {
        self.upload_param = name.into();
        self
    }

    /// Max time to wait for the handled acknowledgment
    #[must_use]
    pub fn handled_timeout(mut self, timeout: Duration) -> Self {
        self.handled_timeout = timeout;
        self
    }

    /// Gets the session store.
    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Reads the upload identifier from the query string.
    pub fn upload_id<B>(&self, req: &Request<B>) -> Option<String> {
        req.uri()
            .query()
            .and_then(|q| query_param(q, &self.upload_param))
            .map(str::to_string)
    }

    /// Recognizes a `multipart/form-data` request carrying an upload identifier.
    pub fn classify<B>(&self, req: &Request<B>) -> Option<UploadRequest> {
        let content_type = parse_content_type(req.headers().get(CONTENT_TYPE))
            .filter(|m| m.type_() == mime::MULTIPART && m.subtype() == mime::FORM_DATA)?;

        let upload_id = self.upload_id(req)?;

        let content_length = req
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());

        Some(UploadRequest {
            upload_id,
            content_type,
            content_length,
        })
    }

    /// Streams the body of an upload request into its session.
    ///
    /// Fails only with [`Error::SessionBusy`] when another request is
    /// already streaming into the session, which is then left untouched.
    /// Every other outcome is recorded on the session.
    ///
    /// Returns once the outcome has been acknowledged by a poller, or the
    /// handled timeout elapsed. The caller then ends the response, keeping
    /// the guard alive while it claims the files.
    pub fn handle<R: RawBody>(&self, req: &UploadRequest, body: &mut R) -> Result<RequestGuard> {
        let session = self.store.get(&req.upload_id).unwrap_or_else(|| {
            warn!("upload {} not found", req.upload_id);
            let session = Arc::new(UploadSession::expired(&req.upload_id));
            self.store.insert(session.clone());
            session
        });

        if let Err(e) = session.claim() {
            warn!("upload {} rejected: {}", req.upload_id, e);
            return Err(e);
        }

        let guard = RequestGuard {
            store: self.store.clone(),
            session,
        };

        if !guard.is_aborted() {
            match receive(&guard, req, body) {
                Ok(true) => {
                    debug!(
                        "upload {} received {} files",
                        req.upload_id,
                        guard.file_count()
                    );
                    guard.complete();
                }
                Ok(false) => {
                    debug!(
                        "upload {} lost after {} files",
                        req.upload_id,
                        guard.opened_files()
                    );
                    guard.disconnect();
                }
                Err(e) => guard.fail(&e),
            }
        }

        if !guard.wait_handled(self.handled_timeout) {
            trace!("upload {} was not acknowledged", req.upload_id);
        }

        Ok(guard)
    }
}

/// Returns `false` if the client went away before the whole body arrived.
fn receive<R: RawBody>(session: &UploadSession, req: &UploadRequest, body: &mut R) -> Result<bool> {
    let boundary = parse_boundary(&req.content_type)?;
    session.begin(&boundary);

    let total = req.content_length.ok_or(Error::LengthRequired)?;
    if let Some(max) = session.limits().checked_stream_size(total) {
        return Err(Error::PayloadTooLarge(max));
    }

    let mut parser = Parser::new(&boundary, session.limits().clone())?;
    parser.start(total);

    let received = pump(&mut parser, session, body, total);
    parser.finish(session);
    received
}

fn pump<R: RawBody>(
    parser: &mut Parser,
    session: &UploadSession,
    body: &mut R,
    total: u64,
) -> Result<bool> {
    let size = parser.buffer_size();
    let mut chunk = BytesMut::zeroed(size);
    let mut filled = 0;
    let mut received = 0u64;

    if let Some(mut preloaded) = body.preloaded() {
        preloaded.truncate(usize::try_from(total).unwrap_or(usize::MAX));
        received = preloaded.len() as u64;
        trace!("{} bytes preloaded", received);

        while preloaded.has_remaining() {
            let n = (size - filled).min(preloaded.remaining());
            chunk[filled..filled + n].copy_from_slice(&preloaded[..n]);
            preloaded.advance(n);
            filled += n;

            if filled == size {
                parser.process_chunk(session, &chunk)?;
                filled = 0;
            }
        }
    }

    while received < total {
        if !body.is_connected() {
            break;
        }

        let want = (size - filled).min(usize::try_from(total - received).unwrap_or(usize::MAX));
        let n = match body.read(&mut chunk[filled..filled + want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if is_disconnect(&e) => {
                debug!("read failed: {}", e);
                0
            }
            Err(e) => return Err(e.into()),
        };

        if n == 0 {
            break;
        }

        filled += n;
        received += n as u64;

        if filled == size {
            parser.process_chunk(session, &chunk)?;
            filled = 0;
        }
    }

    if received < total {
        debug!("client disconnected after {} of {} bytes", received, total);
        parser.abandon();
        return Ok(false);
    }

    parser.process_chunk(session, &chunk[..filled])?;

    Ok(true)
}

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}
