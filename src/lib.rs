//! Streams `multipart/form-data` uploads straight to temporary files.
//!
//! The body is read in fixed-size chunks and never held in memory as a
//! whole. Each file part goes to its own temp file while the progress is
//! published on an [`UploadSession`] that other requests can poll.
//!
//! # Example
//!
//! ```rust
//! use std::{io::Cursor, time::Duration};
//!
//! use anyhow::Result;
//! use http::Request;
//! use tempfile::tempdir;
//!
//! use upload_stream::{Ingestion, Limits, ReadBody, SessionStore};
//!
//! fn main() -> Result<()> {
//!     let dir = tempdir()?;
//!     let store = SessionStore::new();
//!
//!     // created by the page that renders the upload widget
//!     store.create("42", dir.path(), Limits::default().files(4));
//!
//!     let body = "--AaB03x\r\n\
//!         Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
//!         Content-Type: text/plain\r\n\
//!         \r\n\
//!         Hello, world!\r\n\
//!         --AaB03x--\r\n";
//!
//!     let req = Request::post("/upload?upload_id=42")
//!         .header("content-type", "multipart/form-data; boundary=AaB03x")
//!         .header("content-length", body.len())
//!         .body(())?;
//!
//!     let ingestion = Ingestion::new(store).handled_timeout(Duration::ZERO);
//!     let upload = ingestion.classify(&req).expect("an upload request");
//!
//!     // the session leaves the store once `session` is dropped
//!     let session = ingestion.handle(&upload, &mut ReadBody::new(Cursor::new(body)))?;
//!
//!     assert!(session.is_completed());
//!
//!     for mut file in session.take_files() {
//!         assert_eq!(file.name, "hello.txt");
//!         assert_eq!(file.size(), Some(13));
//!         file.persist(dir.path().join(&file.name), false)?;
//!     }
//!
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![deny(nonstandard_style)]
#![warn(missing_docs, unreachable_pub)]

mod error;
mod ingest;
mod limits;
mod parser;
mod part;
mod session;
mod utils;

pub use error::Error;

pub use ingest::{Ingestion, RawBody, ReadBody, RequestGuard, UploadRequest};

pub use limits::Limits;

pub use parser::Parser;

pub use part::FilePart;

pub use session::{FileInfo, SessionStatus, SessionStore, UploadSession};

pub(crate) type Result<T, E = Error> = std::result::Result<T, E>;
