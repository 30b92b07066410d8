use thiserror::Error;

/// Upload Error
#[derive(Debug, Error)]
pub enum Error {
    /// IO Error
    #[error(transparent)]
    Stream(#[from] std::io::Error),

    /// Invalid part header
    #[error("invalid part header")]
    InvalidHeader,

    /// Invalid content disposition
    #[error("invalid content disposition")]
    InvalidContentDisposition,

    /// Missing multipart boundary
    #[error("missing multipart boundary")]
    MissingBoundary,

    /// Boundary does not fit in the overlap region
    #[error("boundary is too long, limit to `{0}`")]
    BoundaryTooLong(usize),

    /// Chunk and overlap sizes that cannot work together
    #[error("buffer size `{0}` must be greater than the overlap size `{1}`, which must not be zero")]
    InvalidLimits(usize, usize),

    /// Missing declared body length
    #[error("content length is required")]
    LengthRequired,

    /// Payload too large
    #[error("payload is too large, limit to `{0}`")]
    PayloadTooLarge(u64),

    /// File too large
    #[error("file is too large, limit to `{0}`")]
    FileTooLarge(u64),

    /// Files too many
    #[error("files is too many, limit to `{0}`")]
    FilesTooMany(usize),

    /// Part headers do not fit in the overlap region
    #[error("part header is too large, limit to `{0}`")]
    HeaderTooLarge(usize),

    /// Upload session already receiving a body
    #[error("upload session `{0}` is already receiving")]
    SessionBusy(String),

    /// Unknown or expired upload session
    #[error("upload session `{0}` has expired")]
    SessionExpired(String),
}
