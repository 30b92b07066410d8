use serde::{Deserialize, Serialize};

/// Various limits on an incoming upload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Limits {
    /// Max number of whole stream
    pub stream_size: Option<u64>,
    /// Max number of file parts
    pub files: Option<usize>,
    /// Max file size
    pub file_size: Option<u64>,
    /// Size of a chunk read from the body
    pub buffer_size: usize,
    /// Size of the region carried over from the previous chunk
    pub overlap_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            stream_size: Some(Self::DEFAULT_STREAM_SIZE),
            files: None,
            file_size: None,
            buffer_size: Self::DEFAULT_BUFFER_SIZE,
            overlap_size: Self::DEFAULT_OVERLAP_SIZE,
        }
    }
}

impl Limits {
    /// Max number of stream size, defaults to 200MB.
    pub const DEFAULT_STREAM_SIZE: u64 = 200 * 1024 * 1024;

    /// Chunk size, defaults to 32KB.
    pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

    /// Overlap size, defaults to 1KB.
    pub const DEFAULT_OVERLAP_SIZE: usize = 1024;

    /// Max number of file parts
    #[must_use]
    pub fn files(mut self, max: usize) -> Self {
        self.files.replace(max);
        self
    }

    /// Max file size
    #[must_use]
    pub fn file_size(mut self, max: u64) -> Self {
        self.file_size.replace(max);
        self
    }

    /// Max number of whole stream size
    #[must_use]
    pub fn stream_size(mut self, max: u64) -> Self {
        self.stream_size.replace(max);
        self
    }

    /// Removes the whole stream size limit.
    #[must_use]
    pub fn unlimited_stream(mut self) -> Self {
        self.stream_size = None;
        self
    }

    /// Chunk size
    ///
    /// # Panics
    ///
    /// If `size` is not greater than the overlap size.
    #[must_use]
    pub fn buffer_size(mut self, size: usize) -> Self {
        assert!(
            size > self.overlap_size,
            "The buffer_size must be greater than the overlap_size {}.",
            self.overlap_size,
        );

        self.buffer_size = size;
        self
    }

    /// Overlap size
    ///
    /// # Panics
    ///
    /// If `size` is zero or not smaller than the buffer size.
    #[must_use]
    pub fn overlap_size(mut self, size: usize) -> Self {
        assert!(
            size > 0 && size < self.buffer_size,
            "The overlap_size must be in 1..{}.",
            self.buffer_size,
        );

        self.overlap_size = size;
        self
    }

    /// Check files
    #[must_use]
    pub fn checked_files(&self, rhs: usize) -> Option<usize> {
        self.files.filter(|max| rhs > *max)
    }

    /// Check stream size
    #[must_use]
    pub fn checked_stream_size(&self, rhs: u64) -> Option<u64> {
        self.stream_size.filter(|max| rhs > *max)
    }

    /// Check file size
    #[must_use]
    pub fn checked_file_size(&self, rhs: u64) -> Option<u64> {
        self.file_size.filter(|max| rhs > *max)
    }
}
