use std::{
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
};

use tracing::trace;

use crate::{
    utils::{base_name, extension},
    Error, Result,
};

/// A file segment discovered in a multipart body, backed by a temp file.
pub struct FilePart {
    /// The form field name, optional.
    pub field: Option<String>,
    /// The filename sent by the client, without any directory prefix.
    pub name: String,
    /// The content type of the part, optional.
    pub content_type: Option<mime::Mime>,
    /// The extension of the filename, optional.
    pub extension: Option<String>,
    start: u64,
    end: Option<u64>,
    written: u64,
    path: PathBuf,
    file: Option<File>,
}

impl FilePart {
    /// Creates the backing temp file and starts a part at the absolute `start` offset.
    pub(crate) fn create(
        field: Option<String>,
        filename: &str,
        content_type: Option<mime::Mime>,
        start: u64,
        path: PathBuf,
    ) -> Result<Self> {
        let name = base_name(filename).to_string();
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;

        trace!("created {} at {}", name, path.display());

        Ok(Self {
            field,
            extension: extension(&name),
            name,
            content_type,
            start,
            end: None,
            written: start,
            path,
            file: Some(file),
        })
    }

    /// Absolute offset of the first payload byte.
    pub fn start(&self) -> u64 {
        self.start
    }

    /// Absolute offset right after the last payload byte, once known.
    pub fn end(&self) -> Option<u64> {
        self.end
    }

    /// The payload size, once the part is finished.
    pub fn size(&self) -> Option<u64> {
        self.end.map(|end| end - self.start)
    }

    /// Absolute offset up to which payload has been flushed to the sink.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Path of the backing temp file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the sink is still open.
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Writes the bytes of `window` that lie in `[written, upto)`.
    ///
    /// `window_start` is the absolute offset of `window[0]`. Bytes below the
    /// watermark are never written twice.
    pub(crate) fn write(&mut self, window_start: u64, window: &[u8], upto: u64) -> Result<usize> {
        let Some(file) = self.file.as_mut() else {
            return Ok(0);
        };

        let window_end = window_start + window.len() as u64;
        let from = self.written.max(window_start);
        let to = upto.min(window_end);

        if to <= from {
            return Ok(0);
        }

        let buf = &window[(from - window_start) as usize..(to - window_start) as usize];
        file.write_all(buf)?;
        self.written = to;

        Ok(buf.len())
    }

    /// Sets the end offset, flushes and closes the sink.
    pub(crate) fn finish(&mut self, end: u64) -> Result<()> {
        debug_assert!(self.end.is_none(), "end offset is set once");
        debug_assert!(end >= self.start);

        self.end.replace(end.max(self.start));

        if let Some(mut file) = self.file.take() {
            file.flush()?;
        }

        trace!("finished {} {:?} bytes", self.name, self.size());

        Ok(())
    }

    /// Opens the backing temp file for reading.
    pub fn open(&self) -> Result<File> {
        Ok(File::open(&self.path)?)
    }

    /// Copies the backing temp file to `dest`.
    pub fn copy_to<P: AsRef<Path>>(&self, dest: P, overwrite: bool) -> Result<u64> {
        let dest = dest.as_ref();
        check_overwrite(dest, overwrite)?;
        Ok(fs::copy(&self.path, dest)?)
    }

    /// Moves the backing temp file to `dest`, the part then points at `dest`.
    pub fn persist<P: AsRef<Path>>(&mut self, dest: P, overwrite: bool) -> Result<()> {
        let dest = dest.as_ref();
        check_overwrite(dest, overwrite)?;

        // rename fails across filesystems
        if fs::rename(&self.path, dest).is_err() {
            fs::copy(&self.path, dest)?;
            fs::remove_file(&self.path)?;
        }

        self.path = dest.to_path_buf();
        Ok(())
    }

    /// Deletes the backing temp file.
    pub fn delete(&mut self) -> Result<()> {
        drop(self.file.take());
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}

fn check_overwrite(dest: &Path, overwrite: bool) -> Result<()> {
    if !overwrite && dest.exists() {
        return Err(Error::Stream(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} already exists", dest.display()),
        )));
    }
    Ok(())
}

impl fmt::Debug for FilePart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilePart")
            .field("field", &self.field)
            .field("name", &self.name)
            .field("content_type", &self.content_type)
            .field("start", &self.start)
            .field("end", &self.end)
            .field("written", &self.written)
            .field("path", &self.path)
            .field("open", &self.file.is_some())
            .finish()
    }
}
