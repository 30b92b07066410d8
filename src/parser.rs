use std::fmt;

use bytes::{Buf, Bytes, BytesMut};
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use memchr::memmem;
use tracing::{debug, trace};

use crate::{
    utils::{
        base_name, find_blank_line, line_terminator_len, parse_content_disposition,
        parse_content_type, parse_part_headers, temp_file_name, DASHES, LF,
    },
    Error, FilePart, Limits, Result, UploadSession,
};

#[derive(Debug)]
enum Flag {
    /// No part is open, looking for the next file part.
    Searching,
    /// A file part is open and its payload goes to the sink.
    Writing(FilePart),
    /// The closing delimiter has been seen, the rest is epilogue.
    Eof,
}

/// What follows a boundary in the current window.
enum Lookahead {
    /// The part headers are not fully visible yet.
    Incomplete,
    /// `--boundary--`, or nothing more will arrive.
    Close,
    /// Not a file part, scanning resumes at the offset.
    Skip(usize),
    /// A file part whose payload starts at the offset.
    File {
        field: Option<String>,
        filename: String,
        content_type: Option<mime::Mime>,
        body: usize,
    },
}

/// Streaming multipart parser.
///
/// Consumes a body as a sequence of fixed-size chunks and writes every file
/// part straight to a temp file. The scan window is the tail of the previous
/// window (at most `overlap_size` bytes) followed by the current chunk, so a
/// boundary split across two chunks is always seen whole. All offsets are
/// absolute within the body.
pub struct Parser {
    limits: Limits,
    boundary: Bytes,
    finder: memmem::Finder<'static>,
    flag: Flag,
    window: BytesMut,
    /// Absolute offset of `window[0]`.
    window_start: u64,
    /// Absolute offset of the next chunk.
    offset: u64,
    total: u64,
    /// Boundaries before this offset have been handled.
    scanned: u64,
    /// A boundary whose headers are still incomplete.
    pending: Option<u64>,
    files: usize,
}

impl Parser {
    /// Creates a parser for `boundary`.
    ///
    /// The delimiter line (`\r\n--boundary\r\n`) must fit in the overlap
    /// region, and so must the part headers that follow it.
    pub fn new(boundary: &str, limits: Limits) -> Result<Self> {
        // `--boundary`
        let mut dash_boundary = BytesMut::with_capacity(DASHES.len() + boundary.len());
        dash_boundary.extend_from_slice(&DASHES);
        dash_boundary.extend_from_slice(boundary.as_bytes());

        if limits.overlap_size == 0 || limits.buffer_size <= limits.overlap_size {
            return Err(Error::InvalidLimits(limits.buffer_size, limits.overlap_size));
        }
        if boundary.is_empty() {
            return Err(Error::MissingBoundary);
        }
        // the delimiter, its line terminator and the line end after it
        if dash_boundary.len() + 4 > limits.overlap_size {
            return Err(Error::BoundaryTooLong(limits.overlap_size.saturating_sub(6)));
        }

        let boundary = dash_boundary.freeze();
        let finder = memmem::Finder::new(&boundary[..]).into_owned();

        Ok(Self {
            window: BytesMut::with_capacity(limits.buffer_size + limits.overlap_size),
            limits,
            boundary,
            finder,
            flag: Flag::Searching,
            window_start: 0,
            offset: 0,
            total: 0,
            scanned: 0,
            pending: None,
            files: 0,
        })
    }

    /// Gets the chunk size.
    pub fn buffer_size(&self) -> usize {
        self.limits.buffer_size
    }

    /// Gets the absolute offset of the next chunk.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Gets the declared body size.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// Whether a file part is open.
    pub fn is_writing(&self) -> bool {
        matches!(self.flag, Flag::Writing(_))
    }

    /// Whether the closing delimiter has been seen.
    pub fn eof(&self) -> bool {
        matches!(self.flag, Flag::Eof)
    }

    /// Counts the file parts opened so far.
    pub fn files(&self) -> usize {
        self.files
    }

    /// Resets the parser for a body of `total` bytes.
    pub fn start(&mut self, total: u64) {
        self.window.clear();
        self.window_start = 0;
        self.offset = 0;
        self.total = total;
        self.scanned = 0;
        self.pending = None;
        self.files = 0;
        self.flag = Flag::Searching;
    }

    /// Processes the next chunk of the body.
    ///
    /// A chunk shorter than the buffer size marks the end of the body.
    pub fn process_chunk(&mut self, session: &UploadSession, chunk: &[u8]) -> Result<()> {
        session.advance(self.offset, self.total);

        let last = chunk.len() < self.limits.buffer_size;
        let end = self.offset + chunk.len() as u64;

        if let Some(max) = self.limits.checked_stream_size(end) {
            return Err(Error::PayloadTooLarge(max));
        }

        trace!(
            "chunk {}..{} window from {} last {}",
            self.offset,
            end,
            self.window_start,
            last
        );

        self.window.extend_from_slice(chunk);
        self.offset = end;

        self.scan(session, last)?;

        let holdback = (self.boundary.len() + 2) as u64;
        if let Flag::Writing(part) = &mut self.flag {
            let upto = if last { end } else { end.saturating_sub(holdback) };
            write_part(part, self.window_start, &self.window, upto, &self.limits)?;
        }

        // truncated body, the part ends with it
        if last && self.is_writing() {
            if let Flag::Writing(mut part) = std::mem::replace(&mut self.flag, Flag::Eof) {
                part.finish(end)?;
                debug!("part {} ends with the body at {}", part.name, end);
                session.complete_file(part);
            }
        }

        self.retain()
    }

    /// Marks the end of the body.
    pub fn finish(&mut self, session: &UploadSession) {
        session.advance(self.offset, self.total);
        session.pin_progress();
        trace!("finished at {}", self.offset);
    }

    /// Drops the open part without finishing it, its temp file is left to
    /// the session cleanup.
    pub fn abandon(&mut self) {
        if let Flag::Writing(part) = std::mem::replace(&mut self.flag, Flag::Eof) {
            debug!("part {} abandoned at {}", part.name, part.written());
        }
    }

    fn scan(&mut self, session: &UploadSession, last: bool) -> Result<()> {
        self.pending = None;

        loop {
            if let Flag::Eof = self.flag {
                break;
            }

            let from = (self.scanned.max(self.window_start) - self.window_start) as usize;
            let Some(n) = self.finder.find(&self.window[from..]).map(|n| from + n) else {
                break;
            };
            let at = self.window_start + n as u64;
            let terminator = line_terminator_len(&self.window, n) as u64;

            // a delimiter starts a line
            if at > 0 && terminator == 0 {
                self.scanned = at + 1;
                continue;
            }

            if let Flag::Writing(part) = &mut self.flag {
                if at <= part.start() {
                    break;
                }

                let end = at - terminator;
                write_part(part, self.window_start, &self.window, end, &self.limits)?;
                part.finish(end)?;

                if let Flag::Writing(part) = std::mem::replace(&mut self.flag, Flag::Searching) {
                    debug!("part {} closed at {}", part.name, end);
                    session.complete_file(part);
                }
            }

            match self.lookahead(n, last) {
                Lookahead::Incomplete => {
                    trace!("headers after {} are incomplete", at);
                    self.pending.replace(at);
                    break;
                }
                Lookahead::Close => {
                    trace!("closing delimiter at {}", at);
                    self.flag = Flag::Eof;
                    break;
                }
                Lookahead::Skip(next) => {
                    self.scanned = self.window_start + next as u64;
                }
                Lookahead::File {
                    field,
                    filename,
                    content_type,
                    body,
                } => {
                    if let Some(max) = self.limits.checked_files(self.files + 1) {
                        return Err(Error::FilesTooMany(max));
                    }

                    let start = self.window_start + body as u64;
                    let path = session
                        .temp_dir()
                        .join(temp_file_name(base_name(&filename)));
                    let part = FilePart::create(field, &filename, content_type, start, path)?;

                    debug!("part {} opened at {}", part.name, start);

                    session.begin_file(&part.name, part.path());
                    self.files += 1;
                    self.flag = Flag::Writing(part);
                    self.scanned = start;
                }
            }
        }

        Ok(())
    }

    /// Looks at the bytes after the boundary at `n`, up to the next boundary.
    fn lookahead(&self, n: usize, last: bool) -> Lookahead {
        let incomplete = if last {
            Lookahead::Close
        } else {
            Lookahead::Incomplete
        };

        let after = n + self.boundary.len();
        let rest = &self.window[after..];

        if rest.len() < 2 {
            return incomplete;
        }
        if rest[..2] == DASHES {
            return Lookahead::Close;
        }

        let Some(eol) = memchr::memchr(LF, rest) else {
            return incomplete;
        };

        let from = after + eol + 1;
        let next = self.finder.find(&self.window[from..]).map(|m| from + m);
        let until = next.unwrap_or(self.window.len());

        let Some((blank, len)) = find_blank_line(&self.window[from..until]) else {
            return if next.is_some() {
                Lookahead::Skip(after)
            } else {
                incomplete
            };
        };

        let body = from + blank + len;

        let Ok(headers) = parse_part_headers(&self.window[from..body]) else {
            debug!("invalid part headers at {}", self.window_start + from as u64);
            return Lookahead::Skip(body);
        };

        let Some((field, Some(filename))) = headers
            .get(CONTENT_DISPOSITION)
            .map(|v| parse_content_disposition(v.as_bytes()))
            .and_then(Result::ok)
        else {
            return Lookahead::Skip(body);
        };

        if filename.is_empty() || !headers.contains_key(CONTENT_TYPE) {
            return Lookahead::Skip(body);
        }

        Lookahead::File {
            field,
            filename,
            content_type: parse_content_type(headers.get(CONTENT_TYPE)),
            body,
        }
    }

    /// Drops the window up to the overlap region, or up to a boundary whose
    /// headers are still incomplete.
    fn retain(&mut self) -> Result<()> {
        let window_end = self.window_start + self.window.len() as u64;
        let overlap = self.limits.overlap_size as u64;

        // a pending boundary keeps its line terminator
        let keep = match self.pending {
            Some(at) => at.saturating_sub(2).max(self.window_start),
            None => window_end.saturating_sub(overlap).max(self.window_start),
        };

        if window_end - keep > overlap {
            return Err(Error::HeaderTooLarge(self.limits.overlap_size));
        }

        self.window.advance((keep - self.window_start) as usize);
        self.window_start = keep;

        Ok(())
    }
}

fn write_part(
    part: &mut FilePart,
    window_start: u64,
    window: &[u8],
    upto: u64,
    limits: &Limits,
) -> Result<()> {
    let upto = upto.min(window_start + window.len() as u64);
    if upto > part.start() {
        if let Some(max) = limits.checked_file_size(upto - part.start()) {
            return Err(Error::FileTooLarge(max));
        }
    }

    let n = part.write(window_start, window, upto)?;
    if n > 0 {
        trace!("part {} wrote {} bytes to {}", part.name, n, part.written());
    }

    Ok(())
}

impl fmt::Debug for Parser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parser")
            .field("flag", &self.flag)
            .field("offset", &self.offset)
            .field("total", &self.total)
            .field("window_start", &self.window_start)
            .field("window_len", &self.window.len())
            .field("scanned", &self.scanned)
            .field("pending", &self.pending)
            .field("files", &self.files)
            .field("boundary", &String::from_utf8_lossy(&self.boundary[2..]))
            .finish()
    }
}
