//!
//! ```
//! RUST_LOG=trace cargo test --test parser -- --nocapture
//! ```

use std::{fs, path::Path};

use anyhow::Result;

use upload_stream::*;

#[path = "./lib/mod.rs"]
mod lib;

use lib::{random_bytes, tracing_init, Multipart};

const BOUNDARY: &str = "----WebKitFormBoundaryWLHCs9qmcJJoyjKR";

fn small() -> Limits {
    Limits::default().overlap_size(256).buffer_size(1024)
}

/// Feeds `body` in chunks of the buffer size, returns the progress seen at
/// the entry of every chunk.
fn run(session: &UploadSession, body: &[u8], limits: &Limits) -> Result<Vec<f64>> {
    let mut parser = Parser::new(BOUNDARY, limits.clone())?;
    parser.start(body.len() as u64);

    let mut progress = Vec::new();
    let mut chunks = body.chunks(limits.buffer_size).peekable();

    while let Some(chunk) = chunks.next() {
        parser.process_chunk(session, chunk)?;
        progress.push(session.progress());

        if chunks.peek().is_none() && chunk.len() == limits.buffer_size {
            parser.process_chunk(session, &[])?;
            progress.push(session.progress());
        }
    }

    if body.is_empty() {
        parser.process_chunk(session, &[])?;
    }

    assert!(!parser.is_writing());

    parser.finish(session);
    progress.push(session.progress());

    Ok(progress)
}

fn files_in(dir: &Path) -> Result<usize> {
    Ok(fs::read_dir(dir)?.count())
}

#[test]
fn one_file_any_chunking() -> Result<()> {
    tracing_init();

    let payload = random_bytes(5_000);

    let mut form = Multipart::new(BOUNDARY);
    form.text("title", "holiday");
    let start = form.file("photo", "beach.png", "image/png", &payload);
    form.text("commit", "Save");
    let body = form.build();

    for buffer_size in (300..2_000).step_by(37) {
        let dir = tempfile::tempdir()?;
        let limits = Limits::default().overlap_size(256).buffer_size(buffer_size);
        let session = UploadSession::new("one", dir.path(), limits.clone());

        run(&session, &body, &limits)?;

        let files = session.take_files();
        assert_eq!(files.len(), 1, "buffer size {buffer_size}");

        let file = &files[0];
        assert_eq!(file.name, "beach.png");
        assert_eq!(file.field.as_deref(), Some("photo"));
        assert_eq!(file.extension.as_deref(), Some("png"));
        assert_eq!(file.content_type, Some(mime::IMAGE_PNG));
        assert_eq!(file.start(), start as u64);
        assert_eq!(file.end(), Some((start + payload.len()) as u64));
        assert_eq!(file.size(), Some(payload.len() as u64));
        assert!(!file.is_open());
        assert_eq!(fs::read(file.path())?, payload, "buffer size {buffer_size}");
    }

    Ok(())
}

#[test]
fn boundary_split_across_chunks() -> Result<()> {
    tracing_init();

    let limits = small();
    let name_len = Multipart::new(BOUNDARY).file_header_len("f", "split.bin", "application/octet-stream");
    let delimiter = 2 + 2 + BOUNDARY.len();

    // every split point of `\r\n--boundary` over the first chunk edge
    for k in 1..delimiter {
        let payload_len = limits.buffer_size - name_len - delimiter + k;
        let payload = random_bytes(payload_len);

        let mut form = Multipart::new(BOUNDARY);
        form.file("f", "split.bin", "application/octet-stream", &payload);
        form.file("g", "after.txt", "text/plain", b"second");
        let body = form.build();

        let dir = tempfile::tempdir()?;
        let session = UploadSession::new("split", dir.path(), limits.clone());
        run(&session, &body, &limits)?;

        let files = session.take_files();
        assert_eq!(files.len(), 2, "split at {k}");
        assert_eq!(fs::read(files[0].path())?, payload, "split at {k}");
        assert_eq!(fs::read(files[1].path())?, b"second");
        assert_eq!(files_in(dir.path())?, 2);
    }

    Ok(())
}

#[test]
fn boundary_across_first_and_second_chunk() -> Result<()> {
    tracing_init();

    let limits = Limits::default();
    assert_eq!(limits.buffer_size, 32_768);

    let header_len = Multipart::new(BOUNDARY).file_header_len("a", "a.bin", "application/octet-stream");

    // the delimiter after the first file covers 32760..32802
    let first = random_bytes(32_760 - header_len);

    let mut form = Multipart::new(BOUNDARY);
    form.file("a", "a.bin", "application/octet-stream", &first);
    let header_len = form.file_header_len("b", "b.bin", "application/octet-stream");
    let rest = 70_000 - form.len() - header_len - 2 - (BOUNDARY.len() + 6);
    let second = random_bytes(rest);
    form.file("b", "b.bin", "application/octet-stream", &second);
    let body = form.build();

    assert_eq!(body.len(), 70_000);

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("scenario", dir.path(), limits.clone());
    let progress = run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].end(), Some(32_760));
    assert_eq!(fs::read(files[0].path())?, first);
    assert_eq!(fs::read(files[1].path())?, second);

    assert_eq!(progress.len(), 4);
    assert!((progress[3] - 1.0).abs() < f64::EPSILON);

    Ok(())
}

#[test]
fn progress_is_monotonic() -> Result<()> {
    let limits = small();
    let mut form = Multipart::new(BOUNDARY);
    for i in 0..5 {
        form.file("f", &format!("{i}.bin"), "application/octet-stream", &random_bytes(1_500));
    }
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("progress", dir.path(), limits.clone());
    let progress = run(&session, &body, &limits)?;

    assert!(progress.windows(2).all(|w| w[0] <= w[1]));
    assert!(progress.iter().all(|p| (0.0..=1.0).contains(p)));
    assert!((progress[progress.len() - 1] - 1.0).abs() < f64::EPSILON);
    assert_eq!(session.file_count(), 5);
    assert_eq!(session.received_bytes(), body.len() as u64);

    Ok(())
}

#[test]
fn no_file_parts() -> Result<()> {
    let limits = small();
    let mut form = Multipart::new(BOUNDARY);
    form.text("_method", "put");
    form.text("profile[bio]", "hello\r\n\r\n\"quote\"");
    // a file input left empty
    form.file("media", "", "application/octet-stream", b"");
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("none", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    assert_eq!(session.file_count(), 0);
    assert_eq!(session.current_file(), None);
    assert_eq!(files_in(dir.path())?, 0);

    Ok(())
}

#[test]
fn empty_body() -> Result<()> {
    let limits = small();
    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("empty", dir.path(), limits.clone());
    run(&session, &[], &limits)?;

    assert_eq!(session.file_count(), 0);
    assert!((session.progress() - 1.0).abs() < f64::EPSILON);

    Ok(())
}

#[test]
fn file_without_content_type_is_skipped() -> Result<()> {
    let limits = small();
    let mut form = Multipart::new(BOUNDARY);
    form.raw(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\r\nplain\r\n"
        )
        .as_bytes(),
    );
    form.file("g", "y.txt", "text/plain", b"typed");
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("ct", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].name, "y.txt");

    Ok(())
}

#[test]
fn filenames() -> Result<()> {
    let limits = small();
    let mut form = Multipart::new(BOUNDARY);
    form.file("file2", "中文.json", "application/json", b"{\r\n  \"test\": \"filename\"\r\n}\r\n");
    form.file("file3", r"C:\fakepath\foo bar.txt", "text/plain", b"contents of the file");
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("names", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "中文.json");
    assert_eq!(files[0].extension.as_deref(), Some("json"));
    assert_eq!(fs::read(files[0].path())?, b"{\r\n  \"test\": \"filename\"\r\n}\r\n");
    assert_eq!(files[1].name, "foo bar.txt");
    assert_eq!(files[1].size(), Some(20));

    Ok(())
}

#[test]
fn too_many_files() -> Result<()> {
    let limits = small().files(2);
    let mut form = Multipart::new(BOUNDARY);
    for i in 0..3 {
        form.file("f", &format!("{i}.txt"), "text/plain", b"data");
    }
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("many", dir.path(), limits.clone());
    let err = run(&session, &body, &limits).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::FilesTooMany(2))
    ));
    assert_eq!(session.file_count(), 2);
    assert_eq!(files_in(dir.path())?, 2);

    Ok(())
}

#[test]
fn file_too_large() -> Result<()> {
    let limits = small().file_size(1_000);
    let mut form = Multipart::new(BOUNDARY);
    form.file("f", "big.bin", "application/octet-stream", &random_bytes(3_000));
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("big", dir.path(), limits.clone());
    let err = run(&session, &body, &limits).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<Error>(),
        Some(Error::FileTooLarge(1_000))
    ));

    Ok(())
}

#[test]
fn headers_larger_than_overlap() -> Result<()> {
    let limits = Limits::default().overlap_size(64).buffer_size(128);
    let mut form = Multipart::new("X");
    form.file("f", &"n".repeat(200), "text/plain", b"data");
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("headers", dir.path(), limits.clone());

    let mut parser = Parser::new("X", limits)?;
    parser.start(body.len() as u64);
    let err = parser.process_chunk(&session, &body[..128]).unwrap_err();

    assert!(matches!(err, Error::HeaderTooLarge(64)));

    Ok(())
}

#[test]
fn boundary_longer_than_overlap() {
    let limits = Limits::default().overlap_size(16).buffer_size(128);
    assert!(matches!(
        Parser::new(BOUNDARY, limits),
        Err(Error::BoundaryTooLong(10))
    ));
}

#[test]
fn limits_from_config_are_checked() -> Result<()> {
    let config = |buffer_size: usize, overlap_size: usize| -> Result<Limits> {
        let mut value = serde_json::to_value(Limits::default())?;
        value["buffer_size"] = buffer_size.into();
        value["overlap_size"] = overlap_size.into();
        Ok(serde_json::from_value(value)?)
    };

    assert!(matches!(
        Parser::new(BOUNDARY, config(0, 1024)?),
        Err(Error::InvalidLimits(0, 1024))
    ));
    assert!(matches!(
        Parser::new(BOUNDARY, config(1024, 1024)?),
        Err(Error::InvalidLimits(1024, 1024))
    ));
    assert!(matches!(
        Parser::new(BOUNDARY, config(1024, 0)?),
        Err(Error::InvalidLimits(1024, 0))
    ));
    assert!(Parser::new(BOUNDARY, config(1024, 256)?).is_ok());

    Ok(())
}

#[test]
fn line_feed_only_part_headers() -> Result<()> {
    let limits = small();
    // a trailing CR would read as part of a CRLF delimiter
    let mut payload = random_bytes(5_000);
    payload.push(b'.');

    let mut body = format!(
        "--{BOUNDARY}\n\
         Content-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\n\
         Content-Type: text/plain\n\
         \n"
    )
    .into_bytes();
    body.extend_from_slice(&payload);
    body.extend_from_slice(
        format!(
            "\n--{BOUNDARY}\n\
             Content-Disposition: form-data; name=\"y\"; filename=\"y.txt\"\r\n\
             Content-Type: text/plain\r\n\
             \n\
             mixed\n\
             --{BOUNDARY}\n\
             Content-Disposition: form-data; name=\"t\"\n\
             \n\
             value\n\
             --{BOUNDARY}--\n"
        )
        .as_bytes(),
    );

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("lf", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 2);
    assert_eq!(files[0].name, "x.txt");
    assert_eq!(fs::read(files[0].path())?, payload);
    assert_eq!(files[1].name, "y.txt");
    assert_eq!(fs::read(files[1].path())?, b"mixed");

    Ok(())
}

#[test]
fn truncated_body_ends_the_open_part() -> Result<()> {
    let limits = small();
    let payload = random_bytes(2_500);

    let mut form = Multipart::new(BOUNDARY);
    form.file("f", "cut.bin", "application/octet-stream", &payload);
    let mut body = form.build();
    // no closing delimiter, no trailing line end
    body.truncate(body.len() - (BOUNDARY.len() + 8));

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("cut", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read(files[0].path())?, payload);

    Ok(())
}

#[test]
fn boundary_lookalike_inside_payload() -> Result<()> {
    let limits = small();
    let payload = format!("not a delimiter: x--{BOUNDARY} stays in the file");

    let mut form = Multipart::new(BOUNDARY);
    form.file("f", "tricky.txt", "text/plain", payload.as_bytes());
    let body = form.build();

    let dir = tempfile::tempdir()?;
    let session = UploadSession::new("tricky", dir.path(), limits.clone());
    run(&session, &body, &limits)?;

    let files = session.take_files();
    assert_eq!(files.len(), 1);
    assert_eq!(fs::read_to_string(files[0].path())?, payload);

    Ok(())
}
