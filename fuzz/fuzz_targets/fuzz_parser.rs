#![no_main]
use libfuzzer_sys::fuzz_target;

use upload_stream::{Limits, Parser, UploadSession};

fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };

    let limits = Limits::default().overlap_size(64).buffer_size(128).files(4);
    let session = UploadSession::new("fuzz", dir.path(), limits.clone());
    let Ok(mut parser) = Parser::new("BOUNDARY", limits) else {
        return;
    };

    parser.start(data.len() as u64);

    let mut chunks = data.chunks(parser.buffer_size()).peekable();
    let mut result = Ok(());
    while let Some(chunk) = chunks.next() {
        result = parser.process_chunk(&session, chunk);
        if result.is_err() {
            break;
        }
        if chunks.peek().is_none() && chunk.len() == parser.buffer_size() {
            result = parser.process_chunk(&session, &[]);
        }
    }

    if result.is_ok() {
        parser.finish(&session);
        assert!((session.progress() - 1.0).abs() < f64::EPSILON);
    }
    assert!(session.progress() <= 1.0);

    parser.abandon();
    session.dispose();
});
