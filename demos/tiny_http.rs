//! Upload server with a progress endpoint.
//!
//! ```
//! RUST_LOG=upload_stream=debug cargo run --example tiny_http -- --dir=/tmp/uploads
//! ```
//!
//! `GET /` renders a form bound to a fresh upload id, the browser posts it
//! to `/upload?upload_id=..` and polls `/progress?upload_id=..` meanwhile.

use std::{
    env, fs,
    io::Cursor,
    path::{Path, PathBuf},
    thread::{sleep, spawn},
    time::Duration,
};

use anyhow::Result;
use http::Request as HttpRequest;
use tiny_http::{Header, Request, Response, Server};
use upload_stream::{Error, Ingestion, Limits, ReadBody, SessionStore};

type Reply = Response<Cursor<Vec<u8>>>;

const PAGE: &str = r#"<!doctype html>
<form method="post" enctype="multipart/form-data" action="/upload?upload_id={id}">
  <input type="file" name="files" multiple>
  <button>Upload</button>
</form>
<pre id="progress"></pre>
<script>
  document.querySelector("form").addEventListener("submit", () => {
    const poll = async () => {
      const status = await (await fetch("/progress?upload_id={id}")).json();
      document.getElementById("progress").textContent = JSON.stringify(status, null, 2);
      if (!status.completed && !status.aborted) setTimeout(poll, 500);
    };
    setTimeout(poll, 100);
  });
</script>
"#;

fn reply(body: String, content_type: &str) -> Reply {
    let res = Response::from_string(body);
    match Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes()) {
        Ok(header) => res.with_header(header),
        Err(()) => res,
    }
}

fn to_http(request: &Request) -> Result<HttpRequest<()>> {
    let mut builder = HttpRequest::builder()
        .method(request.method().to_string().as_str())
        .uri(request.url());

    for h in request.headers() {
        builder = builder.header(h.field.as_str().as_str(), h.value.as_str());
    }

    Ok(builder.body(())?)
}

fn page(store: &SessionStore, dir: &Path) -> Reply {
    let id = format!("{:08x}", rand::random::<u32>());
    store.create(&id, dir, Limits::default().files(16));
    tracing::info!("upload {} created", id);
    reply(PAGE.replace("{id}", &id), "text/html; charset=utf-8")
}

fn progress(ingestion: &Ingestion, request: &Request) -> Result<Reply> {
    let session = ingestion
        .upload_id(&to_http(request)?)
        .and_then(|id| ingestion.store().get(&id));

    let Some(session) = session else {
        return Ok(reply("null".to_string(), "application/json").with_status_code(404));
    };

    let status = session.status();
    if status.is_terminal() {
        session.mark_handled();
    }

    Ok(reply(serde_json::to_string(&status)?, "application/json"))
}

fn upload(ingestion: &Ingestion, request: &mut Request, dest: &Path) -> Result<Reply> {
    let Some(upload) = ingestion.classify(&to_http(request)?) else {
        return Ok(reply("not an upload".to_string(), "text/plain").with_status_code(400));
    };

    let session = match ingestion.handle(&upload, &mut ReadBody::new(request.as_reader())) {
        Ok(session) => session,
        Err(e @ Error::SessionBusy(_)) => {
            return Ok(reply(e.to_string(), "text/plain").with_status_code(409));
        }
        Err(e) => return Err(e.into()),
    };

    let mut txt = String::new();
    if session.is_completed() {
        for mut file in session.take_files() {
            let path = dest.join(&file.name);
            file.persist(&path, true)?;
            txt.push_str(&format!("file {} {:?}\r\n", file.name, file.size()));
        }
    } else {
        txt.push_str(session.error().as_deref().unwrap_or("aborted"));
    }

    Ok(reply(txt, "text/plain"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        // From env var: `RUST_LOG`
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .map_err(|e| anyhow::anyhow!(e))?;

    let dest = env::args()
        .find_map(|a| a.strip_prefix("--dir=").map(PathBuf::from))
        .unwrap_or_else(|| env::temp_dir().join("uploads"));
    let spool = env::temp_dir().join("upload-stream");
    fs::create_dir_all(&dest)?;
    fs::create_dir_all(&spool)?;

    let store = SessionStore::new();
    let ingestion = Ingestion::new(store.clone());

    {
        let store = store.clone();
        spawn(move || loop {
            sleep(Duration::from_secs(60));
            let n = store.sweep(Duration::from_secs(3600));
            if n > 0 {
                tracing::info!("swept {} stale uploads", n);
            }
        });
    }

    let server = Server::http("0.0.0.0:3000").map_err(|e| anyhow::anyhow!(e))?;
    println!("Now listening on port 3000");

    for mut request in server.incoming_requests() {
        let store = store.clone();
        let ingestion = ingestion.clone();
        let dest = dest.clone();
        let spool = spool.clone();

        spawn(move || {
            let path = request.url().split('?').next().unwrap_or_default().to_string();
            let response = match path.as_str() {
                "/" => Ok(page(&store, &spool)),
                "/progress" => progress(&ingestion, &request),
                "/upload" => upload(&ingestion, &mut request, &dest),
                _ => Ok(reply("not found".to_string(), "text/plain").with_status_code(404)),
            };

            let response = response.unwrap_or_else(|e| {
                tracing::error!("{}", e);
                reply(e.to_string(), "text/plain").with_status_code(500)
            });

            let _ = request.respond(response);
        });
    }

    Ok(())
}
