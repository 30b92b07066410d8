use rand::RngCore;

/// Builds `multipart/form-data` bodies.
#[derive(Debug)]
pub struct Multipart {
    boundary: String,
    body: Vec<u8>,
}

impl Multipart {
    pub fn new(boundary: &str) -> Self {
        Self {
            boundary: boundary.to_string(),
            body: Vec::new(),
        }
    }

    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    /// Current length, the offset the next part starts at.
    pub fn len(&self) -> usize {
        self.body.len()
    }

    /// Appends a file part, returns the absolute offset of its payload.
    pub fn file(&mut self, name: &str, filename: &str, content_type: &str, payload: &[u8]) -> usize {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}\r\n\r\n",
                self.boundary, name, filename, content_type
            )
            .as_bytes(),
        );
        let start = self.body.len();
        self.body.extend_from_slice(payload);
        self.body.extend_from_slice(b"\r\n");
        start
    }

    /// Length of the headers `file` writes before the payload.
    pub fn file_header_len(&self, name: &str, filename: &str, content_type: &str) -> usize {
        let mut empty = Multipart::new(&self.boundary);
        empty.file(name, filename, content_type, b"")
    }

    pub fn text(&mut self, name: &str, value: &str) {
        self.body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                self.boundary, name, value
            )
            .as_bytes(),
        );
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.body.extend_from_slice(bytes);
    }

    pub fn build(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}

/// Random binary payload.
pub fn random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}
