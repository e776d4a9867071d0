//! Minimal S3-speaking test server
//!
//! Just enough HTTP/1.1 to exercise the real client: GET/PUT/DELETE on
//! `/{bucket}/{key}`, ListObjectsV2 on `/{bucket}`, a scripted failure
//! queue, per-key corruption injection, and an instance-metadata endpoint
//! for the IAM-role provider. Every response closes the connection.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

#[derive(Clone)]
pub struct StoredObject {
    pub body: Vec<u8>,
    /// Captured `x-amz-meta-*` headers
    pub meta: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: String,
    pub path: String,
    pub at: Instant,
}

#[derive(Default)]
pub struct ServerState {
    pub objects: Mutex<BTreeMap<String, StoredObject>>,
    /// Status codes to return for upcoming requests, regardless of route
    pub fail_script: Mutex<VecDeque<u16>>,
    /// Keys whose body is returned with one byte flipped
    pub corrupt: Mutex<HashSet<String>>,
    /// IAM credential document served under the metadata path
    pub iam_document: Mutex<Option<String>>,
    pub requests: Mutex<Vec<SeenRequest>>,
}

impl ServerState {
    pub fn requests_matching(&self, method: &str, path_part: &str) -> Vec<SeenRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == method && r.path.contains(path_part))
            .cloned()
            .collect()
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<ServerState>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ServerState::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let state = Arc::clone(&state);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Ok(stream) = stream {
                        handle_connection(stream, &state);
                    }
                }
            })
        };

        Self {
            addr,
            state,
            stop,
            handle: Some(handle),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Place an object directly, bypassing the HTTP surface.
    pub fn seed(&self, key: &str, body: &[u8], meta: &[(&str, &str)]) {
        self.state.objects.lock().insert(
            key.to_string(),
            StoredObject {
                body: body.to_vec(),
                meta: meta
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
        );
    }

    pub fn fail_next(&self, statuses: &[u16]) {
        self.state.fail_script.lock().extend(statuses);
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        // Poke the accept loop so it notices the flag.
        let _ = TcpStream::connect(self.addr);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct Request {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Request {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    fn query_param(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

fn read_request(stream: &mut TcpStream) -> Option<Request> {
    let mut raw = Vec::new();
    let mut chunk = [0u8; 1024];
    let header_end = loop {
        if let Some(pos) = find_header_end(&raw) {
            break pos;
        }
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            return None;
        }
        raw.extend_from_slice(&chunk[..n]);
    };

    let header_text = String::from_utf8_lossy(&raw[..header_end]).to_string();
    let mut lines = header_text.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split(' ');
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let (path, query_text) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    let query = query_text
        .split('&')
        .filter(|s| !s.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (url_decode(k), url_decode(v)),
            None => (url_decode(pair), String::new()),
        })
        .collect();

    let headers: Vec<(String, String)> = lines
        .filter_map(|line| {
            line.split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect();

    let content_length: usize = headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case("content-length"))
        .and_then(|(_, v)| v.parse().ok())
        .unwrap_or(0);

    let mut body = raw[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut chunk).ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(Request {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn find_header_end(raw: &[u8]) -> Option<usize> {
    raw.windows(4).position(|w| w == b"\r\n\r\n")
}

fn url_decode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(v) = u8::from_str_radix(&s[i + 1..i + 3], 16) {
                    out.push(v as char);
                    i += 3;
                    continue;
                }
                out.push('%');
                i += 1;
            }
            b'+' => {
                out.push(' ');
                i += 1;
            }
            b => {
                out.push(b as char);
                i += 1;
            }
        }
    }
    out
}

fn respond(stream: &mut TcpStream, status: u16, headers: &[(String, String)], body: &[u8]) {
    let reason = match status {
        200 => "OK",
        204 => "No Content",
        304 => "Not Modified",
        404 => "Not Found",
        503 => "Service Unavailable",
        _ => "Status",
    };
    let mut out = format!("HTTP/1.1 {status} {reason}\r\n");
    out.push_str(&format!("Content-Length: {}\r\n", body.len()));
    out.push_str("Connection: close\r\n");
    for (k, v) in headers {
        out.push_str(&format!("{k}: {v}\r\n"));
    }
    out.push_str("\r\n");
    let _ = stream.write_all(out.as_bytes());
    let _ = stream.write_all(body);
    let _ = stream.flush();
}

fn md5_hex(data: &[u8]) -> String {
    s3bd::BlockHash::compute(data).to_hex()
}

fn handle_connection(mut stream: TcpStream, state: &ServerState) {
    let Some(req) = read_request(&mut stream) else {
        return;
    };
    state.requests.lock().push(SeenRequest {
        method: req.method.clone(),
        path: req.path.clone(),
        at: Instant::now(),
    });

    if let Some(status) = state.fail_script.lock().pop_front() {
        respond(&mut stream, status, &[], b"scripted failure");
        return;
    }

    // Instance metadata endpoint
    if req.path.starts_with("/latest/meta-data/iam/security-credentials/") {
        let doc = state.iam_document.lock().clone();
        match doc {
            Some(doc) => respond(&mut stream, 200, &[], doc.as_bytes()),
            None => respond(&mut stream, 404, &[], b""),
        }
        return;
    }

    // "/bucket" or "/bucket/key..."
    let trimmed = req.path.trim_start_matches('/');
    let (_bucket, key) = match trimmed.split_once('/') {
        Some((b, k)) => (b, k.to_string()),
        None => (trimmed, String::new()),
    };

    match (req.method.as_str(), key.is_empty()) {
        ("GET", true) => {
            // ListObjectsV2
            let prefix = req.query_param("prefix").unwrap_or("").to_string();
            let objects = state.objects.lock();
            let mut contents = String::new();
            for key in objects.keys().filter(|k| k.starts_with(&prefix)) {
                contents.push_str(&format!("<Contents><Key>{key}</Key></Contents>"));
            }
            let xml = format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
                 <ListBucketResult><IsTruncated>false</IsTruncated>{contents}</ListBucketResult>"
            );
            respond(&mut stream, 200, &[], xml.as_bytes());
        }
        ("GET", false) => {
            let objects = state.objects.lock();
            match objects.get(&key) {
                Some(obj) => {
                    let mut body = obj.body.clone();
                    if state.corrupt.lock().contains(&key) {
                        body[0] ^= 0xff;
                    }
                    let etag = format!("\"{}\"", md5_hex(&body));
                    if req.header("if-none-match") == Some(etag.as_str()) {
                        respond(&mut stream, 304, &[], b"");
                        return;
                    }
                    let mut headers = vec![("ETag".to_string(), etag)];
                    for (k, v) in &obj.meta {
                        headers.push((k.clone(), v.clone()));
                    }
                    respond(&mut stream, 200, &headers, &body);
                }
                None => respond(&mut stream, 404, &[], b""),
            }
        }
        ("PUT", false) => {
            let meta: Vec<(String, String)> = req
                .headers
                .iter()
                .filter(|(k, _)| k.to_ascii_lowercase().starts_with("x-amz-meta-"))
                .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
                .collect();
            let etag = format!("\"{}\"", md5_hex(&req.body));
            state.objects.lock().insert(
                key,
                StoredObject {
                    body: req.body.clone(),
                    meta,
                },
            );
            respond(&mut stream, 200, &[("ETag".to_string(), etag)], b"");
        }
        ("DELETE", false) => {
            state.objects.lock().remove(&key);
            respond(&mut stream, 204, &[], b"");
        }
        _ => respond(&mut stream, 404, &[], b""),
    }
}
