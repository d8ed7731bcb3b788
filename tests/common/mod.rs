//! Loopback HTTP server for integration tests. Speaks just enough HTTP/1.1
//! (keep-alive included, since reqwest pools connections) to play the EMS
//! backend: the test supplies one closure that maps each request to a canned
//! response.

use ems_gateway::config::Settings;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub struct Request {
    pub method: String,
    pub path: String,
    pub body: String,
}

impl Request {
    /// "METHOD /path" without the query string, used as the hit-counter key.
    pub fn key(&self) -> String {
        let path = self.path.split('?').next().unwrap_or(&self.path);
        format!("{} {}", self.method, path)
    }
}

pub struct Response {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl Response {
    pub fn json(status: u16, body: serde_json::Value) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.to_string(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// A token-endpoint success response with a long-lived token.
pub fn token_response() -> Response {
    Response::json(
        200,
        serde_json::json!({
            "access_token": "test-token",
            "token_type": "bearer",
            "expires_in": 3600,
        }),
    )
}

type Handler = dyn Fn(&Request, usize) -> Response + Send + Sync;

pub struct MockServer {
    pub base_url: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl MockServer {
    /// Start the server on an ephemeral loopback port. The closure receives
    /// the parsed request and the zero-based hit count for that
    /// method-and-path, so tests can script fail-then-succeed sequences.
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&Request, usize) -> Response + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind loopback listener");
        let addr = listener.local_addr().expect("local addr");
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let accept_hits = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let handler = handler.clone();
                let hits = accept_hits.clone();
                tokio::spawn(async move {
                    serve_connection(stream, handler, hits).await;
                });
            }
        });

        Self {
            base_url: format!("http://{}", addr),
            hits,
        }
    }

    /// Number of requests seen for "METHOD /path".
    pub fn hits(&self, key: &str) -> usize {
        self.hits
            .lock()
            .expect("hit counter lock")
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Settings wired to this server. The URL keeps its http:// scheme
    /// because it never goes through the env-var normalization path.
    pub fn settings(&self) -> Settings {
        Settings {
            base_url: self.base_url.clone(),
            username: "test-user".to_string(),
            password: "test-pass".to_string(),
            default_system: Some(1),
            cache_ttl_secs: 3_600,
            request_timeout_secs: 5,
            max_retries: 3,
        }
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    handler: Arc<Handler>,
    hits: Arc<Mutex<HashMap<String, usize>>>,
) {
    let mut buf: Vec<u8> = Vec::new();
    while let Some(request) = read_request(&mut stream, &mut buf).await {
        let count = {
            let mut hits = hits.lock().expect("hit counter lock");
            let entry = hits.entry(request.key()).or_insert(0);
            let current = *entry;
            *entry += 1;
            current
        };
        let response = handler(&request, count);
        if write_response(&mut stream, &response).await.is_err() {
            break;
        }
    }
}

async fn read_request(stream: &mut TcpStream, buf: &mut Vec<u8>) -> Option<Request> {
    loop {
        if let Some(header_end) = find_subsequence(buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
            let mut lines = head.lines();
            let request_line = lines.next()?;
            let mut parts = request_line.split_whitespace();
            let method = parts.next()?.to_string();
            let path = parts.next()?.to_string();

            let mut content_length = 0usize;
            for line in lines {
                if let Some((name, value)) = line.split_once(':') {
                    if name.eq_ignore_ascii_case("content-length") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
            }

            let body_start = header_end + 4;
            while buf.len() < body_start + content_length {
                if !read_more(stream, buf).await {
                    return None;
                }
            }
            let body =
                String::from_utf8_lossy(&buf[body_start..body_start + content_length]).to_string();
            buf.drain(..body_start + content_length);
            return Some(Request { method, path, body });
        }
        if !read_more(stream, buf).await {
            return None;
        }
    }
}

async fn read_more(stream: &mut TcpStream, buf: &mut Vec<u8>) -> bool {
    let mut chunk = [0u8; 4096];
    match stream.read(&mut chunk).await {
        Ok(0) | Err(_) => false,
        Ok(n) => {
            buf.extend_from_slice(&chunk[..n]);
            true
        }
    }
}

async fn write_response(stream: &mut TcpStream, response: &Response) -> std::io::Result<()> {
    let reason = match response.status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    };
    let mut head = format!(
        "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: keep-alive\r\n",
        response.status,
        reason,
        response.body.len()
    );
    for (name, value) in &response.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(response.body.as_bytes()).await?;
    stream.flush().await
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
