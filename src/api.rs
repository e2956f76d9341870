//! Outbound request layer shared by every API call.
//!
//! The `Authorization` header comes from an [`AuthHeader`] slot. Only the
//! session manager writes to it; every request reads it.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::io::Write;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },
    #[error("request failed: {0}")]
    Transport(String),
    #[error("unreadable response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Field errors of a 400 response, e.g. `{"username": ["taken"]}`.
    pub fn field_errors(&self) -> Option<serde_json::Map<String, Value>> {
        match self {
            ApiError::Status { code: 400, body } => match serde_json::from_str(body) {
                Ok(Value::Object(map)) => Some(map),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Process-wide `Authorization` value for outbound requests.
#[derive(Clone, Default)]
pub struct AuthHeader {
    slot: Arc<RwLock<Option<String>>>,
}

impl AuthHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, value: String) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = Some(value);
    }

    pub fn clear(&self) {
        *self.slot.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn get(&self) -> Option<String> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn is_set(&self) -> bool {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

pub struct ApiClient {
    base_url: String,
    agent: ureq::Agent,
    timeout: Duration,
    auth: AuthHeader,
}

impl ApiClient {
    pub fn new(base_url: &str, timeout_ms: u64, auth: AuthHeader) -> Self {
        Self::with_cookies(base_url, timeout_ms, auth, cookie_store::CookieStore::default())
    }

    /// Client whose agent starts from `jar`. Server-set long-lived
    /// credentials ride in the jar between calls.
    pub fn with_cookies(
        base_url: &str,
        timeout_ms: u64,
        auth: AuthHeader,
        jar: cookie_store::CookieStore,
    ) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().cookie_store(jar).build(),
            timeout: Duration::from_millis(timeout_ms),
            auth,
        }
    }

    #[cfg(test)]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Serialize the agent's cookie jar as JSON, session cookies included.
    pub fn write_cookies<W: Write>(&self, writer: &mut W) -> Result<(), cookie_store::Error> {
        let jar = self.agent.cookie_store();
        cookie_store::serde::json::save_incl_expired_and_nonpersistent(&jar, writer)
    }

    pub fn auth(&self) -> &AuthHeader {
        &self.auth
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: &str, path: &str) -> ureq::Request {
        let url = self.url(path);
        let mut req = self
            .agent
            .request(method, &url)
            .timeout(self.timeout)
            .set("Accept", "application/json");
        let attached = match self.auth.get() {
            Some(value) => {
                req = req.set("Authorization", &value);
                true
            }
            None => false,
        };
        debug!(method, url = %url, authorized = attached, "api request");
        req
    }

    fn finish(resp: Result<ureq::Response, ureq::Error>) -> Result<ureq::Response, ApiError> {
        match resp {
            Ok(r) => Ok(r),
            Err(ureq::Error::Status(code, resp)) => {
                let body = resp.into_string().unwrap_or_default();
                debug!(code, "api error status");
                Err(ApiError::Status { code, body })
            }
            Err(e) => Err(ApiError::Transport(e.to_string())),
        }
    }

    fn decode<T: DeserializeOwned>(resp: ureq::Response) -> Result<T, ApiError> {
        resp.into_json::<T>()
            .map_err(|e| ApiError::Decode(e.to_string()))
    }

    /// POST and discard whatever body comes back.
    pub fn post(&self, path: &str, body: &Value) -> Result<(), ApiError> {
        Self::finish(self.request("POST", path).send_json(body)).map(|_| ())
    }

    pub fn post_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        Self::decode(Self::finish(self.request("POST", path).send_json(body))?)
    }

    pub fn put_json<T: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T, ApiError> {
        Self::decode(Self::finish(self.request("PUT", path).send_json(body))?)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        Self::decode(Self::finish(self.request("GET", path).call())?)
    }
}

#[cfg(test)]
pub(crate) mod stub {
    //! Loopback HTTP stub answering a fixed list of canned responses.

    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc::{self, Receiver};
    use std::thread;

    #[derive(Debug, Clone)]
    pub struct Recorded {
        pub method: String,
        pub path: String,
        pub headers: Vec<(String, String)>,
        pub body: String,
    }

    impl Recorded {
        pub fn header(&self, name: &str) -> Option<&str> {
            self.headers
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.as_str())
        }
    }

    pub struct StubServer {
        pub base_url: String,
        pub requests: Receiver<Recorded>,
    }

    /// Canned reply with extra response headers.
    pub struct Reply {
        pub code: u16,
        pub headers: Vec<(&'static str, String)>,
        pub body: String,
    }

    /// Serve `responses` in order, one connection each, then stop.
    pub fn serve(responses: Vec<(u16, String)>) -> StubServer {
        serve_replies(
            responses
                .into_iter()
                .map(|(code, body)| Reply {
                    code,
                    headers: Vec::new(),
                    body,
                })
                .collect(),
        )
    }

    pub fn serve_replies(replies: Vec<Reply>) -> StubServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for Reply {
                code,
                headers: extra,
                body,
            } in replies
            {
                let Ok((stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream);
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                let mut parts = line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let mut headers = Vec::new();
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    let header = header.trim_end();
                    if header.is_empty() {
                        break;
                    }
                    if let Some((k, v)) = header.split_once(':') {
                        let (k, v) = (k.trim().to_string(), v.trim().to_string());
                        if k.eq_ignore_ascii_case("content-length") {
                            content_length = v.parse().unwrap_or(0);
                        }
                        headers.push((k, v));
                    }
                }
                let mut body_bytes = vec![0u8; content_length];
                reader.read_exact(&mut body_bytes).unwrap();
                let _ = tx.send(Recorded {
                    method,
                    path,
                    headers,
                    body: String::from_utf8_lossy(&body_bytes).into_owned(),
                });

                let extra: String = extra
                    .iter()
                    .map(|(k, v)| format!("{}: {}\r\n", k, v))
                    .collect();
                let reply = format!(
                    "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n{}",
                    code,
                    body.len(),
                    extra,
                    body
                );
                let mut stream = reader.into_inner();
                stream.write_all(reply.as_bytes()).unwrap();
                stream.flush().unwrap();
            }
        });
        StubServer {
            base_url: format!("http://{}/api", addr),
            requests: rx,
        }
    }
}
