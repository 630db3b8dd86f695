//! # HTTP Transport
//!
//! Purpose: Speak the server's JSON REST API with a blocking `reqwest` client,
//! for deployments where the TCP port is not reachable.
//!
//! ## Design Principles
//! 1. **Same Contract as TCP**: Payload strings in, payload strings out.
//!    Values the server re-parsed as JSON are turned back into payload text.
//! 2. **Misses Are Data**: 404 and `{"error":"not_found"}` become `None`.
//! 3. **Shared Retry Policy**: Only connect and timeout failures are retried.
//! 4. **Sticky Auth**: A successful `login` switches the client to Bearer auth.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, trace};

use tagcache_common::Stats;

use crate::config::ClientConfig;
use crate::retry::RetryPolicy;
use crate::transport::{
    Credentials, LoginToken, PayloadEntry, SearchHit, SearchParams, Transport, TransportHealth,
};
use crate::{ClientError, ClientResult};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Auth {
    Anonymous,
    Basic { username: String, password: String },
    Bearer(String),
}

pub struct HttpTransport {
    client: Client,
    base: Url,
    retry: RetryPolicy,
    auth: RwLock<Auth>,
    closed: AtomicBool,
}

#[derive(Deserialize)]
struct CountBody {
    #[serde(default)]
    count: u64,
}

#[derive(Deserialize)]
struct DeleteBody {
    #[serde(default)]
    ok: bool,
}

#[derive(Deserialize)]
struct KeysBody {
    #[serde(default)]
    keys: Vec<String>,
}

#[derive(Deserialize)]
struct ValueBody {
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct BulkItem {
    key: String,
    value: serde_json::Value,
}

#[derive(Deserialize)]
struct BulkGetBody {
    #[serde(default)]
    items: Vec<BulkItem>,
}

#[derive(Deserialize)]
struct SearchBody {
    #[serde(default)]
    keys: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: String,
}

#[derive(Deserialize)]
struct RotateBody {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct PutBody<'a> {
    value: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl_ms: Option<u64>,
    tags: &'a [String],
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> ClientResult<Self> {
        let base = Url::parse(&config.http_url).map_err(|err| {
            ClientError::Configuration(format!("invalid http_url {:?}: {}", config.http_url, err))
        })?;
        if base.cannot_be_a_base() {
            return Err(ClientError::Configuration(format!(
                "http_url {:?} cannot be used as a base URL",
                config.http_url
            )));
        }
        let client = Client::builder()
            .timeout(Duration::from_millis(config.http_timeout_ms.max(1)))
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms.max(1)))
            .build()
            .map_err(|err| ClientError::Configuration(format!("http client: {}", err)))?;

        let auth = match (&config.token, &config.username, &config.password) {
            (Some(token), _, _) => Auth::Bearer(token.clone()),
            (None, Some(username), Some(password)) => Auth::Basic {
                username: username.clone(),
                password: password.clone(),
            },
            _ => Auth::Anonymous,
        };

        Ok(HttpTransport {
            client,
            base,
            retry: config.retry_policy(),
            auth: RwLock::new(auth),
            closed: AtomicBool::new(false),
        })
    }

    fn url(&self, segments: &[&str]) -> ClientResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::Configuration("http_url cannot be a base".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Applies `auth`, or the transport's current auth when `None`.
    fn authorize(&self, request: RequestBuilder, auth: Option<&Auth>) -> RequestBuilder {
        match auth {
            Some(auth) => apply_auth(request, auth),
            None => apply_auth(request, &self.auth.read()),
        }
    }

    /// Sends one request with retries. `Ok(None)` means not found.
    fn request<T: DeserializeOwned>(
        &self,
        op: &'static str,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> ClientResult<Option<T>> {
        self.request_as(op, method, url, body, None)
    }

    fn request_as<T: DeserializeOwned>(
        &self,
        op: &'static str,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
        auth: Option<&Auth>,
    ) -> ClientResult<Option<T>> {
        self.retry
            .execute(op, |attempt| {
                trace!(op, attempt, %url, "http request");
                self.send_once(method.clone(), url.clone(), body, auth)
            })?
            .map(|value| {
                serde_json::from_value(value)
                    .map_err(|err| ClientError::protocol(format!("{} response: {}", op, err)))
            })
            .transpose()
    }

    fn require<T: DeserializeOwned>(
        &self,
        op: &'static str,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
    ) -> ClientResult<T> {
        self.request(op, method, url, body)?
            .ok_or_else(|| ClientError::Http {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: format!("{} endpoint not found", op),
            })
    }

    fn send_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&serde_json::Value>,
        auth: Option<&Auth>,
    ) -> ClientResult<Option<serde_json::Value>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Configuration("client closed".into()));
        }
        let mut request = self.authorize(self.client.request(method, url), auth);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().map_err(|err| self.map_send_error(err))?;
        let status = response.status();
        let text = response.text().map_err(|err| self.map_send_error(err))?;

        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                message: error_message(&text),
            });
        }
        if text.trim().is_empty() {
            return Ok(Some(serde_json::Value::Null));
        }
        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|err| ClientError::protocol(format!("invalid JSON body: {}", err)))?;
        if value.get("error").and_then(|e| e.as_str()) == Some("not_found") {
            return Ok(None);
        }
        Ok(Some(value))
    }

    fn map_send_error(&self, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Io(io::Error::new(io::ErrorKind::TimedOut, err.to_string()))
        } else if err.is_connect() {
            ClientError::Connection {
                addr: self.base.to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, err.to_string()),
            }
        } else {
            ClientError::Http {
                status: err.status().map_or(0, |s| s.as_u16()),
                message: err.to_string(),
            }
        }
    }

    fn invalidate_tags(&self, op: &'static str, tags: &[String], mode: &str) -> ClientResult<u64> {
        let body = json!({ "tags": tags, "mode": mode });
        let url = self.url(&["invalidate", "tags"])?;
        let reply: CountBody = self.require(op, Method::POST, url, Some(&body))?;
        Ok(reply.count)
    }
}

fn apply_auth(request: RequestBuilder, auth: &Auth) -> RequestBuilder {
    match auth {
        Auth::Anonymous => request,
        Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        Auth::Bearer(token) => request.bearer_auth(token),
    }
}

/// Converts a value the server parsed as JSON back into payload text.
fn payload_text(value: serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text,
        other => other.to_string(),
    }
}

fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("error").and_then(|e| e.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.chars().take(200).collect())
}

impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    fn put(&self, key: &str, payload: &str, tags: &[String], ttl_ms: Option<u64>) -> ClientResult<()> {
        let body = serde_json::to_value(PutBody {
            value: payload,
            ttl_ms: ttl_ms.filter(|ms| *ms > 0),
            tags,
        })
        .map_err(|err| ClientError::Serialization(err.to_string()))?;
        let url = self.url(&["keys", key])?;
        self.require::<serde_json::Value>("put", Method::PUT, url, Some(&body))?;
        Ok(())
    }

    fn get(&self, key: &str) -> ClientResult<Option<String>> {
        let url = self.url(&["keys", key])?;
        let reply: Option<ValueBody> = self.request("get", Method::GET, url, None)?;
        Ok(reply.map(|body| payload_text(body.value)))
    }

    fn delete(&self, key: &str) -> ClientResult<bool> {
        let url = self.url(&["keys", key])?;
        let reply: Option<DeleteBody> = self.request("delete", Method::DELETE, url, None)?;
        Ok(reply.map_or(false, |body| body.ok))
    }

    fn bulk_get(&self, keys: &[String]) -> ClientResult<Vec<(String, String)>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "keys": keys });
        let url = self.url(&["keys", "bulk", "get"])?;
        let reply: BulkGetBody = self.require("bulk_get", Method::POST, url, Some(&body))?;
        Ok(reply
            .items
            .into_iter()
            .map(|item| (item.key, payload_text(item.value)))
            .collect())
    }

    fn bulk_put(&self, entries: &[PayloadEntry]) -> ClientResult<usize> {
        // No bulk write endpoint; one PUT per entry.
        for entry in entries {
            self.put(&entry.key, &entry.payload, &entry.tags, entry.ttl_ms)?;
        }
        Ok(entries.len())
    }

    fn bulk_delete(&self, keys: &[String]) -> ClientResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let body = json!({ "keys": keys });
        let url = self.url(&["keys", "bulk", "delete"])?;
        let reply: CountBody = self.require("bulk_delete", Method::POST, url, Some(&body))?;
        Ok(reply.count as usize)
    }

    fn invalidate_tag(&self, tag: &str) -> ClientResult<u64> {
        self.invalidate_tags("invalidate_tag", &[tag.to_string()], "any")
    }

    fn invalidate_tags_any(&self, tags: &[String]) -> ClientResult<u64> {
        self.invalidate_tags("invalidate_tags_any", tags, "any")
    }

    fn invalidate_tags_all(&self, tags: &[String]) -> ClientResult<u64> {
        self.invalidate_tags("invalidate_tags_all", tags, "all")
    }

    fn invalidate_keys(&self, keys: &[String]) -> ClientResult<u64> {
        let body = json!({ "keys": keys });
        let url = self.url(&["invalidate", "keys"])?;
        let reply: CountBody = self.require("invalidate_keys", Method::POST, url, Some(&body))?;
        Ok(reply.count)
    }

    fn keys_by_tag(&self, tag: &str, limit: Option<usize>) -> ClientResult<Vec<String>> {
        let mut url = self.url(&["keys-by-tag"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tag", tag);
            if let Some(limit) = limit {
                query.append_pair("limit", &limit.to_string());
            }
        }
        let reply: KeysBody = self.require("keys_by_tag", Method::GET, url, None)?;
        Ok(reply.keys)
    }

    fn stats(&self) -> ClientResult<Stats> {
        let url = self.url(&["stats"])?;
        self.require("stats", Method::GET, url, None)
    }

    fn flush(&self) -> ClientResult<u64> {
        let url = self.url(&["flush"])?;
        let reply: CountBody = self.require("flush", Method::POST, url, None)?;
        Ok(reply.count)
    }

    fn health(&self) -> TransportHealth {
        let check = self
            .url(&["health"])
            .and_then(|url| self.send_once(Method::GET, url, None, None));
        let (reachable, detail) = match check {
            Ok(Some(value)) => {
                let status = serde_json::from_value::<HealthBody>(value)
                    .map(|body| body.status)
                    .unwrap_or_default();
                (status.is_empty() || status == "ok", Some(status))
            }
            Ok(None) => (false, Some("health endpoint not found".to_string())),
            Err(err) => (false, Some(err.to_string())),
        };
        TransportHealth {
            transport: self.name(),
            reachable,
            pool: None,
            detail,
        }
    }

    fn search(&self, params: &SearchParams) -> ClientResult<Vec<SearchHit>> {
        let body = serde_json::to_value(params)
            .map_err(|err| ClientError::Serialization(err.to_string()))?;
        let url = self.url(&["search"])?;
        let reply: SearchBody = self.require("search", Method::POST, url, Some(&body))?;
        Ok(reply.keys)
    }

    fn login(&self, username: &str, password: &str) -> ClientResult<LoginToken> {
        let body = json!({ "username": username, "password": password });
        let url = self.url(&["auth", "login"])?;
        let basic = Auth::Basic {
            username: username.to_string(),
            password: password.to_string(),
        };
        // The stored auth only changes once the server hands out a token.
        let token: LoginToken = self
            .request_as("login", Method::POST, url, Some(&body), Some(&basic))?
            .ok_or_else(|| ClientError::Http {
                status: StatusCode::NOT_FOUND.as_u16(),
                message: "login endpoint not found".to_string(),
            })?;
        *self.auth.write() = Auth::Bearer(token.token.clone());
        debug!(username, "http login succeeded");
        Ok(token)
    }

    fn rotate_credentials(&self) -> ClientResult<Credentials> {
        let url = self.url(&["auth", "rotate"])?;
        let reply: RotateBody = self.require("rotate_credentials", Method::POST, url, None)?;
        let mut auth = self.auth.write();
        if matches!(*auth, Auth::Basic { .. }) {
            *auth = Auth::Basic {
                username: reply.username.clone(),
                password: reply.password.clone(),
            };
        }
        Ok(Credentials {
            username: reply.username,
            password: reply.password,
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
