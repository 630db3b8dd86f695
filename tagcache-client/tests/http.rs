use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

use serde_json::{json, Value as Json};

use tagcache_client::{
    ClientConfig, ClientError, SearchParams, TagCacheClient, TransportMode, Value,
};

/// `admin:secret` in Basic auth form.
const ADMIN_BASIC: &str = "Basic YWRtaW46c2VjcmV0";
const TOKEN: &str = "tok-1";

struct Seen {
    method: String,
    path: String,
    query: HashMap<String, String>,
    auth: Option<String>,
    body: Json,
}

#[derive(Default)]
struct Backend {
    entries: Mutex<HashMap<String, (String, Vec<String>)>>,
    seen: Mutex<Vec<Seen>>,
}

impl Backend {
    fn last(&self) -> (String, String, Option<String>) {
        let seen = self.seen.lock().unwrap();
        let last = seen.last().expect("a request");
        (last.method.clone(), last.path.clone(), last.auth.clone())
    }

    fn find(&self, path: &str) -> Option<(HashMap<String, String>, Json)> {
        let seen = self.seen.lock().unwrap();
        seen.iter()
            .rev()
            .find(|s| s.path == path)
            .map(|s| (s.query.clone(), s.body.clone()))
    }

    fn remove_where<F: Fn(&[String]) -> bool>(&self, predicate: F) -> usize {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|_, (_, tags)| !predicate(tags));
        before - entries.len()
    }

    fn route(&self, req: &Seen) -> (u16, Json) {
        let segments: Vec<&str> = req.path.trim_start_matches('/').split('/').collect();
        let strings = |field: &str| -> Vec<String> {
            req.body[field]
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|v| v.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default()
        };
        match (req.method.as_str(), segments.as_slice()) {
            ("PUT", ["keys", key]) => {
                let payload = req.body["value"].as_str().unwrap_or_default().to_string();
                self.entries
                    .lock()
                    .unwrap()
                    .insert(key.to_string(), (payload, strings("tags")));
                (200, json!({ "ok": true }))
            }
            ("GET", ["keys", "soft-miss"]) => (200, json!({ "error": "not_found" })),
            ("GET", ["keys", key]) => match self.entries.lock().unwrap().get(*key) {
                // The server hands values back JSON-parsed when they parse.
                Some((payload, _)) => {
                    let value = serde_json::from_str(payload).unwrap_or_else(|_| json!(payload));
                    (200, json!({ "key": key, "value": value }))
                }
                None => (404, json!({ "error": "not_found" })),
            },
            ("DELETE", ["keys", key]) => {
                let removed = self.entries.lock().unwrap().remove(*key).is_some();
                (200, json!({ "ok": removed, "deleted": removed as u8 }))
            }
            ("POST", ["keys", "bulk", "get"]) => {
                let entries = self.entries.lock().unwrap();
                let items: Vec<Json> = strings("keys")
                    .into_iter()
                    .filter_map(|key| {
                        entries
                            .get(&key)
                            .map(|(payload, _)| json!({ "key": key, "value": payload }))
                    })
                    .collect();
                (200, json!({ "items": items }))
            }
            ("POST", ["keys", "bulk", "delete"]) => {
                let mut entries = self.entries.lock().unwrap();
                let count = strings("keys")
                    .iter()
                    .filter(|key| entries.remove(key.as_str()).is_some())
                    .count();
                (200, json!({ "success": true, "count": count }))
            }
            ("POST", ["invalidate", "tags"]) => {
                let wanted = strings("tags");
                let count = if req.body["mode"] == "all" {
                    self.remove_where(|tags| wanted.iter().all(|t| tags.contains(t)))
                } else {
                    self.remove_where(|tags| wanted.iter().any(|t| tags.contains(t)))
                };
                (200, json!({ "success": true, "count": count }))
            }
            ("POST", ["invalidate", "keys"]) => {
                let mut entries = self.entries.lock().unwrap();
                let count = strings("keys")
                    .iter()
                    .filter(|key| entries.remove(key.as_str()).is_some())
                    .count();
                (200, json!({ "success": true, "count": count }))
            }
            ("GET", ["keys-by-tag"]) => {
                let tag = req.query.get("tag").cloned().unwrap_or_default();
                let limit = req
                    .query
                    .get("limit")
                    .and_then(|l| l.parse().ok())
                    .unwrap_or(usize::MAX);
                let mut keys: Vec<String> = self
                    .entries
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(_, (_, tags))| tags.contains(&tag))
                    .map(|(key, _)| key.clone())
                    .collect();
                keys.sort();
                keys.truncate(limit);
                (200, json!({ "tag": tag, "keys": keys }))
            }
            ("POST", ["search"]) => (
                200,
                json!({ "keys": [{ "key": "user:1", "ttl_ms": 900, "tags": ["users"] }] }),
            ),
            ("GET", ["stats"]) => (
                200,
                json!({
                    "hits": 3, "misses": 1, "puts": 2, "invalidations": 0,
                    "hit_ratio": 0.75, "items": 2, "shard_count": 16
                }),
            ),
            ("POST", ["flush"]) => {
                let mut entries = self.entries.lock().unwrap();
                let count = entries.len();
                entries.clear();
                (200, json!({ "success": true, "count": count }))
            }
            ("GET", ["health"]) => (200, json!({ "status": "ok", "time": 1 })),
            ("POST", ["auth", "login"]) => {
                let basic_ok = req.auth.as_deref() == Some(ADMIN_BASIC);
                let body_ok = req.body == json!({ "username": "admin", "password": "secret" });
                if basic_ok && body_ok {
                    (200, json!({ "token": TOKEN, "expires_in": 3600 }))
                } else {
                    (401, json!({ "error": "unauthorized" }))
                }
            }
            _ => (405, json!({ "error": "no route" })),
        }
    }
}

fn read_request(reader: &mut BufReader<TcpStream>) -> Option<Seen> {
    let mut line = String::new();
    if reader.read_line(&mut line).ok()? == 0 {
        return None;
    }
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut length = 0;
    let mut auth = None;
    loop {
        let mut header = String::new();
        reader.read_line(&mut header).ok()?;
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        let (name, value) = header.split_once(':')?;
        match name.to_ascii_lowercase().as_str() {
            "content-length" => length = value.trim().parse().ok()?,
            "authorization" => auth = Some(value.trim().to_string()),
            _ => {}
        }
    }
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).ok()?;

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let query = query
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    Some(Seen {
        method,
        path: path.to_string(),
        query,
        auth,
        body: serde_json::from_slice(&body).unwrap_or(Json::Null),
    })
}

fn serve(backend: Arc<Backend>, stream: TcpStream) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(_) => return,
    };
    let mut reader = BufReader::new(stream);
    while let Some(req) = read_request(&mut reader) {
        let (status, body) = backend.route(&req);
        backend.seen.lock().unwrap().push(req);
        let body = body.to_string();
        let response = format!(
            "HTTP/1.1 {} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        if writer.write_all(response.as_bytes()).is_err() {
            return;
        }
    }
}

fn spawn_http() -> (u16, Arc<Backend>) {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let port = listener.local_addr().expect("addr").port();
    let backend = Arc::new(Backend::default());
    let shared = Arc::clone(&backend);
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(stream) = stream else { return };
            let backend = Arc::clone(&shared);
            thread::spawn(move || serve(backend, stream));
        }
    });
    (port, backend)
}

fn http_config(port: u16) -> ClientConfig {
    ClientConfig {
        mode: TransportMode::Http,
        http_url: format!("http://127.0.0.1:{}", port),
        http_timeout_ms: 2000,
        connect_timeout_ms: 500,
        retry_delay_ms: 1,
        ..ClientConfig::default()
    }
}

fn http_client(port: u16) -> TagCacheClient {
    TagCacheClient::new(http_config(port)).expect("client")
}

#[test]
fn typed_values_round_trip_over_http() {
    let (port, _) = spawn_http();
    let client = http_client(port);
    assert_eq!(client.transport_name(), "http");

    let values = vec![
        Value::Int(42),
        Value::Float(2.0),
        Value::from("hello"),
        Value::from("42"),
        Value::Null,
        Value::Bool(false),
        Value::map([("name", Value::from("A")), ("n", Value::Int(1))]),
        Value::List(vec![Value::Float(f64::INFINITY), Value::bytes(vec![0xffu8])]),
    ];
    for (idx, value) in values.into_iter().enumerate() {
        let key = format!("k{}", idx);
        client.put(&key, value.clone(), &["t"], None).expect("put");
        assert_eq!(client.get(&key).expect("get"), value, "key {}", key);
    }
}

#[test]
fn http_misses_are_not_found() {
    let (port, _) = spawn_http();
    let client = http_client(port);
    assert_eq!(client.get_opt("missing").expect("get_opt"), None);
    assert_eq!(client.get_opt("soft-miss").expect("get_opt"), None);
    assert!(client.get("missing").unwrap_err().is_not_found());
}

#[test]
fn http_delete_and_bulk_routes() {
    let (port, backend) = spawn_http();
    let client = http_client(port);
    for key in ["a", "b", "c"] {
        client.put(key, key, &[], None).expect("put");
    }
    assert!(client.delete("a").expect("delete"));
    assert!(!client.delete("a").expect("delete again"));

    let found = client.bulk_get(&["b", "c", "zz"]).expect("bulk_get");
    assert_eq!(found.len(), 2);
    assert_eq!(found["b"], Value::from("b"));
    assert_eq!(found["c"], Value::from("c"));
    let (_, body) = backend.find("/keys/bulk/get").expect("bulk get request");
    assert_eq!(body, json!({ "keys": ["b", "c", "zz"] }));

    assert_eq!(client.bulk_delete(&["b", "zz"]).expect("bulk_delete"), 1);
    assert_eq!(client.invalidate_keys(&["c"]).expect("invalidate_keys"), 1);
    assert_eq!(client.get_opt("c").expect("get_opt"), None);
}

#[test]
fn http_tag_lookup_and_invalidation() {
    let (port, backend) = spawn_http();
    let client = http_client(port);
    client.put("u1", 1, &["users", "vip"], None).expect("put");
    client.put("u2", 2, &["users"], None).expect("put");
    client.put("p1", 3, &["posts"], None).expect("put");

    assert_eq!(client.keys_by_tag("users").expect("keys"), vec!["u1", "u2"]);
    assert_eq!(client.keys_by_tag_limit("users", Some(1)).expect("keys").len(), 1);
    let (query, _) = backend.find("/keys-by-tag").expect("keys-by-tag request");
    assert_eq!(query.get("tag").map(String::as_str), Some("users"));
    assert_eq!(query.get("limit").map(String::as_str), Some("1"));

    assert_eq!(client.invalidate_tags_all(&["users", "vip"]).expect("all"), 1);
    let (_, body) = backend.find("/invalidate/tags").expect("invalidate request");
    assert_eq!(body, json!({ "tags": ["users", "vip"], "mode": "all" }));
    assert_eq!(client.invalidate_by_tag("users").expect("by tag"), 1);
    assert_eq!(client.invalidate_tags_any(&["posts", "none"]).expect("any"), 1);
}

#[test]
fn search_sends_its_filters() {
    let (port, backend) = spawn_http();
    let client = http_client(port);
    let params = SearchParams {
        q: Some("user".into()),
        tag_any: Some(vec!["users".into()]),
        limit: Some(10),
        ..SearchParams::default()
    };
    let hits = client.search(&params).expect("search");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].key, "user:1");
    assert_eq!(hits[0].ttl_ms, Some(900));
    assert_eq!(hits[0].tags, vec!["users"]);

    let (_, body) = backend.find("/search").expect("search request");
    assert_eq!(body, json!({ "q": "user", "tag_any": ["users"], "limit": 10 }));
}

#[test]
fn login_switches_to_bearer_and_failures_keep_it() {
    let (port, backend) = spawn_http();
    let cfg = ClientConfig {
        username: Some("admin".into()),
        password: Some("secret".into()),
        ..http_config(port)
    };
    let client = TagCacheClient::new(cfg).expect("client");

    client.put("k", 1, &[], None).expect("put");
    assert_eq!(backend.last().2.as_deref(), Some(ADMIN_BASIC));

    let token = client.login("admin", "secret").expect("login");
    assert_eq!(token.token, TOKEN);
    assert_eq!(token.expires_in, Some(3600));
    client.get("k").expect("get");
    let bearer = format!("Bearer {}", TOKEN);
    assert_eq!(backend.last(), ("GET".into(), "/keys/k".into(), Some(bearer.clone())));

    match client.login("admin", "wrong") {
        Err(ClientError::Http { status, message }) => {
            assert_eq!(status, 401);
            assert_eq!(message, "unauthorized");
        }
        other => panic!("expected 401, got {:?}", other),
    }
    client.get("k").expect("get after failed login");
    assert_eq!(backend.last().2, Some(bearer));
}

#[test]
fn stats_flush_and_health_over_http() {
    let (port, _) = spawn_http();
    let client = http_client(port);
    client.put("a", 1, &[], None).expect("put");

    let stats = client.stats().expect("stats");
    assert_eq!((stats.hits, stats.misses, stats.puts), (3, 1, 2));
    assert_eq!(stats.hit_ratio, 0.75);
    assert_eq!(stats.shard_count, Some(16));

    let report = client.health();
    assert!(report.healthy, "{:?}", report.detail);
    assert_eq!(report.transport, "http");
    assert!(report.pool.is_none());

    assert_eq!(client.flush().expect("flush"), 1);
}

#[test]
fn refused_http_connections_are_retried() {
    let port = TcpListener::bind("127.0.0.1:0")
        .expect("bind")
        .local_addr()
        .expect("addr")
        .port();
    let cfg = ClientConfig {
        max_retries: 2,
        ..http_config(port)
    };
    let client = TagCacheClient::new(cfg).expect("client");
    match client.get("k") {
        Err(ClientError::Transport { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected transport error, got {:?}", other),
    }
    assert!(!client.health().healthy);
}
