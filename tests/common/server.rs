//! Mock e621 board
//!
//! Serves the handful of endpoints the downloader talks to from an in-memory
//! post list, with scripted failures and a log of every request it saw.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{Duration, Utc};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// One post on the board. Its file is served from `/data/{id}.{ext}`.
#[derive(Debug, Clone)]
pub struct MockPost {
    pub id: u64,
    pub tags: Vec<String>,
    pub rating: &'static str,
    pub score: i64,
    pub days_ago: i64,
    pub ext: &'static str,
    pub body: Vec<u8>,
    /// The file answers 404 even though the post exists.
    pub file_gone: bool,
}

impl MockPost {
    pub fn new(id: u64, tags: &[&str]) -> Self {
        Self {
            id,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            rating: "s",
            score: 10,
            days_ago: 0,
            ext: "png",
            body: file_body(id, 1024),
            file_gone: false,
        }
    }

    pub fn gone(mut self) -> Self {
        self.file_gone = true;
        self
    }

    pub fn body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    pub fn file_path(&self) -> String {
        format!("/data/{}.{}", self.id, self.ext)
    }

    fn to_json(&self, base_url: &str) -> Value {
        let created_at = Utc::now() - Duration::days(self.days_ago) - Duration::minutes(5);
        json!({
            "id": self.id,
            "created_at": created_at.to_rfc3339(),
            "file": {
                "ext": self.ext,
                "md5": format!("{:032x}", self.id),
                "size": self.body.len(),
                "url": format!("{}{}", base_url, self.file_path()),
            },
            "score": {"up": self.score, "down": 0, "total": self.score},
            "tags": {"general": self.tags},
            "rating": self.rating,
            "fav_count": 0,
        })
    }
}

/// Deterministic content that differs per post.
pub fn file_body(id: u64, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i as u64 * 31 + id) % 251) as u8).collect()
}

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub path: String,
    pub query: HashMap<String, String>,
    pub range: Option<String>,
    pub at: Instant,
}

#[derive(Debug, Default)]
struct Board {
    base_url: String,
    posts: Vec<MockPost>,
    tags: HashSet<String>,
    aliases: HashMap<String, String>,
    scripted: HashMap<String, VecDeque<StatusCode>>,
    requests: Vec<RecordedRequest>,
}

/// Mock board on a random local port. Shuts down when dropped.
pub struct MockBoard {
    pub base_url: String,
    board: Arc<Mutex<Board>>,
    _shutdown_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl MockBoard {
    pub async fn spawn(posts: Vec<MockPost>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to random port");
        let port = listener.local_addr().expect("Failed to get local address").port();
        let base_url = format!("http://127.0.0.1:{}", port);

        let tags = posts.iter().flat_map(|p| p.tags.iter().cloned()).collect();
        let board = Arc::new(Mutex::new(Board {
            base_url: base_url.clone(),
            posts,
            tags,
            ..Board::default()
        }));

        let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = Router::new().fallback(handle).with_state(board.clone());

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    shutdown_rx.await.ok();
                })
                .await
                .expect("Server failed");
        });

        Self {
            base_url,
            board,
            _shutdown_tx: Some(shutdown_tx),
        }
    }

    /// Answers the next requests to `path` with `statuses`, in order.
    pub fn script(&self, path: &str, statuses: &[StatusCode]) {
        self.board
            .lock()
            .scripted
            .entry(path.to_string())
            .or_default()
            .extend(statuses.iter().copied());
    }

    pub fn add_alias(&self, antecedent: &str, consequent: &str) {
        let mut board = self.board.lock();
        board.aliases.insert(antecedent.to_string(), consequent.to_string());
        board.tags.insert(consequent.to_string());
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.board.lock().requests.clone()
    }

    pub fn requests_to(&self, path: &str) -> Vec<RecordedRequest> {
        self.requests().into_iter().filter(|r| r.path == path).collect()
    }
}

async fn handle(State(board): State<Arc<Mutex<Board>>>, request: Request) -> Response {
    let path = request.uri().path().to_string();
    let query: HashMap<String, String> = request
        .uri()
        .query()
        .map(|q| {
            reqwest::Url::parse(&format!("http://board/?{}", q))
                .map(|url| url.query_pairs().into_owned().collect())
                .unwrap_or_default()
        })
        .unwrap_or_default();
    let range = request
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let mut board = board.lock();
    board.requests.push(RecordedRequest {
        path: path.clone(),
        query: query.clone(),
        range: range.clone(),
        at: Instant::now(),
    });

    if let Some(status) = board.scripted.get_mut(&path).and_then(VecDeque::pop_front) {
        return status.into_response();
    }

    if path == "/posts.json" {
        return search(&board, &query).into_response();
    }
    if path == "/tags.json" {
        let name = query.get("search[name]").cloned().unwrap_or_default();
        return if board.tags.contains(&name) {
            json!([{"id": 1, "name": name, "post_count": 1}]).to_string().into_response()
        } else {
            json!({"tags": []}).to_string().into_response()
        };
    }
    if path == "/tag_aliases.json" {
        let name = query.get("search[antecedent_name]").cloned().unwrap_or_default();
        return match board.aliases.get(&name) {
            Some(consequent) => json!([{
                "antecedent_name": name,
                "consequent_name": consequent,
                "status": "active",
            }])
            .to_string()
            .into_response(),
            None => json!({"tag_aliases": []}).to_string().into_response(),
        };
    }
    if let Some(id) = path
        .strip_prefix("/posts/")
        .and_then(|rest| rest.strip_suffix(".json"))
        .and_then(|id| id.parse::<u64>().ok())
    {
        return match board.posts.iter().find(|p| p.id == id) {
            Some(post) => json!({"post": post.to_json(&board.base_url)}).to_string().into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    if path.starts_with("/data/") {
        return match board.posts.iter().find(|p| p.file_path() == path && !p.file_gone) {
            Some(post) => serve_file(&post.body, range.as_deref()),
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }

    StatusCode::NOT_FOUND.into_response()
}

/// Newest first; `-tag` excludes, metatags are ignored.
fn search(board: &Board, query: &HashMap<String, String>) -> String {
    let tags = query.get("tags").cloned().unwrap_or_default();
    let limit: usize = query.get("limit").and_then(|l| l.parse().ok()).unwrap_or(75);
    let before = query
        .get("page")
        .and_then(|p| p.strip_prefix('b'))
        .and_then(|id| id.parse::<u64>().ok())
        .unwrap_or(u64::MAX);

    let mut posts: Vec<&MockPost> = board
        .posts
        .iter()
        .filter(|post| post.id < before)
        .filter(|post| {
            tags.split_whitespace().filter(|t| !t.contains(':')).all(|tag| match tag.strip_prefix('-') {
                Some(excluded) => !post.tags.iter().any(|t| t == excluded),
                None => post.tags.iter().any(|t| t == tag),
            })
        })
        .collect();
    posts.sort_by(|a, b| b.id.cmp(&a.id));

    let entries: Vec<Value> = posts
        .into_iter()
        .take(limit)
        .map(|p| p.to_json(&board.base_url))
        .collect();
    json!({ "posts": entries }).to_string()
}

fn serve_file(body: &[u8], range: Option<&str>) -> Response {
    let offset = range
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|r| r.parse::<usize>().ok());

    match offset {
        None => (StatusCode::OK, body.to_vec()).into_response(),
        Some(offset) if offset >= body.len() => Response::builder()
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", body.len()))
            .body(Body::empty())
            .unwrap_or_default(),
        Some(offset) => Response::builder()
            .status(StatusCode::PARTIAL_CONTENT)
            .header(
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", offset, body.len() - 1, body.len()),
            )
            .body(Body::from(body[offset..].to_vec()))
            .unwrap_or_default(),
    }
}
