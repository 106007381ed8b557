//! SQLite post cache for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Caching every fetched page of posts in a local SQLite table
//! 2. Replaying those posts as a search source for offline runs
//! 3. Looking up cached posts by id

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, NaiveTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::{debug, info};

use crate::e621::{ClientError, ClientResult};
use crate::pipeline::post::{Post, Rating};
use crate::pipeline::queue::Cursor;
use crate::pipeline::source::{PostSink, PostSource, SearchQuery};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for ClientError {
    fn from(e: StoreError) -> Self {
        ClientError::Local(e.to_string())
    }
}

const POST_COLUMNS: &str = "id, tags, rating, score, fav_count, created_at, file_url, file_ext, md5";

pub struct LocalPostStore {
    conn: Mutex<Connection>,
}

impl LocalPostStore {
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self::with_connection(Connection::open(path)?)?;
        info!("Opened post store at {}", path.display());
        Ok(store)
    }

    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY,
                tags TEXT NOT NULL,
                rating TEXT NOT NULL,
                score INTEGER NOT NULL,
                fav_count INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                file_url TEXT,
                file_ext TEXT NOT NULL,
                md5 TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_posts_created_at ON posts (created_at)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Posts below `cursor` created no earlier than `earliest`, newest first.
    pub fn iterate(
        &self,
        cursor: Cursor,
        earliest: Option<DateTime<Utc>>,
        limit: u32,
    ) -> StoreResult<Vec<Post>> {
        let before = match cursor {
            Cursor::Start => i64::MAX,
            Cursor::Before(id) => id as i64,
            Cursor::Exhausted => return Ok(Vec::new()),
        };
        let since = earliest.map(|d| d.timestamp()).unwrap_or(i64::MIN);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM posts WHERE id < ?1 AND created_at >= ?2 ORDER BY id DESC LIMIT ?3",
            POST_COLUMNS
        ))?;
        let rows = stmt.query_map(params![before, since, limit], row_to_post)?;

        let now = Utc::now();
        let mut posts = Vec::new();
        for row in rows {
            let mut post = row??;
            post.days_ago = Post::days_between(post.created_at, now);
            posts.push(post);
        }
        Ok(posts)
    }

    pub fn get(&self, id: u64) -> StoreResult<Option<Post>> {
        let conn = self.conn.lock();
        let post = conn
            .query_row(
                &format!("SELECT {} FROM posts WHERE id = ?1", POST_COLUMNS),
                params![id as i64],
                row_to_post,
            )
            .optional()?;

        match post {
            Some(post) => {
                let mut post = post?;
                post.days_ago = Post::days_between(post.created_at, Utc::now());
                Ok(Some(post))
            }
            None => Ok(None),
        }
    }

    /// Inserts or replaces `posts` in one transaction.
    pub fn insert_all(&self, posts: &[Post]) -> StoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT OR REPLACE INTO posts ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                POST_COLUMNS
            ))?;
            for post in posts {
                stmt.execute(params![
                    post.id as i64,
                    serde_json::to_string(&post.tags)?,
                    post.rating.code(),
                    post.score,
                    post.fav_count as i64,
                    post.created_at.timestamp(),
                    post.file_url,
                    post.file_ext,
                    post.md5,
                ])?;
            }
        }
        tx.commit()?;
        debug!("Cached {} posts", posts.len());
        Ok(())
    }

    pub fn count(&self) -> StoreResult<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM posts", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

// The inner result carries JSON and rating decoding failures that rusqlite cannot express.
fn row_to_post(row: &Row<'_>) -> rusqlite::Result<StoreResult<Post>> {
    let id: i64 = row.get(0)?;
    let tags_json: String = row.get(1)?;
    let rating: String = row.get(2)?;
    let fav_count: i64 = row.get(4)?;
    let created_at: i64 = row.get(5)?;

    let tags: BTreeSet<String> = match serde_json::from_str(&tags_json) {
        Ok(tags) => tags,
        Err(e) => return Ok(Err(e.into())),
    };

    Ok(Ok(Post {
        id: id as u64,
        tags,
        rating: rating.parse().unwrap_or(Rating::Explicit),
        score: row.get(3)?,
        fav_count: fav_count.max(0) as u64,
        created_at: DateTime::from_timestamp(created_at, 0).unwrap_or_default(),
        days_ago: 0,
        file_url: row.get(6)?,
        file_ext: row.get(7)?,
        md5: row.get(8)?,
    }))
}

#[async_trait]
impl PostSource for LocalPostStore {
    async fn search(&self, query: &SearchQuery, cursor: Cursor) -> ClientResult<Vec<Post>> {
        let earliest = query
            .earliest
            .map(|date| date.and_time(NaiveTime::MIN).and_utc());
        Ok(self.iterate(cursor, earliest, query.limit)?)
    }

    async fn resolve_alias(&self, tag: &str) -> ClientResult<String> {
        Ok(tag.to_string())
    }

    async fn lookup_post(&self, id: u64) -> ClientResult<Option<Post>> {
        Ok(self.get(id)?)
    }

    async fn download(&self, url: &str, _dest: &Path) -> ClientResult<u64> {
        Err(ClientError::ContentGone {
            url: url.to_string(),
            status: reqwest::StatusCode::GONE,
        })
    }

    fn is_offline(&self) -> bool {
        true
    }
}

#[async_trait]
impl PostSink for LocalPostStore {
    async fn append(&self, posts: &[Post]) -> StoreResult<()> {
        self.insert_all(posts)
    }
}
