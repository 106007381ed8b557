use std::path::Path;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::e621::ClientResult;
use crate::pipeline::local_store::StoreResult;
use crate::pipeline::post::Post;
use crate::pipeline::queue::Cursor;

/// One page request for a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub directory: String,
    /// Tags sent to the board, already resolved and capped.
    pub tags: Vec<String>,
    pub earliest: Option<NaiveDate>,
    pub limit: u32,
}

impl SearchQuery {
    /// The board's tag expression: `date:>=` first, then the tags.
    pub fn tag_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.tags.len() + 1);
        if let Some(date) = self.earliest {
            parts.push(format!("date:>={}", date.format("%Y-%m-%d")));
        }
        parts.extend(self.tags.iter().filter(|t| !t.is_empty()).cloned());
        parts.join(" ")
    }
}

/// Where posts and files come from.
#[async_trait]
pub trait PostSource: Send + Sync {
    /// Posts older than `cursor`, newest first, at most `query.limit` of them.
    async fn search(&self, query: &SearchQuery, cursor: Cursor) -> ClientResult<Vec<Post>>;

    /// Canonical name for a tag; empty when the tag is unknown.
    async fn resolve_alias(&self, tag: &str) -> ClientResult<String>;

    async fn lookup_post(&self, id: u64) -> ClientResult<Option<Post>>;

    /// Fetches `url` into `dest`, returning the number of bytes on disk.
    async fn download(&self, url: &str, dest: &Path) -> ClientResult<u64>;

    /// True when files cannot be fetched and recovery must not run.
    fn is_offline(&self) -> bool {
        false
    }
}

/// Where fetched posts are cached.
#[async_trait]
pub trait PostSink: Send + Sync {
    async fn append(&self, posts: &[Post]) -> StoreResult<()>;
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

#[async_trait]
impl PostSink for NullSink {
    async fn append(&self, _posts: &[Post]) -> StoreResult<()> {
        Ok(())
    }
}
