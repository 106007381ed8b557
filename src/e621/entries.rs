//! JSON shapes returned by the e621 API.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::pipeline::post::{Post, Rating};

#[derive(Debug, Clone, Deserialize)]
pub struct PostListEntry {
    pub posts: Vec<PostEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SinglePostEntry {
    pub post: PostEntry,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PostEntry {
    pub id: u64,
    pub created_at: DateTime<Utc>,
    pub file: FileEntry,
    pub score: ScoreEntry,
    pub tags: TagGroups,
    pub rating: Rating,
    #[serde(default)]
    pub fav_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub ext: String,
    pub md5: String,
    /// `null` for deleted posts and posts hidden from anonymous users.
    pub url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScoreEntry {
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TagGroups {
    pub general: Vec<String>,
    pub species: Vec<String>,
    pub character: Vec<String>,
    pub copyright: Vec<String>,
    pub artist: Vec<String>,
    pub invalid: Vec<String>,
    pub lore: Vec<String>,
    pub meta: Vec<String>,
}

impl TagGroups {
    pub fn flatten(self) -> BTreeSet<String> {
        [
            self.general,
            self.species,
            self.character,
            self.copyright,
            self.artist,
            self.invalid,
            self.lore,
            self.meta,
        ]
        .into_iter()
        .flatten()
        .collect()
    }
}

impl PostEntry {
    /// Converts to a pipeline post, aging it relative to `now`.
    pub fn into_post(self, now: DateTime<Utc>) -> Post {
        Post {
            id: self.id,
            tags: self.tags.flatten(),
            rating: self.rating,
            score: self.score.total,
            fav_count: self.fav_count,
            created_at: self.created_at,
            days_ago: Post::days_between(self.created_at, now),
            file_url: self.file.url,
            file_ext: self.file.ext,
            md5: self.file.md5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TagEntry {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub post_count: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AliasEntry {
    pub antecedent_name: String,
    pub consequent_name: String,
    #[serde(default)]
    pub status: String,
}

/// Listing endpoints answer an empty result with `{"<name>": []}` instead of `[]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Listing<T> {
    Items(Vec<T>),
    Empty(serde_json::Map<String, serde_json::Value>),
}

impl<T> Listing<T> {
    pub fn into_vec(self) -> Vec<T> {
        match self {
            Listing::Items(items) => items,
            Listing::Empty(_) => Vec::new(),
        }
    }
}
