use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Content rating of a post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rating {
    #[serde(rename = "s")]
    Safe,
    #[serde(rename = "q")]
    Questionable,
    #[serde(rename = "e")]
    Explicit,
}

impl Rating {
    pub const ALL: [Rating; 3] = [Rating::Safe, Rating::Questionable, Rating::Explicit];

    /// The single-letter code the board uses.
    pub fn code(self) -> &'static str {
        match self {
            Rating::Safe => "s",
            Rating::Questionable => "q",
            Rating::Explicit => "e",
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Rating {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "s" | "safe" => Ok(Rating::Safe),
            "q" | "questionable" => Ok(Rating::Questionable),
            "e" | "explicit" => Ok(Rating::Explicit),
            other => Err(format!("unknown rating '{}'", other)),
        }
    }
}

/// A post as the pipeline sees it, independent of where it was fetched from.
///
/// Identity is the post id: two values with the same id compare equal even if
/// one of them was fetched later with a different score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: u64,
    pub tags: BTreeSet<String>,
    pub rating: Rating,
    pub score: i64,
    pub fav_count: u64,
    pub created_at: DateTime<Utc>,
    /// Whole days between `created_at` and the moment the post was fetched.
    pub days_ago: i64,
    /// Absent when the board hides the file (deleted, or login required).
    pub file_url: Option<String>,
    pub file_ext: String,
    pub md5: String,
}

impl Post {
    /// Whole days elapsed between `created_at` and `now`, never negative.
    pub fn days_between(created_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
        (now - created_at).num_days().max(0)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

impl PartialEq for Post {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Post {}

impl Hash for Post {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::Duration;

    /// Builds a safe, zero-score post created `days_ago` days before now.
    pub(crate) fn post(id: u64, tags: &[&str]) -> Post {
        let now = Utc::now();
        Post {
            id,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            rating: Rating::Safe,
            score: 0,
            fav_count: 0,
            created_at: now,
            days_ago: 0,
            file_url: Some(format!("https://static1.e621.net/data/{}.png", id)),
            file_ext: "png".to_string(),
            md5: format!("{:032x}", id),
        }
    }

    pub(crate) fn aged(mut post: Post, days: i64) -> Post {
        post.created_at = post.created_at - Duration::days(days);
        post.days_ago = days;
        post
    }
}
