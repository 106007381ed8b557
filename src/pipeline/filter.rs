use std::fmt;

use crate::pipeline::post::Post;
use crate::pipeline::spec::SearchSpec;

/// Why a post was turned away by a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    NoSearch,
    MissingTag,
    Blacklisted,
    NoAnyTag,
    Condition,
    Rating,
    LowScore,
    LowFavorites,
    TooOld,
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Rejection::NoSearch => "directory has no search of its own",
            Rejection::MissingTag => "missing a requested tag",
            Rejection::Blacklisted => "contains a blacklisted tag",
            Rejection::NoAnyTag => "has none of the alternative tags",
            Rejection::Condition => "does not satisfy the condition",
            Rejection::Rating => "does not have a requested rating",
            Rejection::LowScore => "has a low score",
            Rejection::LowFavorites => "has a low favorite count",
            Rejection::TooOld => "is too old",
        };
        f.write_str(reason)
    }
}

/// Decides whether a post belongs to a search. Stateless.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterEngine;

impl FilterEngine {
    pub fn matches(post: &Post, spec: &SearchSpec) -> bool {
        Self::check(post, spec).is_ok()
    }

    /// Runs the stages cheapest and most selective first, stopping at the first failure.
    pub fn check(post: &Post, spec: &SearchSpec) -> Result<(), Rejection> {
        if !spec.has_actual_search() {
            return Err(Rejection::NoSearch);
        }
        if !spec.whitelist.iter().all(|m| m.matches_any(&post.tags)) {
            return Err(Rejection::MissingTag);
        }
        if spec.blacklist.iter().any(|m| m.matches_any(&post.tags)) {
            return Err(Rejection::Blacklisted);
        }
        if !spec.anylist.is_empty() && !spec.anylist.iter().any(|m| m.matches_any(&post.tags)) {
            return Err(Rejection::NoAnyTag);
        }
        if let Some(condition) = &spec.condition {
            if !condition.evaluate(&post.tags) {
                return Err(Rejection::Condition);
            }
        }
        if !spec.ratings.contains(&post.rating) {
            return Err(Rejection::Rating);
        }
        if post.score < spec.min_score {
            return Err(Rejection::LowScore);
        }
        if post.fav_count < spec.min_favs {
            return Err(Rejection::LowFavorites);
        }
        if post.days_ago >= spec.max_days_ago {
            return Err(Rejection::TooOld);
        }
        Ok(())
    }
}
