use std::collections::{BTreeSet, HashMap};

use crate::pipeline::condition::Condition;
use crate::pipeline::matcher::{compile_all, TagMatcher};
use crate::pipeline::post::Rating;

/// One declared directory and the search that feeds it.
#[derive(Debug, Clone)]
pub struct SearchSpec {
    pub directory: String,
    pub whitelist: Vec<TagMatcher>,
    pub blacklist: Vec<TagMatcher>,
    pub anylist: Vec<TagMatcher>,
    pub condition: Option<Condition>,
    pub ratings: BTreeSet<Rating>,
    pub min_score: i64,
    pub min_favs: u64,
    /// Exclusive upper bound on `Post::days_ago`.
    pub max_days_ago: i64,
    /// `None` means unbounded.
    pub post_limit: Option<u64>,
    pub subdirectories: Vec<String>,
    has_actual_search: bool,
}

impl SearchSpec {
    /// A routing node that accepts every rating, score and age.
    pub fn new(directory: impl Into<String>) -> Self {
        Self {
            directory: directory.into(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            anylist: Vec::new(),
            condition: None,
            ratings: Rating::ALL.into_iter().collect(),
            min_score: i64::MIN,
            min_favs: 0,
            max_days_ago: i64::MAX,
            post_limit: None,
            subdirectories: Vec::new(),
            has_actual_search: false,
        }
    }

    /// True when the directory declares its own tag criteria. Criteria
    /// inherited from the global blacklist do not count.
    pub fn has_actual_search(&self) -> bool {
        self.has_actual_search
    }

    pub fn whitelist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.whitelist = compile_all(patterns);
        self.refresh();
        self
    }

    pub fn blacklist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.blacklist = compile_all(patterns);
        self.refresh();
        self
    }

    pub fn anylist<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.anylist = compile_all(patterns);
        self.refresh();
        self
    }

    pub fn condition(mut self, condition: Option<Condition>) -> Self {
        self.condition = condition;
        self.refresh();
        self
    }

    /// Appends the global blacklist without turning a routing node into a search.
    pub fn inherit_blacklist(mut self, patterns: &[TagMatcher]) -> Self {
        for pattern in patterns {
            if !self.blacklist.contains(pattern) {
                self.blacklist.push(pattern.clone());
            }
        }
        self
    }

    pub fn ratings<I: IntoIterator<Item = Rating>>(mut self, ratings: I) -> Self {
        self.ratings = ratings.into_iter().collect();
        self
    }

    pub fn min_score(mut self, min_score: i64) -> Self {
        self.min_score = min_score;
        self
    }

    pub fn min_favs(mut self, min_favs: u64) -> Self {
        self.min_favs = min_favs;
        self
    }

    pub fn max_days_ago(mut self, days: i64) -> Self {
        self.max_days_ago = days;
        self
    }

    pub fn post_limit(mut self, limit: Option<u64>) -> Self {
        self.post_limit = limit;
        self
    }

    pub fn subdirectories<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subdirectories = names.into_iter().map(Into::into).collect();
        self
    }

    fn refresh(&mut self) {
        self.has_actual_search = !self.whitelist.is_empty()
            || !self.blacklist.is_empty()
            || !self.anylist.is_empty()
            || self.condition.is_some();
    }
}

/// All declared directories, in declaration order, addressable by name.
#[derive(Debug, Clone, Default)]
pub struct SearchSpecs {
    specs: Vec<SearchSpec>,
    index: HashMap<String, usize>,
}

impl SearchSpecs {
    pub fn new(specs: Vec<SearchSpec>) -> Self {
        let index = specs
            .iter()
            .enumerate()
            .map(|(i, spec)| (spec.directory.clone(), i))
            .collect();
        Self { specs, index }
    }

    pub fn get(&self, directory: &str) -> Option<&SearchSpec> {
        self.index.get(directory).map(|&i| &self.specs[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &SearchSpec> {
        self.specs.iter()
    }

    /// Directories that are paginated on their own.
    pub fn searches(&self) -> impl Iterator<Item = &SearchSpec> {
        self.specs.iter().filter(|spec| spec.has_actual_search())
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Largest recency window of any directory.
    pub fn recency_ceiling(&self) -> i64 {
        self.specs.iter().map(|spec| spec.max_days_ago).max().unwrap_or(i64::MAX)
    }
}
