//! Ingestion Producer for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Paginating every search from its saved cursor
//! 2. Screening each page against the directory tree and the blocked ids
//! 3. Recording the cursor and the surviving batch in one persisted step
//! 4. Stopping early once results are too old or no search can take more downloads

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tracing::{debug, error, info, instrument};

use crate::pipeline::countdown::Countdowns;
use crate::pipeline::directory::DirectoryResolver;
use crate::pipeline::post::Post;
use crate::pipeline::queue::{BatchQueue, Cursor, QueueBatch};
use crate::pipeline::source::{PostSink, PostSource, SearchQuery};
use crate::pipeline::spec::SearchSpec;
use crate::pipeline::{PipelineError, PipelineResult};
use crate::status::{Counter, StatusSink};

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub posts_per_page: u32,
    pub max_search_tags: usize,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            posts_per_page: 320,
            max_search_tags: 5,
        }
    }
}

pub struct IngestionProducer {
    source: Arc<dyn PostSource>,
    sink: Arc<dyn PostSink>,
    queue: Arc<BatchQueue>,
    resolver: Arc<DirectoryResolver>,
    countdowns: Arc<Countdowns>,
    status: Arc<dyn StatusSink>,
    excluded: HashSet<u64>,
    root: PathBuf,
    settings: ProducerSettings,
}

impl IngestionProducer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn PostSource>,
        sink: Arc<dyn PostSink>,
        queue: Arc<BatchQueue>,
        resolver: Arc<DirectoryResolver>,
        countdowns: Arc<Countdowns>,
        status: Arc<dyn StatusSink>,
        root: PathBuf,
        settings: ProducerSettings,
    ) -> Self {
        Self {
            source,
            sink,
            queue,
            resolver,
            countdowns,
            status,
            excluded: HashSet::new(),
            root,
            settings,
        }
    }

    /// Post ids that are never queued.
    pub fn with_excluded(mut self, ids: impl IntoIterator<Item = u64>) -> Self {
        self.excluded.extend(ids);
        self
    }

    /// Paginates every unfinished search. On failure the queue is aborted and
    /// persisted before the error is returned.
    pub async fn run(&self) -> PipelineResult<()> {
        let result = self.paginate_all().await;

        if let Err(e) = &result {
            error!("Producer stopped: {}", e);
            self.queue.abort();
            if let Err(persist_err) = self.queue.persist() {
                error!("Failed to persist queue state: {}", persist_err);
            }
        }

        self.queue.mark_producer_done();
        result
    }

    async fn paginate_all(&self) -> PipelineResult<()> {
        let ceiling = self.resolver.specs().recency_ceiling();

        for spec in self.resolver.specs().searches() {
            let progress = self.queue.progress(&spec.directory);
            if progress.completed {
                debug!(directory = %spec.directory, "Search already completed");
                continue;
            }
            self.paginate(spec, progress.cursor, ceiling).await?;
        }

        info!("All searches paginated");
        Ok(())
    }

    #[instrument(skip(self, spec, ceiling), fields(directory = %spec.directory))]
    async fn paginate(&self, spec: &SearchSpec, mut cursor: Cursor, ceiling: i64) -> PipelineResult<()> {
        let query = self.query_for(spec);
        self.status.section(&format!("Searching {}", spec.directory));

        loop {
            if self.queue.is_aborted() {
                return Err(PipelineError::Aborted);
            }
            if !self.countdowns.any_available() {
                info!("Every search has reached its post limit");
                return Ok(());
            }
            if cursor == Cursor::Exhausted || !self.countdowns.is_available(&spec.directory) {
                self.queue.mark_completed(&spec.directory)?;
                return Ok(());
            }

            let page = self.source.search(&query, cursor).await?;
            self.status.increment(Counter::Discovered, page.len() as u64);
            self.sink.append(&page).await?;

            let next = next_cursor(&page, query.limit);
            let too_old = page.iter().map(|p| p.days_ago).min().is_some_and(|days| days >= ceiling);

            let fetched = page.len();
            let survivors: Vec<Post> = page.into_iter().filter(|post| self.accepts(spec, post)).collect();
            self.status.increment(Counter::Filtered, (fetched - survivors.len()) as u64);
            debug!(fetched, kept = survivors.len(), ?next, "Page screened");

            cursor = if too_old { Cursor::Exhausted } else { next };
            let batch = QueueBatch {
                directory: spec.directory.clone(),
                posts: survivors,
            };
            self.queue.record_page(&spec.directory, cursor, Some(batch))?;
        }
    }

    fn accepts(&self, spec: &SearchSpec, post: &Post) -> bool {
        !self.excluded.contains(&post.id) && !self.resolver.resolve(post, &self.root, spec).is_empty()
    }

    /// Whitelist first, then negated blacklist, capped; the rest is filtered locally.
    pub fn query_for(&self, spec: &SearchSpec) -> SearchQuery {
        let tags = spec
            .whitelist
            .iter()
            .map(|m| m.pattern().to_string())
            .chain(spec.blacklist.iter().map(|m| format!("-{}", m.pattern())))
            .take(self.settings.max_search_tags)
            .collect();

        let earliest = (spec.max_days_ago != i64::MAX)
            .then(|| Utc::now().date_naive().checked_sub_signed(Duration::days(spec.max_days_ago)))
            .flatten();

        SearchQuery {
            directory: spec.directory.clone(),
            tags,
            earliest,
            limit: self.settings.posts_per_page,
        }
    }
}

/// A short page ends the search; otherwise continue below its oldest post.
fn next_cursor(page: &[Post], limit: u32) -> Cursor {
    if (page.len() as u32) < limit {
        return Cursor::Exhausted;
    }
    match page.iter().map(|p| p.id).min() {
        Some(oldest) => Cursor::Before(oldest),
        None => Cursor::Exhausted,
    }
}
