//! Download Coordinator for E621 Downloader
//!
//! This module provides functionality for:
//! 1. Draining queued batches in the order they were recorded
//! 2. Charging each post against its search's post limit before dispatch
//! 3. Placing a post in every directory it resolves to, downloading at most once
//! 4. Persisting limits and the registry only when a whole batch is done

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use walkdir::WalkDir;

use crate::e621::ClientError;
use crate::pipeline::countdown::Countdowns;
use crate::pipeline::directory::DirectoryResolver;
use crate::pipeline::naming::{is_partial, FileNamer};
use crate::pipeline::post::Post;
use crate::pipeline::queue::{BatchQueue, QueueBatch};
use crate::pipeline::registry::{PathRegistry, Placement};
use crate::pipeline::source::PostSource;
use crate::pipeline::{PipelineError, PipelineResult};
use crate::status::{Counter, StatusSink};

#[derive(Debug, Clone)]
pub struct CoordinatorSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    /// Hardlink duplicates instead of copying them.
    pub make_hardlinks: bool,
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_interval: Duration::from_millis(250),
            make_hardlinks: false,
        }
    }
}

/// Filename to a path where that file already exists on disk.
pub type KnownFiles = DashMap<String, PathBuf>;

/// Indexes every finished file under `root` by name.
pub fn index_existing_files(root: &Path) -> KnownFiles {
    let known = KnownFiles::new();
    for entry in WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file() && !is_partial(e.path()))
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        known.entry(name).or_insert_with(|| entry.path().to_path_buf());
    }
    debug!("Indexed {} existing files under {}", known.len(), root.display());
    known
}

pub struct DownloadCoordinator {
    source: Arc<dyn PostSource>,
    queue: Arc<BatchQueue>,
    resolver: Arc<DirectoryResolver>,
    countdowns: Arc<Countdowns>,
    status: Arc<dyn StatusSink>,
    namer: FileNamer,
    root: PathBuf,
    settings: CoordinatorSettings,
    registry: PathRegistry,
    known_files: Arc<KnownFiles>,
    semaphore: Arc<Semaphore>,
}

#[derive(Debug, Default)]
struct Placed {
    downloaded: u64,
    duplicate: u64,
    present: u64,
}

#[derive(Debug)]
enum PlacementFailure {
    Gone,
    Failed(ClientError),
    Fatal(PipelineError),
}

struct PlacementJob {
    post: Post,
    placement: Placement,
    source: Arc<dyn PostSource>,
    known_files: Arc<KnownFiles>,
    make_hardlinks: bool,
}

impl DownloadCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Arc<dyn PostSource>,
        queue: Arc<BatchQueue>,
        resolver: Arc<DirectoryResolver>,
        countdowns: Arc<Countdowns>,
        status: Arc<dyn StatusSink>,
        namer: FileNamer,
        root: PathBuf,
        settings: CoordinatorSettings,
    ) -> Self {
        let known_files = Arc::new(index_existing_files(&root));
        let semaphore = Arc::new(Semaphore::new(settings.concurrency.max(1)));
        Self {
            source,
            queue,
            resolver,
            countdowns,
            status,
            namer,
            root,
            settings,
            registry: PathRegistry::new(),
            known_files,
            semaphore,
        }
    }

    /// Everything placed so far, for pruning once the run completes.
    pub fn registry(&self) -> &PathRegistry {
        &self.registry
    }

    /// Processes batches until the producer is done and the queue is empty.
    /// Returns `Aborted` if the producer failed, and aborts the queue itself
    /// on any fatal error.
    pub async fn run(&mut self) -> PipelineResult<()> {
        self.status.section("Downloading");

        loop {
            if self.queue.is_aborted() {
                warn!("Queue aborted, stopping downloads");
                return Err(PipelineError::Aborted);
            }

            match self.queue.next_batch(self.settings.poll_interval).await {
                Some(batch) => {
                    if let Err(e) = self.process_batch(batch).await {
                        error!("Download stopped: {}", e);
                        self.registry.discard_staged();
                        self.queue.abort();
                        if let Err(persist_err) = self.queue.persist() {
                            error!("Failed to persist queue state: {}", persist_err);
                        }
                        return Err(e);
                    }
                }
                None if self.queue.is_drained() => {
                    info!("Download queue drained");
                    return Ok(());
                }
                None => {}
            }
        }
    }

    async fn process_batch(&mut self, batch: QueueBatch) -> PipelineResult<()> {
        let Some(spec) = self.resolver.specs().get(&batch.directory).cloned() else {
            warn!("Dropping batch for undeclared directory {}", batch.directory);
            self.queue.finish_batch(self.countdowns.snapshot())?;
            return Ok(());
        };
        self.status.status(&format!("{} ({} posts)", spec.directory, batch.posts.len()));

        let mut pending = batch.posts;
        loop {
            let mut deferred = Vec::new();
            let mut tasks = JoinSet::new();

            for post in pending {
                let directories = self.resolver.resolve(&post, &self.root, &spec);
                if directories.is_empty() {
                    continue;
                }
                if !self.countdowns.try_take(&spec.directory) {
                    deferred.push(post);
                    continue;
                }

                let placement = Placement {
                    post_id: post.id,
                    file_name: self.namer.file_name(&post),
                    directories,
                };
                self.registry.stage(placement.clone());

                let job = PlacementJob {
                    post,
                    placement,
                    source: self.source.clone(),
                    known_files: self.known_files.clone(),
                    make_hardlinks: self.settings.make_hardlinks,
                };
                let semaphore = self.semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await;
                    let post_id = job.post.id;
                    (post_id, place(job).await)
                });
            }

            let dispatched = tasks.len();
            let mut fatal = None;
            while let Some(joined) = tasks.join_next().await {
                let (post_id, outcome) = joined.map_err(|e| PipelineError::Join(e.to_string()))?;
                match outcome {
                    Ok(placed) => {
                        self.status.increment(Counter::Downloaded, placed.downloaded);
                        self.status.increment(Counter::Duplicate, placed.duplicate);
                        self.status.increment(Counter::AlreadyPresent, placed.present);
                    }
                    Err(failure) => {
                        self.countdowns.restore(&spec.directory);
                        self.registry.withdraw(post_id);
                        match failure {
                            PlacementFailure::Gone => {
                                info!("Post {} is no longer available", post_id);
                                self.status.increment(Counter::NotFound, 1);
                            }
                            PlacementFailure::Failed(e) => {
                                warn!("Post {} failed: {}", post_id, e);
                                self.status.increment(Counter::Failed, 1);
                            }
                            PlacementFailure::Fatal(e) => {
                                if fatal.is_none() {
                                    fatal = Some(e);
                                }
                            }
                        }
                    }
                }
            }
            if let Some(e) = fatal {
                return Err(e);
            }

            if deferred.is_empty() || dispatched == 0 {
                if !deferred.is_empty() {
                    debug!(
                        directory = %spec.directory,
                        skipped = deferred.len(),
                        "Post limit reached"
                    );
                }
                break;
            }
            pending = deferred;
        }

        self.registry.commit();
        self.queue.finish_batch(self.countdowns.snapshot())?;
        Ok(())
    }
}

async fn place(job: PlacementJob) -> Result<Placed, PlacementFailure> {
    let PlacementJob {
        post,
        placement,
        source,
        known_files,
        make_hardlinks,
    } = job;

    let mut placed = Placed::default();
    let mut on_disk = known_files.get(&placement.file_name).map(|p| p.value().clone());

    for target in placement.targets() {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PlacementFailure::Fatal(e.into()))?;
        }

        let exists = tokio::fs::try_exists(&target)
            .await
            .map_err(|e| PlacementFailure::Fatal(e.into()))?;
        if exists {
            debug!(post_id = post.id, path = %target.display(), "Already present");
            placed.present += 1;
            on_disk.get_or_insert(target);
            continue;
        }

        if let Some(existing) = &on_disk {
            duplicate(existing, &target, make_hardlinks)
                .await
                .map_err(|e| PlacementFailure::Fatal(e.into()))?;
            info!(post_id = post.id, from = %existing.display(), to = %target.display(), "Duplicated");
            placed.duplicate += 1;
            continue;
        }

        let Some(url) = post.file_url.as_deref() else {
            return Err(PlacementFailure::Gone);
        };
        match source.download(url, &target).await {
            Ok(bytes) => {
                info!(post_id = post.id, bytes, path = %target.display(), "Downloaded");
                placed.downloaded += 1;
                known_files
                    .entry(placement.file_name.clone())
                    .or_insert_with(|| target.clone());
                on_disk = Some(target);
            }
            Err(ClientError::ContentGone { .. }) => return Err(PlacementFailure::Gone),
            Err(ClientError::Io(e)) => return Err(PlacementFailure::Fatal(e.into())),
            Err(e) => return Err(PlacementFailure::Failed(e)),
        }
    }

    Ok(placed)
}

async fn duplicate(from: &Path, to: &Path, make_hardlinks: bool) -> std::io::Result<()> {
    if make_hardlinks {
        match tokio::fs::hard_link(from, to).await {
            Ok(()) => return Ok(()),
            Err(e) => debug!("Hardlink failed, copying instead: {}", e),
        }
    }
    tokio::fs::copy(from, to).await.map(|_| ())
}
