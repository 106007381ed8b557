use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Error};
use tracing::{debug, info, trace, warn};

use crate::config_loader::ConfigManager;
use crate::e621::{finish_partial_downloads, ClientResult, E621Client};
use crate::pipeline::{
    BatchQueue, CoordinatorSettings, Countdowns, DirectoryResolver, DownloadCoordinator, FileNamer,
    IngestionProducer, LocalPostStore, NullSink, PipelineError, PostSink, PostSource,
    ProducerSettings,
};
use crate::status::{ConsoleStatus, RunSummary, StatusSink};

/// The name of the cargo package.
const NAME: &str = env!("CARGO_PKG_NAME");

/// The version of the cargo package.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Drives one run: recovery, tag resolution, then the producer and the
/// coordinator side by side until the queue drains.
pub struct Program {
    config: ConfigManager,
}

impl Program {
    pub fn new(config: ConfigManager) -> Self {
        Self { config }
    }

    /// Runs the downloader. Returns `None` when an example search config was
    /// just written and there is nothing to download yet.
    pub async fn run(&self) -> Result<Option<RunSummary>, Error> {
        trace!("Program Name: {}", NAME);
        trace!("Program Version: {}", VERSION);
        trace!("Config Directory: {}", self.config.config_dir().display());

        let app = self.config.app_config();
        let e621 = self.config.e621_config();

        if self.config.created_e621_config() {
            info!(
                "Wrote an example e621.toml to {}. Edit it to declare your searches, then run again.",
                self.config.config_dir().display()
            );
            return Ok(None);
        }
        e621.validate()?;

        let root = PathBuf::from(&app.paths.download_directory);
        fs::create_dir_all(&root)?;

        let status = Arc::new(ConsoleStatus::new());
        let status_sink: Arc<dyn StatusSink> = status.clone();

        let (source, sink) = self.open_source()?;

        if source.is_offline() {
            info!("Offline mode, skipping recovery of partial downloads");
        } else {
            status.section("Recovering");
            let report = finish_partial_downloads(source.as_ref(), &root).await?;
            if report.resumed + report.removed + report.failed > 0 {
                info!(
                    resumed = report.resumed,
                    removed = report.removed,
                    failed = report.failed,
                    "Recovered partial downloads"
                );
            }
        }

        status.section("Resolving tags");
        let canonical = resolve_tags(source.as_ref(), e621.tags_to_resolve()).await?;
        let specs = e621.build_specs(&canonical)?;

        let queue = Arc::new(BatchQueue::open(self.config.state_file(), &e621.fingerprint()?)?);
        let countdowns = Arc::new(Countdowns::restore_from(&specs, &queue.saved_countdowns()));
        let resolver = Arc::new(DirectoryResolver::new(specs));

        let producer = IngestionProducer::new(
            source.clone(),
            sink,
            queue.clone(),
            resolver.clone(),
            countdowns.clone(),
            status_sink.clone(),
            root.clone(),
            ProducerSettings {
                posts_per_page: app.limits.posts_per_page,
                max_search_tags: app.limits.max_search_tags,
            },
        )
        .with_excluded(e621.blocked_posts.iter().copied());

        let namer = match &app.options.filename_format {
            Some(format) => FileNamer::new(Some(format.clone()), app.limits.filename_max_len),
            None if app.options.include_md5 => FileNamer::with_md5(app.limits.filename_max_len),
            None => FileNamer::new(None, app.limits.filename_max_len),
        };
        let mut coordinator = DownloadCoordinator::new(
            source,
            queue.clone(),
            resolver.clone(),
            countdowns,
            status_sink,
            namer,
            root.clone(),
            CoordinatorSettings {
                concurrency: app.pools.max_download_concurrency,
                poll_interval: Duration::from_millis(app.queue.poll_interval_ms),
                make_hardlinks: app.options.make_hardlinks,
            },
        );

        let interrupt_queue = queue.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, saving progress");
                interrupt_queue.abort();
            }
        });

        let producer_task = tokio::spawn(async move { producer.run().await });
        let downloaded = coordinator.run().await;
        let produced = producer_task
            .await
            .map_err(|e| anyhow!("Producer task failed: {}", e))?;
        interrupt.abort();

        match (produced, downloaded) {
            (Ok(()), Ok(())) => {}
            (Err(PipelineError::Aborted), Err(e)) | (Err(e), _) | (_, Err(e)) => return Err(e.into()),
        }

        if app.options.prune_downloads {
            if queue.resumed() {
                warn!("Skipping pruning, this run resumed an earlier one and did not see every placement");
            } else {
                let removed = coordinator.registry().prune(&resolver.declared_paths(&root))?;
                info!("Pruned {} files", removed);
            }
        }

        queue.clear()?;
        let summary = status.finish();
        info!("Finished: {}", summary);
        Ok(Some(summary))
    }

    fn open_source(&self) -> Result<(Arc<dyn PostSource>, Arc<dyn PostSink>), Error> {
        let app = self.config.app_config();
        let database = PathBuf::from(&app.paths.database_file);

        if app.options.offline {
            let store = Arc::new(LocalPostStore::open(&database)?);
            info!("Replaying {} stored posts", store.count()?);
            let source: Arc<dyn PostSource> = store;
            let sink: Arc<dyn PostSink> = Arc::new(NullSink);
            return Ok((source, sink));
        }

        let client: Arc<dyn PostSource> =
            Arc::new(E621Client::new(app.client_config(&self.config.e621_config().auth))?);
        let sink: Arc<dyn PostSink> = if app.options.cache_posts {
            Arc::new(LocalPostStore::open(&database)?)
        } else {
            Arc::new(NullSink)
        };
        Ok((client, sink))
    }
}

/// Maps each configured tag to its canonical name. Unknown tags map to "".
async fn resolve_tags(source: &dyn PostSource, tags: BTreeSet<String>) -> ClientResult<HashMap<String, String>> {
    let mut canonical = HashMap::with_capacity(tags.len());
    for tag in tags {
        let resolved = source.resolve_alias(&tag).await?;
        if resolved != tag {
            debug!("Tag {} resolved to {:?}", tag, resolved);
        }
        canonical.insert(tag, resolved);
    }
    Ok(canonical)
}
