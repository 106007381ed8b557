//! The board-independent download pipeline.
//!
//! Posts flow from a `PostSource` through the `IngestionProducer`, which
//! filters them and records them as batches in the `BatchQueue`. The
//! `DownloadCoordinator` drains that queue, places each post in its
//! directories and downloads every file at most once.

use std::io;

use thiserror::Error;

use crate::e621::ClientError;

pub mod condition;
pub mod coordinator;
pub mod countdown;
pub mod directory;
pub mod filter;
pub mod local_store;
pub mod matcher;
pub mod naming;
pub mod post;
pub mod producer;
pub mod queue;
pub mod registry;
pub mod source;
pub mod spec;

pub use coordinator::{CoordinatorSettings, DownloadCoordinator};
pub use countdown::Countdowns;
pub use directory::DirectoryResolver;
pub use filter::FilterEngine;
pub use local_store::{LocalPostStore, StoreError};
pub use naming::FileNamer;
pub use post::{Post, Rating};
pub use producer::{IngestionProducer, ProducerSettings};
pub use queue::{BatchQueue, Cursor, PersistedQueueState, QueueBatch, QueueError};
pub use registry::PathRegistry;
pub use source::{NullSink, PostSink, PostSource, SearchQuery};
pub use spec::{SearchSpec, SearchSpecs};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Remote error: {0}")]
    Client(#[from] ClientError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Post store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Worker task failed: {0}")]
    Join(String),

    #[error("Pipeline aborted")]
    Aborted,
}

pub type PipelineResult<T> = Result<T, PipelineError>;
