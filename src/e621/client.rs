//! Rate-limited e621 client
//!
//! This module provides functionality for:
//! 1. Paginated post searches and single post lookups
//! 2. Tag and alias lookups behind a memoizing resolver
//! 3. Resumable file downloads through `.request` side-car files
//! 4. Retrying transient failures with exponential backoff under one shared rate limit

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode, Url};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, info, instrument, warn};

use crate::e621::entries::{AliasEntry, Listing, PostListEntry, SinglePostEntry, TagEntry};
use crate::e621::rate_limiter::RateLimiter;
use crate::e621::tag_resolver::{TagLookup, TagResolver};
use crate::pipeline::naming::partial_path;
use crate::pipeline::post::Post;
use crate::pipeline::queue::Cursor;
use crate::pipeline::source::{PostSource, SearchQuery};

/// Largest page the board serves.
pub const MAX_PAGE_SIZE: u32 = 320;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid URL {0}")]
    Url(String),

    #[error("Request to {url} failed after {attempts} attempts: {last}")]
    RetriesExhausted { url: String, attempts: u32, last: String },

    #[error("Request to {url} was refused with {status}")]
    Status { url: String, status: StatusCode },

    #[error("File at {url} is gone ({status})")]
    ContentGone { url: String, status: StatusCode },

    #[error("Local store error: {0}")]
    Local(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Debug, Clone)]
pub struct Credentials {
    pub login: String,
    pub api_key: String,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub base_url: String,
    pub user_agent: String,
    pub credentials: Option<Credentials>,
    pub min_interval: Duration,
    pub retry_attempts: u32,
    pub retry_backoff: Duration,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "https://e621.net".to_string(),
            user_agent: format!("e621dl/{}", env!("CARGO_PKG_VERSION")),
            credentials: None,
            min_interval: Duration::from_millis(500),
            retry_attempts: 5,
            retry_backoff: Duration::from_millis(300),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Exponential backoff: `base * 2^(attempt - 1)`, capped at one minute.
pub fn calculate_backoff(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent).min(Duration::from_secs(60))
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// The remote `PostSource`. Cheap to share behind an `Arc`; every request goes
/// through the same rate limiter.
pub struct E621Client {
    http: Client,
    config: ClientConfig,
    limiter: Arc<RateLimiter>,
    resolver: TagResolver,
}

impl E621Client {
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        let limiter = Arc::new(RateLimiter::new(config.min_interval));
        Self::with_limiter(config, limiter)
    }

    pub fn with_limiter(config: ClientConfig, limiter: Arc<RateLimiter>) -> ClientResult<Self> {
        let http = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .build()?;

        info!("e621 client ready for {}", config.base_url);
        Ok(Self {
            http,
            config,
            limiter,
            resolver: TagResolver::new(),
        })
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    fn endpoint(&self, path: &str, params: &[(&str, String)]) -> ClientResult<Url> {
        let base = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        Url::parse_with_params(&base, params).map_err(|e| ClientError::Url(format!("{}: {}", base, e)))
    }

    /// Sends a GET, retrying transport errors and transient statuses. Any other
    /// response, including 4xx, is handed back to the caller.
    async fn get(&self, url: &Url, range_from: Option<u64>) -> ClientResult<Response> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last = String::new();

        for attempt in 1..=attempts {
            self.limiter.acquire().await;

            let mut request = self.http.get(url.clone());
            if let Some(creds) = &self.config.credentials {
                request = request.basic_auth(&creds.login, Some(&creds.api_key));
            }
            if let Some(offset) = range_from {
                request = request.header(RANGE, format!("bytes={}-", offset));
            }

            match request.send().await {
                Ok(response) if is_transient(response.status()) => {
                    last = response.status().to_string();
                    warn!("Transient response {} from {} (attempt {}/{})", last, url, attempt, attempts);
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    last = e.to_string();
                    warn!("Request to {} failed (attempt {}/{}): {}", url, attempt, attempts, e);
                }
            }

            if attempt < attempts {
                let backoff = calculate_backoff(attempt, self.config.retry_backoff);
                debug!("Backing off for {:?} before retry", backoff);
                sleep(backoff).await;
            }
        }

        Err(ClientError::RetriesExhausted {
            url: url.to_string(),
            attempts,
            last,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &Url) -> ClientResult<T> {
        let response = self.get(url, None).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status {
                url: url.to_string(),
                status,
            });
        }
        Ok(response.json::<T>().await?)
    }

    #[instrument(skip(self, query), fields(directory = %query.directory))]
    pub async fn fetch_page(&self, query: &SearchQuery, cursor: Cursor) -> ClientResult<Vec<Post>> {
        let mut params = vec![
            ("limit", query.limit.min(MAX_PAGE_SIZE).to_string()),
            ("tags", query.tag_string()),
        ];
        match cursor {
            Cursor::Start => {}
            Cursor::Before(id) => params.push(("page", format!("b{}", id))),
            Cursor::Exhausted => return Ok(Vec::new()),
        }

        let url = self.endpoint("posts.json", &params)?;
        let entry: PostListEntry = self.get_json(&url).await?;
        let now = Utc::now();
        let posts: Vec<Post> = entry.posts.into_iter().map(|p| p.into_post(now)).collect();
        debug!(count = posts.len(), ?cursor, "Fetched page");
        Ok(posts)
    }

    /// Downloads `url` into `dest`, continuing from whatever a previous attempt
    /// left in the side-car file.
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    pub async fn download_file(&self, url: &str, dest: &Path) -> ClientResult<u64> {
        let parsed = Url::parse(url).map_err(|e| ClientError::Url(format!("{}: {}", url, e)))?;
        let partial = partial_path(dest);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }

        let attempts = self.config.retry_attempts.max(1);
        let mut range_reset = false;
        let mut stream_failures = 0;

        loop {
            let offset = match fs::metadata(&partial).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
                Err(e) => return Err(e.into()),
            };

            let response = self.get(&parsed, (offset > 0).then_some(offset)).await?;
            let status = response.status();

            let append = match status {
                StatusCode::PARTIAL_CONTENT => true,
                StatusCode::OK => {
                    if offset > 0 {
                        debug!("Server ignored range request, restarting {}", dest.display());
                    }
                    false
                }
                StatusCode::RANGE_NOT_SATISFIABLE if !range_reset => {
                    warn!("Partial file {} does not fit the remote file, restarting", partial.display());
                    range_reset = true;
                    fs::remove_file(&partial).await?;
                    continue;
                }
                s if s.is_client_error() => {
                    remove_if_exists(&partial).await?;
                    return Err(ClientError::ContentGone {
                        url: url.to_string(),
                        status: s,
                    });
                }
                s => {
                    return Err(ClientError::Status {
                        url: url.to_string(),
                        status: s,
                    });
                }
            };

            match write_body(response, &partial, append).await {
                Ok(()) => break,
                Err(StreamFailure::Io(e)) => return Err(e.into()),
                Err(StreamFailure::Body(e)) => {
                    stream_failures += 1;
                    if stream_failures >= attempts {
                        return Err(ClientError::RetriesExhausted {
                            url: url.to_string(),
                            attempts,
                            last: e.to_string(),
                        });
                    }
                    warn!("Download of {} interrupted, resuming: {}", url, e);
                    sleep(calculate_backoff(stream_failures, self.config.retry_backoff)).await;
                }
            }
        }

        fs::rename(&partial, dest).await?;
        let size = fs::metadata(dest).await?.len();
        debug!(bytes = size, "Download complete");
        Ok(size)
    }
}

enum StreamFailure {
    Io(io::Error),
    Body(reqwest::Error),
}

async fn write_body(response: Response, partial: &Path, append: bool) -> Result<(), StreamFailure> {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    let mut file = options.open(partial).await.map_err(StreamFailure::Io)?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(StreamFailure::Body)?;
        file.write_all(&chunk).await.map_err(StreamFailure::Io)?;
    }
    file.flush().await.map_err(StreamFailure::Io)?;
    Ok(())
}

async fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[async_trait]
impl TagLookup for E621Client {
    async fn tag_exists(&self, name: &str) -> ClientResult<bool> {
        let url = self.endpoint("tags.json", &[("search[name]", name.to_string())])?;
        let tags: Listing<TagEntry> = self.get_json(&url).await?;
        Ok(tags.into_vec().iter().any(|t| t.name == name))
    }

    async fn alias_of(&self, name: &str) -> ClientResult<Option<String>> {
        let url = self.endpoint(
            "tag_aliases.json",
            &[
                ("search[antecedent_name]", name.to_string()),
                ("search[status]", "active".to_string()),
            ],
        )?;
        let aliases: Listing<AliasEntry> = self.get_json(&url).await?;
        Ok(aliases
            .into_vec()
            .into_iter()
            .find(|a| a.antecedent_name == name)
            .map(|a| a.consequent_name))
    }
}

#[async_trait]
impl PostSource for E621Client {
    async fn search(&self, query: &SearchQuery, cursor: Cursor) -> ClientResult<Vec<Post>> {
        self.fetch_page(query, cursor).await
    }

    async fn resolve_alias(&self, tag: &str) -> ClientResult<String> {
        self.resolver.resolve(self, tag).await
    }

    async fn lookup_post(&self, id: u64) -> ClientResult<Option<Post>> {
        let url = self.endpoint(&format!("posts/{}.json", id), &[])?;
        let response = self.get(&url, None).await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let entry: SinglePostEntry = response.json().await?;
                Ok(Some(entry.post.into_post(Utc::now())))
            }
            status => Err(ClientError::Status {
                url: url.to_string(),
                status,
            }),
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> ClientResult<u64> {
        self.download_file(url, dest).await
    }
}
