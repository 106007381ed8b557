//! Side-car recovery: finishes downloads an earlier run left behind.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::e621::{ClientError, ClientResult};
use crate::pipeline::naming::{is_partial, parse_post_id};
use crate::pipeline::source::PostSource;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryReport {
    pub resumed: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Every side-car file below `root`.
pub fn find_partials(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file() && is_partial(entry.path()))
        .map(|entry| entry.into_path())
        .collect()
}

/// Looks up the post behind each side-car and resumes its download.
///
/// Side-cars whose post is gone are deleted. Transient failures keep the
/// side-car for the next run; a refused lookup stops recovery.
pub async fn finish_partial_downloads(source: &dyn PostSource, root: &Path) -> ClientResult<RecoveryReport> {
    let mut report = RecoveryReport::default();
    let partials = find_partials(root);
    if partials.is_empty() {
        return Ok(report);
    }
    info!("Finishing {} partial downloads", partials.len());

    for partial in partials {
        let dest = partial.with_extension("");
        let name = partial.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();

        let post = match parse_post_id(&name) {
            Some(id) => source.lookup_post(id).await?,
            None => {
                warn!("Cannot tell which post {} belongs to, leaving it", partial.display());
                report.failed += 1;
                continue;
            }
        };

        let Some(url) = post.and_then(|p| p.file_url) else {
            remove_partial(&partial).await?;
            report.removed += 1;
            continue;
        };

        match source.download(&url, &dest).await {
            Ok(_) => {
                info!("Resumed {}", dest.display());
                report.resumed += 1;
            }
            Err(ClientError::ContentGone { .. }) => report.removed += 1,
            Err(ClientError::Io(e)) => return Err(ClientError::Io(e)),
            Err(e) => {
                warn!("Could not resume {}: {}", dest.display(), e);
                report.failed += 1;
            }
        }
    }

    Ok(report)
}

async fn remove_partial(partial: &Path) -> io::Result<()> {
    info!("Post behind {} is gone, removing it", partial.display());
    match fs::remove_file(partial).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
