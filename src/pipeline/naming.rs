use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::{Captures, Regex};

use crate::pipeline::directory::sanitize_filename;
use crate::pipeline::post::Post;

/// Suffix of a file that is still being downloaded.
pub const PARTIAL_SUFFIX: &str = "request";

lazy_static! {
    static ref FIELD: Regex = Regex::new(r"\{(\w+)\}").unwrap();
}

/// Builds destination filenames for posts.
///
/// Without a template the name is `{id}.{ext}`. A template is rendered
/// against the post, sanitized, cut to `max_len` characters and always
/// followed by `.{id}.{ext}` so two posts never share a name.
#[derive(Debug, Clone)]
pub struct FileNamer {
    template: Option<String>,
    max_len: usize,
}

impl FileNamer {
    pub fn new(template: Option<String>, max_len: usize) -> Self {
        let template = template.filter(|t| !t.trim().is_empty());
        Self { template, max_len }
    }

    /// `{id}.{md5}.{ext}` naming.
    pub fn with_md5(max_len: usize) -> Self {
        Self::new(Some("{md5}".to_string()), max_len)
    }

    pub fn file_name(&self, post: &Post) -> String {
        let rendered = self
            .template
            .as_deref()
            .map(|template| self.render(template, post))
            .unwrap_or_default();

        if rendered.is_empty() {
            format!("{}.{}", post.id, post.file_ext)
        } else {
            format!("{}.{}.{}", rendered, post.id, post.file_ext)
        }
    }

    fn render(&self, template: &str, post: &Post) -> String {
        let expanded = FIELD.replace_all(template, |caps: &Captures| {
            field(post, &caps[1]).unwrap_or_else(|| caps[0].to_string())
        });

        let sanitized = sanitize_filename(&expanded);
        sanitized.chars().take(self.max_len).collect::<String>().trim().to_string()
    }
}

fn field(post: &Post, key: &str) -> Option<String> {
    let value = match key {
        "id" => post.id.to_string(),
        "md5" => post.md5.clone(),
        "ext" => post.file_ext.clone(),
        "rating" => post.rating.code().to_string(),
        "score" => post.score.to_string(),
        "favs" => post.fav_count.to_string(),
        "days_ago" => post.days_ago.to_string(),
        "date" => post.created_at.format("%Y-%m-%d").to_string(),
        "tags" => post.tags.iter().cloned().collect::<Vec<_>>().join(" "),
        _ => return None,
    };
    Some(value)
}

/// The side-car path a download of `dest` writes into.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.as_os_str().to_owned();
    name.push(".");
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == PARTIAL_SUFFIX)
}

/// Recovers the post id from a name produced by `FileNamer`, with or without
/// the side-car suffix.
pub fn parse_post_id(file_name: &str) -> Option<u64> {
    let name = file_name
        .strip_suffix(&format!(".{}", PARTIAL_SUFFIX))
        .unwrap_or(file_name);
    let (stem, _ext) = name.rsplit_once('.')?;
    stem.rsplit('.').next()?.parse().ok()
}
