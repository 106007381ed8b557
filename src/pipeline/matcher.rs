/// A compiled tag pattern.
///
/// `*` stands for any run of characters (including none). Patterns are
/// lowercased once here; tags are compared as they come from the board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagMatcher {
    pattern: String,
    segments: Option<Vec<String>>,
}

impl TagMatcher {
    pub fn new(pattern: &str) -> Self {
        let pattern = pattern.trim().to_lowercase();
        let segments = pattern
            .contains('*')
            .then(|| pattern.split('*').map(str::to_string).collect());

        Self { pattern, segments }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.segments.is_some()
    }

    pub fn is_match(&self, tag: &str) -> bool {
        match &self.segments {
            None => self.pattern == tag,
            Some(segments) => glob_match(segments, tag),
        }
    }

    /// True when at least one of `tags` satisfies the pattern.
    pub fn matches_any<'a, I>(&self, tags: I) -> bool
    where
        I: IntoIterator<Item = &'a String>,
    {
        tags.into_iter().any(|tag| self.is_match(tag))
    }
}

// `segments` always has at least two entries: text before the first `*` and after the last.
fn glob_match(segments: &[String], tag: &str) -> bool {
    let first = &segments[0];
    let last = &segments[segments.len() - 1];

    if tag.len() < first.len() + last.len() || !tag.starts_with(first.as_str()) || !tag.ends_with(last.as_str()) {
        return false;
    }

    let mut rest = &tag[first.len()..tag.len() - last.len()];
    for middle in &segments[1..segments.len() - 1] {
        match rest.find(middle.as_str()) {
            Some(index) => rest = &rest[index + middle.len()..],
            None => return false,
        }
    }

    true
}

pub fn compile_all<I, S>(patterns: I) -> Vec<TagMatcher>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    patterns
        .into_iter()
        .filter(|p| !p.as_ref().trim().is_empty())
        .map(|p| TagMatcher::new(p.as_ref()))
        .collect()
}
