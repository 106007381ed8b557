//! Directory routing for matched posts
//!
//! This module provides functionality for:
//! 1. Laying the declared directories out as a tree below the download root
//! 2. Placing a post in the deepest directories whose searches accept it
//! 3. Breaking subdirectory cycles by never revisiting a name on the current path

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use crate::pipeline::filter::FilterEngine;
use crate::pipeline::post::Post;
use crate::pipeline::spec::{SearchSpec, SearchSpecs};

/// Replaces characters that are invalid in file and directory names.
pub fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\\' | '/' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect::<String>()
        .trim_matches('.')
        .trim()
        .to_string()
}

/// The declared directories arranged under the download root.
#[derive(Debug, Clone)]
pub struct DirectoryResolver {
    specs: SearchSpecs,
    /// Where each directory sits below the root, via its first declaration.
    layout: HashMap<String, Canonical>,
}

#[derive(Debug, Clone)]
struct Canonical {
    relative: PathBuf,
    /// Names above this directory on its canonical path, outermost first.
    ancestors: Vec<String>,
}

impl DirectoryResolver {
    pub fn new(specs: SearchSpecs) -> Self {
        let layout = canonical_paths(&specs);
        Self { specs, layout }
    }

    pub fn specs(&self) -> &SearchSpecs {
        &self.specs
    }

    /// Where `directory` itself lives below `root`.
    pub fn path_of(&self, root: &Path, directory: &str) -> PathBuf {
        match self.layout.get(directory) {
            Some(canonical) => root.join(&canonical.relative),
            None => root.join(sanitize_filename(directory)),
        }
    }

    /// Every directory the post should be written to, starting the descent at `spec`.
    ///
    /// A matching child wins over its parent. A node whose own search fails still
    /// forwards the post to its children, and a node with neither a matching child
    /// nor a matching search places nothing, even when an ancestor matched.
    /// Names above `spec` on its canonical path are never re-entered.
    pub fn resolve(&self, post: &Post, root: &Path, spec: &SearchSpec) -> BTreeSet<PathBuf> {
        let here = self.path_of(root, &spec.directory);
        let mut chain: Vec<&str> = self
            .layout
            .get(&spec.directory)
            .map(|canonical| canonical.ancestors.iter().map(String::as_str).collect())
            .unwrap_or_default();
        self.descend(post, here, spec, &mut chain)
    }

    fn descend<'a>(
        &'a self,
        post: &Post,
        here: PathBuf,
        spec: &'a SearchSpec,
        chain: &mut Vec<&'a str>,
    ) -> BTreeSet<PathBuf> {
        let own_match = FilterEngine::matches(post, spec);
        if spec.has_actual_search() && !own_match && spec.subdirectories.is_empty() {
            return BTreeSet::new();
        }

        chain.push(spec.directory.as_str());
        let mut placed = BTreeSet::new();
        for child in &spec.subdirectories {
            if chain.contains(&child.as_str()) {
                continue;
            }
            if let Some(child_spec) = self.specs.get(child) {
                let child_path = here.join(sanitize_filename(child));
                placed.extend(self.descend(post, child_path, child_spec, chain));
            }
        }
        chain.pop();

        if placed.is_empty() && own_match {
            placed.insert(here);
        }
        placed
    }

    /// All directories reachable from the top of the tree.
    pub fn declared_paths(&self, root: &Path) -> BTreeSet<PathBuf> {
        let mut paths = BTreeSet::new();
        for top in top_level(&self.specs) {
            let mut chain = Vec::new();
            self.collect_paths(root.join(sanitize_filename(&top.directory)), top, &mut chain, &mut paths);
        }
        paths
    }

    fn collect_paths<'a>(
        &'a self,
        here: PathBuf,
        spec: &'a SearchSpec,
        chain: &mut Vec<&'a str>,
        paths: &mut BTreeSet<PathBuf>,
    ) {
        chain.push(spec.directory.as_str());
        for child in &spec.subdirectories {
            if chain.contains(&child.as_str()) {
                continue;
            }
            if let Some(child_spec) = self.specs.get(child) {
                self.collect_paths(here.join(sanitize_filename(child)), child_spec, chain, paths);
            }
        }
        chain.pop();
        paths.insert(here);
    }
}

/// Directories nobody declares as a subdirectory, followed by the first
/// declared member of every cycle that is unreachable from those.
fn top_level(specs: &SearchSpecs) -> Vec<&SearchSpec> {
    let nested: HashSet<&str> = specs
        .iter()
        .flat_map(|spec| spec.subdirectories.iter().map(String::as_str))
        .collect();

    let mut tops: Vec<&SearchSpec> = specs
        .iter()
        .filter(|spec| !nested.contains(spec.directory.as_str()))
        .collect();

    let mut reached = HashSet::new();
    for top in &tops {
        mark_reachable(specs, top, &mut reached);
    }
    for spec in specs.iter() {
        if !reached.contains(spec.directory.as_str()) {
            mark_reachable(specs, spec, &mut reached);
            tops.push(spec);
        }
    }
    tops
}

fn mark_reachable<'a>(specs: &'a SearchSpecs, spec: &'a SearchSpec, reached: &mut HashSet<&'a str>) {
    if !reached.insert(spec.directory.as_str()) {
        return;
    }
    for child in &spec.subdirectories {
        if let Some(child_spec) = specs.get(child) {
            mark_reachable(specs, child_spec, reached);
        }
    }
}

fn canonical_paths(specs: &SearchSpecs) -> HashMap<String, Canonical> {
    let mut layout = HashMap::new();
    let mut queue: VecDeque<(&SearchSpec, Canonical)> = top_level(specs)
        .into_iter()
        .map(|spec| {
            let canonical = Canonical {
                relative: PathBuf::from(sanitize_filename(&spec.directory)),
                ancestors: Vec::new(),
            };
            (spec, canonical)
        })
        .collect();

    while let Some((spec, canonical)) = queue.pop_front() {
        if layout.contains_key(&spec.directory) {
            continue;
        }
        let mut chain = canonical.ancestors.clone();
        chain.push(spec.directory.clone());
        for child in &spec.subdirectories {
            if chain.contains(child) {
                continue;
            }
            if let Some(child_spec) = specs.get(child) {
                let nested = Canonical {
                    relative: canonical.relative.join(sanitize_filename(child)),
                    ancestors: chain.clone(),
                };
                queue.push_back((child_spec, nested));
            }
        }
        layout.insert(spec.directory.clone(), canonical);
    }

    layout
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::post::fixtures::post;

    fn resolver(specs: Vec<SearchSpec>) -> DirectoryResolver {
        DirectoryResolver::new(SearchSpecs::new(specs))
    }

    fn set(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("a/b:c*d"), "a_b_c_d");
        assert_eq!(sanitize_filename("..hidden.."), "hidden");
        assert_eq!(sanitize_filename("tab\there"), "tab_here");
    }

    #[test]
    fn test_child_match_wins_over_parent() {
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["cat"]).subdirectories(["B"]),
            SearchSpec::new("B").whitelist(["cat", "cute"]),
        ]);
        let a = dirs.specs().get("A").unwrap();
        let root = Path::new("root");

        assert_eq!(dirs.resolve(&post(1, &["cat", "cute"]), root, a), set(&["root/A/B"]));
        assert_eq!(dirs.resolve(&post(2, &["cat"]), root, a), set(&["root/A"]));
    }

    #[test]
    fn test_child_search_starts_at_its_nested_path() {
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["cat"]).subdirectories(["B"]),
            SearchSpec::new("B").whitelist(["cute"]),
        ]);
        let b = dirs.specs().get("B").unwrap();

        assert_eq!(dirs.resolve(&post(1, &["cute"]), Path::new("root"), b), set(&["root/A/B"]));
    }

    #[test]
    fn test_routing_node_never_places_on_its_own() {
        let dirs = resolver(vec![SearchSpec::new("Root").subdirectories(["Missing"])]);
        let root_spec = dirs.specs().get("Root").unwrap();

        assert!(dirs.resolve(&post(1, &["cat"]), Path::new("root"), root_spec).is_empty());
    }

    #[test]
    fn test_routing_node_forwards_to_children() {
        let dirs = resolver(vec![
            SearchSpec::new("Root").subdirectories(["Cats", "Dogs"]),
            SearchSpec::new("Cats").whitelist(["cat"]),
            SearchSpec::new("Dogs").whitelist(["dog"]),
        ]);
        let root_spec = dirs.specs().get("Root").unwrap();

        assert_eq!(
            dirs.resolve(&post(1, &["cat", "dog"]), Path::new("dl"), root_spec),
            set(&["dl/Root/Cats", "dl/Root/Dogs"])
        );
    }

    #[test]
    fn test_no_fallback_to_ancestor_through_passive_children() {
        // The parent's search fails, its only child is a routing node with no
        // matching descendants: nothing is placed.
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["dog"]).subdirectories(["Group"]),
            SearchSpec::new("Group").subdirectories(["Birds"]),
            SearchSpec::new("Birds").whitelist(["bird"]),
        ]);
        let a = dirs.specs().get("A").unwrap();

        assert!(dirs.resolve(&post(1, &["cat"]), Path::new("r"), a).is_empty());
    }

    #[test]
    fn test_matching_ancestor_keeps_post_when_children_pass() {
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["cat"]).subdirectories(["Group"]),
            SearchSpec::new("Group").subdirectories(["Birds"]),
            SearchSpec::new("Birds").whitelist(["bird"]),
        ]);
        let a = dirs.specs().get("A").unwrap();

        assert_eq!(dirs.resolve(&post(1, &["cat"]), Path::new("r"), a), set(&["r/A"]));
    }

    #[test]
    fn test_mutual_cycle_terminates_without_duplicates() {
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["cat"]).subdirectories(["B"]),
            SearchSpec::new("B").whitelist(["cat"]).subdirectories(["A"]),
        ]);
        let a = dirs.specs().get("A").unwrap();

        let placed = dirs.resolve(&post(1, &["cat"]), Path::new("r"), a);
        assert_eq!(placed.len(), 1);
        assert_eq!(placed, set(&["r/A/B"]));
    }

    #[test]
    fn test_cycle_member_search_does_not_reenter_its_ancestor() {
        let dirs = resolver(vec![
            SearchSpec::new("A").whitelist(["cat"]).subdirectories(["B"]),
            SearchSpec::new("B").whitelist(["cat"]).subdirectories(["A"]),
        ]);
        let b = dirs.specs().get("B").unwrap();
        let root = Path::new("r");

        assert_eq!(dirs.resolve(&post(1, &["cat"]), root, b), set(&["r/A/B"]));
        assert!(dirs.declared_paths(root).contains(&PathBuf::from("r/A/B")));
        assert!(!dirs.declared_paths(root).contains(&PathBuf::from("r/A/B/A")));
    }

    #[test]
    fn test_declared_paths_cover_the_tree() {
        let dirs = resolver(vec![
            SearchSpec::new("Root").subdirectories(["Cats"]),
            SearchSpec::new("Cats").whitelist(["cat"]).subdirectories(["Root"]),
            SearchSpec::new("Solo").whitelist(["x"]),
        ]);

        assert_eq!(
            dirs.declared_paths(Path::new("r")),
            set(&["r/Root", "r/Root/Cats", "r/Solo"])
        );
    }
}
