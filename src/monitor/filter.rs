//! Extension selectors compiled into a single path predicate.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;

/// Immutable compiled selector set.
#[derive(Debug, Default)]
struct Selectors {
    extensions: BTreeSet<String>,
}

impl Selectors {
    fn with(&self, ext: String) -> Self {
        let mut extensions = self.extensions.clone();
        extensions.insert(ext);
        Self { extensions }
    }

    fn matches_extension(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.extensions.contains(ext))
            .unwrap_or(false)
    }
}

/// Matches file paths whose extension is one of the configured selectors.
///
/// Adding a selector builds a new predicate and swaps it in whole, so a
/// concurrent [`PathFilter::matches`] sees either the old set or the new one.
/// Evaluation clones the current `Arc` and never holds the lock.
///
/// An empty filter matches nothing.
#[derive(Debug, Default)]
pub struct PathFilter {
    compiled: RwLock<Arc<Selectors>>,
}

impl PathFilter {
    /// Create a filter with no selectors.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a filter from an initial selector list.
    pub fn with_selectors<I, S>(selectors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let filter = Self::new();
        for selector in selectors {
            filter.add_selector(selector.as_ref());
        }
        filter
    }

    /// Add an extension (`"rs"`; a leading dot is tolerated) and recompile.
    ///
    /// Returns false when the selector was blank or already present.
    pub fn add_selector(&self, ext: &str) -> bool {
        let ext = ext.trim().trim_start_matches('.');
        if ext.is_empty() {
            return false;
        }

        let mut compiled = self.compiled.write();
        if compiled.extensions.contains(ext) {
            return false;
        }
        *compiled = Arc::new(compiled.with(ext.to_string()));
        true
    }

    /// True if `path` is not a directory and its extension is selected.
    pub fn matches(&self, path: &Path) -> bool {
        let selectors = self.compiled.read().clone();
        if selectors.extensions.is_empty() {
            return false;
        }
        selectors.matches_extension(path) && !path.is_dir()
    }

    /// Current selectors in sorted order.
    pub fn selectors(&self) -> Vec<String> {
        self.compiled.read().extensions.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.read().extensions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_empty_filter_matches_nothing() {
        let filter = PathFilter::new();

        assert!(filter.is_empty());
        assert!(!filter.matches(Path::new("/project/notes.txt")));
        assert!(!filter.matches(Path::new("/project/Makefile")));
        assert!(!filter.matches(Path::new("")));
    }

    #[test]
    fn test_matches_final_extension() {
        let filter = PathFilter::with_selectors(["txt", "rs"]);

        assert!(filter.matches(Path::new("/project/notes.txt")));
        assert!(filter.matches(Path::new("/project/src/lib.rs")));
        assert!(filter.matches(Path::new("/project/archive.tar.txt")));
        assert!(!filter.matches(Path::new("/project/image.png")));
        assert!(!filter.matches(Path::new("/project/notes.txt.bak")));
        assert!(!filter.matches(Path::new("/project/README")));
    }

    #[test]
    fn test_dotfile_has_no_extension() {
        let filter = PathFilter::with_selectors(["txt"]);
        assert!(!filter.matches(Path::new("/project/.txt")));
    }

    #[test]
    fn test_case_sensitive() {
        let filter = PathFilter::with_selectors(["txt"]);
        assert!(!filter.matches(Path::new("/project/NOTES.TXT")));
    }

    #[test]
    fn test_directories_never_match() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join("looks_like.txt");
        fs::create_dir(&dir).unwrap();

        let filter = PathFilter::with_selectors(["txt"]);
        assert!(!filter.matches(&dir));

        // A deleted file no longer exists on disk and still matches.
        assert!(filter.matches(&temp_dir.path().join("gone.txt")));
    }

    #[test]
    fn test_add_selector_normalizes_and_dedupes() {
        let filter = PathFilter::new();

        assert!(filter.add_selector(".toml"));
        assert!(!filter.add_selector("toml"));
        assert!(!filter.add_selector("   "));
        assert!(filter.add_selector("md"));

        assert_eq!(filter.selectors(), vec!["md".to_string(), "toml".to_string()]);
        assert!(filter.matches(Path::new("Cargo.toml")));
    }

    #[test]
    fn test_concurrent_selector_updates() {
        let filter = Arc::new(PathFilter::with_selectors(["txt"]));

        let writers: Vec<_> = (0..4)
            .map(|i| {
                let filter = Arc::clone(&filter);
                std::thread::spawn(move || {
                    for j in 0..50 {
                        filter.add_selector(&format!("e{i}x{j}"));
                    }
                })
            })
            .collect();

        // The original selector stays visible throughout.
        for _ in 0..1000 {
            assert!(filter.matches(Path::new("/a/b.txt")));
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(filter.selectors().len(), 201);
    }
}
