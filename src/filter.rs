//! Include/exclude filters for deciding which files make it into a snapshot.

use anyhow::{Context, Result};
use camino::Utf8Path;
use regex::RegexSet;

/// A path filter built from include and exclude regex lists.
///
/// Excludes are a deny-list: a path matching any of them is out.
/// Includes are an allow-list: if any are given, a path must match at
/// least one. Paths are matched in posix form.
pub struct PathFilter {
    includes: Option<RegexSet>,
    excludes: Option<RegexSet>,
}

impl PathFilter {
    /// Returns `None` when both lists are empty - no filtering at all.
    pub fn new(includes: &[String], excludes: &[String]) -> Result<Option<Self>> {
        if includes.is_empty() && excludes.is_empty() {
            return Ok(None);
        }

        let build = |rules: &[String], what| -> Result<Option<RegexSet>> {
            if rules.is_empty() {
                Ok(None)
            } else {
                Ok(Some(
                    RegexSet::new(rules)
                        .with_context(|| format!("{what} rules are not valid regex"))?,
                ))
            }
        };

        Ok(Some(Self {
            includes: build(includes, "Include")?,
            excludes: build(excludes, "Exclude")?,
        }))
    }

    pub fn matches(&self, path: &Utf8Path) -> bool {
        let path = path.as_str();

        if let Some(excludes) = &self.excludes {
            if excludes.is_match(path) {
                return false;
            }
        }
        if let Some(includes) = &self.includes {
            if !includes.is_match(path) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn filter(includes: &[&str], excludes: &[&str]) -> Option<PathFilter> {
        let includes: Vec<String> = includes.iter().map(|s| s.to_string()).collect();
        let excludes: Vec<String> = excludes.iter().map(|s| s.to_string()).collect();
        PathFilter::new(&includes, &excludes).unwrap()
    }

    #[test]
    fn empty_is_no_filter() {
        assert!(filter(&[], &[]).is_none());
    }

    #[test]
    fn excludes_deny() {
        let f = filter(&[], &[r"\.o$", r"/target/"]).unwrap();
        assert!(f.matches(Utf8Path::new("/src/lib.rs")));
        assert!(!f.matches(Utf8Path::new("/src/lib.o")));
        assert!(!f.matches(Utf8Path::new("/proj/target/debug/lib.rs")));
    }

    #[test]
    fn includes_allow() {
        let f = filter(&[r"\.rs$", r"\.toml$"], &[]).unwrap();
        assert!(f.matches(Utf8Path::new("/src/lib.rs")));
        assert!(f.matches(Utf8Path::new("/Cargo.toml")));
        assert!(!f.matches(Utf8Path::new("/notes.txt")));
    }

    #[test]
    fn both_lists() {
        // Must match an include and no exclude.
        let f = filter(&[r"\.rs$"], &[r"test"]).unwrap();
        assert!(f.matches(Utf8Path::new("/src/lib.rs")));
        assert!(!f.matches(Utf8Path::new("/src/test.rs")));
        assert!(!f.matches(Utf8Path::new("/README.md")));
    }
}
