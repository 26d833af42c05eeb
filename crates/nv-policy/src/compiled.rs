use regex::Regex;
use thiserror::Error;

use crate::Filter;

#[derive(Debug, Error)]
pub enum FilterError {
    #[error("filter '{key}' has an invalid regex '{pattern}': {source}")]
    InvalidRegex {
        key: String,
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// A [`Filter`] with its matching predicate precompiled once at
/// profile-load time (§4.2), mirroring the teacher's `compile(&Policy)`
/// pattern of doing the expensive classification work up front rather
/// than per-event.
#[derive(Debug, Clone)]
pub struct CompiledFilter {
    filter: Filter,
    walk_base: String,
    /// `None` for an exact single-file filter (`effective_regex` empty).
    matcher: Option<Regex>,
}

impl CompiledFilter {
    pub fn compile(filter: Filter) -> Result<Self, FilterError> {
        let walk_base = filter.walk_base();
        let effective = filter.effective_regex();
        let matcher = if effective.is_empty() {
            None
        } else {
            let pattern = format!("^{}/{}$", regex::escape(&walk_base), effective);
            Some(
                Regex::new(&pattern).map_err(|source| FilterError::InvalidRegex {
                    key: filter.filter_key(),
                    pattern,
                    source,
                })?,
            )
        };
        Ok(Self {
            filter,
            walk_base,
            matcher,
        })
    }

    #[must_use]
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    #[must_use]
    pub fn walk_base(&self) -> &str {
        &self.walk_base
    }

    #[must_use]
    pub fn filter_key(&self) -> String {
        self.filter.filter_key()
    }

    /// §4.2 "Matching a candidate path p against filter f."
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        match &self.matcher {
            None => candidate == self.filter.unescaped_path(),
            Some(re) => re.is_match(candidate),
        }
    }

    /// Whether `dir` is the filter's base directory or a descendant of
    /// it, honoring the filter's `recursive` flag (§4.2 "Enumeration").
    #[must_use]
    pub fn covers_dir(&self, dir: &str) -> bool {
        if dir == self.walk_base {
            return true;
        }
        if !self.filter.recursive {
            return false;
        }
        dir.strip_prefix(&self.walk_base)
            .is_some_and(|rest| rest.starts_with('/'))
    }

    /// Whether `dir` is a *direct* child of the base (used when
    /// `recursive = false` to restrict file enumeration to immediate
    /// children, §4.2).
    #[must_use]
    pub fn is_direct_child_dir(&self, dir: &str) -> bool {
        dir == self.walk_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Behavior;

    fn f(path: &str, regex: &str, recursive: bool) -> Filter {
        Filter {
            path: path.to_string(),
            regex: regex.to_string(),
            recursive,
            behavior: Behavior::Monitor,
            customer_added: false,
            derived_group: String::new(),
        }
    }

    #[test]
    fn exact_match_requires_equality() {
        let c = CompiledFilter::compile(f("/etc/passwd", "", false)).unwrap();
        assert!(c.matches("/etc/passwd"));
        assert!(!c.matches("/etc/passwd.bak"));
    }

    #[test]
    fn regex_match_is_anchored() {
        let c = CompiledFilter::compile(f("/bin", ".*", true)).unwrap();
        assert!(c.matches("/bin/ls"));
        assert!(!c.matches("/usr/bin/ls"));
    }

    #[test]
    fn non_recursive_filter_rejects_descendant_dirs() {
        let c = CompiledFilter::compile(f("/opt/app/.*", "", false)).unwrap();
        assert!(c.covers_dir("/opt/app"));
        assert!(!c.covers_dir("/opt/app/sub"));
    }

    #[test]
    fn recursive_filter_covers_descendants() {
        let c = CompiledFilter::compile(f("/opt/app/.*", "", true)).unwrap();
        assert!(c.covers_dir("/opt/app/sub"));
        assert!(c.covers_dir("/opt/app/sub/deep"));
        assert!(!c.covers_dir("/opt/other"));
    }
}
