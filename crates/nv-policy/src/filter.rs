use serde::{Deserialize, Serialize};

/// What happens when a filter's target is accessed (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Behavior {
    /// Report access; never deny.
    Monitor,
    /// Eligible for kernel-level denial when the group is in `Enforce` mode.
    Block,
}

/// Declarative watch target (§3 "Filter"). `path` may contain
/// `\.`-escaped dots and an optional `.*` recursive-glob tail (e.g.
/// `"/opt/app/.*"`); `regex` is a separate filename pattern applied
/// under `path` and is empty when `path` names a single file exactly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    pub path: String,
    #[serde(default)]
    pub regex: String,
    #[serde(default)]
    pub recursive: bool,
    pub behavior: Behavior,
    #[serde(default)]
    pub customer_added: bool,
    #[serde(default)]
    pub derived_group: String,
}

impl Filter {
    /// `path` with `\.` unescaped to `.` (§4.2 "Base prefix").
    #[must_use]
    pub fn unescaped_path(&self) -> String {
        self.path.replace("\\.", ".")
    }

    /// If `path` (once unescaped) carries a `.*` tail, the directory it
    /// names with the tail and its trailing `/` stripped. `None` when
    /// `path` has no such tail (a plain file or directory prefix).
    #[must_use]
    pub fn star_tail_dir(&self) -> Option<String> {
        let unescaped = self.unescaped_path();
        let idx = unescaped.find(".*")?;
        let mut dir = unescaped[..idx].to_string();
        if dir.ends_with('/') {
            dir.pop();
        }
        Some(dir)
    }

    /// The directory the walker (C1) should enumerate for this filter
    /// (§4.2 "Base prefix"): the `.*`-stripped directory when `path`
    /// carries a tail, else `path`'s parent directory when `regex` is
    /// empty (a single-file filter — the walker can only list
    /// directories), else `path` unchanged (a directory filter paired
    /// with an explicit `regex`, e.g. `{path:"/bin", regex:".*"}`).
    #[must_use]
    pub fn walk_base(&self) -> String {
        if let Some(dir) = self.star_tail_dir() {
            return dir;
        }
        let full = self.unescaped_path();
        if self.regex.is_empty() {
            parent_dir(&full)
        } else {
            full
        }
    }

    /// The regex actually used for matching: `regex` verbatim when set,
    /// else `".*"` when `path` carries a `.*` tail (the tail is
    /// shorthand for "match everything under this directory"), else
    /// empty (an exact single-file filter).
    #[must_use]
    pub fn effective_regex(&self) -> String {
        if !self.regex.is_empty() {
            return self.regex.clone();
        }
        if self.star_tail_dir().is_some() {
            ".*".to_string()
        } else {
            String::new()
        }
    }

    /// The stable filter-key identity `"<path>/<regex>"` (§3), built
    /// from the *raw* attributes so it stays injective over
    /// `(path, regex)` pairs (§8 invariant 4) regardless of how a
    /// `.*` tail is normalized for matching.
    #[must_use]
    pub fn filter_key(&self) -> String {
        format!("{}/{}", self.path, self.regex)
    }

    #[must_use]
    pub fn protect(&self) -> bool {
        matches!(self.behavior, Behavior::Block)
    }
}

/// `Path::parent()`-equivalent on a `/`-joined string, without requiring
/// the string to exist on disk (filters describe in-container paths
/// that are only meaningful once rebased under `/proc/<pid>/root`).
pub fn parent_dir(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f(path: &str, regex: &str) -> Filter {
        Filter {
            path: path.to_string(),
            regex: regex.to_string(),
            recursive: true,
            behavior: Behavior::Monitor,
            customer_added: false,
            derived_group: String::new(),
        }
    }

    #[test]
    fn exact_file_walks_parent_and_has_no_regex() {
        let filter = f("/etc/passwd", "");
        assert_eq!(filter.walk_base(), "/etc");
        assert_eq!(filter.effective_regex(), "");
        assert_eq!(filter.filter_key(), "/etc/passwd/");
    }

    #[test]
    fn directory_with_explicit_regex() {
        let filter = f("/bin", ".*");
        assert_eq!(filter.walk_base(), "/bin");
        assert_eq!(filter.effective_regex(), ".*");
    }

    #[test]
    fn star_tail_is_shorthand_for_directory_plus_wildcard() {
        let filter = f("/opt/app/.*", "");
        assert_eq!(filter.walk_base(), "/opt/app");
        assert_eq!(filter.effective_regex(), ".*");
    }

    #[test]
    fn escaped_dot_is_unescaped_before_tail_search() {
        let filter = f("/etc/rc\\.d/.*", "");
        assert_eq!(filter.walk_base(), "/etc/rc.d");
    }

    #[test]
    fn parent_dir_handles_root_children() {
        assert_eq!(parent_dir("/etc"), "/");
        assert_eq!(parent_dir("/etc/passwd"), "/etc");
        assert_eq!(parent_dir("/"), "");
    }
}
