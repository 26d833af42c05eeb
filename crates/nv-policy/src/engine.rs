//! Filter Engine (C2): translates a [`crate::CompiledProfile`] plus a
//! walker enumeration into the concrete [`FileInfoExt`] target list a
//! driver should arm (§4.2).
//!
//! ```text
//! CompiledProfile + WalkResult
//!           │
//!           ▼
//!   pick matching directories  ──▶ directory targets
//!           │
//!           ▼
//!   pick matching files        ──▶ file targets
//!           │
//!           ▼
//!   attach files to their parent directory target's `children`
//! ```

use std::collections::HashMap;

use crate::filter::parent_dir;
use crate::{CompiledProfile, FileInfoExt, FileMode};

/// Output of the out-of-scope `Walker` collaborator (§4.1): every
/// directory and file found under the requested base directories,
/// together with its raw mode bits.
#[derive(Debug, Clone, Default)]
pub struct WalkResult {
    pub dirs: Vec<(String, FileMode)>,
    pub files: Vec<(String, FileMode)>,
}

/// §4.2 "Enumeration" + "Target split".
#[must_use]
pub fn compile(
    profile: &CompiledProfile,
    walk: &WalkResult,
    container_id: &str,
    host_root: &str,
) -> Vec<FileInfoExt> {
    let mut targets: Vec<FileInfoExt> = Vec::new();

    for (dir_path, mode) in &walk.dirs {
        if let Some(filter) = profile.filters().iter().find(|f| f.covers_dir(dir_path)) {
            targets.push(FileInfoExt::new(
                container_id,
                host_root,
                dir_path,
                *mode,
                true,
                filter,
            ));
        }
    }

    for (file_path, mode) in &walk.files {
        if let Some(filter) = profile
            .filters()
            .iter()
            .find(|f| matches_file(f, file_path))
        {
            targets.push(FileInfoExt::new(
                container_id,
                host_root,
                file_path,
                *mode,
                false,
                filter,
            ));
        }
    }

    attach_children(&mut targets);
    targets
}

fn matches_file(filter: &crate::CompiledFilter, file_path: &str) -> bool {
    if !filter.matches(file_path) {
        return false;
    }
    filter.filter().recursive || filter.is_direct_child_dir(&parent_dir(file_path))
}

/// §4.2 "Target split": files whose parent directory has a registered
/// directory target are attached to that target's `children`.
fn attach_children(targets: &mut [FileInfoExt]) {
    let index: HashMap<String, usize> = targets
        .iter()
        .enumerate()
        .filter(|(_, t)| t.is_dir)
        .map(|(i, t)| (t.in_container_path.clone(), i))
        .collect();

    let file_paths: Vec<String> = targets
        .iter()
        .filter(|t| !t.is_dir)
        .map(|t| t.in_container_path.clone())
        .collect();

    for file_path in file_paths {
        let parent = parent_dir(&file_path);
        if let Some(&dir_idx) = index.get(&parent) {
            targets[dir_idx].children.push(file_path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Behavior, Filter, Profile};

    fn profile_single(path: &str, regex: &str, recursive: bool) -> CompiledProfile {
        let profile = Profile {
            filters: vec![Filter {
                path: path.to_string(),
                regex: regex.to_string(),
                recursive,
                behavior: Behavior::Monitor,
                customer_added: true,
                derived_group: "g".into(),
            }],
        };
        CompiledProfile::compile(&profile).unwrap()
    }

    #[test]
    fn recursive_directory_attaches_nested_file_as_child() {
        let profile = profile_single("/opt/app/.*", "", true);
        let walk = WalkResult {
            dirs: vec![("/opt/app".into(), 0o755), ("/opt/app/sub".into(), 0o755)],
            files: vec![("/opt/app/sub/bin".into(), 0o644)],
        };
        let targets = compile(&profile, &walk, "c1", "/proc/42/root");
        let app = targets.iter().find(|t| t.in_container_path == "/opt/app").unwrap();
        assert!(app.children.is_empty());
        let sub = targets.iter().find(|t| t.in_container_path == "/opt/app/sub").unwrap();
        assert_eq!(sub.children, vec!["/opt/app/sub/bin".to_string()]);
    }

    #[test]
    fn non_recursive_filter_drops_descendant_dir_and_nested_file() {
        let profile = profile_single("/opt/app/.*", "", false);
        let walk = WalkResult {
            dirs: vec![("/opt/app".into(), 0o755), ("/opt/app/sub".into(), 0o755)],
            files: vec![
                ("/opt/app/top".into(), 0o644),
                ("/opt/app/sub/nested".into(), 0o644),
            ],
        };
        let targets = compile(&profile, &walk, "c1", "/proc/42/root");
        assert!(!targets.iter().any(|t| t.in_container_path == "/opt/app/sub"));
        assert!(targets.iter().any(|t| t.in_container_path == "/opt/app/top"));
        assert!(!targets.iter().any(|t| t.in_container_path == "/opt/app/sub/nested"));
    }

    #[test]
    fn single_file_filter_produces_exact_target_under_parent_walk_base() {
        let profile = profile_single("/etc/passwd", "", false);
        let walk = WalkResult {
            dirs: vec![("/etc".into(), 0o755)],
            files: vec![("/etc/passwd".into(), 0o644), ("/etc/shadow".into(), 0o600)],
        };
        let targets = compile(&profile, &walk, "c1", "/proc/42/root");
        assert!(targets.iter().any(|t| t.in_container_path == "/etc/passwd"));
        assert!(!targets.iter().any(|t| t.in_container_path == "/etc/shadow"));
        // "/etc" itself isn't claimed as a target unless a filter also covers it as a dir.
        assert!(!targets.iter().any(|t| t.in_container_path == "/etc" && t.is_dir));
    }

    #[test]
    fn host_path_is_rebased_under_proc_root() {
        let profile = profile_single("/etc/passwd", "", false);
        let walk = WalkResult {
            dirs: vec![("/etc".into(), 0o755)],
            files: vec![("/etc/passwd".into(), 0o644)],
        };
        let targets = compile(&profile, &walk, "c1", "/proc/42/root");
        let passwd = targets.iter().find(|t| t.in_container_path == "/etc/passwd").unwrap();
        assert_eq!(passwd.host_path, "/proc/42/root/etc/passwd");
    }
}
