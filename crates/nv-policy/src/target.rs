/// Raw `st_mode` bits as returned by the walker / `lstat` (§3 "file_mode").
pub type FileMode = u32;

/// Raw content hash (§3 "hash", §9 "Hashing"). Zero means "never computed".
pub type ContentHash = u64;

/// Resolved watch target (§3 "FileInfoExt"). Produced by the filter
/// engine (C2, [`crate::engine::compile`]) from a [`crate::WalkResult`]
/// and a [`crate::CompiledProfile`]; consumed by the drivers (C3/C4) to
/// decide what to arm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfoExt {
    pub container_id: String,
    /// Path inside the container's filesystem namespace, e.g. `/etc/passwd`.
    pub in_container_path: String,
    /// Absolute path on the host, e.g. `/proc/4821/root/etc/passwd` (§6
    /// "Kernel interfaces").
    pub host_path: String,
    pub file_mode: FileMode,
    pub is_dir: bool,
    /// Resolved symlink target, or empty when not a symlink (§3 "link").
    /// Per the open question in §9, this is always the raw host path —
    /// never rewritten relative to a bind-mount boundary.
    pub link: String,
    pub hash: ContentHash,
    pub filter_key: String,
    pub protect: bool,
    pub user_added: bool,
    /// Paths of child targets nested directly under this directory
    /// target (§9: avoids a cyclic `Rc`/arena by storing paths instead
    /// of back-references — the owning registry's path-keyed map *is*
    /// the arena).
    pub children: Vec<String>,
}

impl FileInfoExt {
    #[must_use]
    pub fn new(
        container_id: &str,
        host_root: &str,
        in_container_path: &str,
        file_mode: FileMode,
        is_dir: bool,
        filter: &crate::CompiledFilter,
    ) -> Self {
        Self {
            container_id: container_id.to_string(),
            in_container_path: in_container_path.to_string(),
            host_path: join_host_root(host_root, in_container_path),
            file_mode,
            is_dir,
            link: String::new(),
            hash: 0,
            filter_key: filter.filter_key(),
            protect: filter.filter().protect(),
            user_added: filter.filter().customer_added,
            children: Vec::new(),
        }
    }
}

fn join_host_root(host_root: &str, in_container_path: &str) -> String {
    format!(
        "{}{}",
        host_root.trim_end_matches('/'),
        in_container_path
    )
}
