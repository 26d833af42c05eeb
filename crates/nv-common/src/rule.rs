use serde::{Deserialize, Serialize};

/// A single learned access rule (§4.7, §6): one process path observed
/// accessing the paths matched by one filter, within one container
/// group. Batches of these are handed to the `SendAccessRule` callback.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub group: String,
    pub filter_key: String,
    pub process_path: String,
}

impl Rule {
    #[must_use]
    pub fn new(
        group: impl Into<String>,
        filter_key: impl Into<String>,
        process_path: impl Into<String>,
    ) -> Self {
        Self {
            group: group.into(),
            filter_key: filter_key.into(),
            process_path: process_path.into(),
        }
    }
}
