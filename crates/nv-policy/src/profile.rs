use serde::{Deserialize, Serialize};

use crate::{CompiledFilter, Filter, FilterError};

/// Policy mode (§3, glossary). Governs both reporting (§4.6 "mode
/// gating") and rule learning (§4.7) for one container group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    /// Observe and record; access rules are learned, never reported
    /// (besides `Accessed` events, which are withheld entirely).
    Learn,
    /// Report violations; never deny.
    Evaluate,
    /// Deny at the kernel boundary for `Block` filters; report denials.
    Enforce,
}

impl Default for PolicyMode {
    /// §4.8: mode defaults to `Learn` if unset.
    fn default() -> Self {
        PolicyMode::Learn
    }
}

/// A container's declarative monitoring profile: the set of filters a
/// `StartWatch` call activates (§3 "GroupInfo.profile").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Profile {
    pub filters: Vec<Filter>,
}

/// A [`Profile`] with every filter precompiled (§4.2), produced once
/// per `StartWatch` call.
#[derive(Debug, Clone, Default)]
pub struct CompiledProfile {
    filters: Vec<CompiledFilter>,
}

impl CompiledProfile {
    pub fn compile(profile: &Profile) -> Result<Self, FilterError> {
        let filters = profile
            .filters
            .iter()
            .cloned()
            .map(CompiledFilter::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { filters })
    }

    #[must_use]
    pub fn filters(&self) -> &[CompiledFilter] {
        &self.filters
    }

    /// All distinct walk bases the walker (C1) should be asked to
    /// enumerate for this profile (§4.1 "dirs").
    #[must_use]
    pub fn walk_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.filters.iter().map(|f| f.walk_base().to_string()).collect();
        dirs.sort();
        dirs.dedup();
        dirs
    }

    /// The first filter (in profile order) that matches `path`, if any.
    #[must_use]
    pub fn matching(&self, path: &str) -> Option<&CompiledFilter> {
        self.filters.iter().find(|f| f.matches(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Behavior;

    #[test]
    fn walk_dirs_are_deduped_and_sorted() {
        let profile = Profile {
            filters: vec![
                Filter {
                    path: "/bin".into(),
                    regex: ".*".into(),
                    recursive: true,
                    behavior: Behavior::Monitor,
                    customer_added: true,
                    derived_group: String::new(),
                },
                Filter {
                    path: "/etc/passwd".into(),
                    regex: String::new(),
                    recursive: false,
                    behavior: Behavior::Block,
                    customer_added: false,
                    derived_group: String::new(),
                },
            ],
        };
        let compiled = CompiledProfile::compile(&profile).unwrap();
        assert_eq!(compiled.walk_dirs(), vec!["/bin".to_string(), "/etc".to_string()]);
    }
}
