//! Filter/profile declarative types and the filter engine (C2) that
//! turns a profile plus a directory-walk enumeration into a concrete
//! list of watch targets (§4.2).

mod compiled;
mod filter;
pub mod engine;
mod profile;
mod target;

pub use compiled::{CompiledFilter, FilterError};
pub use engine::WalkResult;
pub use filter::{Behavior, Filter};
pub use profile::{CompiledProfile, PolicyMode, Profile};
pub use target::{ContentHash, FileInfoExt, FileMode};
