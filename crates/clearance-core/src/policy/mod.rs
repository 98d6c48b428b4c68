//! Policy definitions and the hot-reloadable registry.
//!
//! Policy files are structured data validated against an embedded JSON
//! Schema, then checked for value rules (unique ids, thresholds in [0, 1]).

mod definition;
mod registry;
mod schema;

pub use definition::{
    ConfigError, PolicyDefinition, PolicyFile, PolicySetDefinition, PolicySource, DEFAULT_TASK,
    IMPLICIT_POLICY_SET,
};
pub use registry::{PolicyRegistry, PolicySnapshot, ResolvedPolicySet};
