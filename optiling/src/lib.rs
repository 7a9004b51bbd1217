pub mod common;
pub mod dispatcher;
pub mod error;
pub mod ops;
pub mod plan;
pub mod platform;
pub mod registry;
pub mod utils;
pub mod workload;

// Re-exported for the `shape!` macro.
pub use smallvec;

pub use dispatcher::TilingDispatcher;
pub use error::TilingError;
pub use plan::TilingPlan;
pub use platform::MemoryHierarchyDescriptor;
pub use registry::{default_registry, TilingTemplateRegistry};
pub use workload::{AttrValue, OperatorWorkload};
