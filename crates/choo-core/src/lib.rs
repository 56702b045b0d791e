pub mod config;
pub mod events;
pub mod frontmatter;
pub mod graph;
pub mod types;

pub use config::{BaselineCheck, Config, ProviderConfig, ProviderOverride};
pub use events::{EventType, GraphEdge, GraphNode, GraphPayload, WireEvent};
pub use graph::DepGraph;
pub use types::{
    EventRecord, Run, RunId, RunStatus, TaskMeta, TaskStatus, UnitMeta, UnitRecord, UnitStatus,
};
