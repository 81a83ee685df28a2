//! CarbonPlane: Flowchart & Scope Registry
//!
//! Durable model of clients, flowcharts, process nodes, and their scope
//! descriptors with allocation percentages. The registry is the source of
//! truth the rest of the plane resolves scopes against: ingestion validates
//! streams here, the summary materialiser reads the node-metadata cache
//! built here, and the allocation engine reads process-chart percentages
//! declared here.

pub mod flowchart;
pub mod merge;
pub mod metadata;
pub mod registry;
pub mod scope;
pub mod store;
pub mod types;

pub use flowchart::{ChartKind, FlowEdge, FlowNode, Flowchart};
pub use merge::{merge_scopes, IncomingScope};
pub use metadata::{NodeMetadataCache, ScopeMeta};
pub use registry::{
    AllocationOutcome, AllocationShare, FlowchartRegistry, NodeUpdate, RegistryError,
    UpsertOutcome,
};
pub use scope::{CollectionFrequency, InputType, ScopeDescriptor};
pub use store::{FlowchartStore, InMemoryFlowchartStore, StoreError};
pub use types::{
    AssessmentLevel, Client, ClientId, ClientStore, InMemoryClientStore, NodeId, Principal, Role,
    ScopeUid,
};
