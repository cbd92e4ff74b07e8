//! Connector contracts, resolution and implementations.
//!
//! - [`base`]: role traits, metadata/output envelopes, connector classes
//! - [`registry`]: name -> lazily resolved connector class
//! - [`factory`]: role- and version-checked construction
//! - [`storage`]: reference connector over a `KvStore`
//! - [`multi`]: composite connector over prioritized sub-connectors

pub mod base;
pub mod factory;
pub mod multi;
pub mod registry;
pub mod storage;

pub use base::{
    BackendStats, BuildContext, ConnectorClass, ConnectorInstance, ConnectorMetadata, ConnectorOutput,
    ConnectorRole, LayerLoadOutcome, RequestInfo, RuntimeVersion, SchedulerConnector,
    TransferEvent, WorkerConnector,
};
pub use factory::ConnectorFactory;
pub use registry::{ConnectorRegistry, ModuleCatalog};
