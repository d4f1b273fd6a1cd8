//! Execution Engine
//!
//! Resolves a requirements manifest against a warm catalog of base images,
//! builds a one-shot image holding the decrypted code, and runs it in a
//! memory- and CPU-capped container without network access.

pub mod base_images;
pub mod catalog;
pub mod context;
pub mod docker;
pub mod monitor;
pub mod orchestrator;
pub mod resolver;
pub mod runtime;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use base_images::{BaseImageManager, BaseImageStatus, CatalogStatus};
pub use catalog::{CatalogEntry, ImageCatalog};
pub use docker::DockerRuntime;
pub use orchestrator::{
    ExecutionOutcome, ExecutionRequest, Orchestrator, OrchestratorConfig, PerformanceStats,
};
pub use resolver::{resolve, Manifest, Resolution};
pub use runtime::{ContainerRuntime, ContainerSpec, ImageDetails, ResourceSample};
