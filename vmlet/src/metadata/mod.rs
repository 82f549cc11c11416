//! Durable sandbox and container metadata.
//!
//! Every mutation goes through a read-modify-write closure executed inside
//! one store transaction, so callers never race between a read and the
//! write that depends on it.

mod sqlite;
mod types;

use std::collections::HashSet;

use vmlet_shared::errors::VmletResult;

pub use sqlite::SqliteMetadataStore;
pub use types::{
    ContainerFilter, ContainerRecord, ContainerState, PodSandboxConfig, PodSandboxMetadata,
    PodSandboxRecord, PortMapping, Protocol, SandboxFilter, SandboxState, now_nanos,
};

/// Read-modify-write step: gets the current record (`None` if absent) and
/// returns the record to store, or `None` to delete it. An error aborts the
/// transaction.
pub type UpdateFn<'a, R> = Box<dyn FnOnce(Option<R>) -> VmletResult<Option<R>> + Send + 'a>;

pub trait MetadataStore: Send + Sync {
    fn sandbox(&self, id: &str) -> VmletResult<Option<PodSandboxRecord>>;

    /// Apply `f` to the sandbox `id` atomically and return what was stored.
    fn update_sandbox(
        &self,
        id: &str,
        f: UpdateFn<'_, PodSandboxRecord>,
    ) -> VmletResult<Option<PodSandboxRecord>>;

    fn list_sandboxes(&self, filter: &SandboxFilter) -> VmletResult<Vec<PodSandboxRecord>>;

    fn container(&self, id: &str) -> VmletResult<Option<ContainerRecord>>;

    /// Apply `f` to the container `id` atomically and return what was stored.
    fn update_container(
        &self,
        id: &str,
        f: UpdateFn<'_, ContainerRecord>,
    ) -> VmletResult<Option<ContainerRecord>>;

    fn list_containers(&self, filter: &ContainerFilter) -> VmletResult<Vec<ContainerRecord>>;

    /// Image names referenced by any container.
    fn images_in_use(&self) -> VmletResult<HashSet<String>> {
        Ok(self
            .list_containers(&ContainerFilter::default())?
            .into_iter()
            .map(|c| c.image)
            .collect())
    }
}
