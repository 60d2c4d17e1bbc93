//! Persistence seam
//!
//! A unit of work runs a closure against a private copy of one group
//! aggregate and the shared registry. The copy is written back only when the
//! closure returns `Ok`, so a failed operation leaves nothing behind.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{GroupAggregate, Registry};

#[async_trait]
pub trait Store: Send + Sync {
    /// Persist a freshly created group. Fails if the id is taken.
    async fn insert_group(&self, aggregate: GroupAggregate) -> Result<()>;

    async fn group_ids(&self) -> Result<Vec<Uuid>>;

    async fn load_group(&self, group_id: Uuid) -> Result<GroupAggregate>;

    async fn registry(&self) -> Result<Registry>;

    /// Serialized per group; concurrent callers on the same group queue up.
    async fn update_group<T, F>(&self, group_id: Uuid, f: F) -> Result<T>
    where
        F: FnOnce(&mut GroupAggregate, &Registry) -> Result<T> + Send,
        T: Send;

    async fn update_registry<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Registry) -> Result<T> + Send,
        T: Send;
}
