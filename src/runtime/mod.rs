//! Runtime adapters (tokio spawner, sweeper) and request-facing API.

pub mod api;
pub mod sweeper;
pub mod tokio_spawner;

pub use api::{health, list_labs, ApiError, Health, LabSnapshot};
pub use sweeper::{spawn_sweeper, SweeperHandle};
pub use tokio_spawner::TokioSpawner;
