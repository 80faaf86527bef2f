pub mod admission;
pub mod job;
pub mod queue;
pub mod registry;

pub use admission::{Admission, ClaimEngine, NodeLoad};
pub use job::{QueueEntry, RunRecord, RunStatus, CANCELLED_REASON};
pub use queue::LocalQueue;
pub use registry::{ContainerPhase, FinishedContainers, Registry, RegistryEntry};
