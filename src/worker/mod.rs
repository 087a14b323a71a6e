//! Engine worker processes: spawning, output scanning and port reservation.

pub mod codec;
pub mod ports;
pub mod readiness;
pub mod supervisor;

pub use ports::{PortAllocator, PortLease};
pub use supervisor::{ReadyOutcome, WorkerHandle, WorkerState, WorkerSupervisor};
