//! Domain model (IDs, tasks, queue records, leases, outcomes, ...).

pub mod decision;
pub mod entry;
pub mod errors;
pub mod ids;
pub mod lease;
pub mod outcome;
pub mod stream;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use entry::{AckEntry, AckRecord, DeadLetter, QueueEntry};
pub use errors::{ConveyorError, ErrorKind};
pub use ids::{IdParseError, LeaseToken, TaskId};
pub use lease::{ClaimLease, Claimed, ConsumerId, StreamLease};
pub use outcome::{DrainCheckpoint, DurableRecord, FinalStatus, Outcome, OutcomeKind};
pub use stream::{InvalidStreamName, Offset, StreamName};
pub use task::{Task, TaskKind, TaskStatus};
