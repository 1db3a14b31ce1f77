//! Partitioned destination table and its lock-or-defer front end.

pub mod deferred;
pub mod partition;
pub mod partitioned;
pub mod ticket;

pub use deferred::{DeferredOp, DeferredQueue, DeferredTable};
pub use partition::{Partition, MAX_AVG_CHAIN};
pub use partitioned::{PartitionedTable, DEFAULT_PARTITIONS};
pub use ticket::{Cancelled, Completer, Ticket, TicketState};
