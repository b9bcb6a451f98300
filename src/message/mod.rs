pub use batch::Batch;
pub use offset::{CommittedOffset, MarkEvent, OffsetMetadataStrategy, ReconciledOffset};
pub use record::{Headers, Message};
pub use topic_partition::TopicPartition;

mod batch;
mod offset;
mod record;
mod topic_partition;
