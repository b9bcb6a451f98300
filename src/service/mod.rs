pub use app_error::{AppError, AppResult};
pub use config::{
    ConsumerConfig, DeadLetterConfig, GeneralConfig, OffsetsConfig, PartitionerKind, PauseConfig,
    ProcessingConfig, VirtualPartitionsConfig,
};
pub use shutdown::{Shutdown, ShutdownCause};
pub use tracing_config::{setup_local_tracing, setup_tracing, TracingGuard};

mod app_error;
mod config;
mod shutdown;
mod tracing_config;
