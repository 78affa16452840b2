// 中继核心：缓冲区、会话选项、协议策略、会话、重试、租户队列

pub mod buffer;
pub mod error;
pub mod options;
pub mod protocol;
pub mod queue;
pub mod retry;
pub mod service;
pub mod session;

pub use buffer::{Chunk, RelayBuffer, RelayBufferError};
pub use error::RelayError;
pub use options::{HttpMethod, Protocol, SessionOptions};
pub use protocol::{ObjectStoreClient, ProtocolStrategy, RelayContext, S3Client};
pub use queue::TenantWorkQueue;
pub use retry::{Attempt, RetryOrchestrator};
pub use service::{RelayRejection, RelayService};
pub use session::{SessionState, TransferSession};
