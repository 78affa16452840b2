// 事件模块：线上事件类型、事件总线、进度去重

pub mod bus;
pub mod progress;
pub mod types;

pub use bus::{topics, EventBus, Handler, LocalEventBus, SubscriptionId};
pub use progress::ProgressGate;
pub use types::{
    percentage, BusMessage, ErrorPayload, ProgressPayload, QueuedPayload, RelayEvent,
    ResponseInfo, SerializedError, SuccessPayload,
};
