pub mod bus;
pub mod consumer;
pub mod dlq;
pub mod error;
pub mod event;
pub mod outbox;
pub mod store;
pub mod stream;

pub use bus::{EventBus, Publisher};
pub use consumer::{ConsumerConfig, ConsumerInfo, EventHandler};
pub use dlq::DlqEnvelope;
pub use error::BusError;
pub use event::{Event, EventKind};
pub use store::{MemoryStreamStore, SqliteStreamStore, StoredEvent, StreamStats, StreamStore};
pub use stream::{StreamConfig, StreamStorage};
