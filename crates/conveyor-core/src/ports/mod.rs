//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（クラスタ化されたキュー、リレーショナル DB）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! - キュー（QueueBackend）はトランスポートであり、drain 元
//! - DurableStore が正本（system of record）

pub mod clock;
pub mod durable_store;
pub mod id_generator;
pub mod queue_backend;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::durable_store::{DurableStore, StoreError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::queue_backend::{ClaimRequest, QueueBackend, QueueError};
