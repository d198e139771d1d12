//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryQueueBackend**: 開発・テスト用のキュー（障害注入つき）
//! - **ShardedQueueBackend**: ストリーム名のハッシュで複数のバックエンドに振り分け
//! - **InMemoryDurableStore**: テスト用の正本（障害注入つき）
//! - **PostgresDurableStore**: 本番用の正本（feature `postgres`）

pub mod fault;
pub mod inmem_backend;
pub mod inmem_store;
#[cfg(feature = "postgres")]
pub mod postgres_store;
pub mod sharded_backend;

pub use self::fault::FaultInjector;
pub use self::inmem_backend::InMemoryQueueBackend;
pub use self::inmem_store::InMemoryDurableStore;
#[cfg(feature = "postgres")]
pub use self::postgres_store::PostgresDurableStore;
pub use self::sharded_backend::ShardedQueueBackend;
