//! App - アプリケーション層
//!
//! ports を組み合わせて producer / consumer / drainer を実装します。
//!
//! # 主要コンポーネント
//! - **AppBuilder**: ハンドラ登録と起動時検証
//! - **Producer**: タスクの enqueue（バックエンド障害はバックオフで再試行）
//! - **Consumer**: claim → handle → decide → ack/nack/dead letter
//! - **Drainer**: ack ストリームを正本ストアへ upsert し、チェックポイントを進める
//! - **DeadLetters**: 隔離タスクの一覧・replay・purge
//! - **Liveness**: ループの生存確認（起動順序のゲート）

pub mod builder;
pub mod consumer;
pub mod context;
pub mod dead_letter;
pub mod drainer;
pub mod health;
pub mod producer;

// 主要な型を再エクスポート
pub use self::builder::{App, AppBuilder, BuildError};
pub use self::consumer::{Consumer, ConsumerConfig, ConsumerHandle, Processed};
pub use self::context::{CancelHandle, TaskContext};
pub use self::dead_letter::DeadLetters;
pub use self::drainer::{DrainReport, Drainer, DrainerConfig, DrainerHandle};
pub use self::health::Liveness;
pub use self::producer::{Producer, ProducerConfig};
