//! Task trait - 型付き Task の定義
//!
//! `KIND` がそのままキュー上の `TaskKind` になり、payload は serde_json で保存されます。

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Task は kind と payload の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct RetryPayment {
///     payment_id: String,
/// }
///
/// impl Task for RetryPayment {
///     const KIND: &'static str = "retry_payment";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// ハンドラを選ぶための識別子（例: `retry_payment`, `webhook`）
    const KIND: &'static str;
}
