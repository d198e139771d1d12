//! Handler trait - Task を実行する Handler の定義
//!
//! - ジェネリック trait (Handler<T>)
//! - Object-safe trait (DynHandler)
//! - Type erasure (TypedHandler<T, H> → DynHandler)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::task::Task;
use crate::app::TaskContext;
use crate::domain::{ConveyorError, Outcome};

/// Handler は Task を実行して Outcome を返す
///
/// `Err(ConveyorError::PoisonPayload(_))` は即 dead letter、
/// それ以外の `Err` は `Outcome::failure` と同じ扱い（リトライ対象）。
///
/// 長い処理は `ctx.cancelled()` か `ctx.is_cancelled()` で打ち切りを確認すること。
/// 期限を過ぎた future は consumer 側で drop される。
///
/// ```ignore
/// struct RetryPaymentHandler;
///
/// #[async_trait]
/// impl Handler<RetryPayment> for RetryPaymentHandler {
///     async fn handle(&self, task: RetryPayment, ctx: TaskContext) -> Result<Outcome, ConveyorError> {
///         gateway.retry(&task.payment_id).await?;
///         Ok(Outcome::success())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler<T: Task>: Send + Sync {
    async fn handle(&self, task: T, ctx: TaskContext) -> Result<Outcome, ConveyorError>;
}

/// DynHandler は object-safe な Handler
///
/// HashMap<String, Arc<dyn DynHandler>> に格納するための型消去レイヤー。
#[async_trait]
pub trait DynHandler: Send + Sync {
    /// payload を T にデコードできなければ `PoisonPayload`
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<Outcome, ConveyorError>;

    fn kind(&self) -> &'static str;
}

pub struct TypedHandler<T: Task, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Task, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Task, H: Handler<T>> DynHandler for TypedHandler<T, H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: TaskContext,
    ) -> Result<Outcome, ConveyorError> {
        let task: T = serde_json::from_value(payload)
            .map_err(|e| ConveyorError::PoisonPayload(format!("{}: {e}", T::KIND)))?;
        self.handler.handle(task, ctx).await
    }

    fn kind(&self) -> &'static str {
        T::KIND
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::fixtures::RetryPaymentHandler;
    use super::*;
    use crate::domain::{OutcomeKind, TaskId, TaskKind};
    use crate::typed::task::fixtures::RetryPayment;
    use serde_json::json;
    use ulid::Ulid;

    fn ctx() -> TaskContext {
        let (ctx, _cancel) = TaskContext::new(
            TaskId::from_ulid(Ulid::new()),
            TaskKind::new(RetryPayment::KIND),
            1,
            Duration::from_secs(5),
        );
        ctx
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let handler = TypedHandler::<RetryPayment, _>::new(RetryPaymentHandler);

        let payload = json!({ "payment_id": "pay_1", "amount": 100 });
        let outcome = handler.handle_dyn(payload, ctx()).await.unwrap();
        assert_eq!(outcome.kind, OutcomeKind::Success);
        assert_eq!(outcome.result, Some(json!({ "retried": "pay_1" })));
        assert_eq!(handler.kind(), "retry_payment");
    }

    #[tokio::test]
    async fn undecodable_payload_is_poison() {
        let handler = TypedHandler::<RetryPayment, _>::new(RetryPaymentHandler);

        let err = handler
            .handle_dyn(json!({ "payment_id": 7 }), ctx())
            .await
            .unwrap_err();
        assert!(matches!(err, ConveyorError::PoisonPayload(_)));
    }
}
