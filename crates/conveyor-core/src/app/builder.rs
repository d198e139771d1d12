//! AppBuilder - ハンドラ登録と起動時検証
//!
//! - Builder パターン
//! - 起動時検証（Fail-fast 設計）

use std::sync::Arc;

use crate::typed::{Handler, RegistryError, Task, TypedRegistry};

/// AppBuilder はハンドラを集めて App を作る
///
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<RetryPayment, _>(RetryPaymentHandler)?
///     .expect_kinds(&["retry_payment", "webhook"])
///     .build()?;
/// ```
///
/// expect_kinds() で期待される kind を宣言すると、build() 時に
/// 「期待集合 ⊆ 登録済み集合」をチェックし、不足があれば BuildError を返す。
pub struct AppBuilder {
    registry: TypedRegistry,
    expected_kinds: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task kinds: {0:?}. These kinds were expected but not registered.")]
    MissingKinds(Vec<String>),
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TypedRegistry::new(),
            expected_kinds: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        if let Some(expected) = &self.expected_kinds {
            let registered = self.registry.registered_kinds();
            let missing: Vec<String> = expected
                .iter()
                .filter(|kind| !registered.contains(kind))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }
        Ok(App {
            registry: Arc::new(self.registry),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// App は検証済みのハンドラ集合
///
/// Consumer はこれを共有して kind → handler を引く。
#[derive(Clone)]
pub struct App {
    pub registry: Arc<TypedRegistry>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::fixtures::RetryPaymentHandler;
    use crate::typed::task::fixtures::{RetryPayment, Webhook};

    #[test]
    fn build_success() {
        let app = AppBuilder::new()
            .register::<RetryPayment, _>(RetryPaymentHandler)
            .unwrap()
            .expect_kinds(&[RetryPayment::KIND])
            .build();
        assert!(app.is_ok());
    }

    #[test]
    fn build_reports_missing_kinds() {
        let app = AppBuilder::new()
            .register::<RetryPayment, _>(RetryPaymentHandler)
            .unwrap()
            .expect_kinds(&[RetryPayment::KIND, Webhook::KIND])
            .build();
        assert!(matches!(
            app,
            Err(BuildError::MissingKinds(missing)) if missing == vec![Webhook::KIND.to_string()]
        ));
    }

    #[test]
    fn build_without_expectations() {
        let app = AppBuilder::new()
            .register::<RetryPayment, _>(RetryPaymentHandler)
            .unwrap()
            .build()
            .unwrap();
        assert!(app.registry.get(RetryPayment::KIND).is_some());
    }
}
