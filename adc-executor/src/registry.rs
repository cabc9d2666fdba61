use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::ExecutorError;

type BoxedHandler = Arc<
    dyn Fn(
            Vec<serde_json::Value>,
        ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, ExecutorError>> + Send>>
        + Send
        + Sync,
>;

/// Dispatcher table built at registration time: method name → handler.
///
/// A distributed module registers each of its methods here once; the
/// worker pool and the IPC server both dispatch through the table, so
/// call interception needs no runtime reflection.
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<String, BoxedHandler>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a method handler.
    pub fn register<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Vec<serde_json::Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<serde_json::Value, ExecutorError>> + Send + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Arc::new(move |args| Box::pin(handler(args))),
        );
        self
    }

    /// Invoke a method in-process.
    pub async fn dispatch(
        &self,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let handler = self
            .methods
            .get(method)
            .ok_or_else(|| ExecutorError::UnknownMethod(method.to_string()))?;
        handler(args).await
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn method_names(&self) -> Vec<&str> {
        self.methods.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dispatches_registered_methods() {
        let registry = MethodRegistry::new().register("sum", |args| async move {
            let total: i64 = args.iter().filter_map(|v| v.as_i64()).sum();
            Ok(serde_json::json!(total))
        });

        let result = registry
            .dispatch("sum", vec![serde_json::json!(2), serde_json::json!(3)])
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!(5));
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let registry = MethodRegistry::new();
        let err = registry.dispatch("ghost", vec![]).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnknownMethod(_)));
    }
}
