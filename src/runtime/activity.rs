use async_trait::async_trait;

use crate::ActivityError;

/// Trait implemented by activity handlers that can be invoked by the runtime.
///
/// Activities receive only their input; they have no access to orchestration
/// state. Returning `ActivityError::Transient` asks the dispatcher to retry.
#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, ActivityError>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, ActivityError> {
        (self.0)(input).await
    }
}
