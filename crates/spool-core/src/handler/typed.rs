//! Handler trait - JobClass を実行する Handler の定義
//!
//! - ジェネリック trait (`Handler<J>`)
//! - Object-safe trait (`DynHandler`)
//! - Type erasure (`TypedHandler<J, H>` → `DynHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::class::JobClass;
use crate::domain::JobError;

/// Handler は JobClass の引数を受け取ってジョブ本体を実行する
///
/// # 使用例
/// ```ignore
/// struct SendInvoiceHandler;
///
/// #[async_trait]
/// impl Handler<SendInvoice> for SendInvoiceHandler {
///     async fn perform(&self, job: SendInvoice) -> Result<(), JobError> {
///         mailer.send(job.invoice_id).await.map_err(|e| JobError::new("MailerError", e.to_string()))
///     }
/// }
/// ```
///
/// `Handler<SendInvoice>` は `SendInvoice` しか受け取れない。
#[async_trait]
pub trait Handler<J: JobClass>: Send + Sync {
    async fn perform(&self, job: J) -> Result<(), JobError>;
}

/// DynHandler は object-safe な Handler
///
/// `HashMap<String, Arc<dyn DynHandler>>` に格納するための型消去レイヤー。
#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn perform_dyn(&self, arguments: serde_json::Value) -> Result<(), JobError>;
    fn class_name(&self) -> &'static str;
}

pub struct TypedHandler<J: JobClass, H: Handler<J>> {
    handler: H,
    _marker: PhantomData<fn() -> J>,
}

impl<J: JobClass, H: Handler<J>> TypedHandler<J, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<J: JobClass, H: Handler<J>> DynHandler for TypedHandler<J, H> {
    async fn perform_dyn(&self, arguments: serde_json::Value) -> Result<(), JobError> {
        let job: J = serde_json::from_value(arguments)
            .map_err(|e| JobError::new("DeserializationError", format!("{}: {e}", J::CLASS)))?;
        self.handler.perform(job).await
    }

    fn class_name(&self) -> &'static str {
        J::CLASS
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Greet {
        pub name: String,
    }

    impl JobClass for Greet {
        const CLASS: &'static str = "test.greet";
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct Explode {
        pub reason: String,
    }

    impl JobClass for Explode {
        const CLASS: &'static str = "test.explode";
    }

    #[derive(Default, Clone)]
    pub struct GreetHandler {
        pub performed: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler<Greet> for GreetHandler {
        async fn perform(&self, _job: Greet) -> Result<(), JobError> {
            self.performed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    pub struct ExplodeHandler;

    #[async_trait]
    impl Handler<Explode> for ExplodeHandler {
        async fn perform(&self, job: Explode) -> Result<(), JobError> {
            Err(JobError::new("ExplodeError", job.reason))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use serde_json::json;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn typed_handler_decodes_arguments() {
        let handler = GreetHandler::default();
        let typed = TypedHandler::<Greet, _>::new(handler.clone());

        typed.perform_dyn(json!({ "name": "ada" })).await.unwrap();

        assert_eq!(handler.performed.load(Ordering::SeqCst), 1);
        assert_eq!(typed.class_name(), "test.greet");
    }

    #[tokio::test]
    async fn undecodable_arguments_become_job_error() {
        let typed = TypedHandler::<Greet, _>::new(GreetHandler::default());

        let err = typed.perform_dyn(json!({ "nom": 1 })).await.unwrap_err();

        assert_eq!(err.class, "DeserializationError");
        assert!(err.message.starts_with("test.greet"));
    }

    #[tokio::test]
    async fn handler_error_is_passed_through() {
        let typed = TypedHandler::<Explode, _>::new(ExplodeHandler);

        let err = typed.perform_dyn(json!({ "reason": "boom" })).await.unwrap_err();

        assert_eq!(err, JobError::new("ExplodeError", "boom"));
    }
}
