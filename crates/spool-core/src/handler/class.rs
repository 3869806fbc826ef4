//! JobClass trait - ジョブ引数の型と class_name の対応付け

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::NewJob;

/// JobClass は class_name と引数の型を対応付ける
///
/// # 使用例
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct SendInvoice {
///     invoice_id: u64,
/// }
///
/// impl JobClass for SendInvoice {
///     const CLASS: &'static str = "billing.send_invoice";
/// }
///
/// store.submit(SendInvoice { invoice_id: 7 }.to_new_job()?).await?;
/// ```
///
/// # Trait Bounds
/// - `Serialize`: submit 時に arguments (JSON) へ変換するため
/// - `DeserializeOwned`: 実行時に arguments から復元するため
/// - `Send + Sync + 'static`: worker の slot に move するため
pub trait JobClass: Serialize + DeserializeOwned + Send + Sync + 'static {
    const CLASS: &'static str;

    /// Queue used when the submitter does not pick one.
    const QUEUE: &'static str = crate::domain::DEFAULT_QUEUE_NAME;

    fn to_new_job(&self) -> Result<NewJob, serde_json::Error> {
        Ok(NewJob::new(Self::CLASS, serde_json::to_value(self)?).on_queue(Self::QUEUE))
    }
}
