use anyhow::anyhow;
use sentry_core::protocol::SpanStatus;
use sentry_core::{Hub, TransactionContext};
use std::any::Any;
use std::future::Future;

/// Convert the payload of a caught panic into an error.
pub(crate) fn try_to_extract_panic_info(info: &(dyn Any + Send + 'static)) -> anyhow::Error {
    if let Some(message) = info.downcast_ref::<&'static str>() {
        anyhow!("job panicked: {message}")
    } else if let Some(message) = info.downcast_ref::<String>() {
        anyhow!("job panicked: {message}")
    } else {
        anyhow!("job panicked")
    }
}

/// Run `future` inside a sentry transaction named after the job type.
pub(crate) async fn with_sentry_transaction<F, R, E>(
    transaction_name: &str,
    future: F,
) -> Result<R, E>
where
    F: Future<Output = Result<R, E>>,
{
    let tx_ctx = TransactionContext::new(transaction_name, "delayed_job.perform");
    let tx = sentry_core::start_transaction(tx_ctx);

    Hub::current().configure_scope(|scope| scope.set_span(Some(tx.clone().into())));

    let result = future.await;

    tx.set_status(match result {
        Ok(_) => SpanStatus::Ok,
        Err(_) => SpanStatus::UnknownError,
    });
    tx.finish();

    result
}

/// Identity of worker number `index` in this process.
///
/// Identities are unique per worker task, so two workers of the same
/// process never share a lock.
pub fn worker_name(index: usize) -> String {
    format!("host:{} pid:{} worker:{index}", hostname(), std::process::id())
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/proc/sys/kernel/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
