/// Audit macro for identity gate decisions.
///
/// Wraps `tracing::info!` and adds `audit=true`, `auditType="iap"` and the
/// current request context to the event.
///
/// ```ignore
/// audit!(outcome = "rejected", reason = %err, "IAP assertion rejected");
/// ```
#[macro_export]
macro_rules! audit {
    ($($arg:tt)+) => {
        $crate::middleware::with_request_info(|ctx| {
            tracing::info!(
                audit = true,
                auditType = "iap",
                endpoint = %ctx.endpoint,
                host = %ctx.host,
                httpMethod = %ctx.method,
                requestId = %ctx.request_id,
                $($arg)+
            )
        })
    };
}
