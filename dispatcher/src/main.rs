//! Dispatcher Service - Entry Point
//!
//! Paces and routes queued jobs to per-session task queues, consumed by one
//! task per connected WhatsApp session, with SmartGuard auto-tuning RPM
//! within each session's trust-policy ceiling.

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dispatcher::run().await
}
