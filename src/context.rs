use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::proxy::sender_receiver_proxy::SenderReceiverProxy;

pub const DEFAULT_JOB_NAME: &str = "Anonymous_job";

/// Everything a party process holds for one job. The host runtime owns the context and calls
///  [PartyContext::shutdown] as part of its own lifecycle management.
pub struct PartyContext {
    job_name: String,
    current_party: String,
    proxy: Arc<SenderReceiverProxy>,
    is_shut_down: AtomicBool,
}

impl PartyContext {
    pub fn new(job_name: Option<&str>, proxy: Arc<SenderReceiverProxy>) -> PartyContext {
        PartyContext {
            job_name: job_name.unwrap_or(DEFAULT_JOB_NAME).to_string(),
            current_party: proxy.self_party().to_string(),
            proxy,
            is_shut_down: AtomicBool::new(false),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn current_party(&self) -> &str {
        &self.current_party
    }

    pub fn proxy(&self) -> &Arc<SenderReceiverProxy> {
        &self.proxy
    }

    pub fn is_shut_down(&self) -> bool {
        self.is_shut_down.load(Ordering::Acquire)
    }

    /// Stops the proxy. Only the first call has an effect.
    pub async fn shutdown(&self) {
        if self.is_shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down job {} for party {}", self.job_name, self.current_party);
        self.proxy.stop().await;
    }
}
