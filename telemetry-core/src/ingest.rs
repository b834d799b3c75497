//! Inbound point handling (consumer role)

use crate::protocol::{AckResult, PointUpdate, ReceiveHandler};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Acknowledgement decision for one inbound value.
///
/// Every update is accepted today. Validation (range checks, rejecting
/// stale values) belongs here and only here.
pub fn decide(_point_id: u32, _previous: Option<f64>, _incoming: f64) -> AckResult {
    AckResult::Accepted
}

/// Callback target shared by every registered point
pub struct PointIngestHandler {
    log_every_nth: u64,
    received: AtomicU64,
}

impl PointIngestHandler {
    pub fn new(log_every_nth: u64) -> Self {
        Self {
            log_every_nth: log_every_nth.max(1),
            received: AtomicU64::new(0),
        }
    }

    /// Runs on the session's own task, so it must stay cheap
    pub fn handle(&self, update: &PointUpdate) -> AckResult {
        let count = self.received.fetch_add(1, Ordering::Relaxed) + 1;

        if count % self.log_every_nth == 0 {
            info!(
                "Received value {:.2} on point {} (cause {})",
                update.value,
                update.address,
                update.cause.code()
            );
        }

        let ack = decide(update.address, update.previous, update.value);
        debug!("point {} -> {:?}", update.address, ack);
        ack
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Wrap a shared handler as a session callback
    pub fn receive_handler(handler: Arc<Self>) -> ReceiveHandler {
        Arc::new(move |update: &PointUpdate| handler.handle(update))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Cause;
    use chrono::Utc;

    fn update(address: u32, previous: Option<f64>, value: f64) -> PointUpdate {
        PointUpdate {
            common_address: 1,
            address,
            previous,
            value,
            cause: Cause::Spontaneous,
            quality: 0,
            sent_at: Utc::now(),
        }
    }

    #[test]
    fn test_every_update_is_accepted() {
        assert_eq!(decide(1000, None, f64::NAN), AckResult::Accepted);
        assert_eq!(decide(1000, Some(1.0), -5.0), AckResult::Accepted);
    }

    #[test]
    fn test_handler_counts_updates() {
        let handler = Arc::new(PointIngestHandler::new(100));
        let callback = PointIngestHandler::receive_handler(handler.clone());

        for i in 0..250 {
            assert_eq!(callback(&update(1000 + i, None, i as f64)), AckResult::Accepted);
        }
        assert_eq!(handler.received(), 250);
    }

    #[test]
    fn test_handler_is_usable_across_threads() {
        let handler = Arc::new(PointIngestHandler::new(1));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let callback = PointIngestHandler::receive_handler(handler.clone());
                std::thread::spawn(move || {
                    for _ in 0..25 {
                        callback(&update(1000, Some(1.0), 2.0));
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        assert_eq!(handler.received(), 100);
    }
}
