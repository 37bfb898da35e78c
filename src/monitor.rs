use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::{debug, error};
use tokio::time::{interval, MissedTickBehavior};

use crate::types::{CancelReceiver, SharedService};
use crate::util::get_short_token;

/// Counts live monitor loops for as long as it is held.
pub(crate) struct CycleGuard(Arc<AtomicUsize>);

impl CycleGuard {
    pub(crate) fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Runs one evaluation immediately, then one per tick, until cancelled or
/// superseded by a newer generation.
pub async fn start_monitoring_loop(
    service: SharedService,
    subject_id: String,
    generation: u64,
    mut cancel_rx: CancelReceiver,
) {
    let _guard = service.enter_cycle();
    let short_subject = get_short_token(&subject_id);
    let mut ticker = interval(service.config().tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!("monitor:: subject ...{short_subject} generation {generation} started");

    loop {
        tokio::select! {
            biased;
            _ = cancel_rx.recv() => {
                debug!("monitor:: subject ...{short_subject} generation {generation} canceled");
                break;
            }
            _ = ticker.tick() => {}
        }

        match service.run_cycle(&subject_id, generation).await {
            Ok(report) if report.cancelled => {
                debug!("monitor:: subject ...{short_subject} generation {generation} superseded");
                break;
            }
            Ok(report) => debug!("monitor:: subject ...{short_subject} cycle: {report:?}"),
            Err(e) => error!("monitor:: subject ...{short_subject} cycle failed: {e}"),
        }
    }
}
