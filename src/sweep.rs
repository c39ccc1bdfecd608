use std::sync::Arc;

use log::{error, info};
use tokio::sync::Mutex;
use tokio::time::{self, Duration};

use crate::engine::Engine;

/// Periodically recomputes every segment so age-driven scores keep moving even
/// when no new defects arrive.
#[derive(Clone)]
pub struct PrioritySweep {
    engine: Engine,
    interval: Duration,
    running: Arc<Mutex<bool>>,
}

impl PrioritySweep {
    pub fn new(engine: Engine, interval_secs: u64) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(interval_secs.max(1)),
            running: Arc::new(Mutex::new(false)),
        }
    }

    /// Runs forever; the first sweep fires one interval after start.
    pub async fn start(self) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            self.run_once().await;
        }
    }

    /// One sweep, skipped when the previous one is still going.
    pub async fn run_once(&self) -> Option<usize> {
        {
            let mut running = self.running.lock().await;
            if *running {
                info!("Priority sweep already in progress, skipping");
                return None;
            }
            *running = true;
        }

        info!("Starting priority sweep");
        let written = match self.engine.recompute_all().await {
            Ok(written) => {
                info!("Priority sweep wrote {} scores", written);
                Some(written)
            }
            Err(e) => {
                error!("Priority sweep failed: {}", e);
                None
            }
        };

        *self.running.lock().await = false;
        written
    }
}
