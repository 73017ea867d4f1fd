use std::{sync::Arc, time::Duration};

use tokio::{
    select,
    sync::watch,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{device::DeviceState, emitter::Emitter};

pub const DEFAULT_STATUS_INTERVAL: Duration = Duration::from_secs(5);

/// Emits the current device status on a fixed period while armed.
///
/// Holds no device data of its own: each tick reads the latest snapshot
/// and runs it through the emitter.
pub struct Scheduler {
    armed: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Scheduler {
    pub fn spawn(
        period: Duration,
        state: watch::Receiver<DeviceState>,
        emitter: Arc<Emitter>,
    ) -> Self {
        let (armed, armed_rx) = watch::channel(false);
        let task = tokio::spawn(Self::tick_task(period, armed_rx, state, emitter));

        Self { armed, task }
    }

    pub fn arm(&self) {
        if !self.armed.send_replace(true) {
            tracing::debug!("Status scheduler armed");
        }
    }

    pub fn disarm(&self) {
        if self.armed.send_replace(false) {
            tracing::debug!("Status scheduler disarmed");
        }
    }

    pub fn is_armed(&self) -> bool {
        *self.armed.borrow()
    }

    /// Stops the tick task and waits until it is gone, so no emission can
    /// start afterwards.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
    }

    async fn tick_task(
        period: Duration,
        mut armed: watch::Receiver<bool>,
        state: watch::Receiver<DeviceState>,
        emitter: Arc<Emitter>,
    ) {
        // Outer loop waits to be armed, inner loop ticks until disarmed
        while armed.wait_for(|armed| *armed).await.is_ok() {
            let mut timer = interval_at(Instant::now() + period, period);

            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                select! {
                    changed = armed.changed() => {
                        if changed.is_err() || !*armed.borrow_and_update() {
                            break;
                        }
                    }

                    _ = timer.tick() => {
                        let snapshot = state.borrow().clone();
                        emitter.emit(&snapshot).await;
                    }
                }
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
