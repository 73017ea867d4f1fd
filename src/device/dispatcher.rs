use std::{sync::Arc, time::Duration};

use eyre::{Result, bail};
use tokio::{
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};

use crate::{
    defs::{Action, Command, CommandError, Source, StatusEvent},
    emitter::Emitter,
    event_log::EventLog,
};

use super::{DeviceState, StatusProvider, Transition};

/// Quiet period after the last raw speed input before it is committed.
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/* === Definitions === */

/// Handle to the single task that owns the device state.
///
/// Every write (commands from any channel and raw speed input) is queued
/// to that task and applied one at a time. Reads go through a watch
/// channel that only ever holds fully applied states.
#[derive(Clone)]
pub struct Dispatcher {
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<DeviceState>,
    emitter: Arc<Emitter>,
    log: EventLog,
}

enum Message {
    Command(Command, Source),
    RawSpeed(f64),
    Flush(oneshot::Sender<()>),
    Close(oneshot::Sender<()>),
}

struct Controller {
    state: DeviceState,
    published: watch::Sender<DeviceState>,
    emitter: Arc<Emitter>,
    log: EventLog,
    pending: Option<Pending>,
}

/// A raw speed input waiting for the settle delay to elapse.
struct Pending {
    deadline: Instant,
    value: f64,
}

/* === Implementations === */

impl Dispatcher {
    pub fn spawn(state: DeviceState, emitter: Arc<Emitter>, log: EventLog) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (published, state_rx) = watch::channel(state.clone());

        let controller = Controller {
            state,
            published,
            emitter: emitter.clone(),
            log: log.clone(),
            pending: None,
        };

        let task = tokio::spawn(controller.run(rx));

        let dispatcher = Dispatcher {
            tx,
            state: state_rx,
            emitter,
            log,
        };

        (dispatcher, task)
    }

    /// Queues a command for the controller. Never fails: if the controller
    /// is gone the command is logged and dropped.
    pub fn dispatch(&self, command: Command, source: Source) {
        if self.tx.send(Message::Command(command, source)).is_err() {
            self.log
                .append(format!("Command via {source} dropped, controller stopped"));
        }
    }

    /// Continuous speed input, such as a slider. Applied immediately and
    /// committed once the input has been quiet for [`SETTLE_DELAY`].
    pub fn raw_speed_input(&self, value: f64) {
        if self.tx.send(Message::RawSpeed(value)).is_err() {
            tracing::warn!("Raw speed input dropped, controller stopped");
        }
    }

    /// Resolves once every message queued before this call was handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();

        if self.tx.send(Message::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Stops accepting input. Messages queued before this call are still
    /// applied; anything dispatched afterwards is dropped and logged. A
    /// pending raw input is discarded.
    pub async fn close(&self) {
        let (tx, rx) = oneshot::channel();

        if self.tx.send(Message::Close(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> DeviceState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<DeviceState> {
        self.state.clone()
    }

    pub fn is_available(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl StatusProvider for Dispatcher {
    fn current_status(&self) -> Result<StatusEvent> {
        if !self.is_available() {
            bail!("Device controller is not running");
        }

        Ok(self.emitter.status_for(&self.snapshot()))
    }
}

impl Controller {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        tracing::debug!("Controller started for {}", self.state.device_id());

        loop {
            let deadline = self.pending.as_ref().map(|p| p.deadline);

            select! {
                biased;

                message = rx.recv() => match message {
                    Some(Message::Close(done)) => {
                        rx.close();
                        self.pending = None;
                        let _ = done.send(());
                        break;
                    }

                    Some(message) => self.handle(message).await,
                    None => break,
                },

                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.settle().await;
                }
            }
        }

        tracing::debug!("Controller stopped");
    }

    async fn handle(&mut self, message: Message) {
        match message {
            Message::Command(command, source) => self.handle_command(command, source).await,
            Message::RawSpeed(value) => self.handle_raw_speed(value),
            Message::Flush(done) | Message::Close(done) => {
                let _ = done.send(());
            }
        }
    }

    async fn handle_command(&mut self, command: Command, source: Source) {
        if command.device_id != self.state.device_id() {
            self.log.append(format!(
                "Ignoring command for device {} via {source}",
                command.device_id
            ));
            return;
        }

        let transition = match self.apply(&command) {
            Ok(transition) => transition,
            Err(error) => {
                self.log
                    .append(format!("Malformed command via {source}: {error}"));
                return;
            }
        };

        // A committed discrete change supersedes an unsettled raw input
        if matches!(
            transition,
            Transition::Stopped | Transition::SpeedSet { .. } | Transition::SpeedPreset { .. }
        ) {
            self.pending = None;
        }

        self.publish_state();
        self.log.append(transition.describe(source));

        if transition.is_active() {
            self.emitter.emit(&self.state).await;
        }
    }

    fn apply(&mut self, command: &Command) -> Result<Transition, CommandError> {
        let transition = match command.action()? {
            Action::Start => self.state.start(),
            Action::Stop => self.state.stop(),
            Action::SetSpeed => self.state.set_speed(command.speed()?),
        };

        Ok(transition)
    }

    fn handle_raw_speed(&mut self, value: f64) {
        if let transition @ Transition::SpeedRejected { .. } = self.state.set_speed(value) {
            self.log.append(transition.describe(Source::Local));
            return;
        }

        self.publish_state();

        self.pending = Some(Pending {
            deadline: Instant::now() + SETTLE_DELAY,
            value,
        });
    }

    async fn settle(&mut self) {
        let Some(pending) = self.pending.take() else {
            return;
        };

        if self.state.running() {
            self.log
                .append(format!("Fan speed set to {:.2}", pending.value));
            self.emitter.emit(&self.state).await;
        } else {
            self.log
                .append(format!("Fan speed preset to {:.2}", pending.value));
        }
    }

    fn publish_state(&self) {
        self.published.send_replace(self.state.clone());
    }
}
