use std::{path::Path, sync::Arc, time::Duration};

use eyre::Result;
use tokio::{signal, task::JoinHandle, time::timeout};

use crate::{
    config::{Config, EventLogConfig, QueueConfig},
    defs::Mode,
    device::{DeviceState, Dispatcher},
    emitter::{AlarmPolicy, Emitter},
    event_log::{EventLog, FileSink},
    queue::{QueueEvents, QueueLink},
    scheduler::Scheduler,
    server::{self, AppState},
};

const SERVICE: &str = concat!(env!("CARGO_PKG_NAME"), " REST API");

pub async fn launch(path: &Path) -> Result<()> {
    let config = Config::load(path).await?;
    tracing::info!("Loaded config\n{config}");

    let (log, sink) = open_event_log(&config.event_log).await;
    let device_id = config.device.id.as_str();

    let queue = match &config.queue {
        Some(queue) => prepare_queue(queue, device_id, &log),
        None => {
            log.append("Queue channel not configured");
            None
        }
    };

    let mut emitter = Emitter::new(log.clone(), AlarmPolicy::new(config.thresholds.alarm_speed))
        .with_publish_timeout(config.timing.publish_timeout);

    if let Some((link, ..)) = &queue {
        emitter = emitter.with_publisher(link.clone());
    }

    let emitter = Arc::new(emitter);
    let (dispatcher, controller) =
        Dispatcher::spawn(DeviceState::new(device_id), emitter.clone(), log.clone());

    let scheduler = Scheduler::spawn(
        config.timing.status_interval,
        dispatcher.subscribe(),
        emitter.clone(),
    );

    let queue = match queue {
        Some((link, events, connect_timeout)) => {
            let task = events.spawn(dispatcher.clone(), log.clone());

            match link.wait_connected(connect_timeout).await {
                Ok(()) => {
                    // Announce the initial state before periodic reporting starts
                    emitter.emit(&dispatcher.snapshot()).await;
                    scheduler.arm();
                    Some((link, task))
                }

                Err(error) => {
                    log.append(format!("Queue channel unavailable: {error}"));
                    task.abort();
                    None
                }
            }
        }

        None => None,
    };

    let socket = if config.http.enabled {
        server::bind(config.http.bind)
            .await
            .inspect_err(|error| log.append(format!("REST channel unavailable: {error}")))
            .ok()
    } else {
        None
    };

    let mode = Mode::new(socket.is_some(), queue.is_some());

    if mode.is_degraded() {
        tracing::warn!("Running in degraded mode");
    }

    log.append(format!("Device {device_id} online ({mode})"));

    match socket {
        Some(socket) => {
            let router = server::create_router(AppState {
                dispatcher: dispatcher.clone(),
                status: Arc::new(dispatcher.clone()),
                log: log.clone(),
                mode,
                service: SERVICE.to_owned(),
            });

            if let Err(error) = server::listen(socket, router, shutdown_signal()).await {
                log.append(format!("REST channel failed: {error}"));
                shutdown_signal().await;
            }
        }

        None => shutdown_signal().await,
    }

    tracing::info!("Shutting down");

    let limit = config.timing.shutdown_timeout;

    go_offline(device_id, &dispatcher, scheduler, &emitter, &log, limit).await;

    if let Some((link, task)) = queue {
        release_queue(&link, task, limit).await;
    }

    stop_controller(dispatcher, controller, limit).await;

    log.append(format!("Device {device_id} stopped"));

    if let Some(sink) = sink {
        sink.flush().await;
    }

    Ok(())
}

/// Closes command intake and periodic reporting, then sends the final
/// offline status. Nothing is published after it.
async fn go_offline(
    device_id: &str,
    dispatcher: &Dispatcher,
    scheduler: Scheduler,
    emitter: &Emitter,
    log: &EventLog,
    limit: Duration,
) {
    scheduler.disarm();
    scheduler.stop().await;
    dispatcher.close().await;

    match emitter.emit_offline(device_id, limit).await {
        Ok(()) => log.append("Sent offline status"),
        Err(error) => log.append(format!("Failed to send offline status: {error}")),
    }
}

async fn open_event_log(config: &EventLogConfig) -> (EventLog, Option<FileSink>) {
    let Some(path) = &config.path else {
        return (EventLog::new(config.capacity), None);
    };

    match FileSink::open(path).await {
        Ok(sink) => (EventLog::with_sink(config.capacity, sink.clone()), Some(sink)),
        Err(error) => {
            tracing::warn!("Event log file {} unavailable: {error}", path.display());
            (EventLog::new(config.capacity), None)
        }
    }
}

fn prepare_queue(
    config: &QueueConfig,
    device_id: &str,
    log: &EventLog,
) -> Option<(Arc<QueueLink>, QueueEvents, Duration)> {
    match QueueLink::connect(config, device_id) {
        Ok((link, events)) => Some((Arc::new(link), events, config.connect_timeout)),
        Err(error) => {
            log.append(format!("Queue channel disabled: {error}"));
            None
        }
    }
}

async fn release_queue(link: &QueueLink, task: JoinHandle<()>, limit: Duration) {
    if let Err(error) = link.disconnect(limit).await {
        tracing::warn!("{error}");
    }

    task.abort();
}

/// Closes the command channel and waits for the controller to drain it.
async fn stop_controller(dispatcher: Dispatcher, controller: JoinHandle<()>, limit: Duration) {
    drop(dispatcher);

    match timeout(limit, controller).await {
        Ok(Ok(())) => {}
        Ok(Err(error)) => tracing::error!("Device controller failed: {error}"),
        Err(_) => tracing::warn!("Device controller did not stop within {limit:?}"),
    }
}

async fn shutdown_signal() {
    if let Err(error) = signal::ctrl_c().await {
        tracing::error!("Failed to listen for interrupt: {error}");
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        defs::{Command, Source, StateCode},
        emitter::tests::RecordingPublisher,
        scheduler::DEFAULT_STATUS_INTERVAL,
    };

    use super::*;

    const DEVICE: &str = "fan-001";
    const LIMIT: Duration = Duration::from_secs(2);

    #[tokio::test(start_paused = true)]
    async fn test_offline_status_is_final_publish() {
        let log = EventLog::default();
        let publisher = Arc::new(RecordingPublisher::default());
        let emitter = Arc::new(
            Emitter::new(log.clone(), AlarmPolicy::default()).with_publisher(publisher.clone()),
        );

        let (dispatcher, controller) =
            Dispatcher::spawn(DeviceState::new(DEVICE), emitter.clone(), log.clone());
        let scheduler = Scheduler::spawn(DEFAULT_STATUS_INTERVAL, dispatcher.subscribe(), emitter.clone());
        scheduler.arm();

        dispatcher.dispatch(Command::new(DEVICE, "Start"), Source::Queue);
        dispatcher.flush().await;

        go_offline(DEVICE, &dispatcher, scheduler, &emitter, &log, LIMIT).await;

        // Arrives after the offline status, as a queue message still in flight would
        dispatcher.dispatch(Command::new(DEVICE, "SetSpeed").with_speed(2.0), Source::Queue);
        tokio::time::sleep(DEFAULT_STATUS_INTERVAL * 3).await;

        stop_controller(dispatcher, controller, LIMIT).await;

        let statuses = publisher.statuses.lock().unwrap().clone();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].state, StateCode::Running);
        assert_eq!(statuses[1].state, StateCode::Offline);

        let messages: Vec<_> = log.recent().into_iter().map(|entry| entry.message).collect();
        assert_eq!(messages[0], "Command via queue dropped, controller stopped");
        assert!(messages.iter().any(|message| message == "Sent offline status"));
    }

    #[tokio::test]
    async fn test_event_log_without_path_has_no_sink() {
        let (log, sink) = open_event_log(&EventLogConfig::default()).await;

        assert!(sink.is_none());
        log.append("kept in memory");
        assert_eq!(log.recent().len(), 1);
    }
}
