use std::{fmt, sync::Arc};

use eyre::Result;

use crate::defs::{Source, StatusEvent};

pub use self::dispatcher::{Dispatcher, SETTLE_DELAY};

pub mod dispatcher;

pub const MIN_SPEED: f64 = 0.1;
pub const MAX_SPEED: f64 = 3.0;
pub const DEFAULT_SPEED: f64 = 1.0;

/* === Definitions === */

/// Authoritative run/speed record of the fan.
///
/// The mutators are pure transition rules: they never log or publish, they
/// only report what happened so the dispatcher can decide on side effects.
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceState {
    device_id: Arc<str>,
    running: bool,
    speed: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Transition {
    Started { speed: f64 },
    AlreadyRunning,
    Stopped,
    AlreadyStopped,
    SpeedSet { speed: f64 },
    SpeedPreset { speed: f64 },
    SpeedRejected { value: f64 },
}

/// Read access to the current device status, injected into the inbound
/// adapters.
pub trait StatusProvider: Send + Sync {
    fn current_status(&self) -> Result<StatusEvent>;
}

/* === Implementations === */

impl DeviceState {
    pub fn new(device_id: impl Into<Arc<str>>) -> Self {
        Self {
            device_id: device_id.into(),
            running: false,
            speed: DEFAULT_SPEED,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn running(&self) -> bool {
        self.running
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }

    /// The speed that currently drives the fan, if it is running.
    pub fn active_speed(&self) -> Option<f64> {
        self.running.then_some(self.speed)
    }

    pub fn accepts_speed(value: f64) -> bool {
        value.is_finite() && (MIN_SPEED..=MAX_SPEED).contains(&value)
    }

    pub fn start(&mut self) -> Transition {
        if self.running {
            return Transition::AlreadyRunning;
        }

        self.running = true;
        Transition::Started { speed: self.speed }
    }

    pub fn stop(&mut self) -> Transition {
        if !self.running {
            return Transition::AlreadyStopped;
        }

        self.running = false;
        Transition::Stopped
    }

    pub fn set_speed(&mut self, value: f64) -> Transition {
        if !Self::accepts_speed(value) {
            return Transition::SpeedRejected { value };
        }

        self.speed = value;

        match self.running {
            true => Transition::SpeedSet { speed: value },
            false => Transition::SpeedPreset { speed: value },
        }
    }
}

impl Transition {
    /// Whether the transition changed the emitted state of the device.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Transition::Started { .. } | Transition::Stopped | Transition::SpeedSet { .. }
        )
    }

    pub fn describe(&self, source: Source) -> String {
        Described(self, source).to_string()
    }
}

struct Described<'a>(&'a Transition, Source);

impl fmt::Display for Described<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Described(transition, source) = self;

        match transition {
            Transition::Started { speed } => write!(f, "Fan started at {speed:.2} via {source}"),
            Transition::AlreadyRunning => write!(f, "Fan already running"),
            Transition::Stopped => write!(f, "Fan stopped via {source}"),
            Transition::AlreadyStopped => write!(f, "Fan already stopped"),
            Transition::SpeedSet { speed } => write!(f, "Speed set to {speed:.2} via {source}"),
            Transition::SpeedPreset { speed } => {
                write!(f, "Speed preset to {speed:.2} (fan not running)")
            }
            Transition::SpeedRejected { value } => write!(
                f,
                "Invalid speed {value:.2} (must be {MIN_SPEED:.1}-{MAX_SPEED:.1})"
            ),
        }
    }
}
