//! Actuator contract and the sport-mode velocity implementation.

/// Velocity sinks: in-memory simulation and JSON-lines bridge.
pub mod sinks;

use std::{
    fmt,
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::errors::ActuatorError;

/// Minimum number of zero frames sent by an emergency stop.
pub const MIN_EMERGENCY_REPEATS: u32 = 3;

/// Robot executing named movement commands.
///
/// Calls are synchronous. Implementations must be safe to call concurrently;
/// the emergency stop in particular may race any other call.
pub trait Actuator: Send + Sync {
    /// Backend name for status reporting.
    fn backend(&self) -> &str;
    /// Opens the connection. Returns whether the actuator is now connected.
    fn connect(&self) -> bool;
    /// Stops and closes the connection.
    fn disconnect(&self);
    /// Whether commands will be delivered.
    fn is_connected(&self) -> bool;
    /// Executes a named command. `None` uses the backend's default speed.
    fn execute(&self, command: &str, speed: Option<f64>) -> Result<(), ActuatorError>;
    /// Halts all movement.
    fn stop(&self) -> Result<(), ActuatorError>;
    /// Halts all movement, resending the stop to raise delivery confidence.
    fn emergency_stop(&self) -> Result<(), ActuatorError>;
}

/// Movement vocabulary understood by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MovementCommand {
    /// Walk forward.
    Forward,
    /// Turn clockwise.
    Right,
    /// Turn counter-clockwise.
    Left,
    /// Spin in place; used instead of walking backwards.
    Rotate,
    /// Stand still.
    Idle,
}

impl MovementCommand {
    /// Parses a command name; surrounding whitespace and case are ignored.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match title_case(name.trim()).as_str() {
            "Forward" => Some(Self::Forward),
            "Right" => Some(Self::Right),
            "Left" => Some(Self::Left),
            "Rotate" => Some(Self::Rotate),
            "Idle" => Some(Self::Idle),
            _ => None,
        }
    }

    /// Canonical label.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Forward => "Forward",
            Self::Right => "Right",
            Self::Left => "Left",
            Self::Rotate => "Rotate",
            Self::Idle => "Idle",
        }
    }

    /// Velocity `[vx, vy, vyaw]` for the given speed.
    #[must_use]
    pub fn velocity(self, speed: f64) -> [f64; 3] {
        match self {
            Self::Forward => [speed, 0.0, 0.0],
            Self::Right => [0.0, 0.0, -speed],
            Self::Left | Self::Rotate => [0.0, 0.0, speed],
            Self::Idle => [0.0, 0.0, 0.0],
        }
    }
}

impl fmt::Display for MovementCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

fn title_case(raw: &str) -> String {
    let mut chars = raw.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect()
    })
}

/// Sport-mode command envelope as published to the robot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SportModeFrame {
    /// Controller mode; 2 selects velocity walking.
    pub mode: u8,
    /// Gait; 1 is trot.
    pub gait_type: u8,
    /// `[forward, lateral, yaw]` in m/s and rad/s.
    pub velocity: [f64; 3],
    /// Unused position target.
    pub position: [f64; 2],
    /// Body height offset.
    pub body_height: f64,
    /// Foot raise height offset.
    pub foot_raise_height: f64,
}

impl SportModeFrame {
    /// Velocity frame in trot gait.
    #[must_use]
    pub const fn velocity(vx: f64, vy: f64, vyaw: f64) -> Self {
        Self {
            mode: 2,
            gait_type: 1,
            velocity: [vx, vy, vyaw],
            position: [0.0, 0.0],
            body_height: 0.0,
            foot_raise_height: 0.0,
        }
    }

    /// All-zero velocity frame.
    #[must_use]
    pub const fn zero() -> Self {
        Self::velocity(0.0, 0.0, 0.0)
    }

    /// Whether the frame commands no motion.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.velocity.iter().all(|component| component.abs() < f64::EPSILON)
    }
}

/// Transport that delivers frames to a robot or a stand-in.
pub trait VelocitySink: Send + Sync {
    /// Sink name.
    fn name(&self) -> &str;
    /// Prepares the transport.
    fn open(&self) -> Result<(), ActuatorError>;
    /// Delivers one frame.
    fn send(&self, frame: &SportModeFrame) -> Result<(), ActuatorError>;
    /// Releases the transport.
    fn close(&self) {}
}

/// Speeds and emergency behaviour of a [`SportModeActuator`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActuatorProfile {
    /// Default forward speed in m/s.
    pub forward_speed: f64,
    /// Default turn rate in rad/s.
    pub turn_speed: f64,
    /// Zero frames sent on emergency stop; raised to at least three.
    pub emergency_repeats: u32,
    /// Pause between emergency frames.
    pub emergency_spacing: Duration,
}

impl Default for ActuatorProfile {
    fn default() -> Self {
        Self {
            forward_speed: 0.3,
            turn_speed: 0.5,
            emergency_repeats: MIN_EMERGENCY_REPEATS,
            emergency_spacing: Duration::from_millis(10),
        }
    }
}

/// Maps named commands to sport-mode velocity frames on a [`VelocitySink`].
///
/// Every send holds the internal mutex, so frames reach the sink in the order
/// the calls were made.
pub struct SportModeActuator<S> {
    sink: S,
    profile: ActuatorProfile,
    connected: AtomicBool,
    last_frame: Mutex<Option<SportModeFrame>>,
}

impl<S: VelocitySink> fmt::Debug for SportModeActuator<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SportModeActuator")
            .field("sink", &self.sink.name())
            .field("connected", &self.connected.load(Ordering::SeqCst))
            .finish()
    }
}

impl<S: VelocitySink> SportModeActuator<S> {
    /// Creates a disconnected actuator.
    #[must_use]
    pub fn new(sink: S, profile: ActuatorProfile) -> Self {
        Self {
            sink,
            profile,
            connected: AtomicBool::new(false),
            last_frame: Mutex::new(None),
        }
    }

    /// Underlying sink.
    #[must_use]
    pub const fn sink(&self) -> &S {
        &self.sink
    }

    /// Most recent frame delivered.
    #[must_use]
    pub fn last_frame(&self) -> Option<SportModeFrame> {
        *self.last_frame.lock()
    }

    fn send(&self, frame: SportModeFrame) -> Result<(), ActuatorError> {
        let mut last = self.last_frame.lock();
        if !self.connected.load(Ordering::SeqCst) {
            warn!(backend = self.sink.name(), "actuator not connected, frame dropped");
            return Err(ActuatorError::NotConnected);
        }
        self.sink.send(&frame).map_err(|err| {
            error!(backend = self.sink.name(), %err, "failed to send frame");
            err
        })?;
        *last = Some(frame);
        Ok(())
    }

    fn default_speed(&self, command: MovementCommand) -> f64 {
        match command {
            MovementCommand::Forward => self.profile.forward_speed,
            _ => self.profile.turn_speed,
        }
    }
}

impl<S: VelocitySink> Actuator for SportModeActuator<S> {
    fn backend(&self) -> &str {
        self.sink.name()
    }

    fn connect(&self) -> bool {
        if self.connected.load(Ordering::SeqCst) {
            return true;
        }
        match self.sink.open() {
            Ok(()) => {
                self.connected.store(true, Ordering::SeqCst);
                info!(backend = self.sink.name(), "actuator connected");
                true
            }
            Err(err) => {
                error!(backend = self.sink.name(), %err, "actuator connection failed");
                false
            }
        }
    }

    fn disconnect(&self) {
        if self.connected.load(Ordering::SeqCst) {
            let _ = self.stop();
            self.connected.store(false, Ordering::SeqCst);
            self.sink.close();
            info!(backend = self.sink.name(), "actuator disconnected");
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn execute(&self, command: &str, speed: Option<f64>) -> Result<(), ActuatorError> {
        let parsed = MovementCommand::parse(command).ok_or_else(|| {
            warn!(command, "unknown command");
            ActuatorError::UnknownCommand(command.to_string())
        })?;
        if parsed == MovementCommand::Idle {
            return self.stop();
        }
        let speed = speed.unwrap_or_else(|| self.default_speed(parsed));
        let [vx, vy, vyaw] = parsed.velocity(speed);
        info!(command = parsed.label(), speed, "executing movement");
        self.send(SportModeFrame::velocity(vx, vy, vyaw))
    }

    fn stop(&self) -> Result<(), ActuatorError> {
        info!(backend = self.sink.name(), "stopping");
        self.send(SportModeFrame::zero())
    }

    fn emergency_stop(&self) -> Result<(), ActuatorError> {
        error!(backend = self.sink.name(), "EMERGENCY STOP");
        let repeats = self.profile.emergency_repeats.max(MIN_EMERGENCY_REPEATS);
        let mut outcome = Ok(());
        for attempt in 0..repeats {
            if let Err(err) = self.send(SportModeFrame::zero()) {
                outcome = Err(err);
            }
            if attempt + 1 < repeats {
                thread::sleep(self.profile.emergency_spacing);
            }
        }
        outcome
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Counting actuator for dispatcher and service tests.

    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::Actuator;
    use crate::errors::ActuatorError;

    #[derive(Debug, Default)]
    pub struct CountingActuator {
        pub connected: AtomicBool,
        pub executes: AtomicUsize,
        pub stops: AtomicUsize,
        pub emergencies: AtomicUsize,
        pub commands: Mutex<Vec<String>>,
    }

    impl CountingActuator {
        pub fn connected() -> Self {
            let actuator = Self::default();
            actuator.connected.store(true, Ordering::SeqCst);
            actuator
        }

        pub fn executes(&self) -> usize {
            self.executes.load(Ordering::SeqCst)
        }

        pub fn stops(&self) -> usize {
            self.stops.load(Ordering::SeqCst)
        }

        pub fn emergencies(&self) -> usize {
            self.emergencies.load(Ordering::SeqCst)
        }

        fn ensure_connected(&self) -> Result<(), ActuatorError> {
            if self.connected.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ActuatorError::NotConnected)
            }
        }
    }

    impl Actuator for CountingActuator {
        fn backend(&self) -> &str {
            "counting"
        }

        fn connect(&self) -> bool {
            self.connected.store(true, Ordering::SeqCst);
            true
        }

        fn disconnect(&self) {
            self.connected.store(false, Ordering::SeqCst);
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        fn execute(&self, command: &str, _speed: Option<f64>) -> Result<(), ActuatorError> {
            self.ensure_connected()?;
            self.executes.fetch_add(1, Ordering::SeqCst);
            self.commands.lock().push(command.to_string());
            Ok(())
        }

        fn stop(&self) -> Result<(), ActuatorError> {
            self.ensure_connected()?;
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn emergency_stop(&self) -> Result<(), ActuatorError> {
            self.ensure_connected()?;
            self.emergencies.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
