use crate::config::TransportConfig;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[cfg_attr(test, automock)]
pub trait PingCallbacks: Send + Sync {
    /// sends a PING packet and returns its packet id
    fn send_ping(&self) -> u16;

    /// sends a command the client has to answer, to get traffic flowing again
    fn send_recovery_command(&self);
}

pub struct PingConfig {
    pub interval: Duration,
    pub timeout: Duration,
}

impl From<&TransportConfig> for PingConfig {
    fn from(config: &TransportConfig) -> Self {
        PingConfig {
            interval: config.ping_interval,
            timeout: config.ping_timeout,
        }
    }
}

#[derive(Default)]
struct PingState {
    last_ping_id: Option<u16>,
    last_request: Option<Instant>,
    last_response: Option<Instant>,
    last_command_acknowledge: Option<Instant>,
    current_ping: Option<Duration>,
    recovery_sent: bool,
}

/// Keeps a connection alive and measures its round trip time.
///
/// NB: This never closes the connection. A peer that stays silent is detected by the resend
///  timeout of the next reliable packet.
pub struct PingHandler {
    config: PingConfig,
    callbacks: Arc<dyn PingCallbacks>,
    state: Mutex<PingState>,
}

impl PingHandler {
    pub fn new(config: PingConfig, callbacks: Arc<dyn PingCallbacks>) -> PingHandler {
        PingHandler {
            config,
            callbacks,
            state: Default::default(),
        }
    }

    pub fn reset(&self) {
        *self.state.lock() = PingState::default();
    }

    /// the round trip time of the last answered ping
    pub fn current_ping(&self) -> Option<Duration> {
        self.state.lock().current_ping
    }

    pub fn tick(&self, now: Instant) {
        let mut state = self.state.lock();

        let last_sign_of_life = match (state.last_response, state.last_command_acknowledge) {
            (Some(a), Some(b)) => a.max(b),
            (a, b) => a.or(b).unwrap_or(now),
        };
        if state.last_response.is_none() {
            // start of monitoring counts as a response
            state.last_response = Some(last_sign_of_life);
        }

        if state.last_request.map_or(true, |t| now.saturating_duration_since(t) >= self.config.interval) {
            let ping_id = self.callbacks.send_ping();
            trace!("sent ping {}", ping_id);
            state.last_ping_id = Some(ping_id);
            state.last_request = Some(now);
        }

        if !state.recovery_sent && now.saturating_duration_since(last_sign_of_life) >= self.config.timeout {
            debug!("no response for {:?} - sending recovery command", now.saturating_duration_since(last_sign_of_life));
            self.callbacks.send_recovery_command();
            state.recovery_sent = true;
        }
    }

    pub fn received_pong(&self, ping_id: u16, now: Instant) {
        let mut state = self.state.lock();
        if state.last_ping_id != Some(ping_id) {
            trace!("pong for ping {} which is not the current ping ({:?}) - ignoring", ping_id, state.last_ping_id);
            return;
        }

        if let Some(request) = state.last_request {
            state.current_ping = Some(now.saturating_duration_since(request));
        }
        state.last_ping_id = None;
        state.last_response = Some(now);
        state.recovery_sent = false;
    }

    pub fn received_command_acknowledged(&self, now: Instant) {
        let mut state = self.state.lock();
        state.last_command_acknowledge = Some(now);
        state.recovery_sent = false;
    }
}
