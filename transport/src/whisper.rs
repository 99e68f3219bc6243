use crate::command::{CommandError, ErrorCode};
use crate::config::TransportConfig;
#[cfg(test)] use mockall::automock;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace};

pub type ChannelId = u64;
pub type ClientId = u16;

/// audio stream id of whisper sessions in the audio router
pub const WHISPER_STREAM_ID: u32 = 2;

/// sequence id (u16) and codec (u8) precede the whisper header
const VOICE_PREFIX_LEN: usize = 3;
const NEW_HEADER_LEN: usize = 10;

/// A connected client as far as whisper target resolution is concerned
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhisperCandidate {
    pub client_id: ClientId,
    pub channel_id: ChannelId,
    pub server_groups: Vec<u64>,
    pub channel_group: u64,
    pub channel_commander: bool,
    /// `None` if the client has no audio connection
    pub rtc_client_id: Option<u32>,
}

/// The server's view of its clients and channels
#[cfg_attr(test, automock)]
pub trait WhisperDirectory: Send + Sync {
    fn clients(&self) -> Vec<WhisperCandidate>;
    fn client_channel(&self, client_id: ClientId) -> Option<ChannelId>;
    fn parent_channel(&self, channel_id: ChannelId) -> Option<ChannelId>;
}

/// The audio router that forwards a speaker's whisper stream to its targets
#[cfg_attr(test, automock)]
pub trait WhisperRouter: Send + Sync {
    fn configure_whisper_session(&self, speaker: u32, stream_id: u32, targets: &[u32]) -> anyhow::Result<()>;
    fn reset_whisper_session(&self, speaker: u32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WhisperType {
    Echo = 0,
    All = 1,
    ServerGroup = 2,
    ChannelGroup = 3,
    ChannelCommander = 4,
}

impl TryFrom<u8> for WhisperType {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WhisperType::Echo),
            1 => Ok(WhisperType::All),
            2 => Ok(WhisperType::ServerGroup),
            3 => Ok(WhisperType::ChannelGroup),
            4 => Ok(WhisperType::ChannelCommander),
            _ => Err(CommandError::parameter_invalid("type")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WhisperTarget {
    ChannelAll = 0,
    ChannelCurrent = 1,
    ChannelParent = 2,
    ChannelAllParent = 3,
    ChannelFamily = 4,
    ChannelCompleteFamily = 5,
    ChannelSubchannels = 6,
}

impl TryFrom<u8> for WhisperTarget {
    type Error = CommandError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(WhisperTarget::ChannelAll),
            1 => Ok(WhisperTarget::ChannelCurrent),
            2 => Ok(WhisperTarget::ChannelParent),
            3 => Ok(WhisperTarget::ChannelAllParent),
            4 => Ok(WhisperTarget::ChannelFamily),
            5 => Ok(WhisperTarget::ChannelCompleteFamily),
            6 => Ok(WhisperTarget::ChannelSubchannels),
            _ => Err(CommandError::parameter_invalid("target")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    InitializeFailed,
    Initialized,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WhisperOutcome<'a> {
    /// the session is set up, forward the voice data following the whisper header
    Forward(&'a [u8]),
    /// malformed packet, or the session is not usable
    Drop,
    /// setting up the session failed; the client should be told
    InitializeFailed(CommandError),
}

pub struct WhisperConfig {
    pub refresh_interval: Duration,
    pub retry_interval: Duration,
    pub max_targets: usize,
}

impl From<&TransportConfig> for WhisperConfig {
    fn from(config: &TransportConfig) -> Self {
        WhisperConfig {
            refresh_interval: config.whisper_refresh,
            retry_interval: config.whisper_retry,
            max_targets: config.max_whisper_targets,
        }
    }
}

struct SessionData {
    state: SessionState,
    /// header of the packet that the session was last set up for
    last_header: Vec<u8>,
    timestamp: Option<Instant>,
}

/// Caches the resolved audience of a client's whisper packets. Clients repeat the same whisper
///  header for every packet, so the (expensive) target resolution only happens when the header
///  changes, or periodically to pick up clients joining or leaving the target set.
pub struct WhisperHandler {
    config: WhisperConfig,
    client_id: ClientId,
    rtc_client_id: u32,
    directory: Arc<dyn WhisperDirectory>,
    router: Arc<dyn WhisperRouter>,
    session: Mutex<SessionData>,
}

impl WhisperHandler {
    pub fn new(config: WhisperConfig, client_id: ClientId, rtc_client_id: u32, directory: Arc<dyn WhisperDirectory>, router: Arc<dyn WhisperRouter>) -> WhisperHandler {
        WhisperHandler {
            config,
            client_id,
            rtc_client_id,
            directory,
            router,
            session: Mutex::new(SessionData {
                state: SessionState::Uninitialized,
                last_header: Vec::new(),
                timestamp: None,
            }),
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.lock().state
    }

    /// `payload` is the packet payload, starting with the voice sequence id and codec
    pub fn process_packet<'a>(&self, new_protocol: bool, payload: &'a [u8], now: Instant) -> WhisperOutcome<'a> {
        let header_len = match whisper_header_len(new_protocol, payload) {
            Some(len) => len,
            None => {
                trace!("whisper packet too short");
                return WhisperOutcome::Drop;
            }
        };
        let header = &payload[VOICE_PREFIX_LEN..VOICE_PREFIX_LEN + header_len];
        let voice_data = &payload[VOICE_PREFIX_LEN + header_len..];

        let mut session = self.session.lock();
        let header_matches = session.last_header == header;
        if !header_matches {
            session.last_header.clear();
            session.last_header.extend_from_slice(header);
        }

        let elapsed = session.timestamp.map(|t| now.saturating_duration_since(t));
        match session.state {
            SessionState::Uninitialized => {}
            SessionState::InitializeFailed => {
                if header_matches && elapsed.map_or(false, |e| e < self.config.retry_interval) {
                    return WhisperOutcome::Drop;
                }
            }
            SessionState::Initialized => {
                if header_matches && elapsed.map_or(false, |e| e <= self.config.refresh_interval) {
                    return WhisperOutcome::Forward(voice_data);
                }
            }
        }

        session.timestamp = Some(now);
        let result = if new_protocol {
            let whisper_type = header[0];
            let target = header[1];
            let type_id = u64::from_be_bytes(header[2..NEW_HEADER_LEN].try_into().unwrap_or_default());
            self.initialize_session_new(whisper_type, target, type_id)
        }
        else {
            let channel_count = header[0] as usize;
            let client_count = header[1] as usize;
            let channel_ids = header[2..2 + channel_count * 8]
                .chunks_exact(8)
                .map(|c| u64::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
                .collect::<Vec<_>>();
            let client_ids = header[2 + channel_count * 8..2 + channel_count * 8 + client_count * 2]
                .chunks_exact(2)
                .map(|c| u16::from_be_bytes([c[0], c[1]]))
                .collect::<Vec<_>>();
            self.initialize_session_old(&channel_ids, &client_ids)
        };

        match result {
            Ok(()) => {
                session.state = SessionState::Initialized;
                WhisperOutcome::Forward(voice_data)
            }
            Err(e) => {
                trace!("whisper session initialisation failed: {}", e);
                session.state = SessionState::InitializeFailed;
                WhisperOutcome::InitializeFailed(e)
            }
        }
    }

    /// forgets the cached session, the next packet resolves its targets again
    pub fn reset_session(&self) {
        let mut session = self.session.lock();
        session.state = SessionState::Uninitialized;
        session.last_header = Vec::new();
        session.timestamp = None;
    }

    /// asks the router to drop the session; it confirms through [WhisperHandler::reset_session]
    pub fn signal_session_reset(&self) {
        self.router.reset_whisper_session(self.rtc_client_id);
    }

    fn other_clients(&self) -> impl Iterator<Item = WhisperCandidate> + '_ {
        self.directory.clients()
            .into_iter()
            .filter(move |c| c.client_id != self.client_id && c.rtc_client_id.is_some())
    }

    fn initialize_session_old(&self, channel_ids: &[ChannelId], client_ids: &[ClientId]) -> Result<(), CommandError> {
        let targets = self.other_clients()
            .filter(|c| channel_ids.contains(&c.channel_id) || client_ids.contains(&c.client_id))
            .collect::<Vec<_>>();
        self.configure_router(&targets)
    }

    fn initialize_session_new(&self, whisper_type: u8, target: u8, type_id: u64) -> Result<(), CommandError> {
        let whisper_type = WhisperType::try_from(whisper_type)?;

        if whisper_type == WhisperType::Echo {
            return self.configure_router_ids(&[self.rtc_client_id]);
        }

        let target = WhisperTarget::try_from(target)?;

        let mut targets = self.other_clients()
            .filter(|c| match whisper_type {
                WhisperType::All => true,
                WhisperType::ServerGroup => type_id == 0 || c.server_groups.contains(&type_id),
                WhisperType::ChannelGroup => c.channel_group == type_id,
                WhisperType::ChannelCommander => c.channel_commander,
                WhisperType::Echo => false,
            })
            .collect::<Vec<_>>();

        let own_channel = self.directory.client_channel(self.client_id);
        match (target, own_channel) {
            (WhisperTarget::ChannelAll, _) => {}
            (_, None) => targets.clear(),
            (WhisperTarget::ChannelCurrent, Some(own)) => targets.retain(|c| c.channel_id == own),
            (WhisperTarget::ChannelParent, Some(own)) => match self.directory.parent_channel(own) {
                Some(parent) => targets.retain(|c| c.channel_id == parent),
                None => targets.clear(),
            },
            (WhisperTarget::ChannelAllParent, Some(own)) => match self.directory.parent_channel(own) {
                Some(parent) => targets.retain(|c| self.is_ancestor_or_self(c.channel_id, parent)),
                None => targets.clear(),
            },
            (WhisperTarget::ChannelFamily, Some(own)) => targets.retain(|c| self.is_ancestor_or_self(own, c.channel_id)),
            (WhisperTarget::ChannelCompleteFamily, Some(own)) => {
                let mut root = own;
                while let Some(parent) = self.directory.parent_channel(root) {
                    root = parent;
                }
                targets.retain(|c| self.is_ancestor_or_self(root, c.channel_id));
            }
            (WhisperTarget::ChannelSubchannels, Some(own)) => targets.retain(|c| self.directory.parent_channel(c.channel_id) == Some(own)),
        }

        self.configure_router(&targets)
    }

    /// true if `ancestor` is `channel` or one of its parents
    fn is_ancestor_or_self(&self, ancestor: ChannelId, channel: ChannelId) -> bool {
        let mut current = Some(channel);
        while let Some(c) = current {
            if c == ancestor {
                return true;
            }
            current = self.directory.parent_channel(c);
        }
        false
    }

    fn configure_router(&self, targets: &[WhisperCandidate]) -> Result<(), CommandError> {
        let ids = targets.iter()
            .filter_map(|c| c.rtc_client_id)
            .collect::<Vec<_>>();
        self.configure_router_ids(&ids)
    }

    fn configure_router_ids(&self, targets: &[u32]) -> Result<(), CommandError> {
        if targets.len() >= self.config.max_targets {
            return Err(CommandError::new(ErrorCode::WhisperTooManyTargets));
        }
        if targets.is_empty() {
            return Err(CommandError::new(ErrorCode::WhisperNoTargets));
        }

        if let Err(e) = self.router.configure_whisper_session(self.rtc_client_id, WHISPER_STREAM_ID, targets) {
            error!("failed to configure whisper session with {} participants: {}", targets.len(), e);
            return Err(CommandError::with_extra(ErrorCode::VsCritical, e.to_string()));
        }
        trace!("configured whisper session with {} participants", targets.len());
        Ok(())
    }
}

/// length of the whisper header after the voice prefix, `None` if the payload is too short
fn whisper_header_len(new_protocol: bool, payload: &[u8]) -> Option<usize> {
    let header_len = if new_protocol {
        NEW_HEADER_LEN
    }
    else {
        let channel_count = *payload.get(VOICE_PREFIX_LEN)? as usize;
        let client_count = *payload.get(VOICE_PREFIX_LEN + 1)? as usize;
        2 + channel_count * 8 + client_count * 2
    };

    if payload.len() < VOICE_PREFIX_LEN + header_len {
        return None;
    }
    Some(header_len)
}
