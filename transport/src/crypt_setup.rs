use crate::command::{build_ok_response, Command, CommandError, ErrorCode};
use crate::config::TransportConfig;
use crate::crypt_handler::{CryptHandler, SEED_LEN, SERVER_SEED_LEN_NEW};
use crate::error::CloseReason;
#[cfg(test)] use mockall::automock;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use parking_lot::Mutex;
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, trace, warn};

/// A license chain with a fresh ephemeral entry, as it is sent to clients using the licensed
///  protocol variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseChain {
    /// the exported chain
    pub chain: Vec<u8>,
    /// the chain's hash, signed with the server's identity key
    pub proof: Vec<u8>,
    pub root_key: Vec<u8>,
    /// private key belonging to the chain's ephemeral entry, opaque to the transport
    pub ephemeral_private_key: Vec<u8>,
}

/// The server's identity and license cryptography. It is owned by the server and passed to each
///  connection's setup handler.
#[cfg_attr(test, automock)]
pub trait KeyExchange: Send + Sync {
    /// the server's public identity key, as it is sent in `omega`
    fn server_public_key(&self) -> anyhow::Result<String>;

    /// checks that the client's public identity key can be imported
    fn validate_client_key(&self, client_key: &[u8]) -> anyhow::Result<()>;

    /// legacy protocol: key agreement between the server's and the client's identity keys
    fn shared_secret(&self, client_key: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn create_license_chain(&self) -> anyhow::Result<LicenseChain>;

    /// licensed protocol: key agreement between the chain's ephemeral key and the client's `ek`
    fn ephemeral_shared_secret(&self, chain: &LicenseChain, client_ek: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// checks `signature` of `digest` against the (exported) `public_key`
    fn verify_signature(&self, public_key: &[u8], digest: &[u8], signature: &[u8]) -> bool;
}

/// The parts of a connection that the setup handshake drives
#[cfg_attr(test, automock)]
pub trait SetupTransport: Send + Sync {
    /// Starts over with fresh crypto, packet ids, reassembly buffers and loss statistics. The
    ///  `clientinitiv` packet that triggered this counts as received.
    fn reset_for_handshake(&self);
    fn send_command(&self, command: &str);
    /// encrypts everything that is queued with the current key, before the key changes
    fn encrypt_pending_packets(&self);
    fn reset_acknowledges(&self);
    /// acknowledges a command packet with an *encrypted* acknowledge
    fn send_encrypted_acknowledge(&self, packet_id: u16);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// waiting for `clientinitiv`
    InitLow,
    /// crypto is set up, waiting for the identity handshake and `clientinit`
    InitHigh,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Begin,
    IdentityProof,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandHandleResult {
    /// not a setup command: hand it on to the regular command queue
    PassThrough,
    ConsumeCommand,
    CloseConnection(CloseReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum IdentityType {
    TeaSpeakForum = 0,
    TeamSpeak = 1,
    Nickname = 2,
}

impl IdentityType {
    fn from_id(id: u8) -> Option<IdentityType> {
        match id {
            0 => Some(IdentityType::TeaSpeakForum),
            1 => Some(IdentityType::TeamSpeak),
            2 => Some(IdentityType::Nickname),
            _ => None,
        }
    }
}

pub struct SetupConfig {
    pub allow_legacy_clients: bool,
    pub licensed_protocol: bool,
}

impl From<&TransportConfig> for SetupConfig {
    fn from(config: &TransportConfig) -> Self {
        SetupConfig {
            allow_legacy_clients: config.allow_legacy_clients,
            licensed_protocol: config.licensed_protocol,
        }
    }
}

struct SetupState {
    connection_state: ConnectionState,
    handshake_state: HandshakeState,
    teaspeak_client: bool,
    seed_client: Vec<u8>,
    seed_server: Vec<u8>,
    /// decoded `omega` of `clientinitiv`
    client_identity: Option<Vec<u8>>,
    license_chain: Option<LicenseChain>,
    /// public key announced in `handshakebegin`
    handshake_identity: Option<Vec<u8>>,
    proof_digest: Vec<u8>,
    last_command: Option<Instant>,
}

impl Default for SetupState {
    fn default() -> Self {
        SetupState {
            connection_state: ConnectionState::InitLow,
            handshake_state: HandshakeState::Begin,
            teaspeak_client: false,
            seed_client: Vec::new(),
            seed_server: Vec::new(),
            client_identity: None,
            license_chain: None,
            handshake_identity: None,
            proof_digest: Vec::new(),
            last_command: None,
        }
    }
}

enum SetupOutcome {
    /// handled, nothing to report to the client
    Silent(CommandHandleResult),
    /// handled, report success if the client asked for a `return_code`
    Ok,
}

/// Negotiates a connection's shared secret and the client's identity before regular commands
///  are accepted.
///
/// Setup commands are handled synchronously in the receive path, and the handler's lock
///  serializes them per connection. A failing setup command is answered with an `error`
///  command and closes the connection.
pub struct CryptSetupHandler {
    config: SetupConfig,
    crypt_handler: Arc<CryptHandler>,
    key_exchange: Arc<dyn KeyExchange>,
    transport: Arc<dyn SetupTransport>,
    state: Mutex<SetupState>,
}

impl CryptSetupHandler {
    pub fn new(config: SetupConfig, crypt_handler: Arc<CryptHandler>, key_exchange: Arc<dyn KeyExchange>, transport: Arc<dyn SetupTransport>) -> CryptSetupHandler {
        CryptSetupHandler {
            config,
            crypt_handler,
            key_exchange,
            transport,
            state: Default::default(),
        }
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.state.lock().connection_state
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state.lock().handshake_state
    }

    pub fn is_teaspeak_client(&self) -> bool {
        self.state.lock().teaspeak_client
    }

    /// the client's public identity key from `clientinitiv`
    pub fn client_identity(&self) -> Option<Vec<u8>> {
        self.state.lock().client_identity.clone()
    }

    /// `base64(sha1(omega))`
    pub fn client_unique_id(&self) -> Option<String> {
        self.state.lock().client_identity.as_ref()
            .map(|identity| BASE64.encode(Sha1::digest(BASE64.encode(identity))))
    }

    pub fn last_command(&self) -> Option<Instant> {
        self.state.lock().last_command
    }

    /// Back to the initial state, e.g. when the client reconnects on the same connection
    pub fn reset(&self) {
        *self.state.lock() = SetupState::default();
    }

    pub fn handle_command(&self, payload: &[u8]) -> CommandHandleResult {
        let name = command_name(payload);
        let mut state = self.state.lock();

        match name {
            b"clientinitiv" | b"clientek" | b"clientinit" | b"handshakebegin" | b"handshakeindentityproof" => {}
            b"clientdisconnect" => return CommandHandleResult::PassThrough,
            _ if state.connection_state == ConnectionState::Connected => return CommandHandleResult::PassThrough,
            _ => {
                trace!("command before the connection is set up");
                return self.report_error(CommandError::new(ErrorCode::ClientNotLoggedIn), None);
            }
        }

        state.last_command = Some(Instant::now());

        let command = match Command::parse_bytes(payload) {
            Ok(command) => command,
            Err(e) => {
                debug!("failed to parse setup command: {}", e);
                return CommandHandleResult::CloseConnection(CloseReason::ProtocolViolation(e.to_string()));
            }
        };

        let result = match command.name() {
            "clientinitiv" => self.handle_client_init_iv(&mut state, &command),
            "clientek" => self.handle_client_ek(&mut state, &command),
            "clientinit" => self.handle_client_init(&mut state),
            "handshakebegin" => self.handle_handshake_begin(&mut state, &command),
            _ => self.handle_handshake_identity_proof(&mut state, &command),
        };

        let return_code = command.get("return_code");
        match result {
            Ok(SetupOutcome::Silent(result)) => result,
            Ok(SetupOutcome::Ok) => {
                if return_code.is_some() {
                    self.transport.send_command(&build_ok_response(return_code).build());
                }
                CommandHandleResult::ConsumeCommand
            }
            Err(e) => self.report_error(e, return_code),
        }
    }

    fn report_error(&self, error: CommandError, return_code: Option<&str>) -> CommandHandleResult {
        debug!("setup command failed: {} - closing connection", error);
        self.transport.send_command(&error.build_response(return_code).build());
        CommandHandleResult::CloseConnection(CloseReason::ProtocolViolation(error.to_string()))
    }

    fn handle_client_init_iv(&self, state: &mut SetupState, command: &Command) -> Result<SetupOutcome, CommandError> {
        match state.connection_state {
            ConnectionState::InitLow => state.connection_state = ConnectionState::InitHigh,
            ConnectionState::InitHigh => {
                trace!("duplicated clientinitiv - our response has not reached the client yet");
                return Ok(SetupOutcome::Silent(CommandHandleResult::ConsumeCommand));
            }
            ConnectionState::Connected => {
                return Ok(SetupOutcome::Silent(CommandHandleResult::PassThrough));
            }
        }

        self.transport.reset_for_handshake();

        let use_teaspeak = command.has_trigger("teaspeak");
        if !use_teaspeak && !self.config.allow_legacy_clients {
            return Err(CommandError::new(ErrorCode::ClientTypeIsNotAllowed));
        }
        state.teaspeak_client = use_teaspeak;

        state.seed_client = decode_base64(command.require("alpha")?)
            .filter(|seed| seed.len() == SEED_LEN)
            .ok_or_else(|| CommandError::parameter_invalid("alpha"))?;

        let client_omega = decode_base64(command.require("omega")?)
            .ok_or_else(|| CommandError::parameter_invalid("omega"))?;
        if let Err(e) = self.key_exchange.validate_client_key(&client_omega) {
            debug!("failed to import client identity: {}", e);
            return Err(CommandError::new(ErrorCode::ClientCouldNotValidateIdentity));
        }
        state.client_identity = Some(client_omega.clone());

        let ot = command.get("ot") == Some("1");
        let licensed = !use_teaspeak && ot && self.config.licensed_protocol;

        state.seed_server = vec![0u8; if licensed { SERVER_SEED_LEN_NEW } else { SEED_LEN }];
        rand::thread_rng().fill_bytes(&mut state.seed_server);

        let server_public_key = self.key_exchange.server_public_key()
            .map_err(|e| {
                error!("failed to export server public key: {}", e);
                CommandError::with_extra(ErrorCode::VsCritical, "failed to export server public key")
            })?;

        if licensed {
            debug!("client uses the licensed protocol");
            let chain = self.key_exchange.create_license_chain()
                .map_err(|e| {
                    error!("failed to create license chain: {}", e);
                    CommandError::with_extra(ErrorCode::VsCritical, "failed to sign crypto chain")
                })?;

            let time = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default();

            let answer = Command::new("initivexpand2")
                .with("time", time)
                .with("l", BASE64.encode(&chain.chain))
                .with("beta", BASE64.encode(&state.seed_server))
                .with("omega", &server_public_key)
                .with("proof", BASE64.encode(&chain.proof))
                .with("tvd", "")
                .with("root", BASE64.encode(&chain.root_key))
                .with("ot", 1);
            self.transport.send_command(&answer.build());

            state.license_chain = Some(chain);
            // the license chain verifies the identity
            state.handshake_state = HandshakeState::Succeeded;
        }
        else {
            debug!("client uses the legacy protocol (teaspeak: {})", use_teaspeak);
            let mut answer = Command::new("initivexpand")
                .with("alpha", BASE64.encode(&state.seed_client))
                .with("beta", BASE64.encode(&state.seed_server))
                .with("omega", &server_public_key);

            if use_teaspeak {
                answer.set("teaspeak", 1);
                state.handshake_state = HandshakeState::Begin;
            }
            else {
                state.handshake_state = HandshakeState::Succeeded;
            }

            self.transport.send_command(&answer.build());
            // NB: the answer must go out with the old key
            self.transport.encrypt_pending_packets();

            let shared_secret = self.key_exchange.shared_secret(&client_omega)
                .map_err(|e| {
                    error!("failed to calculate shared secret: {}", e);
                    CommandError::new(ErrorCode::VsCritical)
                })?;
            self.crypt_handler.setup_shared_secret(&state.seed_client, &state.seed_server, &shared_secret)
                .map_err(|e| {
                    error!("failed to set up shared secret: {}", e);
                    CommandError::new(ErrorCode::VsCritical)
                })?;
        }

        Ok(SetupOutcome::Silent(CommandHandleResult::ConsumeCommand))
    }

    fn handle_client_ek(&self, state: &mut SetupState, command: &Command) -> Result<SetupOutcome, CommandError> {
        let chain = state.license_chain.as_ref()
            .ok_or_else(|| CommandError::with_extra(ErrorCode::VsCritical, "missing chain data"))?;

        let client_ek = decode_base64(command.require("ek")?)
            .ok_or_else(|| CommandError::parameter_invalid("ek"))?;

        let shared_secret = self.key_exchange.ephemeral_shared_secret(chain, &client_ek)
            .map_err(|e| {
                warn!("ephemeral key agreement failed: {}", e);
                CommandError::parameter_invalid("ek")
            })?;
        self.crypt_handler.setup_shared_secret_new(&state.seed_client, &state.seed_server, &shared_secret)
            .map_err(|e| {
                error!("failed to set up shared secret: {}", e);
                CommandError::new(ErrorCode::VsCritical)
            })?;

        self.transport.reset_acknowledges();
        // clientek itself is command packet 1, and its acknowledge already uses the new key
        self.transport.send_encrypted_acknowledge(1);

        Ok(SetupOutcome::Silent(CommandHandleResult::ConsumeCommand))
    }

    fn handle_client_init(&self, state: &mut SetupState) -> Result<SetupOutcome, CommandError> {
        if state.connection_state != ConnectionState::InitHigh || state.handshake_state != HandshakeState::Succeeded {
            return Err(CommandError::new(ErrorCode::ClientNotLoggedIn));
        }

        // the client must have received everything by now
        self.transport.reset_acknowledges();
        state.seed_client.clear();
        state.seed_server.clear();
        state.license_chain = None;
        state.connection_state = ConnectionState::Connected;

        Ok(SetupOutcome::Silent(CommandHandleResult::PassThrough))
    }

    fn handle_handshake_begin(&self, state: &mut SetupState, command: &Command) -> Result<SetupOutcome, CommandError> {
        if state.connection_state != ConnectionState::InitHigh || state.handshake_state != HandshakeState::Begin {
            return Err(CommandError::new(ErrorCode::WebHandshakeInvalid));
        }

        if command.require("intention")? != "0" {
            return Err(CommandError::new(ErrorCode::WebHandshakeUnsupported));
        }

        let method = command.require("authentication_method")?
            .parse::<u8>()
            .ok()
            .and_then(IdentityType::from_id);

        match method {
            Some(IdentityType::TeamSpeak) => {
                let public_key = decode_base64(command.require("publicKey")?)
                    .ok_or_else(|| CommandError::new(ErrorCode::WebHandshakeInvalid))?;
                if let Err(e) = self.key_exchange.validate_client_key(&public_key) {
                    warn!("failed to import remote public key: {}", e);
                    return Err(CommandError::new(ErrorCode::WebHandshakeInvalid));
                }

                let mut nonce = [0u8; 32];
                rand::thread_rng().fill_bytes(&mut nonce);
                let message = format!("identity proof #{}", BASE64.encode(nonce));

                state.proof_digest = Sha256::digest(message.as_bytes()).to_vec();
                state.handshake_identity = Some(public_key);

                self.transport.send_command(&Command::new("handshakeidentityproof")
                    .with("message", &message)
                    .with("digest", "SHA-256")
                    .build());
                state.handshake_state = HandshakeState::IdentityProof;
                Ok(SetupOutcome::Ok)
            }
            Some(other) => {
                debug!("unsupported authentication method {:?}", other);
                Err(CommandError::new(ErrorCode::WebHandshakeUnsupported))
            }
            None => Err(CommandError::new(ErrorCode::WebHandshakeUnsupported)),
        }
    }

    fn handle_handshake_identity_proof(&self, state: &mut SetupState, command: &Command) -> Result<SetupOutcome, CommandError> {
        if state.connection_state != ConnectionState::InitHigh || state.handshake_state != HandshakeState::IdentityProof {
            return Err(CommandError::new(ErrorCode::WebHandshakeInvalid));
        }

        let identity = state.handshake_identity.as_ref()
            .ok_or_else(|| CommandError::new(ErrorCode::WebHandshakeInvalid))?;
        let proof = decode_base64(command.require("proof")?)
            .ok_or_else(|| CommandError::new(ErrorCode::WebHandshakeIdentityProofFailed))?;

        if !self.key_exchange.verify_signature(identity, &state.proof_digest, &proof) {
            return Err(CommandError::new(ErrorCode::WebHandshakeIdentityProofFailed));
        }

        state.handshake_state = HandshakeState::Succeeded;
        Ok(SetupOutcome::Ok)
    }
}

fn command_name(payload: &[u8]) -> &[u8] {
    payload.split(|&b| b == b' ' || b == b'|')
        .next()
        .unwrap_or_default()
}

fn decode_base64(value: &str) -> Option<Vec<u8>> {
    BASE64.decode(value).ok()
}
