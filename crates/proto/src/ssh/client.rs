//! SSH client engine.
//!
//! [`SshClient`] drives one connection over any [`ByteStream`]: version
//! exchange, key exchange with host key verification, user authentication
//! and a single interactive `session` channel with a pseudo-terminal.
//!
//! The interactive phase is split in two so that a caller can select on it.
//! [`SshClient::read_packet`] only frames packets and is cancel safe;
//! [`SshClient::handle_packet`] applies one packet and may write replies.
//!
//! # Example
//!
//! ```rust,no_run
//! use wisp_proto::ssh::auth::NoPrompter;
//! use wisp_proto::ssh::client::{ChannelEvent, PtySize, SshClient, SshClientConfig};
//! # use wisp_platform::ByteStream;
//!
//! # async fn run(stream: ByteStream) -> wisp_platform::WispResult<()> {
//! let mut prompter = NoPrompter;
//! let mut client =
//!     SshClient::connect(stream, "example.com", 22, SshClientConfig::default(), &mut prompter)
//!         .await?;
//! client.authenticate("alice", &mut prompter, &[]).await?;
//! client.open_pty_session(PtySize::default(), &[]).await?;
//!
//! loop {
//!     let packet = client.read_packet().await?;
//!     if let Some(ChannelEvent::Closed) = client.handle_packet(packet).await? {
//!         break;
//!     }
//! }
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::ssh::auth::{
    construct_signature_data, parse_service_name, service_request, AuthBanner, AuthFailure,
    AuthMethod, AuthPkOk, AuthPrompter, AuthRequest, InfoRequest, InfoResponse, NoPrompter,
    CONNECTION_SERVICE, USERAUTH_SERVICE,
};
use crate::ssh::channel::{ChannelState, SshChannel};
use crate::ssh::cipher::{PacketOpener, PacketSealer, Role};
use crate::ssh::connection::{
    request_failure, ChannelMessage, ChannelOpen, ChannelOpenFailureReason, ChannelRequest,
    ChannelRequestType, GlobalRequest, DEFAULT_MAX_PACKET_SIZE, DEFAULT_WINDOW_SIZE,
    EMPTY_TERMINAL_MODES, EXTENDED_DATA_STDERR,
};
use crate::ssh::hostkey::{KeyPair, PublicHostKey};
use crate::ssh::identity::Identity;
use crate::ssh::keepalive::{keepalive_message, KEEPALIVE_DATA_LEN};
use crate::ssh::kex::{KexInit, Negotiated, NewKeys};
use crate::ssh::kex_dh::{exchange_hash, EcdhExchange, ExchangeHashInput, KexMethod, SessionKeys};
use crate::ssh::known_hosts::{KnownHostsFile, StrictHostKeyChecking, Verdict};
use crate::ssh::message::{
    MessageType, DISCONNECT_BY_APPLICATION, DISCONNECT_HOST_KEY_NOT_VERIFIABLE,
    DISCONNECT_NO_MORE_AUTH_METHODS, DISCONNECT_PROTOCOL_ERROR,
};
use crate::ssh::transport::{
    disconnect, parse_disconnect, unimplemented, RekeyTracker, State, Transport,
    TransportState, DEFAULT_REKEY_BYTES, DEFAULT_REKEY_INTERVAL,
};
use crate::ssh::version::Version;
use crate::ssh::wire::{expect_message, put_string, read_string};
use bytes::{BufMut, BytesMut};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use wisp_platform::{ByteStream, WispError, WispResult};

/// Terminal type requested when the environment carries no `TERM`.
pub const DEFAULT_TERM: &str = "xterm-256color";

/// Default number of password prompts.
pub const DEFAULT_PASSWORD_ATTEMPTS: u32 = 3;

const SESSION_CHANNEL_ID: u32 = 0;

/// Host key decision that replaces the known_hosts lookup.
///
/// Arguments: host name, port and the verified key. Returns true to accept.
pub type HostKeyVerifier = Arc<dyn Fn(&str, u16, &PublicHostKey) -> bool + Send + Sync>;

/// SSH client configuration.
#[derive(Clone)]
pub struct SshClientConfig {
    /// Software version sent in the identification string.
    pub software_version: String,
    /// Host key checking policy.
    ///
    /// - `Strict`: reject unknown and changed host keys
    /// - `Ask`: ask the prompter about unknown keys, reject changed ones
    /// - `AcceptNew`: record unknown keys, reject changed ones
    /// - `No`: accept every host key (testing only)
    pub strict_host_key_checking: StrictHostKeyChecking,
    /// known_hosts file. Without one, nothing is ever recorded.
    pub known_hosts_file: Option<PathBuf>,
    /// Overrides the known_hosts lookup entirely.
    pub host_key_verifier: Option<HostKeyVerifier>,
    /// Keep-alive interval, if any.
    pub keepalive_interval: Option<Duration>,
    /// Bytes after which the client rekeys.
    pub rekey_bytes_limit: u64,
    /// Time after which the client rekeys.
    pub rekey_time_limit: Duration,
    /// Password prompts before giving up.
    pub password_attempts: u32,
    /// Receive window advertised for the session channel.
    pub window_size: u32,
    /// Largest packet accepted on the session channel.
    pub max_packet_size: u32,
}

impl std::fmt::Debug for SshClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClientConfig")
            .field("software_version", &self.software_version)
            .field("strict_host_key_checking", &self.strict_host_key_checking)
            .field("known_hosts_file", &self.known_hosts_file)
            .field(
                "host_key_verifier",
                &self.host_key_verifier.as_ref().map(|_| "<callback>"),
            )
            .field("keepalive_interval", &self.keepalive_interval)
            .field("rekey_bytes_limit", &self.rekey_bytes_limit)
            .field("rekey_time_limit", &self.rekey_time_limit)
            .field("password_attempts", &self.password_attempts)
            .field("window_size", &self.window_size)
            .field("max_packet_size", &self.max_packet_size)
            .finish()
    }
}

impl Default for SshClientConfig {
    fn default() -> Self {
        Self {
            software_version: Version::wisp_default().software().to_string(),
            strict_host_key_checking: StrictHostKeyChecking::default(),
            known_hosts_file: None,
            host_key_verifier: None,
            keepalive_interval: None,
            rekey_bytes_limit: DEFAULT_REKEY_BYTES,
            rekey_time_limit: DEFAULT_REKEY_INTERVAL,
            password_attempts: DEFAULT_PASSWORD_ATTEMPTS,
            window_size: DEFAULT_WINDOW_SIZE,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
        }
    }
}

impl SshClientConfig {
    /// Replaces known_hosts checking with `verifier`.
    pub fn with_host_key_verifier<F>(mut self, verifier: F) -> Self
    where
        F: Fn(&str, u16, &PublicHostKey) -> bool + Send + Sync + 'static,
    {
        self.host_key_verifier = Some(Arc::new(verifier));
        self
    }
}

/// Terminal size in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtySize {
    /// Columns.
    pub cols: u32,
    /// Rows.
    pub rows: u32,
}

impl PtySize {
    /// Creates a size.
    pub fn new(cols: u32, rows: u32) -> Self {
        Self { cols, rows }
    }
}

impl Default for PtySize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Which remote stream channel data belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataStream {
    /// CHANNEL_DATA.
    Stdout,
    /// CHANNEL_EXTENDED_DATA of type stderr.
    Stderr,
}

/// Something the session channel reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output from the remote shell.
    Data {
        /// Stream the bytes arrived on.
        stream: DataStream,
        /// The bytes.
        data: Vec<u8>,
    },
    /// The shell exited with a status.
    ExitStatus(u32),
    /// The shell was killed by a signal.
    ExitSignal {
        /// Signal name without `SIG`.
        signal_name: String,
        /// Whether a core was dumped.
        core_dumped: bool,
        /// Message from the server.
        error_message: String,
    },
    /// The server will send no more data.
    Eof,
    /// The channel is closed on both sides.
    Closed,
    /// The server ended the connection.
    Disconnected {
        /// Reason code.
        reason: u32,
        /// Description from the server.
        description: String,
    },
}

enum AuthReply {
    Success,
    Failure(AuthFailure),
    /// Method-specific message 60 (PK_OK or INFO_REQUEST).
    Continue(Vec<u8>),
}

/// Picks the terminal type from the session environment.
pub fn terminal_type(env: &[(String, String)]) -> &str {
    env.iter()
        .find(|(name, _)| name == "TERM")
        .map(|(_, value)| value.as_str())
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_TERM)
}

/// A client connection.
pub struct SshClient {
    transport: Transport,
    state: TransportState,
    config: SshClientConfig,
    host: String,
    port: u16,
    client_version: String,
    server_version: String,
    session_id: Option<Vec<u8>>,
    host_key_blob: Vec<u8>,
    strict_kex: bool,
    negotiated: Option<Negotiated>,
    channel: Option<SshChannel>,
    pty_size: PtySize,
}

impl std::fmt::Debug for SshClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshClient")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("state", &self.state.current())
            .field("server_version", &self.server_version)
            .field("negotiated", &self.negotiated)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl SshClient {
    /// Runs the version exchange and first key exchange over `stream`.
    ///
    /// `host` and `port` name the server for host key checks. `prompter`
    /// answers the host key question under the `Ask` policy.
    ///
    /// # Errors
    ///
    /// - [`WispError::ConnectionFailed`] if the stream ends early
    /// - [`WispError::ProtocolViolation`] for malformed or unexpected packets
    /// - [`WispError::HostKeyVerificationFailed`] if the host key is not trusted
    pub async fn connect(
        stream: ByteStream,
        host: &str,
        port: u16,
        config: SshClientConfig,
        prompter: &mut dyn AuthPrompter,
    ) -> WispResult<Self> {
        debug!(peer = %stream.label(), host, port, "Starting SSH handshake");
        let (reader, writer) = stream.into_split();
        let rekey = RekeyTracker::new(config.rekey_bytes_limit, config.rekey_time_limit);
        let ours = Version::new(&config.software_version, None);

        let mut client = Self {
            transport: Transport::new(reader, writer, Role::Client, rekey),
            state: TransportState::new(),
            config,
            host: host.to_string(),
            port,
            client_version: ours.to_string(),
            server_version: String::new(),
            session_id: None,
            host_key_blob: Vec::new(),
            strict_kex: false,
            negotiated: None,
            channel: None,
            pty_size: PtySize::default(),
        };

        let banner = client.transport.exchange_versions(&ours).await?;
        client.server_version = banner.line;
        client.state.transition(State::KeyExchange)?;

        if let Err(e) = client.key_exchange(None, Some(prompter)).await {
            client.abort(&e).await;
            return Err(e);
        }
        client.state.transition(State::Authenticating)?;
        Ok(client)
    }

    /// Returns the connection state.
    pub fn state(&self) -> State {
        self.state.current()
    }

    /// Returns the server's identification line.
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Returns the session identifier, once the first exchange is done.
    pub fn session_id(&self) -> Option<&[u8]> {
        self.session_id.as_deref()
    }

    /// Returns the algorithms of the latest key exchange.
    pub fn negotiated(&self) -> Option<&Negotiated> {
        self.negotiated.as_ref()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SshClientConfig {
        &self.config
    }

    /// Returns the session channel state, if one was opened.
    pub fn channel_state(&self) -> Option<ChannelState> {
        self.channel.as_ref().map(SshChannel::state)
    }

    /// Returns the latest terminal size.
    pub fn pty_size(&self) -> PtySize {
        self.pty_size
    }

    async fn abort(&mut self, error: &WispError) {
        let reason = match error {
            WispError::HostKeyVerificationFailed(_) => DISCONNECT_HOST_KEY_NOT_VERIFIABLE,
            WispError::AuthenticationFailed(_) => DISCONNECT_NO_MORE_AUTH_METHODS,
            WispError::ProtocolViolation(_) => DISCONNECT_PROTOCOL_ERROR,
            _ => return,
        };
        if let Err(e) = self
            .transport
            .write_payload(&disconnect(reason, &error.to_string()))
            .await
        {
            debug!(error = %e, "Could not send disconnect");
        }
        let _ = self.state.transition(State::Closed);
    }

    async fn key_exchange(
        &mut self,
        server_kexinit: Option<Vec<u8>>,
        prompter: Option<&mut dyn AuthPrompter>,
    ) -> WispResult<()> {
        let initial = self.session_id.is_none();
        debug!(initial, "Key exchange started");

        let ours = KexInit::client_default();
        let client_kexinit = ours.to_bytes();
        self.transport.write_payload(&client_kexinit).await?;

        let mut noise = false;
        let server_kexinit = match server_kexinit {
            Some(payload) => payload,
            None => {
                self.next_kex_message(initial, MessageType::KexInit, &mut noise)
                    .await?
            }
        };
        let theirs = KexInit::from_bytes(&server_kexinit)?;
        let negotiated = Negotiated::from_kexinits(&ours, &theirs)?;

        if initial {
            self.strict_kex = negotiated.strict_kex;
            if self.strict_kex && noise {
                return Err(WispError::ProtocolViolation(
                    "strict key exchange: KEXINIT was not the first packet".to_string(),
                ));
            }
        }
        debug!(
            kex = %negotiated.kex,
            host_key = %negotiated.host_key,
            cipher = negotiated.cipher_client_to_server.name(),
            strict = self.strict_kex,
            "Negotiated algorithms"
        );

        let guessed_wrong = theirs.first_kex_packet_follows()
            && (theirs.kex_algorithms().first() != Some(&negotiated.kex)
                || theirs.server_host_key_algorithms().first() != Some(&negotiated.host_key));
        if guessed_wrong {
            let discarded = self.transport.read_wire_payload().await?;
            debug!(
                msg = discarded.first().copied().unwrap_or_default(),
                "Discarded wrongly guessed kex packet"
            );
        }

        let exchange = EcdhExchange::new(KexMethod::from_name(&negotiated.kex)?)?;
        let client_ephemeral = exchange.public_key().to_vec();
        let mut init = BytesMut::new();
        init.put_u8(MessageType::KexdhInit as u8);
        put_string(&mut init, &client_ephemeral);
        self.transport.write_payload(&init).await?;

        let reply = self
            .next_kex_message(initial, MessageType::KexdhReply, &mut noise)
            .await?;
        let mut offset = 1;
        let host_key_blob = read_string(&reply, &mut offset)?.to_vec();
        let server_ephemeral = read_string(&reply, &mut offset)?.to_vec();
        let signature = read_string(&reply, &mut offset)?.to_vec();

        let shared_secret = exchange.compute_shared_secret(&server_ephemeral)?;
        let hash = exchange_hash(&ExchangeHashInput {
            client_version: &self.client_version,
            server_version: &self.server_version,
            client_kexinit: &client_kexinit,
            server_kexinit: &server_kexinit,
            host_key_blob: &host_key_blob,
            client_ephemeral: &client_ephemeral,
            server_ephemeral: &server_ephemeral,
            shared_secret: &shared_secret,
        });

        let host_key = PublicHostKey::from_blob(&host_key_blob)?;
        host_key.verify(&negotiated.host_key, &hash, &signature)?;
        if initial {
            match prompter {
                Some(prompter) => self.check_host_key(&host_key, prompter).await?,
                None => self.check_host_key(&host_key, &mut NoPrompter).await?,
            }
            self.host_key_blob = host_key_blob;
        } else if host_key_blob != self.host_key_blob {
            return Err(WispError::HostKeyVerificationFailed(
                "server presented a different host key during rekey".to_string(),
            ));
        }

        self.transport.write_payload(&NewKeys::new().to_bytes()).await?;

        let session_id = self.session_id.get_or_insert_with(|| hash.clone()).clone();
        let keys = SessionKeys::derive(
            &shared_secret,
            &hash,
            &session_id,
            negotiated.cipher_client_to_server,
            negotiated.cipher_server_to_client,
        );
        let (sealing, opening) = keys.split(Role::Client);
        let strict = self.strict_kex;
        self.transport
            .codec_mut()
            .install_sealer(PacketSealer::new(&sealing)?, strict);

        let newkeys = self
            .next_kex_message(initial, MessageType::NewKeys, &mut noise)
            .await?;
        NewKeys::from_bytes(&newkeys)?;
        self.transport
            .codec_mut()
            .install_opener(PacketOpener::new(&opening)?, strict);
        self.transport.rekey_mut().reset(Instant::now());

        info!(
            host = %self.host,
            kex = %negotiated.kex,
            cipher = negotiated.cipher_client_to_server.name(),
            deferred = self.transport.deferred_len(),
            "Key exchange complete"
        );
        self.negotiated = Some(negotiated);
        Ok(())
    }

    /// Reads the next key exchange message of type `expected`.
    ///
    /// Packets that may legally interleave are consumed. During a rekey,
    /// connection traffic is deferred until the exchange completes.
    async fn next_kex_message(
        &mut self,
        initial: bool,
        expected: MessageType,
        noise: &mut bool,
    ) -> WispResult<Vec<u8>> {
        loop {
            let payload = self.transport.read_wire_payload().await?;
            let msg = payload.first().copied().unwrap_or_default();
            if msg == expected as u8 {
                return Ok(payload);
            }

            match MessageType::from_u8(msg) {
                Some(MessageType::Disconnect) => return Err(peer_disconnect(&payload)),
                Some(
                    MessageType::KexInit
                    | MessageType::NewKeys
                    | MessageType::KexdhInit
                    | MessageType::KexdhReply,
                ) => {
                    return Err(WispError::ProtocolViolation(format!(
                        "expected {} during key exchange, got message {}",
                        expected.name(),
                        msg
                    )));
                }
                _ if initial && self.strict_kex => {
                    return Err(WispError::ProtocolViolation(format!(
                        "strict key exchange: unexpected message {}",
                        msg
                    )));
                }
                Some(MessageType::Ignore | MessageType::Debug | MessageType::Unimplemented) => {
                    trace!(msg, "Consumed packet during key exchange");
                    *noise = true;
                }
                _ if initial => {
                    return Err(WispError::ProtocolViolation(format!(
                        "unexpected message {} during initial key exchange",
                        msg
                    )));
                }
                _ => {
                    debug!(msg, "Deferring packet received during rekey");
                    self.transport.defer(payload);
                }
            }
        }
    }

    async fn check_host_key(
        &self,
        key: &PublicHostKey,
        prompter: &mut dyn AuthPrompter,
    ) -> WispResult<()> {
        let fingerprint = key.fingerprint();

        if let Some(verifier) = &self.config.host_key_verifier {
            if verifier(&self.host, self.port, key) {
                debug!(host = %self.host, %fingerprint, "Host key accepted by verifier");
                return Ok(());
            }
            return Err(WispError::HostKeyVerificationFailed(format!(
                "{} key {} for {} was rejected",
                key.key_type(),
                fingerprint,
                self.host
            )));
        }

        let mut known_hosts = match &self.config.known_hosts_file {
            Some(path) => KnownHostsFile::from_file(path)?,
            None => KnownHostsFile::from_string(""),
        };
        let blob = key.to_blob();
        let status = known_hosts.verify_host_key(&self.host, self.port, key.key_type(), &blob);

        let record = match self.config.strict_host_key_checking.decide(&status) {
            Verdict::Accept => false,
            Verdict::AcceptAndRecord => true,
            Verdict::Confirm => {
                let accepted = prompter
                    .confirm_host_key(&self.host, self.port, key.key_type(), &fingerprint)
                    .await?;
                if !accepted {
                    return Err(WispError::HostKeyVerificationFailed(format!(
                        "{} key {} for {} was not accepted",
                        key.key_type(),
                        fingerprint,
                        self.host
                    )));
                }
                true
            }
            Verdict::Reject(reason) => return Err(WispError::HostKeyVerificationFailed(reason)),
        };

        if record && self.config.known_hosts_file.is_some() {
            known_hosts.add_host(&self.host, self.port, key.key_type(), &blob, false);
            match known_hosts.save() {
                Ok(()) => info!(
                    host = %self.host,
                    key_type = key.key_type(),
                    %fingerprint,
                    "Permanently added host key to known hosts"
                ),
                Err(e) => warn!(error = %e, "Could not record host key"),
            }
        }
        Ok(())
    }

    /// Authenticates `user`.
    ///
    /// Methods run in order: `none`, `publickey` for each identity,
    /// `keyboard-interactive`, then `password` up to the configured number of
    /// attempts. Only methods the server lists are tried.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::AuthenticationFailed`] once every method is
    /// exhausted.
    pub async fn authenticate(
        &mut self,
        user: &str,
        prompter: &mut dyn AuthPrompter,
        identities: &[Identity],
    ) -> WispResult<()> {
        if self.state.current() != State::Authenticating {
            return Err(WispError::ProtocolViolation(format!(
                "cannot authenticate in state {:?}",
                self.state.current()
            )));
        }

        self.transport
            .write_payload(&service_request(USERAUTH_SERVICE))
            .await?;
        let accept = self.next_control_message().await?;
        expect_message(&accept, MessageType::ServiceAccept as u8, "SERVICE_ACCEPT")?;
        let service = parse_service_name(&accept)?;
        if service != USERAUTH_SERVICE {
            return Err(WispError::ProtocolViolation(format!(
                "server accepted service '{}'",
                service
            )));
        }

        match self.try_method(user, AuthMethod::None, prompter).await? {
            AuthReply::Success => return self.authenticated(user, "none"),
            AuthReply::Failure(failure) => {
                let mut allowed = failure;
                debug!(methods = ?allowed.methods_can_continue(), "Server authentication methods");

                if self
                    .public_key_auth(user, identities, prompter, &mut allowed)
                    .await?
                {
                    return self.authenticated(user, "publickey");
                }
                if self
                    .keyboard_interactive_auth(user, prompter, &mut allowed)
                    .await?
                {
                    return self.authenticated(user, "keyboard-interactive");
                }
                if self.password_auth(user, prompter, &mut allowed).await? {
                    return self.authenticated(user, "password");
                }

                let error = WispError::AuthenticationFailed(format!(
                    "{}@{}: no method succeeded (server allows {})",
                    user,
                    self.host,
                    allowed.methods_can_continue().join(",")
                ));
                self.abort(&error).await;
                Err(error)
            }
            AuthReply::Continue(payload) => Err(unexpected_message(&payload, "none authentication")),
        }
    }

    fn authenticated(&mut self, user: &str, method: &str) -> WispResult<()> {
        info!(user, host = %self.host, method, "Authenticated");
        self.state.transition(State::ChannelOpen)
    }

    async fn try_method(
        &mut self,
        user: &str,
        method: AuthMethod,
        prompter: &mut dyn AuthPrompter,
    ) -> WispResult<AuthReply> {
        let request = AuthRequest::new(user, CONNECTION_SERVICE, method);
        self.transport.write_payload(&request.to_bytes()).await?;
        self.auth_reply(prompter).await
    }

    async fn auth_reply(&mut self, prompter: &mut dyn AuthPrompter) -> WispResult<AuthReply> {
        loop {
            let payload = self.next_control_message().await?;
            let msg = payload.first().copied().unwrap_or_default();
            match MessageType::from_u8(msg) {
                Some(MessageType::UserauthSuccess) => return Ok(AuthReply::Success),
                Some(MessageType::UserauthFailure) => {
                    return Ok(AuthReply::Failure(AuthFailure::from_bytes(&payload)?))
                }
                Some(MessageType::UserauthBanner) => {
                    let banner = AuthBanner::from_bytes(&payload)?;
                    prompter.banner(banner.message()).await?;
                }
                Some(MessageType::UserauthPkOk) => return Ok(AuthReply::Continue(payload)),
                _ => return Err(unexpected_message(&payload, "authentication")),
            }
        }
    }

    async fn public_key_auth(
        &mut self,
        user: &str,
        identities: &[Identity],
        prompter: &mut dyn AuthPrompter,
        allowed: &mut AuthFailure,
    ) -> WispResult<bool> {
        for identity in identities {
            if !allowed.allows("publickey") {
                break;
            }
            let key = identity.key_pair();
            let algorithm = key.algorithm().name().to_string();
            let blob = key.public_key_blob();
            debug!(comment = identity.comment(), "Offering public key");

            let query = AuthMethod::PublicKey {
                algorithm: algorithm.clone(),
                public_key: blob.clone(),
                signature: None,
            };
            match self.try_method(user, query, prompter).await? {
                AuthReply::Success => return Ok(true),
                AuthReply::Failure(failure) => {
                    *allowed = failure;
                    continue;
                }
                AuthReply::Continue(payload) => {
                    AuthPkOk::from_bytes(&payload)?;
                }
            }

            let session_id = self.session_id.clone().unwrap_or_default();
            let data =
                construct_signature_data(&session_id, user, CONNECTION_SERVICE, &algorithm, &blob);
            let signed = AuthMethod::PublicKey {
                algorithm,
                public_key: blob,
                signature: Some(key.sign(&data)?),
            };
            match self.try_method(user, signed, prompter).await? {
                AuthReply::Success => return Ok(true),
                AuthReply::Failure(failure) => *allowed = failure,
                AuthReply::Continue(payload) => {
                    return Err(unexpected_message(&payload, "public key authentication"))
                }
            }
        }
        Ok(false)
    }

    async fn keyboard_interactive_auth(
        &mut self,
        user: &str,
        prompter: &mut dyn AuthPrompter,
        allowed: &mut AuthFailure,
    ) -> WispResult<bool> {
        if !allowed.allows("keyboard-interactive") {
            return Ok(false);
        }

        let method = AuthMethod::KeyboardInteractive {
            submethods: String::new(),
        };
        let mut reply = self.try_method(user, method, prompter).await?;
        loop {
            match reply {
                AuthReply::Success => return Ok(true),
                AuthReply::Failure(failure) => {
                    *allowed = failure;
                    return Ok(false);
                }
                AuthReply::Continue(payload) => {
                    let request = InfoRequest::from_bytes(&payload)?;
                    let answers = if request.prompts.is_empty() {
                        Some(Vec::new())
                    } else {
                        prompter
                            .keyboard_interactive(
                                &request.name,
                                &request.instruction,
                                &request.prompts,
                            )
                            .await?
                    };
                    let Some(answers) = answers else {
                        debug!("Keyboard-interactive declined");
                        return Ok(false);
                    };
                    if answers.len() != request.prompts.len() {
                        return Err(WispError::InvalidParameters(format!(
                            "{} answers for {} prompts",
                            answers.len(),
                            request.prompts.len()
                        )));
                    }
                    self.transport
                        .write_payload(&InfoResponse::new(answers).to_bytes())
                        .await?;
                    reply = self.auth_reply(prompter).await?;
                }
            }
        }
    }

    async fn password_auth(
        &mut self,
        user: &str,
        prompter: &mut dyn AuthPrompter,
        allowed: &mut AuthFailure,
    ) -> WispResult<bool> {
        let mut attempts = 0;
        while allowed.allows("password") && attempts < self.config.password_attempts {
            let Some(password) = prompter.password(user, &self.host).await? else {
                break;
            };
            attempts += 1;

            match self
                .try_method(user, AuthMethod::Password(password), prompter)
                .await?
            {
                AuthReply::Success => return Ok(true),
                AuthReply::Failure(failure) => {
                    debug!(attempt = attempts, "Password rejected");
                    *allowed = failure;
                }
                AuthReply::Continue(_) => {
                    warn!("Server requested a password change, which is not supported");
                    break;
                }
            }
        }
        Ok(false)
    }

    /// Opens the session channel, requests a pseudo-terminal and starts the shell.
    ///
    /// `TERM` in `env` selects the terminal type. Every entry is also sent
    /// as an `env` request; the server may ignore them.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] if the server refuses the
    /// channel, the terminal or the shell.
    pub async fn open_pty_session(
        &mut self,
        size: PtySize,
        env: &[(String, String)],
    ) -> WispResult<()> {
        if self.state.current() != State::ChannelOpen {
            return Err(WispError::ProtocolViolation(format!(
                "cannot open a session in state {:?}",
                self.state.current()
            )));
        }
        self.pty_size = size;

        let open = ChannelOpen::session(
            SESSION_CHANNEL_ID,
            self.config.window_size,
            self.config.max_packet_size,
        );
        self.transport
            .write_payload(&ChannelMessage::Open(open).to_bytes())
            .await?;
        let mut channel = SshChannel::new(SESSION_CHANNEL_ID, self.config.window_size);

        loop {
            let payload = self.next_control_message().await?;
            match parse_channel_message(&payload)? {
                ChannelMessage::OpenConfirmation {
                    recipient_channel: SESSION_CHANNEL_ID,
                    sender_channel,
                    initial_window_size,
                    maximum_packet_size,
                } => {
                    channel.confirm(sender_channel, initial_window_size, maximum_packet_size)?;
                    break;
                }
                ChannelMessage::OpenFailure {
                    reason,
                    description,
                    ..
                } => {
                    return Err(WispError::ConnectionFailed(format!(
                        "session channel refused: {} ({})",
                        description,
                        ChannelOpenFailureReason::describe(reason)
                    )));
                }
                _ => return Err(unexpected_message(&payload, "channel open")),
            }
        }
        debug!(remote = channel.remote_id(), window = channel.send_window(), "Session channel open");
        self.channel = Some(channel);

        let pty = ChannelRequestType::PtyReq {
            term: terminal_type(env).to_string(),
            cols: size.cols,
            rows: size.rows,
            width_px: 0,
            height_px: 0,
            modes: EMPTY_TERMINAL_MODES.to_vec(),
        };
        self.send_channel_request(pty, true).await?;
        if !self.channel_reply().await? {
            return Err(WispError::ConnectionFailed(
                "server refused the pseudo-terminal".to_string(),
            ));
        }

        for (name, value) in env {
            let request = ChannelRequestType::Env {
                name: name.clone(),
                value: value.clone(),
            };
            self.send_channel_request(request, false).await?;
        }

        self.send_channel_request(ChannelRequestType::Shell, true)
            .await?;
        if !self.channel_reply().await? {
            return Err(WispError::ConnectionFailed(
                "server refused to start a shell".to_string(),
            ));
        }

        self.state.transition(State::Interactive)?;
        info!(host = %self.host, cols = size.cols, rows = size.rows, "Shell started");
        Ok(())
    }

    async fn send_channel_request(
        &mut self,
        request_type: ChannelRequestType,
        want_reply: bool,
    ) -> WispResult<()> {
        let remote = self.open_channel()?.remote_id();
        let request = ChannelRequest::new(remote, request_type, want_reply);
        self.transport
            .write_payload(&ChannelMessage::Request(request).to_bytes())
            .await
    }

    /// Waits for CHANNEL_SUCCESS or CHANNEL_FAILURE.
    ///
    /// Output that races ahead of the reply is held and replayed in order.
    async fn channel_reply(&mut self) -> WispResult<bool> {
        let mut held = Vec::new();
        let result = loop {
            let payload = self.next_control_message().await?;
            match parse_channel_message(&payload)? {
                ChannelMessage::Success { .. } => break true,
                ChannelMessage::Failure { .. } => break false,
                ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                    self.open_channel()?.add_send_window(bytes_to_add);
                }
                ChannelMessage::Close { .. } => {
                    return Err(WispError::ConnectionFailed(
                        "server closed the session channel during setup".to_string(),
                    ));
                }
                _ => held.push(payload),
            }
        };
        self.transport.requeue(held);
        Ok(result)
    }

    fn open_channel(&mut self) -> WispResult<&mut SshChannel> {
        self.channel
            .as_mut()
            .ok_or_else(|| WispError::ProtocolViolation("no session channel".to_string()))
    }

    /// Reads packets until one is not transport housekeeping.
    async fn next_control_message(&mut self) -> WispResult<Vec<u8>> {
        loop {
            self.maybe_rekey().await?;
            let payload = self.transport.read_payload().await?;
            if payload.first() == Some(&(MessageType::Disconnect as u8)) {
                return Err(peer_disconnect(&payload));
            }
            if let Some(payload) = self.handle_transport_message(payload).await? {
                return Ok(payload);
            }
        }
    }

    /// Consumes transport and global messages. Returns everything else.
    async fn handle_transport_message(&mut self, payload: Vec<u8>) -> WispResult<Option<Vec<u8>>> {
        let Some(&msg) = payload.first() else {
            return Err(WispError::ProtocolViolation("empty packet".to_string()));
        };

        match MessageType::from_u8(msg) {
            Some(MessageType::Ignore | MessageType::Debug) => Ok(None),
            Some(MessageType::Unimplemented) => {
                debug!("Server reported an unimplemented message");
                Ok(None)
            }
            Some(MessageType::KexInit) => {
                debug!("Server initiated rekey");
                self.key_exchange(Some(payload), None).await?;
                Ok(None)
            }
            Some(MessageType::GlobalRequest) => {
                let request = GlobalRequest::from_bytes(&payload)?;
                debug!(name = %request.name, "Refusing global request");
                if request.want_reply {
                    self.transport.write_payload(&request_failure()).await?;
                }
                Ok(None)
            }
            Some(MessageType::RequestSuccess | MessageType::RequestFailure) => Ok(None),
            Some(_) => Ok(Some(payload)),
            None => {
                let sequence = self.transport.codec_mut().recv_sequence().wrapping_sub(1);
                debug!(msg, sequence, "Unknown message type");
                self.transport.write_payload(&unimplemented(sequence)).await?;
                Ok(None)
            }
        }
    }

    async fn maybe_rekey(&mut self) -> WispResult<()> {
        if self.session_id.is_some() && self.transport.rekey_mut().needs_rekey(Instant::now()) {
            info!(bytes = self.transport.rekey_mut().bytes(), "Rekey threshold reached");
            self.key_exchange(None, None).await?;
        }
        Ok(())
    }

    /// Reads the next packet.
    ///
    /// Cancel safe. Pass the result to [`SshClient::handle_packet`].
    pub async fn read_packet(&mut self) -> WispResult<Vec<u8>> {
        self.transport.read_payload().await
    }

    /// Applies one packet read by [`SshClient::read_packet`].
    ///
    /// Transport housekeeping, rekeys and window adjusts are handled here;
    /// what the session channel reports is returned.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ProtocolViolation`] for malformed packets or a
    /// window overrun.
    pub async fn handle_packet(&mut self, payload: Vec<u8>) -> WispResult<Option<ChannelEvent>> {
        if payload.first() == Some(&(MessageType::Disconnect as u8)) {
            let (reason, description) = parse_disconnect(&payload)?;
            info!(reason, description = %description, "Server disconnected");
            self.state.transition(State::Closed)?;
            return Ok(Some(ChannelEvent::Disconnected {
                reason,
                description,
            }));
        }

        let event = match self.handle_transport_message(payload).await? {
            None => None,
            Some(payload)
                if payload
                    .first()
                    .copied()
                    .is_some_and(ChannelMessage::is_channel_message) =>
            {
                let message = ChannelMessage::from_bytes(&payload)?;
                self.handle_channel_message(message).await?
            }
            Some(payload) => {
                warn!(
                    msg = payload.first().copied().unwrap_or_default(),
                    "Ignoring out-of-place message"
                );
                None
            }
        };

        self.maybe_rekey().await?;
        Ok(event)
    }

    async fn handle_channel_message(
        &mut self,
        message: ChannelMessage,
    ) -> WispResult<Option<ChannelEvent>> {
        if let ChannelMessage::Open(open) = &message {
            debug!(channel_type = %open.channel_type, "Refusing server-initiated channel");
            let refusal = ChannelMessage::OpenFailure {
                recipient_channel: open.sender_channel,
                reason: ChannelOpenFailureReason::AdministrativelyProhibited as u32,
                description: "channel type not supported".to_string(),
            };
            self.transport.write_payload(&refusal.to_bytes()).await?;
            return Ok(None);
        }

        let Some(channel) = self.channel.as_mut() else {
            warn!("Channel message without a session channel");
            return Ok(None);
        };
        if message.recipient_channel() != Some(channel.local_id()) {
            warn!(recipient = ?message.recipient_channel(), "Message for unknown channel");
            return Ok(None);
        }
        let remote = channel.remote_id();

        match message {
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                channel.add_send_window(bytes_to_add);
                self.flush().await?;
                Ok(None)
            }
            ChannelMessage::Data { data, .. } => {
                channel.on_data_received(data.len())?;
                Ok(Some(ChannelEvent::Data {
                    stream: DataStream::Stdout,
                    data,
                }))
            }
            ChannelMessage::ExtendedData {
                data_type, data, ..
            } => {
                channel.on_data_received(data.len())?;
                if data_type == EXTENDED_DATA_STDERR {
                    Ok(Some(ChannelEvent::Data {
                        stream: DataStream::Stderr,
                        data,
                    }))
                } else {
                    debug!(data_type, len = data.len(), "Dropping extended data");
                    self.release_window(data.len()).await?;
                    Ok(None)
                }
            }
            ChannelMessage::Eof { .. } => {
                channel.mark_eof_received();
                Ok(Some(ChannelEvent::Eof))
            }
            ChannelMessage::Close { .. } => {
                if channel.on_close_received() {
                    let close = ChannelMessage::Close {
                        recipient_channel: remote,
                    };
                    self.transport.write_payload(&close.to_bytes()).await?;
                }
                Ok(Some(ChannelEvent::Closed))
            }
            ChannelMessage::Request(request) => {
                let want_reply = request.want_reply();
                match request.request_type() {
                    ChannelRequestType::ExitStatus { exit_status } => {
                        Ok(Some(ChannelEvent::ExitStatus(*exit_status)))
                    }
                    ChannelRequestType::ExitSignal {
                        signal_name,
                        core_dumped,
                        error_message,
                    } => Ok(Some(ChannelEvent::ExitSignal {
                        signal_name: signal_name.clone(),
                        core_dumped: *core_dumped,
                        error_message: error_message.clone(),
                    })),
                    other => {
                        debug!(request = other.name(), "Refusing channel request");
                        if want_reply {
                            let failure = ChannelMessage::Failure {
                                recipient_channel: remote,
                            };
                            self.transport.write_payload(&failure.to_bytes()).await?;
                        }
                        Ok(None)
                    }
                }
            }
            ChannelMessage::Success { .. } | ChannelMessage::Failure { .. } => Ok(None),
            ChannelMessage::OpenConfirmation { .. }
            | ChannelMessage::OpenFailure { .. }
            | ChannelMessage::Open(_) => {
                warn!("Unexpected channel open reply");
                Ok(None)
            }
        }
    }

    async fn flush(&mut self) -> WispResult<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        let remote = channel.remote_id();
        for data in channel.take_sendable() {
            let message = ChannelMessage::Data {
                recipient_channel: remote,
                data,
            };
            self.transport.write_payload(&message.to_bytes()).await?;
        }
        Ok(())
    }

    /// Writes to the shell's stdin.
    ///
    /// Data beyond the server's window is queued and sent as the window
    /// reopens. Input after the channel closed is dropped.
    pub async fn send_data(&mut self, data: &[u8]) -> WispResult<()> {
        self.maybe_rekey().await?;
        let channel = self.open_channel()?;
        if channel.state() != ChannelState::Open {
            debug!(len = data.len(), "Dropping input for a closed channel");
            return Ok(());
        }
        channel.queue(data);
        self.flush().await
    }

    /// Returns the number of input bytes waiting for window.
    pub fn queued_input(&self) -> usize {
        self.channel.as_ref().map_or(0, SshChannel::queued_bytes)
    }

    /// Reports a terminal size change. Remembered even without a channel.
    pub async fn window_change(&mut self, size: PtySize) -> WispResult<()> {
        self.pty_size = size;
        if self.channel_state() != Some(ChannelState::Open) {
            return Ok(());
        }
        let request = ChannelRequestType::WindowChange {
            cols: size.cols,
            rows: size.rows,
            width_px: 0,
            height_px: 0,
        };
        self.send_channel_request(request, false).await
    }

    /// Returns consumed output bytes to the receive window.
    pub async fn release_window(&mut self, bytes: usize) -> WispResult<()> {
        let Some(channel) = self.channel.as_mut() else {
            return Ok(());
        };
        let bytes = u32::try_from(bytes).unwrap_or(u32::MAX);
        if let Some(adjust) = channel.release(bytes) {
            let message = ChannelMessage::WindowAdjust {
                recipient_channel: channel.remote_id(),
                bytes_to_add: adjust,
            };
            trace!(adjust, "Sending window adjust");
            self.transport.write_payload(&message.to_bytes()).await?;
        }
        Ok(())
    }

    /// Sends an SSH_MSG_IGNORE keep-alive.
    pub async fn send_keepalive(&mut self) -> WispResult<()> {
        trace!("Sending keep-alive");
        self.transport
            .write_payload(&keepalive_message(KEEPALIVE_DATA_LEN))
            .await
    }

    /// Closes the channel and disconnects. Closing twice is a no-op.
    pub async fn close(&mut self) -> WispResult<()> {
        if self.state.current() == State::Closed {
            return Ok(());
        }
        self.state.transition(State::Closing)?;

        let mut result = Ok(());
        if let Some(channel) = self.channel.as_mut() {
            let remote = channel.remote_id();
            if channel.state() == ChannelState::Open && channel.begin_close() {
                let close = ChannelMessage::Close {
                    recipient_channel: remote,
                };
                result = self.transport.write_payload(&close.to_bytes()).await;
            }
        }
        if result.is_ok() {
            result = self
                .transport
                .write_payload(&disconnect(DISCONNECT_BY_APPLICATION, "disconnected by user"))
                .await;
        }
        let shutdown = self.transport.shutdown().await;
        self.state.transition(State::Closed)?;
        debug!(host = %self.host, "Connection closed");
        result.and(shutdown)
    }
}

fn parse_channel_message(payload: &[u8]) -> WispResult<ChannelMessage> {
    match payload.first() {
        Some(&msg) if ChannelMessage::is_channel_message(msg) => ChannelMessage::from_bytes(payload),
        _ => Err(unexpected_message(payload, "channel setup")),
    }
}

fn unexpected_message(payload: &[u8], during: &str) -> WispError {
    let msg = payload.first().copied().unwrap_or_default();
    let name = MessageType::from_u8(msg).map_or("unknown", |t| t.name());
    WispError::ProtocolViolation(format!(
        "unexpected message {} ({}) during {}",
        msg, name, during
    ))
}

fn peer_disconnect(payload: &[u8]) -> WispError {
    match parse_disconnect(payload) {
        Ok((reason, description)) => WispError::ConnectionFailed(format!(
            "disconnected by server: {} (reason {})",
            description, reason
        )),
        Err(e) => e,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = SshClientConfig::default();
        assert!(config.software_version.starts_with("wisp_"));
        assert_eq!(
            config.strict_host_key_checking,
            StrictHostKeyChecking::AcceptNew
        );
        assert_eq!(config.password_attempts, 3);
        assert_eq!(config.rekey_bytes_limit, 1 << 30);
        assert_eq!(config.rekey_time_limit, Duration::from_secs(3600));
        assert!(config.keepalive_interval.is_none());
        assert!(config.host_key_verifier.is_none());
    }

    #[test]
    fn test_config_debug_hides_callback() {
        let config = SshClientConfig::default().with_host_key_verifier(|_, _, _| true);
        let debug = format!("{:?}", config);
        assert!(debug.contains("<callback>"));

        let cloned = config.clone();
        assert!(cloned.host_key_verifier.is_some());
    }

    #[test]
    fn test_terminal_type() {
        assert_eq!(terminal_type(&[]), DEFAULT_TERM);

        let env = vec![
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("TERM".to_string(), "vt100".to_string()),
        ];
        assert_eq!(terminal_type(&env), "vt100");

        let env = vec![("TERM".to_string(), String::new())];
        assert_eq!(terminal_type(&env), DEFAULT_TERM);
    }

    #[test]
    fn test_pty_size_default() {
        assert_eq!(PtySize::default(), PtySize::new(80, 24));
    }

    #[test]
    fn test_unexpected_message_names_type() {
        let err = unexpected_message(&[52], "setup");
        assert!(err.to_string().contains("52"));

        let err = peer_disconnect(&disconnect(11, "bye"));
        assert!(matches!(err, WispError::ConnectionFailed(msg) if msg.contains("bye")));
    }
}
