//! In-memory SSH server used to drive the client end to end.
//!
//! The server is built from the same wire pieces as the client, running the
//! transport in the server role with an Ed25519 host key. Its shell
//! understands a few commands:
//!
//! - `ls` prints a fixed listing
//! - `big N` prints N bytes, honouring the client's window
//! - `rekey` starts a server-initiated key exchange
//! - `exit` reports the configured exit status and closes the channel
//! - anything else is echoed back

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use wisp_platform::{
    ByteStream, ReadOutcome, StreamKind, StreamReader, StreamWriter, WispError, WispResult,
};
use wisp_proto::ssh::auth::{
    construct_signature_data, parse_service_name, service_accept, AuthBanner, AuthFailure,
    AuthMethod, AuthPkOk, AuthPrompter, AuthRequest, InfoRequest, InfoResponse, Prompt,
};
use wisp_proto::ssh::cipher::{PacketOpener, PacketSealer, Role};
use wisp_proto::ssh::connection::{ChannelMessage, ChannelRequest, ChannelRequestType};
use wisp_proto::ssh::hostkey::{Ed25519KeyPair, KeyPair, PublicHostKey};
use wisp_proto::ssh::kex::{KexInit, Negotiated, NewKeys};
use wisp_proto::ssh::kex_dh::{
    exchange_hash, EcdhExchange, ExchangeHashInput, KexMethod, SessionKeys,
};
use wisp_proto::ssh::message::MessageType;
use wisp_proto::ssh::transport::{RekeyTracker, Transport};
use wisp_proto::ssh::version::Version;
use wisp_proto::ssh::wire::{put_string, read_string};

/// Read half of an in-memory pipe.
pub struct DuplexReader(ReadHalf<DuplexStream>);

#[async_trait]
impl StreamReader for DuplexReader {
    async fn read(&mut self, max_bytes: usize) -> WispResult<ReadOutcome> {
        let mut buf = vec![0u8; max_bytes.max(1)];
        let n = self.0.read(&mut buf).await?;
        if n == 0 {
            return Ok(ReadOutcome::EndOfStream);
        }
        buf.truncate(n);
        Ok(ReadOutcome::Data(buf))
    }
}

/// Write half of an in-memory pipe.
pub struct DuplexWriter(WriteHalf<DuplexStream>);

#[async_trait]
impl StreamWriter for DuplexWriter {
    async fn write(&mut self, data: &[u8]) -> WispResult<usize> {
        Ok(self.0.write(data).await?)
    }

    async fn close(&mut self) -> WispResult<()> {
        self.0.shutdown().await?;
        Ok(())
    }
}

fn memory_stream(io: DuplexStream, label: &str) -> ByteStream {
    let (reader, writer) = tokio::io::split(io);
    ByteStream::new(
        StreamKind::Memory,
        label,
        Box::new(DuplexReader(reader)),
        Box::new(DuplexWriter(writer)),
    )
}

/// Two connected in-memory streams: `(client end, server end)`.
pub fn memory_pair() -> (ByteStream, ByteStream) {
    let (client, server) = tokio::io::duplex(256 * 1024);
    (
        memory_stream(client, "memory-client"),
        memory_stream(server, "memory-server"),
    )
}

/// What the test server accepts and how its shell behaves.
#[derive(Clone)]
pub struct TestServerConfig {
    pub host_key: Ed25519KeyPair,
    pub user: String,
    pub password: Option<String>,
    pub verification_code: Option<String>,
    pub authorized_key: Option<Vec<u8>>,
    pub banner: Option<String>,
    pub exit_status: u32,
    pub refuse_pty: bool,
    pub window_size: u32,
}

impl TestServerConfig {
    /// A server for `user` with a fresh host key and no credentials.
    pub fn new(user: &str) -> Self {
        Self {
            host_key: Ed25519KeyPair::generate(),
            user: user.to_string(),
            password: None,
            verification_code: None,
            authorized_key: None,
            banner: None,
            exit_status: 0,
            refuse_pty: false,
            window_size: 1024 * 1024,
        }
    }

    pub fn with_password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    pub fn with_verification_code(mut self, code: &str) -> Self {
        self.verification_code = Some(code.to_string());
        self
    }

    pub fn with_authorized_key(mut self, blob: Vec<u8>) -> Self {
        self.authorized_key = Some(blob);
        self
    }

    pub fn with_host_key(mut self, key: Ed25519KeyPair) -> Self {
        self.host_key = key;
        self
    }

    pub fn with_banner(mut self, banner: &str) -> Self {
        self.banner = Some(banner.to_string());
        self
    }

    pub fn with_exit_status(mut self, status: u32) -> Self {
        self.exit_status = status;
        self
    }

    fn methods(&self) -> Vec<String> {
        let mut methods = Vec::new();
        if self.authorized_key.is_some() {
            methods.push("publickey".to_string());
        }
        if self.verification_code.is_some() {
            methods.push("keyboard-interactive".to_string());
        }
        if self.password.is_some() {
            methods.push("password".to_string());
        }
        methods
    }
}

/// What the server observed.
#[derive(Debug, Default, Clone)]
pub struct ServerReport {
    pub auth_method: Option<String>,
    pub password_attempts: u32,
    pub term: Option<String>,
    pub pty_size: Option<(u32, u32)>,
    pub env: Vec<(String, String)>,
    pub window_changes: Vec<(u32, u32)>,
    pub input: Vec<u8>,
    pub kex_count: u32,
    pub keepalives: u32,
    pub window_adjusts: u32,
    pub client_closed_channel: bool,
    pub client_disconnected: bool,
}

struct KexContext {
    client_version: String,
    server_version: String,
    host_key: Ed25519KeyPair,
    session_id: Option<Vec<u8>>,
}

/// Runs one connection to completion.
pub async fn run_server(stream: ByteStream, config: TestServerConfig) -> WispResult<ServerReport> {
    let (reader, writer) = stream.into_split();
    let mut transport = Transport::new(reader, writer, Role::Server, RekeyTracker::default());
    let ours = Version::new("WispTestServer_1.0", None);
    let banner = transport.exchange_versions(&ours).await?;

    let mut ctx = KexContext {
        client_version: banner.line,
        server_version: ours.to_string(),
        host_key: config.host_key.clone(),
        session_id: None,
    };
    let mut report = ServerReport::default();

    match server_kex(&mut transport, &mut ctx, None).await {
        Ok(()) => report.kex_count += 1,
        // The client hung up, e.g. after rejecting the host key.
        Err(WispError::ConnectionFailed(_)) => return Ok(report),
        Err(e) => return Err(e),
    }

    let Some(request) = read_or_end(&mut transport).await? else {
        return Ok(report);
    };
    if request.first() == Some(&(MessageType::Disconnect as u8)) {
        report.client_disconnected = true;
        return Ok(report);
    }
    let service = parse_service_name(&request)?;
    transport.write_payload(&service_accept(&service)).await?;

    if let Some(text) = &config.banner {
        transport
            .write_payload(&AuthBanner::new(text.clone()).to_bytes())
            .await?;
    }

    if !serve_auth(&mut transport, &mut ctx, &config, &mut report).await? {
        return Ok(report);
    }
    serve_session(&mut transport, &mut ctx, &config, &mut report).await?;
    Ok(report)
}

async fn read_or_end(transport: &mut Transport) -> WispResult<Option<Vec<u8>>> {
    match transport.read_payload().await {
        Ok(payload) => Ok(Some(payload)),
        Err(WispError::ConnectionFailed(_)) => Ok(None),
        Err(e) => Err(e),
    }
}

async fn read_kex(transport: &mut Transport, expected: MessageType) -> WispResult<Vec<u8>> {
    loop {
        let payload = transport.read_wire_payload().await?;
        let msg = payload.first().copied().unwrap_or_default();
        if msg == expected as u8 {
            return Ok(payload);
        }
        match msg {
            2 | 4 => {}
            1 | 20 | 21 | 30 | 31 => {
                return Err(WispError::ConnectionFailed(format!(
                    "expected {} got {}",
                    expected.name(),
                    msg
                )))
            }
            _ => transport.defer(payload),
        }
    }
}

async fn server_kex(
    transport: &mut Transport,
    ctx: &mut KexContext,
    client_kexinit: Option<Vec<u8>>,
) -> WispResult<()> {
    let ours = KexInit::server_default().with_host_key_algorithms(&["ssh-ed25519"]);
    let server_kexinit = ours.to_bytes();
    transport.write_payload(&server_kexinit).await?;

    let client_kexinit = match client_kexinit {
        Some(payload) => payload,
        None => read_kex(transport, MessageType::KexInit).await?,
    };
    let theirs = KexInit::from_bytes(&client_kexinit)?;
    let negotiated = Negotiated::from_kexinits(&theirs, &ours)?;

    let init = read_kex(transport, MessageType::KexdhInit).await?;
    let mut offset = 1;
    let client_ephemeral = read_string(&init, &mut offset)?.to_vec();

    let exchange = EcdhExchange::new(KexMethod::from_name(&negotiated.kex)?)?;
    let server_ephemeral = exchange.public_key().to_vec();
    let shared_secret = exchange.compute_shared_secret(&client_ephemeral)?;
    let host_key_blob = ctx.host_key.public_key_blob();
    let hash = exchange_hash(&ExchangeHashInput {
        client_version: &ctx.client_version,
        server_version: &ctx.server_version,
        client_kexinit: &client_kexinit,
        server_kexinit: &server_kexinit,
        host_key_blob: &host_key_blob,
        client_ephemeral: &client_ephemeral,
        server_ephemeral: &server_ephemeral,
        shared_secret: &shared_secret,
    });
    let signature = ctx.host_key.sign(&hash)?;

    let mut reply = BytesMut::new();
    reply.put_u8(MessageType::KexdhReply as u8);
    put_string(&mut reply, &host_key_blob);
    put_string(&mut reply, &server_ephemeral);
    put_string(&mut reply, &signature);
    transport.write_payload(&reply).await?;
    transport.write_payload(&NewKeys::new().to_bytes()).await?;

    let session_id = ctx.session_id.get_or_insert_with(|| hash.clone()).clone();
    let (sealing, opening) = SessionKeys::derive(
        &shared_secret,
        &hash,
        &session_id,
        negotiated.cipher_client_to_server,
        negotiated.cipher_server_to_client,
    )
    .split(Role::Server);
    transport
        .codec_mut()
        .install_sealer(PacketSealer::new(&sealing)?, negotiated.strict_kex);

    let newkeys = read_kex(transport, MessageType::NewKeys).await?;
    NewKeys::from_bytes(&newkeys)?;
    transport
        .codec_mut()
        .install_opener(PacketOpener::new(&opening)?, negotiated.strict_kex);
    Ok(())
}

async fn serve_auth(
    transport: &mut Transport,
    ctx: &mut KexContext,
    config: &TestServerConfig,
    report: &mut ServerReport,
) -> WispResult<bool> {
    let methods = config.methods();
    let failure = AuthFailure::new(methods, false).to_bytes();
    let session_id = ctx.session_id.clone().unwrap_or_default();
    let mut carried: Option<Vec<u8>> = None;

    loop {
        let payload = match carried.take() {
            Some(payload) => payload,
            None => match read_or_end(transport).await? {
                Some(payload) => payload,
                None => return Ok(false),
            },
        };
        if payload.first() == Some(&(MessageType::Disconnect as u8)) {
            report.client_disconnected = true;
            return Ok(false);
        }
        if payload.first() == Some(&(MessageType::KexInit as u8)) {
            server_kex(transport, ctx, Some(payload)).await?;
            report.kex_count += 1;
            continue;
        }
        if payload.first() == Some(&(MessageType::Ignore as u8)) {
            continue;
        }

        let request = AuthRequest::from_bytes(&payload)?;
        if request.user_name() != config.user {
            transport.write_payload(&failure).await?;
            continue;
        }

        let accepted = match request.method() {
            AuthMethod::None => false,
            AuthMethod::PublicKey {
                algorithm,
                public_key,
                signature,
            } => {
                if config.authorized_key.as_ref() != Some(public_key) {
                    false
                } else if let Some(signature) = signature {
                    let data = construct_signature_data(
                        &session_id,
                        request.user_name(),
                        request.service_name(),
                        algorithm,
                        public_key,
                    );
                    PublicHostKey::from_blob(public_key)?
                        .verify(algorithm, &data, signature)
                        .is_ok()
                } else {
                    let ok = AuthPkOk::new(algorithm.clone(), public_key.clone());
                    transport.write_payload(&ok.to_bytes()).await?;
                    continue;
                }
            }
            AuthMethod::Password(password) => {
                report.password_attempts += 1;
                config.password.as_deref() == Some(password.as_str())
            }
            AuthMethod::KeyboardInteractive { .. } => {
                let Some(code) = &config.verification_code else {
                    transport.write_payload(&failure).await?;
                    continue;
                };
                let info = InfoRequest {
                    name: String::new(),
                    instruction: "Two-factor check".to_string(),
                    prompts: vec![Prompt {
                        text: "Verification code: ".to_string(),
                        echo: false,
                    }],
                };
                transport.write_payload(&info.to_bytes()).await?;
                let Some(reply) = read_or_end(transport).await? else {
                    return Ok(false);
                };
                if reply.first() != Some(&(MessageType::UserauthInfoResponse as u8)) {
                    carried = Some(reply);
                    continue;
                }
                let response = InfoResponse::from_bytes(&reply)?;
                response.responses().first() == Some(code)
            }
        };

        if accepted {
            report.auth_method = Some(request.method().name().to_string());
            transport
                .write_payload(&[MessageType::UserauthSuccess as u8])
                .await?;
            return Ok(true);
        }
        transport.write_payload(&failure).await?;
    }
}

struct ShellState {
    client_channel: u32,
    client_window: u32,
    client_max_packet: u32,
    output: VecDeque<u8>,
    line: Vec<u8>,
    closing: bool,
    finished: bool,
}

impl ShellState {
    async fn flush(&mut self, transport: &mut Transport) -> WispResult<()> {
        while !self.output.is_empty() && self.client_window > 0 {
            let n = self
                .output
                .len()
                .min(self.client_window as usize)
                .min(self.client_max_packet as usize);
            let data: Vec<u8> = self.output.drain(..n).collect();
            self.client_window -= n as u32;
            let message = ChannelMessage::Data {
                recipient_channel: self.client_channel,
                data,
            };
            transport.write_payload(&message.to_bytes()).await?;
        }
        Ok(())
    }

    fn print(&mut self, text: &[u8]) {
        self.output.extend(text.iter().copied());
    }
}

const SERVER_CHANNEL_ID: u32 = 7;

async fn serve_session(
    transport: &mut Transport,
    ctx: &mut KexContext,
    config: &TestServerConfig,
    report: &mut ServerReport,
) -> WispResult<()> {
    let mut shell: Option<ShellState> = None;

    loop {
        let Some(payload) = read_or_end(transport).await? else {
            return Ok(());
        };
        let msg = payload.first().copied().unwrap_or_default();
        match MessageType::from_u8(msg) {
            Some(MessageType::Disconnect) => {
                report.client_disconnected = true;
                return Ok(());
            }
            Some(MessageType::Ignore) => {
                report.keepalives += 1;
                continue;
            }
            Some(MessageType::KexInit) => {
                server_kex(transport, ctx, Some(payload)).await?;
                report.kex_count += 1;
                continue;
            }
            _ if !ChannelMessage::is_channel_message(msg) => continue,
            _ => {}
        }

        match ChannelMessage::from_bytes(&payload)? {
            ChannelMessage::Open(open) => {
                let confirmation = ChannelMessage::OpenConfirmation {
                    recipient_channel: open.sender_channel,
                    sender_channel: SERVER_CHANNEL_ID,
                    initial_window_size: config.window_size,
                    maximum_packet_size: 32768,
                };
                transport.write_payload(&confirmation.to_bytes()).await?;
                shell = Some(ShellState {
                    client_channel: open.sender_channel,
                    client_window: open.initial_window_size,
                    client_max_packet: open.maximum_packet_size,
                    output: VecDeque::new(),
                    line: Vec::new(),
                    closing: false,
                    finished: false,
                });
            }
            ChannelMessage::Request(request) => {
                let Some(state) = shell.as_mut() else {
                    continue;
                };
                let ok = match request.request_type() {
                    ChannelRequestType::PtyReq {
                        term, cols, rows, ..
                    } => {
                        report.term = Some(term.clone());
                        report.pty_size = Some((*cols, *rows));
                        !config.refuse_pty
                    }
                    ChannelRequestType::Env { name, value } => {
                        report.env.push((name.clone(), value.clone()));
                        true
                    }
                    ChannelRequestType::Shell => true,
                    ChannelRequestType::WindowChange { cols, rows, .. } => {
                        report.window_changes.push((*cols, *rows));
                        true
                    }
                    _ => false,
                };
                if request.want_reply() {
                    let reply = if ok {
                        ChannelMessage::Success {
                            recipient_channel: state.client_channel,
                        }
                    } else {
                        ChannelMessage::Failure {
                            recipient_channel: state.client_channel,
                        }
                    };
                    transport.write_payload(&reply.to_bytes()).await?;
                }
            }
            ChannelMessage::Data { data, .. } => {
                let Some(state) = shell.as_mut() else {
                    continue;
                };
                report.input.extend_from_slice(&data);
                for byte in data {
                    if byte != b'\r' && byte != b'\n' {
                        state.line.push(byte);
                        continue;
                    }
                    let line = String::from_utf8_lossy(&std::mem::take(&mut state.line)).into_owned();
                    run_command(transport, ctx, config, report, state, line.trim()).await?;
                }
                state.flush(transport).await?;
            }
            ChannelMessage::WindowAdjust { bytes_to_add, .. } => {
                report.window_adjusts += 1;
                if let Some(state) = shell.as_mut() {
                    state.client_window = state.client_window.saturating_add(bytes_to_add);
                    state.flush(transport).await?;
                    if state.closing && !state.finished && state.output.is_empty() {
                        finish(transport, config, state).await?;
                    }
                }
            }
            ChannelMessage::Close { .. } => {
                report.client_closed_channel = true;
                if let Some(state) = shell.as_ref() {
                    if !state.finished {
                        let close = ChannelMessage::Close {
                            recipient_channel: state.client_channel,
                        };
                        transport.write_payload(&close.to_bytes()).await?;
                    }
                }
            }
            _ => {}
        }
    }
}

async fn run_command(
    transport: &mut Transport,
    ctx: &mut KexContext,
    config: &TestServerConfig,
    report: &mut ServerReport,
    state: &mut ShellState,
    line: &str,
) -> WispResult<()> {
    if line.is_empty() {
        return Ok(());
    }
    match line.split_whitespace().collect::<Vec<_>>().as_slice() {
        ["ls"] => state.print(b"Cargo.toml  src\r\n"),
        ["big", count] => {
            let count: usize = count.parse().unwrap_or(0);
            state.print(&vec![b'x'; count]);
        }
        ["rekey"] => {
            state.flush(transport).await?;
            server_kex(transport, ctx, None).await?;
            report.kex_count += 1;
            state.print(b"rekeyed\r\n");
        }
        ["exit"] => {
            state.closing = true;
            state.flush(transport).await?;
            if state.output.is_empty() {
                finish(transport, config, state).await?;
            }
        }
        _ => {
            state.print(line.as_bytes());
            state.print(b"\r\n");
        }
    }
    Ok(())
}

async fn finish(
    transport: &mut Transport,
    config: &TestServerConfig,
    state: &mut ShellState,
) -> WispResult<()> {
    state.finished = true;
    let status = ChannelRequest::new(
        state.client_channel,
        ChannelRequestType::ExitStatus {
            exit_status: config.exit_status,
        },
        false,
    );
    transport
        .write_payload(&ChannelMessage::Request(status).to_bytes())
        .await?;
    transport
        .write_payload(
            &ChannelMessage::Eof {
                recipient_channel: state.client_channel,
            }
            .to_bytes(),
        )
        .await?;
    transport
        .write_payload(
            &ChannelMessage::Close {
                recipient_channel: state.client_channel,
            }
            .to_bytes(),
        )
        .await
}

/// Prompter answering from queues.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    pub passwords: VecDeque<String>,
    pub codes: VecDeque<String>,
    pub accept_host_key: bool,
    pub host_key_questions: u32,
    pub banners: Vec<String>,
}

impl ScriptedPrompter {
    pub fn with_passwords(passwords: &[&str]) -> Self {
        Self {
            passwords: passwords.iter().map(|p| p.to_string()).collect(),
            ..Self::default()
        }
    }
}

#[async_trait]
impl AuthPrompter for ScriptedPrompter {
    async fn password(&mut self, _user: &str, _host: &str) -> WispResult<Option<String>> {
        Ok(self.passwords.pop_front())
    }

    async fn keyboard_interactive(
        &mut self,
        _name: &str,
        _instruction: &str,
        prompts: &[Prompt],
    ) -> WispResult<Option<Vec<String>>> {
        Ok(self
            .codes
            .pop_front()
            .map(|code| vec![code; prompts.len()]))
    }

    async fn banner(&mut self, message: &str) -> WispResult<()> {
        self.banners.push(message.to_string());
        Ok(())
    }

    async fn confirm_host_key(
        &mut self,
        _host: &str,
        _port: u16,
        _key_type: &str,
        _fingerprint: &str,
    ) -> WispResult<bool> {
        self.host_key_questions += 1;
        Ok(self.accept_host_key)
    }
}
