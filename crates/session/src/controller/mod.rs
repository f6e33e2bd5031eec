//! The session engine.
//!
//! An [`Engine`] serves one [`EngineEnd`]. Each `startSession` runs one SSH
//! session through its phases:
//!
//! 1. **Bootstrapping**: parse the arguments, dial, handshake, authenticate
//!    and open a PTY shell. Prompts are answered from `onRead` on fd 0.
//! 2. **Interactive**: shell output goes out as `write` on fd 1 and 2 within
//!    the write window; keystrokes, resizes and acknowledgements come in.
//! 3. **Exiting**: the SSH connection is closed, a single `exit` is sent
//!    and the engine waits for `onExitAcknowledge`.
//!
//! Exit codes are the shell's exit status, 255 when the session failed or
//! the shell was killed, 2 for bad arguments and -1 when the control
//! channel went away.

mod prompter;
mod terminal;

use crate::config::ClientConfig;
use crate::gateway::{EngineEnd, EngineInput, EngineOutput, Outbound};
use crate::host::{STDERR_FD, STDOUT_FD};
use crate::params::{ConnectionParams, StartSessionArgs, DEFAULT_WRITE_WINDOW};
use crate::reconnect::ReconnectHandler;
use crate::stream::{DirectRelay, HostRouter, Relay, WebSocketRelay};
use prompter::TerminalPrompter;
use std::fmt;
use std::sync::Arc;
use terminal::{Inbox, Terminal};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};
use wisp_platform::{ByteStream, WispError, WispResult};
use wisp_proto::ssh::{ChannelEvent, DataStream, Identity, Keepalive, PtySize, SshClient};

/// Exit code when the control channel closed under a running session.
pub const EXIT_INBOUND_CLOSED: i32 = -1;
/// Exit code for failed sessions and shells killed by a signal.
pub const EXIT_FAILURE: i32 = 255;

/// Where the engine is in a session's life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Waiting for `startSession`.
    Idle,
    /// Dialing, handshaking and authenticating.
    Bootstrapping,
    /// The shell is running.
    Interactive,
    /// `exit` sent or about to be; waiting for the acknowledgement.
    Exiting,
    /// The session is over.
    Closed,
}

/// Outcome of one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    /// Per-engine session number, starting at 1.
    pub id: u64,
    /// `user@host[:port]`, if the arguments parsed.
    pub target: Option<String>,
    /// Code sent in `exit`.
    pub exit_code: i32,
}

/// Ends the running session from outside the control channel.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: mpsc::UnboundedSender<i32>,
}

impl ShutdownHandle {
    /// Asks the running session to exit with `code`. Ignored when no
    /// session is running.
    pub fn exit(&self, code: i32) {
        if self.tx.send(code).is_err() {
            debug!(code, "Engine gone; ignoring shutdown");
        }
    }
}

/// The engine side of the control-message boundary.
pub struct Engine {
    config: ClientConfig,
    relay: Option<Arc<dyn Relay>>,
    identities: Option<Vec<Identity>>,
    phase: watch::Sender<SessionPhase>,
    shutdown_tx: mpsc::UnboundedSender<i32>,
    shutdown_rx: mpsc::UnboundedReceiver<i32>,
    sessions: u64,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("relay", &self.relay.is_some())
            .field("phase", &*self.phase.borrow())
            .field("sessions", &self.sessions)
            .finish_non_exhaustive()
    }
}

/// Control channel plumbing shared by the sessions of one endpoint.
struct Wiring {
    inbox: Inbox,
    outbound: Outbound<EngineOutput>,
    router: HostRouter,
    pending_resize: Option<PtySize>,
    demux: JoinHandle<()>,
}

impl Wiring {
    fn new(end: EngineEnd) -> Self {
        let (inbound, outbound) = end.into_parts();
        let router = HostRouter::new(outbound.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let demux = tokio::spawn(demultiplex(inbound, router.clone(), tx));
        Self {
            inbox: Inbox::new(rx),
            outbound,
            router,
            pending_resize: None,
            demux,
        }
    }

    async fn wait_for_start(&mut self) -> Option<StartSessionArgs> {
        loop {
            match self.inbox.recv().await? {
                EngineInput::StartSession(args) => return Some(args),
                EngineInput::OnResize { width, height } => {
                    self.pending_resize = Some(PtySize::new(width, height));
                }
                EngineInput::OnExitAcknowledge => warn!("Exit acknowledged without an exit"),
                other => debug!(fd = ?other.fd(), "No session running; dropping input"),
            }
        }
    }
}

impl Drop for Wiring {
    fn drop(&mut self) {
        self.demux.abort();
    }
}

/// Routes completions for host sockets to their streams and everything
/// else to the session.
async fn demultiplex(
    mut inbound: mpsc::UnboundedReceiver<EngineInput>,
    router: HostRouter,
    tx: mpsc::UnboundedSender<EngineInput>,
) {
    while let Some(input) = inbound.recv().await {
        if let Some(input) = router.dispatch(input).await {
            if tx.send(input).is_err() {
                break;
            }
        }
    }
    debug!("Control input ended");
}

enum Step {
    Packet(WispResult<Vec<u8>>),
    Input(Option<EngineInput>),
    Shutdown(i32),
    Keepalive,
}

/// Live state of the interactive phase.
struct Shell {
    client: SshClient,
    status: Option<i32>,
    reading: bool,
}

impl Engine {
    /// Creates an engine. Sockets are dialed directly, through
    /// `config.relay_url`, or through the host when a session asks for it.
    pub fn new(config: ClientConfig) -> Self {
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let (shutdown_tx, shutdown_rx) = mpsc::unbounded_channel();
        Self {
            config,
            relay: None,
            identities: None,
            phase,
            shutdown_tx,
            shutdown_rx,
            sessions: 0,
        }
    }

    /// Dials through `relay` unless a session asks for host sockets.
    pub fn with_relay(mut self, relay: Arc<dyn Relay>) -> Self {
        self.relay = Some(relay);
        self
    }

    /// Authenticates with `identities` instead of the configured files.
    pub fn with_identities(mut self, identities: Vec<Identity>) -> Self {
        self.identities = Some(identities);
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Subscribes to phase changes.
    pub fn phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    /// Returns a handle that ends the running session.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Serves sessions on `end` until the other side goes away.
    pub async fn serve(&mut self, end: EngineEnd) -> Vec<SessionReport> {
        let mut wiring = Wiring::new(end);
        let mut reports = Vec::new();
        while let Some(args) = wiring.wait_for_start().await {
            reports.push(self.run(args, &mut wiring).await);
            if wiring.inbox.is_closed() {
                break;
            }
            self.set_phase(SessionPhase::Idle);
        }
        self.set_phase(SessionPhase::Closed);
        reports
    }

    /// Runs exactly one session on `end`.
    ///
    /// # Errors
    ///
    /// Returns [`WispError::ConnectionFailed`] if `end` closes before a
    /// `startSession` arrives. Session failures are reported through the
    /// exit code, not as errors.
    pub async fn run_session(&mut self, end: EngineEnd) -> WispResult<SessionReport> {
        let mut wiring = Wiring::new(end);
        let args = wiring.wait_for_start().await.ok_or_else(|| {
            WispError::ConnectionFailed("control channel closed before startSession".into())
        })?;
        Ok(self.run(args, &mut wiring).await)
    }

    fn set_phase(&self, phase: SessionPhase) {
        let previous = self.phase.send_replace(phase);
        if previous != phase {
            debug!(from = ?previous, to = ?phase, "Session phase");
        }
    }

    async fn run(&mut self, args: StartSessionArgs, wiring: &mut Wiring) -> SessionReport {
        self.sessions += 1;
        let id = self.sessions;
        while self.shutdown_rx.try_recv().is_ok() {}
        self.set_phase(SessionPhase::Bootstrapping);

        let params = match self
            .config
            .validate()
            .and_then(|()| ConnectionParams::from_start_session(&args))
        {
            Ok(params) => params,
            Err(e) => {
                warn!(session = id, error = %e, "Rejected startSession");
                let terminal = Terminal::new(
                    wiring.outbound.clone(),
                    PtySize::default(),
                    DEFAULT_WRITE_WINDOW,
                );
                if terminal.log(e.to_string()).is_err() {
                    debug!(session = id, "Control channel gone");
                }
                let exit_code = self.finish(id, None, e.exit_code(), wiring).await;
                return SessionReport {
                    id,
                    target: None,
                    exit_code,
                };
            }
        };

        let target = params.display_target();
        info!(session = id, target = %target, "Starting session");
        if params.compression {
            debug!(session = id, "Compression requested; only none is negotiated");
        }

        let size = wiring.pending_resize.take().unwrap_or(PtySize::new(
            params.terminal_width,
            params.terminal_height,
        ));
        let mut terminal = Terminal::new(wiring.outbound.clone(), size, params.write_window);
        let relay = self.select_relay(&params, &wiring.router);
        let identities = match &self.identities {
            Some(identities) => identities.clone(),
            None => self.config.load_identities(),
        };

        let booted = tokio::select! {
            booted = bootstrap(
                &self.config,
                relay,
                &params,
                &identities,
                &mut terminal,
                &mut wiring.inbox,
            ) => Ok(booted),
            Some(code) = self.shutdown_rx.recv() => Err(code),
        };

        let (client, code) = match booted {
            Ok(Ok(client)) => {
                self.set_phase(SessionPhase::Interactive);
                info!(session = id, target = %target, "Shell open");
                let mut shell = Shell {
                    client,
                    status: None,
                    reading: true,
                };
                let code = self.interactive(id, &mut shell, &mut terminal, wiring).await;
                (Some(shell.client), code)
            }
            Ok(Err(e)) if wiring.inbox.is_closed() => {
                debug!(session = id, error = %e, "Control channel closed during bootstrap");
                (None, EXIT_INBOUND_CLOSED)
            }
            Ok(Err(e)) => {
                warn!(session = id, error = %e, "Session failed");
                if terminal.log(e.to_string()).is_err() {
                    debug!(session = id, "Control channel gone");
                }
                (None, e.exit_code())
            }
            Err(code) => {
                info!(session = id, code, "Shutdown during bootstrap");
                (None, code)
            }
        };

        let exit_code = self.finish(id, client, code, wiring).await;
        SessionReport {
            id,
            target: Some(target),
            exit_code,
        }
    }

    fn select_relay(&self, params: &ConnectionParams, router: &HostRouter) -> Arc<dyn Relay> {
        if params.use_host_socket {
            return Arc::new(router.clone());
        }
        if let Some(relay) = &self.relay {
            return relay.clone();
        }
        match &self.config.relay_url {
            Some(url) => Arc::new(WebSocketRelay::new(url.clone())),
            None => Arc::new(DirectRelay::new(self.config.connect_timeout)),
        }
    }

    async fn interactive(
        &mut self,
        id: u64,
        shell: &mut Shell,
        terminal: &mut Terminal,
        wiring: &mut Wiring,
    ) -> i32 {
        let mut keepalive = Keepalive::new(self.config.keepalive_interval);

        if let Err(e) = flush_terminal_state(shell, terminal).await {
            return fail(id, shell, terminal, e);
        }

        loop {
            if !shell.reading && terminal.held_bytes() == 0 {
                let code = shell.status.unwrap_or(EXIT_FAILURE);
                info!(session = id, code, "Shell closed");
                return code;
            }

            let step = tokio::select! {
                packet = shell.client.read_packet(), if shell.reading => Step::Packet(packet),
                input = wiring.inbox.recv() => Step::Input(input),
                Some(code) = self.shutdown_rx.recv() => Step::Shutdown(code),
                () = keepalive.tick(), if shell.reading => Step::Keepalive,
            };

            let result = match step {
                Step::Packet(Ok(payload)) => {
                    keepalive.reset();
                    match shell.client.handle_packet(payload).await {
                        Ok(Some(event)) => on_channel_event(id, shell, terminal, event),
                        Ok(None) => Ok(()),
                        Err(e) => Err(e),
                    }
                }
                Step::Packet(Err(e)) => Err(e),
                Step::Input(None) => {
                    info!(session = id, "Control channel closed");
                    return EXIT_INBOUND_CLOSED;
                }
                Step::Input(Some(input)) => match terminal.absorb(input) {
                    Ok(Some(keys)) if shell.reading => shell.client.send_data(&keys).await,
                    Ok(Some(_)) => {
                        trace!(session = id, "Shell closed; dropping keystrokes");
                        Ok(())
                    }
                    Ok(None) => flush_terminal_state(shell, terminal).await,
                    Err(e) => Err(e),
                },
                Step::Shutdown(code) => {
                    info!(session = id, code, "Shutdown requested");
                    return code;
                }
                Step::Keepalive => shell.client.send_keepalive().await,
            };

            if let Err(e) = result {
                return fail(id, shell, terminal, e);
            }
        }
    }

    async fn finish(
        &mut self,
        id: u64,
        client: Option<SshClient>,
        code: i32,
        wiring: &mut Wiring,
    ) -> i32 {
        self.set_phase(SessionPhase::Exiting);
        if let Some(mut client) = client {
            if let Err(e) = client.close().await {
                debug!(session = id, error = %e, "Disconnect failed");
            }
        }
        wiring.router.clear().await;

        info!(session = id, code, "Session exit");
        if wiring.outbound.send(EngineOutput::Exit(code)).is_ok() {
            loop {
                match wiring.inbox.recv().await {
                    Some(EngineInput::OnExitAcknowledge) | None => break,
                    Some(other) => trace!(session = id, fd = ?other.fd(), "Discarding input after exit"),
                }
            }
        } else {
            debug!(session = id, "Control channel gone; exit not delivered");
        }
        self.set_phase(SessionPhase::Closed);
        code
    }
}

async fn bootstrap(
    config: &ClientConfig,
    relay: Arc<dyn Relay>,
    params: &ConnectionParams,
    identities: &[Identity],
    terminal: &mut Terminal,
    inbox: &mut Inbox,
) -> WispResult<SshClient> {
    let stream = dial(config, relay, &params.hostname, params.port).await?;
    debug!(peer = %stream.label(), kind = ?stream.kind(), "Connected");

    let mut prompter = TerminalPrompter::new(terminal, inbox);
    let mut client = SshClient::connect(
        stream,
        &params.hostname,
        params.port,
        config.ssh_config(),
        &mut prompter,
    )
    .await?;
    client
        .authenticate(&params.username, &mut prompter, identities)
        .await?;

    let size = terminal.size();
    terminal.take_resize();
    client.open_pty_session(size, &params.environment).await?;
    Ok(client)
}

async fn dial(
    config: &ClientConfig,
    relay: Arc<dyn Relay>,
    host: &str,
    port: u16,
) -> WispResult<ByteStream> {
    if !config.reconnect.enabled {
        return relay.open_socket(host, port).await;
    }
    let mut handler = ReconnectHandler::new(config.reconnect);
    handler
        .reconnect_with_backoff(|| {
            let relay = relay.clone();
            let host = host.to_string();
            async move { relay.open_socket(&host, port).await }
        })
        .await
}

/// Forwards typeahead, acknowledged window and size changes to the shell.
async fn flush_terminal_state(shell: &mut Shell, terminal: &mut Terminal) -> WispResult<()> {
    if !shell.reading {
        return Ok(());
    }
    let typed = terminal.take_typeahead();
    if !typed.is_empty() {
        shell.client.send_data(&typed).await?;
    }
    let released = terminal.take_release();
    if released > 0 {
        shell.client.release_window(released).await?;
    }
    if let Some(size) = terminal.take_resize() {
        shell.client.window_change(size).await?;
    }
    Ok(())
}

fn on_channel_event(
    id: u64,
    shell: &mut Shell,
    terminal: &mut Terminal,
    event: ChannelEvent,
) -> WispResult<()> {
    match event {
        ChannelEvent::Data { stream, data } => {
            let fd = match stream {
                DataStream::Stdout => STDOUT_FD,
                DataStream::Stderr => STDERR_FD,
            };
            terminal.emit(fd, data, true)?;
        }
        ChannelEvent::ExitStatus(status) => {
            info!(session = id, status, "Shell exited");
            shell.status = Some(i32::try_from(status).unwrap_or(EXIT_FAILURE));
        }
        ChannelEvent::ExitSignal {
            signal_name,
            core_dumped,
            error_message,
        } => {
            info!(session = id, signal = %signal_name, core_dumped, "Shell killed");
            let mut text = format!("Remote shell killed by signal {}", signal_name);
            if core_dumped {
                text.push_str(" (core dumped)");
            }
            if !error_message.is_empty() {
                text.push_str(": ");
                text.push_str(&error_message);
            }
            terminal.log(text)?;
            shell.status = Some(EXIT_FAILURE);
        }
        ChannelEvent::Eof => debug!(session = id, "Shell sent EOF"),
        ChannelEvent::Closed => {
            debug!(session = id, held = terminal.held_bytes(), "Channel closed");
            shell.reading = false;
        }
        ChannelEvent::Disconnected {
            reason,
            description,
        } => {
            info!(session = id, reason, description = %description, "Server disconnected");
            if shell.status.is_none() {
                terminal.log(format!("Disconnected: {}", description))?;
            }
            shell.reading = false;
        }
    }
    Ok(())
}

fn fail(id: u64, shell: &Shell, terminal: &Terminal, error: WispError) -> i32 {
    if let Some(status) = shell.status {
        debug!(session = id, error = %error, "Connection ended after exit status");
        return status;
    }
    warn!(session = id, error = %error, "Session failed");
    if terminal.log(error.to_string()).is_err() {
        debug!(session = id, "Control channel gone");
    }
    EXIT_FAILURE
}
