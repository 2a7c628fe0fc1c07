//! Automation session: the typed operations on top of the RPC client.
//!
//! A session walks `Uninitialized -> Handshaking -> Ready -> Connected`.
//! The facade enforces the order itself: nothing but `handshake` is sent
//! before the `initialize` / `notifications/initialized` exchange is done,
//! and UI operations are refused until `connect` succeeds. Any fatal error
//! (transport lost, session closed) drops the session straight to `Closed`.

use std::io;
use std::time::Duration;

use marionette_core::content::{ScreenImage, ToolCallResult};
use marionette_core::error::{ClientError, DecodeError};
use marionette_core::outcome::{ConnectResult, ElementList, TapOutcome};
use marionette_core::protocol::{
    methods, tools, InitializeParams, InitializeResult, ServerInfo, ToolCallParams,
    ToolDescriptor, ToolList,
};
use marionette_core::state::SessionState;
use marionette_core::target::TapTarget;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info, warn};

use crate::driver::client::RpcClient;
use crate::driver::config::DriverConfig;
use crate::driver::process::PeerProcess;

pub struct Session {
    client: RpcClient,
    /// `None` when driving streams that are not a child process.
    process: Option<PeerProcess>,
    state: SessionState,
    config: DriverConfig,
    server: Option<InitializeResult>,
}

impl Session {
    /// Spawn the configured peer. The session starts `Uninitialized`.
    pub fn spawn(config: DriverConfig) -> Result<Self, ClientError> {
        let mut process = PeerProcess::spawn(&config.peer_command)?;
        let stdin = process
            .take_stdin()
            .ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = process
            .take_stdout()
            .ok_or_else(|| missing_pipe("stdout"))?;

        let client = RpcClient::new(stdout, stdin, config.call_timeout);
        Ok(Self {
            client,
            process: Some(process),
            state: SessionState::Uninitialized,
            config,
            server: None,
        })
    }

    /// Drive a peer over arbitrary streams instead of a child process.
    #[allow(dead_code)]
    pub fn over_streams<R, W>(reader: R, writer: W, config: DriverConfig) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            client: RpcClient::new(reader, writer, config.call_timeout),
            process: None,
            state: SessionState::Uninitialized,
            config,
            server: None,
        }
    }

    /// Spawn the peer and complete the handshake.
    ///
    /// On failure the peer is shut down before the error is returned.
    pub async fn start(config: DriverConfig) -> Result<Self, ClientError> {
        let mut session = Self::spawn(config)?;
        match session.handshake().await {
            Ok(_) => Ok(session),
            Err(e) => {
                session.shutdown().await;
                Err(e)
            }
        }
    }

    #[allow(dead_code)]
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Full `initialize` result, once the handshake is done.
    pub fn initialize_result(&self) -> Option<&InitializeResult> {
        self.server.as_ref()
    }

    /// Recent peer stderr output, for error reports.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.process
            .as_ref()
            .map(PeerProcess::stderr_tail)
            .unwrap_or_default()
    }

    /// The underlying RPC client, for raw calls and notification observers.
    pub fn client(&self) -> &RpcClient {
        &self.client
    }

    /// Handshake with the configured client identity.
    pub async fn handshake(&mut self) -> Result<ServerInfo, ClientError> {
        let params = InitializeParams::new(self.config.client_info.clone());
        self.handshake_with(params).await
    }

    /// Send `initialize`, then `notifications/initialized`, then wait for the
    /// peer to settle.
    pub async fn handshake_with(
        &mut self,
        params: InitializeParams,
    ) -> Result<ServerInfo, ClientError> {
        if self.state != SessionState::Uninitialized {
            return Err(self.invalid_state("handshake", "uninitialized"));
        }
        self.transition(SessionState::Handshaking);

        match self.initialize(&params).await {
            Ok((result, server)) => {
                info!("Handshake complete with {}", server);
                self.server = Some(result);
                self.transition(SessionState::Ready);
                Ok(server)
            }
            Err(e) => {
                let next = if e.is_fatal() {
                    SessionState::Closed
                } else {
                    SessionState::Uninitialized
                };
                self.transition(next);
                Err(e)
            }
        }
    }

    async fn initialize(
        &self,
        params: &InitializeParams,
    ) -> Result<(InitializeResult, ServerInfo), ClientError> {
        let value = self
            .client
            .call(methods::INITIALIZE, Some(to_params(methods::INITIALIZE, params)?))
            .await?;

        let result: InitializeResult = serde_json::from_value(value).map_err(|source| {
            ClientError::decode(
                "initialize result",
                DecodeError::Shape {
                    what: "initialize result",
                    source,
                },
            )
        })?;
        let server = result.server_info.clone().ok_or_else(|| {
            ClientError::decode("initialize result", DecodeError::Missing("serverInfo"))
        })?;

        if let Some(version) = &result.protocol_version {
            if version != &params.protocol_version {
                warn!(
                    "Peer answered with protocol {}, requested {}",
                    version, params.protocol_version
                );
            }
        }

        self.client.notify(methods::INITIALIZED, None)?;
        settle(self.config.handshake_settle).await;
        Ok((result, server))
    }

    /// Tools the peer offers. Valid once the handshake is done.
    pub async fn list_tools(&mut self) -> Result<Vec<ToolDescriptor>, ClientError> {
        self.require_ready("list_tools")?;
        let result = self.client.call(methods::TOOLS_LIST, None).await;
        let value = self.observe(result)?;

        let list: ToolList = serde_json::from_value(value).map_err(|source| {
            ClientError::decode(
                "tool list",
                DecodeError::Shape {
                    what: "tools/list result",
                    source,
                },
            )
        })?;
        Ok(list.tools)
    }

    /// Attach the peer to the app's runtime debug endpoint.
    ///
    /// A refusal from the peer is a `ToolFailed` error and leaves the session
    /// `Ready`. Connecting again from `Connected` is allowed.
    pub async fn connect(&mut self, uri: &str) -> Result<ConnectResult, ClientError> {
        self.require_ready("connect")?;
        info!("Connecting to {}", uri);

        let result = self.tool(tools::CONNECT, json!({ "uri": uri })).await;
        let result = self.observe(result)?;
        let message = failed_tool(tools::CONNECT, result)?.text();

        self.transition(SessionState::Connected);
        settle(self.config.connect_settle).await;
        Ok(ConnectResult {
            uri: uri.to_string(),
            message,
        })
    }

    /// Inspect the UI. Every call asks the peer for a fresh listing.
    pub async fn list_interactive_elements(&mut self) -> Result<ElementList, ClientError> {
        self.require_connected("list_interactive_elements")?;

        let result = self.tool(tools::GET_INTERACTIVE_ELEMENTS, json!({})).await;
        let result = self.observe(result)?;
        let result = failed_tool(tools::GET_INTERACTIVE_ELEMENTS, result)?;

        let list = ElementList::from_text(result.text());
        debug!("Peer listed {} interactive elements", list.len());
        Ok(list)
    }

    /// Tap a widget by text or key, or a screen coordinate.
    ///
    /// The outcome reports what the peer said; whether the UI reacted is up
    /// to the caller to check.
    pub async fn tap(&mut self, target: &TapTarget) -> Result<TapOutcome, ClientError> {
        self.require_connected("tap")?;
        debug!("Tapping {}", target);

        let result = self.tool(tools::TAP, target.to_arguments()).await;
        let result = self.observe(result)?;

        let outcome = TapOutcome::from_result(&result);
        if !outcome.success {
            warn!("Tap on {} reported: {}", target, outcome.message);
        }
        Ok(outcome)
    }

    /// Capture the screen. Returns every image the peer sent, at least one.
    pub async fn capture_screen(&mut self) -> Result<Vec<ScreenImage>, ClientError> {
        self.require_connected("capture_screen")?;

        let result = self.tool(tools::TAKE_SCREENSHOTS, json!({})).await;
        let result = self.observe(result)?;
        let result = failed_tool(tools::TAKE_SCREENSHOTS, result)?;

        let images = result
            .images()
            .map_err(|source| ClientError::decode("screen capture", source))?;
        if images.is_empty() {
            return Err(ClientError::decode(
                "screen capture",
                DecodeError::Missing("image content"),
            ));
        }
        Ok(images)
    }

    /// Call any tool by name. The result is returned as-is, `isError`
    /// included.
    pub async fn call_tool(
        &mut self,
        name: &str,
        arguments: Value,
    ) -> Result<ToolCallResult, ClientError> {
        self.require_connected("call_tool")?;
        let result = self.tool(name, arguments).await;
        self.observe(result)
    }

    /// Close the transport and stop the peer. Safe with calls in flight:
    /// they fail with `SessionClosed`.
    pub async fn shutdown(mut self) {
        if !self.state.is_closed() {
            self.transition(SessionState::Closing);
        }
        self.client.close().await;

        if let Some(mut process) = self.process.take() {
            if let Err(e) = process.shutdown(self.config.shutdown_grace).await {
                warn!("Failed to stop peer cleanly: {}", e);
            }
        }
        self.transition(SessionState::Closed);
    }

    async fn tool(&self, name: &str, arguments: Value) -> Result<ToolCallResult, ClientError> {
        let params = to_params(methods::TOOLS_CALL, &ToolCallParams::new(name, arguments))?;
        let value = self.client.call(methods::TOOLS_CALL, Some(params)).await?;
        ToolCallResult::from_value(&value).map_err(|source| ClientError::decode("tool result", source))
    }

    /// Close the session on fatal errors, pass everything through.
    fn observe<T>(&mut self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(e) = &result {
            if e.is_fatal() && !self.state.is_closed() {
                error!("Session lost: {}", e);
                if let Some(process) = self.process.as_mut() {
                    if process.has_exited() {
                        error!("Peer process is no longer running");
                    }
                }
                let tail = self.stderr_tail();
                if !tail.is_empty() {
                    error!("Last peer output:\n{}", tail.join("\n"));
                }
                self.transition(SessionState::Closed);
            }
        }
        result
    }

    fn require_ready(&mut self, operation: &'static str) -> Result<(), ClientError> {
        self.check_transport();
        match self.state {
            SessionState::Ready | SessionState::Connected => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(ClientError::SessionClosed),
            _ => Err(self.invalid_state(operation, "ready")),
        }
    }

    fn require_connected(&mut self, operation: &'static str) -> Result<(), ClientError> {
        self.check_transport();
        match self.state {
            SessionState::Connected => Ok(()),
            SessionState::Closing | SessionState::Closed => Err(ClientError::SessionClosed),
            _ => Err(self.invalid_state(operation, "connected")),
        }
    }

    /// The read loop may have lost the peer since the last call.
    fn check_transport(&mut self) {
        if self.client.is_closed() && !self.state.is_closed() {
            warn!("Peer connection was lost");
            self.transition(SessionState::Closed);
        }
    }

    fn invalid_state(&self, operation: &'static str, required: &'static str) -> ClientError {
        ClientError::InvalidState {
            operation,
            required,
            actual: self.state,
        }
    }

    fn transition(&mut self, next: SessionState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Unexpected session transition {} -> {}", self.state, next);
        }
        debug!("Session {} -> {}", self.state, next);
        self.state = next;
    }
}

fn missing_pipe(stream: &str) -> ClientError {
    ClientError::Transport(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("peer {} was not captured", stream),
    ))
}

fn to_params<T: Serialize>(method: &str, params: &T) -> Result<Value, ClientError> {
    serde_json::to_value(params).map_err(|source| ClientError::Encode {
        method: method.to_string(),
        source,
    })
}

/// Turn a result flagged `isError` into `ToolFailed`.
fn failed_tool(tool: &str, result: ToolCallResult) -> Result<ToolCallResult, ClientError> {
    if result.is_error {
        return Err(ClientError::ToolFailed {
            tool: tool.to_string(),
            message: result.text(),
        });
    }
    Ok(result)
}

async fn settle(pause: Duration) {
    if !pause.is_zero() {
        debug!("Waiting {:?} for the peer to settle", pause);
        tokio::time::sleep(pause).await;
    }
}
