//! In-memory transport and strategy doubles for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::builder::StrategyFactory;
use super::error::ChainError;
use super::strategy::{ConnectionStrategy, HopChannel};
use super::transport::{
    Endpoint, ExecOutput, RemoteSession, ShellStream, Transport, TransportError,
};
use super::types::{HostConfig, TransportKind};

/// Observes a [`ScriptedShell`] after it has been boxed away.
#[derive(Clone, Default)]
pub(crate) struct ShellTranscript {
    sent: Arc<Mutex<Vec<String>>>,
    closed: Arc<AtomicBool>,
}

impl ShellTranscript {
    /// Everything written to the shell, one entry per `send`.
    pub(crate) fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A PTY that answers sent lines from a script.
///
/// Lines are echoed back (CRLF-terminated) unless `no_echo` is set, then the
/// first unused rule for that line queues its reply chunks.
pub(crate) struct ScriptedShell {
    rules: Vec<(String, Vec<String>)>,
    echo: bool,
    hang_up: bool,
    pending: VecDeque<Vec<u8>>,
    transcript: ShellTranscript,
}

impl ScriptedShell {
    pub(crate) fn new() -> Self {
        Self {
            rules: Vec::new(),
            echo: true,
            hang_up: false,
            pending: VecDeque::new(),
            transcript: ShellTranscript::default(),
        }
    }

    pub(crate) fn greeting(mut self, text: &str) -> Self {
        self.pending.push_back(text.as_bytes().to_vec());
        self
    }

    pub(crate) fn greeting_chunks(mut self, chunks: &[&str]) -> Self {
        for chunk in chunks {
            self.pending.push_back(chunk.as_bytes().to_vec());
        }
        self
    }

    pub(crate) fn on(mut self, line: &str, reply: &str) -> Self {
        self.rules.push((line.to_string(), vec![reply.to_string()]));
        self
    }

    pub(crate) fn no_echo(mut self) -> Self {
        self.echo = false;
        self
    }

    /// Report the stream as closed once queued output is drained.
    pub(crate) fn hang_up(mut self) -> Self {
        self.hang_up = true;
        self
    }

    pub(crate) fn transcript(&self) -> ShellTranscript {
        self.transcript.clone()
    }
}

#[async_trait]
impl ShellStream for ScriptedShell {
    async fn send(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.transcript.is_closed() {
            return Err(TransportError::Closed);
        }

        let text = String::from_utf8_lossy(data).into_owned();
        self.transcript.sent.lock().unwrap().push(text.clone());

        let line = text.trim_end_matches(['\r', '\n']);
        if self.echo && line.len() != text.len() {
            self.pending.push_back(format!("{}\r\n", line).into_bytes());
        }
        if let Some(at) = self.rules.iter().position(|(on, _)| on == line) {
            let (_, reply) = self.rules.remove(at);
            self.pending
                .extend(reply.into_iter().map(String::into_bytes));
        }
        Ok(())
    }

    fn try_recv(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.transcript.is_closed() {
            return Err(TransportError::Closed);
        }
        match self.pending.pop_front() {
            Some(chunk) => Ok(Some(chunk)),
            None if self.hang_up => Err(TransportError::Closed),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.transcript.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted behavior of one fake host.
#[derive(Default)]
pub(crate) struct FakeHost {
    refuse: Option<TransportError>,
    exec: HashMap<String, ExecOutput>,
    shells: VecDeque<ScriptedShell>,
    disconnect_error: Option<TransportError>,
}

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn refuse(mut self, error: TransportError) -> Self {
        self.refuse = Some(error);
        self
    }

    pub(crate) fn exec(mut self, command: &str, stdout: &str, stderr: &str, status: u32) -> Self {
        self.exec.insert(
            command.to_string(),
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                exit_status: Some(status),
                timed_out: false,
            },
        );
        self
    }

    pub(crate) fn exec_timeout(mut self, command: &str, partial: &str) -> Self {
        self.exec.insert(
            command.to_string(),
            ExecOutput {
                stdout: partial.to_string(),
                timed_out: true,
                ..Default::default()
            },
        );
        self
    }

    /// Queue a shell returned by the next `open_shell` on this host.
    pub(crate) fn shell(mut self, shell: ScriptedShell) -> Self {
        self.shells.push_back(shell);
        self
    }

    pub(crate) fn failing_disconnect(mut self, error: TransportError) -> Self {
        self.disconnect_error = Some(error);
        self
    }
}

#[derive(Default)]
struct WorldState {
    hosts: HashMap<String, FakeHost>,
    events: Vec<String>,
    endpoints: HashMap<String, Endpoint>,
}

/// A network of fake hosts with an event log shared by every session.
#[derive(Clone, Default)]
pub(crate) struct FakeWorld {
    state: Arc<Mutex<WorldState>>,
}

impl FakeWorld {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_host(self, host_name: &str, host: FakeHost) -> Self {
        self.state
            .lock()
            .unwrap()
            .hosts
            .insert(host_name.to_string(), host);
        self
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(FakeTransport {
            world: self.clone(),
        })
    }

    /// Event log, e.g. `connect b1`, `tunnel b1->t`, `exec t: echo hi`.
    pub(crate) fn events(&self) -> Vec<String> {
        self.state.lock().unwrap().events.clone()
    }

    /// The endpoint last used to reach `host_name`.
    pub(crate) fn endpoint(&self, host_name: &str) -> Option<Endpoint> {
        self.state.lock().unwrap().endpoints.get(host_name).cloned()
    }

    fn record(&self, event: String) {
        self.state.lock().unwrap().events.push(event);
    }

    fn open(
        &self,
        via: Option<&str>,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        self.record(match via {
            Some(parent) => format!("tunnel {}->{}", parent, endpoint.host_name),
            None => format!("connect {}", endpoint.host_name),
        });

        let mut state = self.state.lock().unwrap();
        state
            .endpoints
            .insert(endpoint.host_name.clone(), endpoint.clone());
        let host = state
            .hosts
            .get(&endpoint.host_name)
            .ok_or_else(|| TransportError::Connect("No route to host".to_string()))?;
        if let Some(error) = &host.refuse {
            return Err(error.clone());
        }
        Ok(Arc::new(FakeSession {
            world: self.clone(),
            host_name: endpoint.host_name.clone(),
        }))
    }
}

struct FakeTransport {
    world: FakeWorld,
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Arc<dyn RemoteSession>, TransportError> {
        self.world.open(None, endpoint)
    }
}

pub(crate) struct FakeSession {
    world: FakeWorld,
    host_name: String,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn connect_through(
        &self,
        endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        self.world.open(Some(&self.host_name), endpoint)
    }

    async fn exec(&self, command: &str, _timeout: Duration) -> Result<ExecOutput, TransportError> {
        self.world
            .record(format!("exec {}: {}", self.host_name, command));
        let state = self.world.state.lock().unwrap();
        let output = state
            .hosts
            .get(&self.host_name)
            .and_then(|host| host.exec.get(command).cloned())
            .unwrap_or_else(|| ExecOutput {
                stderr: format!("sh: {}: command not found\n", command),
                exit_status: Some(127),
                ..Default::default()
            });
        Ok(output)
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellStream>, TransportError> {
        self.world.record(format!("shell {}", self.host_name));
        let mut state = self.world.state.lock().unwrap();
        state
            .hosts
            .get_mut(&self.host_name)
            .and_then(|host| host.shells.pop_front())
            .map(|shell| Box::new(shell) as Box<dyn ShellStream>)
            .ok_or_else(|| TransportError::Channel("shell request denied".to_string()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.world.record(format!("disconnect {}", self.host_name));
        let state = self.world.state.lock().unwrap();
        match state
            .hosts
            .get(&self.host_name)
            .and_then(|host| host.disconnect_error.clone())
        {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Session with no behavior, for channels built by hand.
pub(crate) struct NullSession;

#[async_trait]
impl RemoteSession for NullSession {
    async fn connect_through(
        &self,
        _endpoint: &Endpoint,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        Ok(Arc::new(NullSession))
    }

    async fn exec(&self, _command: &str, _timeout: Duration) -> Result<ExecOutput, TransportError> {
        Ok(ExecOutput {
            exit_status: Some(0),
            ..Default::default()
        })
    }

    async fn open_shell(&self) -> Result<Box<dyn ShellStream>, TransportError> {
        Ok(Box::new(ScriptedShell::new()))
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Sequence of strategy calls across a chain, e.g. `open b1`, `run t`,
/// `close b1`.
#[derive(Clone, Default)]
pub(crate) struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    fn push(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

/// Strategy that records calls and fails on demand.
pub(crate) struct RecordingStrategy {
    host_name: String,
    recorder: Recorder,
    fail_open: bool,
    fail_close: bool,
    output: String,
}

#[async_trait]
impl ConnectionStrategy for RecordingStrategy {
    async fn open(&self, _parent: Option<&HopChannel>) -> Result<HopChannel, ChainError> {
        self.recorder.push(format!("open {}", self.host_name));
        if self.fail_open {
            return Err(ChainError::connection(&self.host_name, "Connection refused"));
        }
        Ok(HopChannel::Session(Arc::new(NullSession)))
    }

    async fn close(&self, _channel: HopChannel) -> Result<(), ChainError> {
        self.recorder.push(format!("close {}", self.host_name));
        if self.fail_close {
            return Err(ChainError::connection(&self.host_name, "Broken pipe"));
        }
        Ok(())
    }

    async fn run(
        &self,
        _channel: &mut HopChannel,
        command: &str,
        _timeout: Duration,
    ) -> Result<String, ChainError> {
        self.recorder.push(format!("run {}", self.host_name));
        if command == "false" {
            return Err(ChainError::command(&self.host_name, "exit status 1", ""));
        }
        Ok(self.output.clone())
    }

    fn kind(&self) -> TransportKind {
        TransportKind::DirectExec
    }
}

/// Builds [`RecordingStrategy`]s sharing one [`Recorder`].
#[derive(Clone, Default)]
pub(crate) struct RecordingFactory {
    pub(crate) recorder: Recorder,
    fail_open: Vec<String>,
    fail_close: Vec<String>,
}

impl RecordingFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn failing_open(mut self, host_name: &str) -> Self {
        self.fail_open.push(host_name.to_string());
        self
    }

    pub(crate) fn failing_close(mut self, host_name: &str) -> Self {
        self.fail_close.push(host_name.to_string());
        self
    }

    pub(crate) fn strategy(&self, host_name: &str) -> Box<dyn ConnectionStrategy> {
        Box::new(RecordingStrategy {
            host_name: host_name.to_string(),
            recorder: self.recorder.clone(),
            fail_open: self.fail_open.iter().any(|h| h == host_name),
            fail_close: self.fail_close.iter().any(|h| h == host_name),
            output: format!("output of {}", host_name),
        })
    }
}

impl StrategyFactory for RecordingFactory {
    fn create(&self, host: &HostConfig) -> Result<Box<dyn ConnectionStrategy>, ChainError> {
        Ok(self.strategy(&host.host_name))
    }
}
