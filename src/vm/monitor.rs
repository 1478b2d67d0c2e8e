//! Line-oriented management channel to the running VM.
//!
//! One actor task owns the socket. Callers queue commands over an mpsc
//! channel and receive the raw reply over a oneshot, so two commands can
//! never interleave their writes on the stream.
//!
//! ```text
//! MonitorChannel::issue(cmd) ──mpsc──► actor ──"cmd\r\n"──► VM monitor
//!            ▲                           │
//!            └────────oneshot────────────┘ (bytes up to the next prompt)
//! ```
//!
//! Replies are not parsed; only channel-level success is reported.
//! Reconnecting is explicit: after a failure the channel stays
//! `Disconnected` until someone calls [`MonitorChannel::connect`].

use std::fmt;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Prompt printed by the monitor when it is ready for the next command.
pub const PROMPT: &[u8] = b"(qemu) ";

/// Upper bound on a single reply.
const MAX_REPLY_BYTES: usize = 1 << 20;

/// Host-to-guest forward used by the interactive shell transport.
pub fn shell_forward_rule(host_port: u16) -> String {
    format!("tcp::{host_port}-:22")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("management channel is not connected")]
    NotConnected,
    #[error("management channel I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("management channel closed by the VM")]
    Closed,
    #[error("management reply exceeded {} bytes", MAX_REPLY_BYTES)]
    ReplyTooLarge,
    #[error("management channel actor has shut down")]
    ActorGone,
}

/// Commands understood by the VM's management endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorCommand {
    SaveVm(String),
    LoadVm(String),
    /// Continue after a `loadvm`.
    Continue,
    Halt,
    Cont,
    HostFwdAdd(String),
    HostFwdRemove(String),
}

impl fmt::Display for MonitorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonitorCommand::SaveVm(tag) => write!(f, "savevm {tag}"),
            MonitorCommand::LoadVm(tag) => write!(f, "loadvm {tag}"),
            MonitorCommand::Continue => f.write_str("c"),
            MonitorCommand::Halt => f.write_str("halt"),
            MonitorCommand::Cont => f.write_str("cont"),
            MonitorCommand::HostFwdAdd(rule) => write!(f, "hostfwd_add {rule}"),
            MonitorCommand::HostFwdRemove(rule) => write!(f, "hostfwd_remove {rule}"),
        }
    }
}

enum Request {
    Connect(oneshot::Sender<Result<(), MonitorError>>),
    Command(String, oneshot::Sender<Result<String, MonitorError>>),
    Disconnect,
}

/// Cloneable handle to the management channel actor.
#[derive(Clone)]
pub struct MonitorChannel {
    addr: String,
    requests: mpsc::Sender<Request>,
    state: watch::Receiver<ChannelState>,
}

impl fmt::Debug for MonitorChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorChannel")
            .field("addr", &self.addr)
            .field("state", &self.state())
            .finish()
    }
}

impl MonitorChannel {
    /// Spawn the actor for the endpoint at `addr`. Starts `Disconnected`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(addr: impl Into<String>) -> Self {
        let addr = addr.into();
        let (requests, rx) = mpsc::channel(16);
        let (state_tx, state) = watch::channel(ChannelState::Disconnected);

        tokio::spawn(run_actor(addr.clone(), rx, state_tx));

        Self { addr, requests, state }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn state(&self) -> ChannelState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Open (or reopen) the connection and wait for the first prompt.
    pub async fn connect(&self) -> Result<(), MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Connect(tx))
            .await
            .map_err(|_| MonitorError::ActorGone)?;
        rx.await.map_err(|_| MonitorError::ActorGone)?
    }

    /// Issue one command and return the raw reply text.
    pub async fn issue(&self, command: &MonitorCommand) -> Result<String, MonitorError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Command(command.to_string(), tx))
            .await
            .map_err(|_| MonitorError::ActorGone)?;
        rx.await.map_err(|_| MonitorError::ActorGone)?
    }

    /// Drop the connection; queued commands ahead of this still run.
    pub async fn disconnect(&self) {
        let _ = self.requests.send(Request::Disconnect).await;
    }
}

async fn run_actor(
    addr: String,
    mut requests: mpsc::Receiver<Request>,
    state: watch::Sender<ChannelState>,
) {
    let mut conn: Option<TcpStream> = None;

    while let Some(request) = requests.recv().await {
        match request {
            Request::Connect(reply) => {
                conn = None;
                let _ = state.send(ChannelState::Connecting);

                let result = open(&addr).await;
                match result {
                    Ok(stream) => {
                        info!(addr = %addr, "management channel connected");
                        conn = Some(stream);
                        let _ = state.send(ChannelState::Connected);
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        debug!(addr = %addr, error = %e, "management channel connect failed");
                        let _ = state.send(ChannelState::Disconnected);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::Command(command, reply) => {
                let Some(stream) = conn.as_mut() else {
                    let _ = reply.send(Err(MonitorError::NotConnected));
                    continue;
                };

                debug!(addr = %addr, command = %command, "management command");
                match exchange(stream, &command).await {
                    Ok(text) => {
                        let _ = reply.send(Ok(text));
                    }
                    Err(e) => {
                        warn!(addr = %addr, command = %command, error = %e, "management command failed");
                        conn = None;
                        let _ = state.send(ChannelState::Disconnected);
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Request::Disconnect => {
                conn = None;
                let _ = state.send(ChannelState::Disconnected);
            }
        }
    }
}

async fn open(addr: &str) -> Result<TcpStream, MonitorError> {
    let mut stream = TcpStream::connect(addr).await?;
    // Swallow the banner so the first reply starts clean.
    read_until_prompt(&mut stream).await?;
    Ok(stream)
}

async fn exchange(stream: &mut TcpStream, command: &str) -> Result<String, MonitorError> {
    stream.write_all(format!("{command}\r\n").as_bytes()).await?;
    stream.flush().await?;
    let reply = read_until_prompt(stream).await?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
}

async fn read_until_prompt(stream: &mut TcpStream) -> Result<Vec<u8>, MonitorError> {
    let mut reply = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(MonitorError::Closed);
        }
        reply.extend_from_slice(&chunk[..n]);

        if reply.ends_with(PROMPT) {
            reply.truncate(reply.len() - PROMPT.len());
            return Ok(reply);
        }
        if reply.len() > MAX_REPLY_BYTES {
            return Err(MonitorError::ReplyTooLarge);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Minimal monitor endpoint: banner, then echo every line back.
    async fn fake_monitor() -> (String, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            write.write_all(b"QEMU monitor\r\n(qemu) ").await.unwrap();

            let mut seen = Vec::new();
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim_end().to_string();
                write
                    .write_all(format!("{line}\r\nok\r\n(qemu) ").as_bytes())
                    .await
                    .unwrap();
                seen.push(line);
            }
            seen
        });

        (addr, handle)
    }

    #[test]
    fn commands_render_as_monitor_lines() {
        assert_eq!(MonitorCommand::SaveVm("instantboota".into()).to_string(), "savevm instantboota");
        assert_eq!(MonitorCommand::LoadVm("x".into()).to_string(), "loadvm x");
        assert_eq!(MonitorCommand::Continue.to_string(), "c");
        assert_eq!(MonitorCommand::Halt.to_string(), "halt");
        assert_eq!(MonitorCommand::Cont.to_string(), "cont");
        assert_eq!(
            MonitorCommand::HostFwdAdd(shell_forward_rule(10022)).to_string(),
            "hostfwd_add tcp::10022-:22"
        );
    }

    #[tokio::test]
    async fn commands_fail_until_connected() {
        let (addr, server) = fake_monitor().await;
        let channel = MonitorChannel::spawn(addr);

        assert_eq!(channel.state(), ChannelState::Disconnected);
        assert!(matches!(
            channel.issue(&MonitorCommand::Halt).await,
            Err(MonitorError::NotConnected)
        ));

        channel.connect().await.unwrap();
        assert!(channel.is_connected());

        let reply = channel.issue(&MonitorCommand::Halt).await.unwrap();
        assert!(reply.contains("ok"));
        channel.issue(&MonitorCommand::Cont).await.unwrap();

        channel.disconnect().await;
        assert_eq!(server.await.unwrap(), vec!["halt", "cont"]);
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }

    #[tokio::test]
    async fn concurrent_commands_do_not_interleave() {
        let (addr, server) = fake_monitor().await;
        let channel = MonitorChannel::spawn(addr);
        channel.connect().await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let channel = channel.clone();
            tasks.push(tokio::spawn(async move {
                channel
                    .issue(&MonitorCommand::SaveVm(format!("tag{i}")))
                    .await
                    .unwrap()
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        channel.disconnect().await;

        let mut seen = server.await.unwrap();
        seen.sort();
        let mut expected: Vec<_> = (0..10).map(|i| format!("savevm tag{i}")).collect();
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[tokio::test]
    async fn refused_connection_stays_disconnected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let channel = MonitorChannel::spawn(addr);
        assert!(matches!(channel.connect().await, Err(MonitorError::Io(_))));
        assert_eq!(channel.state(), ChannelState::Disconnected);
    }
}
