//! Client side of the control protocol, used by the `ctl` subcommand.

use anyhow::{Context, Result, anyhow, bail};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use crate::control::protocol::ControlMessage;

/// Marker put in `key` when `prepare_mount` carries an access token.
pub const BOOKMARK_MARKER: &str = "bookmark";

#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: String,
}

impl ControlClient {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }

    /// Send one message on a fresh connection and read one reply.
    pub async fn exchange(&self, message: &ControlMessage) -> Result<ControlMessage> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|| format!("connect to control server {}", self.addr))?;
        let (read, mut write) = stream.into_split();

        write.write_all(&message.to_frame()).await?;
        write.flush().await?;

        let mut line = String::new();
        BufReader::new(read)
            .read_line(&mut line)
            .await
            .context("read control reply")?;
        if line.trim().is_empty() {
            bail!("control server closed the connection without replying");
        }
        serde_json::from_str(&line).context("decode control reply")
    }

    /// Raw exchange; the reply is returned even when it is an error.
    pub async fn raw(
        &self,
        command: &str,
        key: Option<String>,
        value: Option<String>,
    ) -> Result<ControlMessage> {
        let message = ControlMessage {
            command: command.to_string(),
            key,
            value,
        };
        self.exchange(&message).await
    }

    async fn request(&self, message: ControlMessage) -> Result<ControlMessage> {
        let reply = self.exchange(&message).await?;
        if reply.is_error() {
            bail!(reply.value.unwrap_or_else(|| "unknown error".to_string()));
        }
        Ok(reply)
    }

    /// Reply value, treating a `status` key (e.g. `cancelled`) as failure.
    async fn request_value(&self, message: ControlMessage) -> Result<String> {
        let reply = self.request(message).await?;
        if reply.key.as_deref() == Some("status") {
            bail!(reply.value.unwrap_or_else(|| "-none-".to_string()));
        }
        reply
            .value
            .ok_or_else(|| anyhow!("reply to {} carried no value", reply.command))
    }

    pub async fn set_font_size(&self, size: u32) -> Result<()> {
        self.request(
            ControlMessage::new("font")
                .with_key("size")
                .with_value(size.to_string()),
        )
        .await
        .map(drop)
    }

    /// Returns the VM-mount tag for `host_path`.
    pub async fn prepare_mount(&self, host_path: &str) -> Result<String> {
        self.request_value(ControlMessage::new("prepare_mount").with_value(host_path))
            .await
    }

    /// Like [`Self::prepare_mount`] for an access token; the mount is
    /// remembered across restarts.
    pub async fn prepare_mount_bookmark(&self, token: &str) -> Result<String> {
        self.request_value(
            ControlMessage::new("prepare_mount")
                .with_key(BOOKMARK_MARKER)
                .with_value(token),
        )
        .await
    }

    /// Host path of a folder the user picks.
    pub async fn choose_folder(&self) -> Result<String> {
        self.request_value(ControlMessage::new("choose_folder")).await
    }

    /// Access token for a folder the user picks.
    pub async fn open_folder(&self) -> Result<String> {
        self.request_value(ControlMessage::new("open_folder")).await
    }
}
