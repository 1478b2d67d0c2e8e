//! Command dispatch for the control plane.
//!
//! | command         | effect                                     | reply                                   |
//! |-----------------|--------------------------------------------|-----------------------------------------|
//! | `echo`          | none                                       | `response` with the same value          |
//! | `choose_folder` | folder picker                              | `status: cancelled` or `directory`      |
//! | `open_folder`   | folder picker + access token               | `status: cancelled` or `bookmark`       |
//! | `prepare_mount` | [`Supervisor::mount`]                      | `tag`                                   |
//! | `font`          | `size` persists the font size              | `font_size.response` ack                |

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::control::protocol::ControlMessage;
use crate::host::{FolderPicker, PickedFolder};
use crate::vm::Supervisor;
use crate::vm::access::{BookmarkToken, DirectPath};

/// Everything a handler may touch.
pub struct ControlContext {
    pub supervisor: Arc<Supervisor>,
    pub picker: Arc<dyn FolderPicker>,
}

impl ControlContext {
    pub fn new(supervisor: Arc<Supervisor>, picker: Arc<dyn FolderPicker>) -> Self {
        Self { supervisor, picker }
    }
}

/// Decode one frame and run it to completion.
pub async fn dispatch(ctx: &ControlContext, raw: &[u8]) -> ControlMessage {
    let message: ControlMessage = match serde_json::from_slice(raw) {
        Ok(m) => m,
        Err(e) => {
            debug!(error = %e, "undecodable control message");
            return ControlMessage::error("unable to process command");
        }
    };
    handle(ctx, message).await
}

pub async fn handle(ctx: &ControlContext, message: ControlMessage) -> ControlMessage {
    debug!(command = %message.command, key = ?message.key, "control command");

    match message.command.as_str() {
        "echo" => ControlMessage::response(message.value),
        "choose_folder" => choose_folder(ctx, false).await,
        "open_folder" => choose_folder(ctx, true).await,
        "prepare_mount" => prepare_mount(ctx, message),
        "font" => font(ctx, message),
        _ => ControlMessage::error("command not recognized"),
    }
}

async fn pick(ctx: &ControlContext) -> anyhow::Result<Option<PickedFolder>> {
    // The picker blocks until the user answers.
    let picker = Arc::clone(&ctx.picker);
    tokio::task::spawn_blocking(move || picker.pick_folder()).await?
}

async fn choose_folder(ctx: &ControlContext, with_token: bool) -> ControlMessage {
    let command = if with_token { "open_folder" } else { "choose_folder" };

    match pick(ctx).await {
        Ok(None) => ControlMessage::reply(command, "status", "cancelled"),
        Ok(Some(picked)) if with_token => ControlMessage::reply(command, "bookmark", picked.token),
        Ok(Some(picked)) => {
            ControlMessage::reply(command, "directory", picked.path.display().to_string())
        }
        Err(e) => {
            warn!(error = %e, "folder picker failed");
            ControlMessage::error(format!("could not pick a folder: {e}"))
        }
    }
}

/// `value` is a host path, or an access token when `key` is non-empty.
fn prepare_mount(ctx: &ControlContext, message: ControlMessage) -> ControlMessage {
    let Some(value) = message.value.filter(|v| !v.is_empty()) else {
        return ControlMessage::error("invalid argument to a mount command");
    };

    let result = match message.key.as_deref() {
        Some(marker) if !marker.is_empty() => {
            ctx.supervisor
                .mount(&BookmarkToken(value), None, None, true)
        }
        _ => ctx
            .supervisor
            .mount(&DirectPath(PathBuf::from(value)), None, None, false),
    };

    match result {
        Ok(tag) => ControlMessage::reply("prepare_mount", "tag", tag),
        Err(e) => {
            warn!(error = %e, "prepare_mount failed");
            ControlMessage::error(e.to_string())
        }
    }
}

fn font(ctx: &ControlContext, message: ControlMessage) -> ControlMessage {
    match message.key.as_deref() {
        Some("size") => {
            let Some(size) = message.value.as_deref().and_then(|v| v.trim().parse::<u32>().ok())
            else {
                return ControlMessage::error(format!(
                    "could not parse font size {:?}",
                    message.value.unwrap_or_default()
                ));
            };
            match ctx.supervisor.settings().set_font_size(size) {
                Ok(()) => ControlMessage::ack("font_size"),
                Err(e) => {
                    warn!(error = %e, "could not persist font size");
                    ControlMessage::error(format!("could not save font size: {e}"))
                }
            }
        }
        Some(other) => ControlMessage::error(format!("{other} is not a valid font property")),
        None => ControlMessage::error("font command requires a property"),
    }
}
