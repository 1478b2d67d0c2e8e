//! Local control plane: a small JSON command protocol the guest (or a host
//! tool) uses to query and alter supervisor state at runtime.

pub mod client;
pub mod handlers;
pub mod protocol;
pub mod server;

pub use client::ControlClient;
pub use handlers::ControlContext;
pub use protocol::{ControlMessage, MAX_MESSAGE_BYTES};
pub use server::ControlServer;
