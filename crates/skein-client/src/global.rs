//! Process-wide client registry for top-level entry points.
//!
//! A binary can install one client here at startup and fetch it where
//! threading a handle through is impractical. Ops never consult this
//! registry: calls are delivered through a bound client or the scope's sink.

use std::sync::{Mutex, MutexGuard};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

static GLOBAL: Mutex<Option<Client>> = Mutex::new(None);

fn slot() -> MutexGuard<'static, Option<Client>> {
    GLOBAL.lock().unwrap_or_else(|e| e.into_inner())
}

/// Create a client from `config` and install it.
///
/// Fails if a client is already installed.
pub fn init(config: ClientConfig) -> Result<Client> {
    let mut slot = slot();
    if slot.is_some() {
        return Err(ClientError::Config(
            "A global client is already installed".to_string(),
        ));
    }
    let client = Client::new(config)?;
    *slot = Some(client.clone());
    Ok(client)
}

/// Install `client`, returning the one it replaces.
pub fn set_client(client: Client) -> Option<Client> {
    slot().replace(client)
}

/// The installed client, if any.
pub fn client() -> Option<Client> {
    slot().clone()
}

/// Remove the installed client and shut it down.
pub async fn shutdown() -> Result<()> {
    let client = slot().take();
    match client {
        Some(client) => client.shutdown().await,
        None => Ok(()),
    }
}
