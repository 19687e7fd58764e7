//! Process-wide client registry for hosts that want a single shared engine.
//!
//! Nothing in the engine reads this; it is explicit opt-in for callers.

use std::sync::RwLock;

use once_cell::sync::Lazy;

use crate::client::InboxClient;

static CLIENT: Lazy<RwLock<Option<InboxClient>>> = Lazy::new(|| RwLock::new(None));

/// Register `client` as the shared instance.
///
/// Fails, handing the client back, if one is already installed.
pub fn install(client: InboxClient) -> Result<(), InboxClient> {
    let mut slot = CLIENT.write().unwrap_or_else(|e| e.into_inner());
    if slot.is_some() {
        return Err(client);
    }
    *slot = Some(client);
    Ok(())
}

/// The shared instance, if installed.
pub fn shared() -> Option<InboxClient> {
    CLIENT.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Remove the shared instance, signing it out. Returns whether one was
/// installed.
pub fn teardown() -> bool {
    let client = CLIENT.write().unwrap_or_else(|e| e.into_inner()).take();
    match client {
        Some(client) => {
            client.sign_out();
            true
        }
        None => false,
    }
}
