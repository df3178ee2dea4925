//! Process-wide client slot.
//!
//! Most applications want one connection shared by every consumer. The
//! slot is filled lazily from the environment on first access, or
//! explicitly with [`init_shared`]. [`reset_shared`] tears it down so the
//! next access builds a fresh client (session change, test isolation).

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::info;

use crate::client::RealtimeClient;
use crate::config::ClientConfig;

static SHARED: Lazy<Mutex<Option<RealtimeClient>>> = Lazy::new(|| Mutex::new(None));

/// Returns the shared client, creating it from [`ClientConfig::from_env`]
/// on first access.
pub fn shared() -> RealtimeClient {
    SHARED
        .lock()
        .get_or_insert_with(|| {
            info!("creating shared realtime client");
            RealtimeClient::new(ClientConfig::from_env())
        })
        .clone()
}

/// Installs a shared client built from `config`, destroying the previous
/// one if any.
pub fn init_shared(config: ClientConfig) -> RealtimeClient {
    let client = RealtimeClient::new(config);
    let previous = SHARED.lock().replace(client.clone());
    if let Some(previous) = previous {
        previous.destroy();
    }
    client
}

/// Destroys the shared client and empties the slot.
pub fn reset_shared() {
    let previous = SHARED.lock().take();
    if let Some(previous) = previous {
        info!("resetting shared realtime client");
        previous.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // One test touches the global slot so runs in parallel cannot interfere.
    #[test]
    fn shared_slot_lifecycle() {
        reset_shared();

        let a = shared();
        let b = shared();
        assert!(a.same_client(&b));

        a.subscribe("run-1", |_| {});
        reset_shared();
        assert_eq!(a.stats().subscription_count, 0);

        let c = shared();
        assert!(!a.same_client(&c));

        let d = init_shared(ClientConfig::default().with_url("ws://127.0.0.1:9/ws"));
        assert!(shared().same_client(&d));
        assert_eq!(d.url(), "ws://127.0.0.1:9/ws");

        reset_shared();
    }
}
