// store.rs

use crate::*;

/// Persistent home of [`Settings`]. Writes are synchronous and idempotent.
pub trait SettingsStore {
    fn load(&mut self) -> Option<Settings>;
    fn store(&mut self, settings: &Settings) -> AppResult<()>;
}

/// Persist and log instead of failing; a lost write only costs the
/// mutations made since the previous snapshot.
pub fn store_settings(store: &mut dyn SettingsStore, settings: &Settings) -> bool {
    match store.store(settings) {
        Ok(()) => true,
        Err(e) => {
            error!("Cannot save settings: {e}");
            false
        }
    }
}

// EOF
