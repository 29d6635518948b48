use crate::{error::StorageError, types::DeviceId};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::warn;

/// Settings key for the identifier of the most recently connected device.
pub const LAST_DEVICE_KEY: &str = "last_device_id";

/// Settings key for the demo-mode flag.
pub const DEMO_MODE_KEY: &str = "demo_mode";

/// Key-value settings persistence.
///
/// The host application brings its own implementation (typically a wrapper
/// over its encrypted settings database); [`MemorySettingsStore`] serves
/// tests and demos.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Write a setting, replacing any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing store rejects the write.
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError>;

    /// Read a setting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing store fails the read.
    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError>;

    /// Delete a setting. Deleting an absent key is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backing store rejects the delete.
    async fn remove_setting(&self, key: &str) -> Result<(), StorageError>;
}

/// In-process [`SettingsStore`] used by tests and demos.
#[derive(Debug, Default)]
pub struct MemorySettingsStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemorySettingsStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SettingsStore for MemorySettingsStore {
    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StorageError> {
        self.values
            .lock()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StorageError> {
        Ok(self.values.lock().await.get(key).cloned())
    }

    async fn remove_setting(&self, key: &str) -> Result<(), StorageError> {
        self.values.lock().await.remove(key);
        Ok(())
    }
}

/// Remember the connected device for next launch. A write failure is logged
/// and swallowed; losing the preference must not fail the connect.
pub async fn save_last_device(store: &dyn SettingsStore, id: &DeviceId) {
    if let Err(e) = store.set_setting(LAST_DEVICE_KEY, id.as_str()).await {
        warn!("failed to persist last device id: {e}");
    }
}

/// The device to offer for automatic resume, if one was remembered.
///
/// # Errors
///
/// Returns [`StorageError`] when the read fails; callers decide whether to
/// fall back to a fresh scan.
pub async fn load_last_device(
    store: &dyn SettingsStore,
) -> Result<Option<DeviceId>, StorageError> {
    Ok(store
        .get_setting(LAST_DEVICE_KEY)
        .await?
        .map(DeviceId::new))
}

/// Forget the remembered device.
///
/// # Errors
///
/// Returns [`StorageError`] when the delete fails. Unlike the save path this
/// propagates: silently keeping a device the user abandoned would resurrect
/// it on the next launch.
pub async fn clear_last_device(store: &dyn SettingsStore) -> Result<(), StorageError> {
    store.remove_setting(LAST_DEVICE_KEY).await
}

/// Remember whether the demo device was in use. Non-fatal, like
/// [`save_last_device`].
pub async fn save_demo_mode(store: &dyn SettingsStore, enabled: bool) {
    let value = if enabled { "true" } else { "false" };
    if let Err(e) = store.set_setting(DEMO_MODE_KEY, value).await {
        warn!("failed to persist demo mode flag: {e}");
    }
}

/// Whether the demo device was in use last time. Read failures are logged
/// and reported as `false`.
pub async fn load_demo_mode(store: &dyn SettingsStore) -> bool {
    match store.get_setting(DEMO_MODE_KEY).await {
        Ok(value) => value.as_deref() == Some("true"),
        Err(e) => {
            warn!("failed to read demo mode flag: {e}");
            false
        }
    }
}
