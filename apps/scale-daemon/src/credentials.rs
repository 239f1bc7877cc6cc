//! Device passwords from the process environment.

use async_trait::async_trait;

use scale_core::DeviceId;
use scale_sync::{CredentialStore, Credentials, SyncResult};

/// Reads `SCALES_DEVICE_<id>_PASSWORD` on every connect. Nothing is cached.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentials;

impl EnvCredentials {
    fn key(device_id: DeviceId) -> String {
        format!("SCALES_DEVICE_{}_PASSWORD", device_id.0)
    }

    fn lookup(device_id: DeviceId, get: impl Fn(&str) -> Option<String>) -> Credentials {
        Credentials {
            password: get(&Self::key(device_id)).filter(|p| !p.is_empty()),
        }
    }
}

#[async_trait]
impl CredentialStore for EnvCredentials {
    async fn credentials(&self, device_id: DeviceId) -> SyncResult<Credentials> {
        Ok(Self::lookup(device_id, |key| std::env::var(key).ok()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_device() {
        let creds = EnvCredentials::lookup(DeviceId(7), |key| {
            (key == "SCALES_DEVICE_7_PASSWORD").then(|| "secret".to_string())
        });
        assert_eq!(creds.password.as_deref(), Some("secret"));

        let none = EnvCredentials::lookup(DeviceId(8), |_| Some(String::new()));
        assert!(none.password.is_none());
    }
}
