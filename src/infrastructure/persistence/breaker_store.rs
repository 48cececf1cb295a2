//! Durable circuit-breaker state.
//!
//! State is a single JSON document written on every transition and restored
//! before the risk gateway accepts any order. The file is chmod 0600 and
//! replaced atomically (write temp, rename).

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::info;

pub struct BreakerStore {
    path: PathBuf,
}

impl BreakerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read breaker state {:?}", self.path))?;
        let state = serde_json::from_str(&raw).context("failed to parse breaker state")?;
        info!("BreakerStore: restored state from {:?}", self.path);
        Ok(Some(state))
    }

    pub fn save<T: Serialize>(&self, state: &T) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).context("failed to create breaker state dir")?;
            }
        }

        let raw = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, raw).context("failed to write breaker state")?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))
                .context("failed to set breaker state permissions")?;
        }

        std::fs::rename(&tmp, &self.path).context("failed to replace breaker state")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Dummy {
        counter: u32,
    }

    #[test]
    fn test_round_trip_and_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let store = BreakerStore::new(dir.path().join("circuit_breaker_state.json"));

        assert!(store.load::<Dummy>().unwrap().is_none());

        store.save(&Dummy { counter: 7 }).unwrap();
        let restored: Dummy = store.load().unwrap().unwrap();
        assert_eq!(restored, Dummy { counter: 7 });

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
