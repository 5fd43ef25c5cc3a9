use std::path::{Path, PathBuf};

use anyhow::Context;
use privacy_analytics::{LedgerState, PrivacyLedger};
use tokio::sync::Mutex;

/// Ledger state file shared by every request. Saves are serialized so the
/// file always holds the newest export.
#[derive(Debug)]
pub struct LedgerStore {
    path: PathBuf,
    write: Mutex<()>,
}

impl LedgerStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> anyhow::Result<Option<LedgerState>> {
        load_ledger_state(&self.path).await
    }

    pub async fn save(&self, ledger: &PrivacyLedger) -> anyhow::Result<()> {
        let _guard = self.write.lock().await;
        save_ledger_state(&self.path, &ledger.export_state()).await
    }
}

/// Reads a previously saved ledger. A missing file means a fresh ledger.
pub async fn load_ledger_state(path: &Path) -> anyhow::Result<Option<LedgerState>> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading ledger state {}", path.display()))
        }
    };
    let state = serde_json::from_str(&contents)
        .with_context(|| format!("parsing ledger state {}", path.display()))?;
    Ok(Some(state))
}

/// Written through a sibling temp file, then renamed into place.
pub async fn save_ledger_state(path: &Path, state: &LedgerState) -> anyhow::Result<()> {
    let encoded = serde_json::to_vec_pretty(state)?;
    let staging = path.with_extension("json.tmp");
    tokio::fs::write(&staging, encoded)
        .await
        .with_context(|| format!("writing {}", staging.display()))?;
    tokio::fs::rename(&staging, path)
        .await
        .with_context(|| format!("replacing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use privacy_analytics::{config::BudgetConfig, Principal, PrivacyLedger};

    #[tokio::test]
    async fn round_trips_ledger_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        assert!(load_ledger_state(&path).await.unwrap().is_none());

        let ledger = PrivacyLedger::new(BudgetConfig::default()).unwrap();
        let alice = Principal::new("alice");
        ledger.authorize(&alice, 0.25, 0.0).unwrap().commit();
        save_ledger_state(&path, &ledger.export_state()).await.unwrap();

        let state = load_ledger_state(&path).await.unwrap().unwrap();
        let restored = PrivacyLedger::restore(BudgetConfig::default(), state).unwrap();
        assert_eq!(restored.spent(&alice), ledger.spent(&alice));
    }

    #[tokio::test]
    async fn concurrent_saves_leave_the_newest_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(LedgerStore::new(dir.path().join("ledger.json")));
        let ledger = PrivacyLedger::new(BudgetConfig::default()).unwrap();
        let alice = Principal::new("alice");

        let mut saves = Vec::new();
        for _ in 0..4 {
            ledger.authorize(&alice, 0.1, 0.0).unwrap().commit();
            let (store, ledger) = (store.clone(), ledger.clone());
            saves.push(tokio::spawn(async move { store.save(&ledger).await }));
        }
        for save in saves {
            save.await.unwrap().unwrap();
        }
        store.save(&ledger).await.unwrap();

        let state = store.load().await.unwrap().unwrap();
        let restored = PrivacyLedger::restore(BudgetConfig::default(), state).unwrap();
        assert_eq!(restored.spent(&alice), ledger.spent(&alice));
        assert_eq!(restored.snapshot(&alice).releases, 4);
    }

    #[tokio::test]
    async fn rejects_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(load_ledger_state(&path).await.is_err());
    }
}
