//! File-backed state store.
//!
//! One JSON file holds {credential, cursor}. Every save rewrites the file via
//! a temp-file + rename so readers never observe a torn write and a crash
//! mid-save leaves the previous state intact. All failures map to
//! `Error::Persistence`: if this store cannot write, the bot's durability
//! guarantees are gone and the caller is expected to stop.

use std::path::{Path, PathBuf};

use tokio::sync::Mutex;

use mxb_core::{
    domain::{Credential, SyncCursor},
    errors::Error,
    ports::{PersistedState, StateStore},
    Result,
};

#[derive(Debug)]
pub struct FsStateStore {
    path: PathBuf,
    state: Mutex<PersistedState>,
}

impl FsStateStore {
    /// Open (or create) the store at `path`. A missing file is an empty
    /// state, not an error; an unreadable or corrupt file is fatal rather
    /// than silently starting from scratch and rewinding the cursor.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Persistence(format!("corrupt state file {}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PersistedState::default(),
            Err(e) => {
                return Err(Error::Persistence(format!(
                    "cannot read state file {}: {e}",
                    path.display()
                )))
            }
        };
        Ok(Self {
            path,
            state: Mutex::new(state),
        })
    }

    async fn write_atomic(path: &Path, state: &PersistedState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| Error::Persistence(format!("state serialize: {e}")))?;

        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            Error::Persistence(format!("write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, path).await.map_err(|e| {
            Error::Persistence(format!("rename into {}: {e}", path.display()))
        })?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl StateStore for FsStateStore {
    async fn load(&self) -> Result<PersistedState> {
        Ok(self.state.lock().await.clone())
    }

    async fn save_credential(&self, credential: &Credential) -> Result<()> {
        let mut st = self.state.lock().await;
        st.credential = Some(credential.clone());
        Self::write_atomic(&self.path, &st).await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> Result<()> {
        let mut st = self.state.lock().await;
        st.cursor = Some(cursor.clone());
        Self::write_atomic(&self.path, &st).await
    }

    async fn flush(&self) -> Result<()> {
        let st = self.state.lock().await;
        Self::write_atomic(&self.path, &st).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mxb_core::domain::UserId;
    use std::time::Duration;

    fn tmp_path(prefix: &str) -> PathBuf {
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or(Duration::from_secs(0))
            .as_nanos();
        let pid = std::process::id();
        std::env::temp_dir().join(format!("{prefix}-{pid}-{ts}.json"))
    }

    #[tokio::test]
    async fn missing_file_is_empty_state() {
        let store = FsStateStore::open(tmp_path("mxb-store-missing")).await.unwrap();
        assert_eq!(store.load().await.unwrap(), PersistedState::default());
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let path = tmp_path("mxb-store-reopen");

        let store = FsStateStore::open(&path).await.unwrap();
        let cred = Credential::new("tok".into(), UserId("@bot:hs".into()));
        store.save_credential(&cred).await.unwrap();
        store.save_cursor(&SyncCursor("s1".into())).await.unwrap();
        store.save_cursor(&SyncCursor("s2".into())).await.unwrap();
        drop(store);

        let reopened = FsStateStore::open(&path).await.unwrap();
        let state = reopened.load().await.unwrap();
        assert_eq!(state.credential, Some(cred));
        assert_eq!(state.cursor, Some(SyncCursor("s2".into())));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn corrupt_file_is_fatal_not_silent_reset() {
        let path = tmp_path("mxb-store-corrupt");
        std::fs::write(&path, b"not json{").unwrap();

        let err = FsStateStore::open(&path).await.unwrap_err();
        assert!(matches!(err, Error::Persistence(_)));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn saves_leave_no_temp_file_behind() {
        let path = tmp_path("mxb-store-tmpfile");
        let store = FsStateStore::open(&path).await.unwrap();
        store.save_cursor(&SyncCursor("s1".into())).await.unwrap();

        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());

        let _ = std::fs::remove_file(&path);
    }
}
