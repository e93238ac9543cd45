use std::path::Path;
use std::path::PathBuf;

use anyhow::Context as _;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::ring::HashRing;

/// Process-wide restreamer membership: an ordered host list mirrored to a
/// JSON file on disk and a consistent-hash ring over it.
///
/// Mutations serialize on the write lock and replace the file before the
/// in-memory state is swapped, so a crash mid-update leaves the previous
/// membership intact.
pub(crate) struct HostProvider {
    storage_file: PathBuf,
    state: RwLock<State>,
}

struct State {
    hosts: Vec<String>,
    ring: HashRing,
}

impl HostProvider {
    /// Loads the membership from `storage_file`; a missing file means an
    /// empty membership.
    pub(crate) async fn load(storage_file: PathBuf) -> anyhow::Result<Self> {
        let hosts: Vec<String> = match tokio::fs::read(&storage_file).await {
            Ok(raw) => serde_json::from_slice(&raw).context("JSON unmarshal hosts file")?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err).context("read hosts file"),
        };

        let mut ring = HashRing::new();
        for host in &hosts {
            ring.add(host);
        }

        Ok(Self {
            storage_file,
            state: RwLock::new(State { hosts, ring }),
        })
    }

    /// The host responsible for `uri`, or `None` when the membership is
    /// empty.
    pub(crate) async fn pick(&self, uri: &str) -> Option<String> {
        self.state.read().await.ring.get(uri).map(str::to_owned)
    }

    pub(crate) async fn hosts(&self) -> Vec<String> {
        self.state.read().await.hosts.clone()
    }

    /// Appends `host` if absent. Re-adding an existing host is a no-op.
    pub(crate) async fn add(&self, host: &str) -> anyhow::Result<()> {
        let mut state = self.state.write().await;
        if state.hosts.iter().any(|existing| existing == host) {
            return Ok(());
        }

        let mut hosts = state.hosts.clone();
        hosts.push(host.to_owned());
        write_storage_file(&self.storage_file, &hosts).await?;

        state.hosts = hosts;
        state.ring.add(host);
        Ok(())
    }

    /// Removes `host`. Returns `false` when it was not a member.
    pub(crate) async fn remove(&self, host: &str) -> anyhow::Result<bool> {
        let mut state = self.state.write().await;
        if !state.hosts.iter().any(|existing| existing == host) {
            return Ok(false);
        }

        let hosts: Vec<String> = state
            .hosts
            .iter()
            .filter(|existing| existing.as_str() != host)
            .cloned()
            .collect();
        write_storage_file(&self.storage_file, &hosts).await?;

        state.hosts = hosts;
        state.ring.remove(host);
        Ok(true)
    }
}

/// Writes the host list to a sibling temp file, fsyncs it, and renames it
/// over the storage file, so the file on disk is always a complete JSON
/// array.
async fn write_storage_file(path: &Path, hosts: &[String]) -> anyhow::Result<()> {
    let mut temp = path.as_os_str().to_owned();
    temp.push("-temp");
    let temp = PathBuf::from(temp);

    let raw = serde_json::to_vec(hosts).context("JSON marshal hosts")?;

    let mut file = tokio::fs::File::create(&temp)
        .await
        .context("create temp file")?;
    file.write_all(&raw).await.context("write temp file")?;
    file.sync_all().await.context("sync temp file")?;
    drop(file);

    tokio::fs::rename(&temp, path)
        .await
        .context("rename temp file")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage_path(dir: &tempfile::TempDir) -> PathBuf {
        dir.path().join("hosts.json")
    }

    async fn stored_hosts(path: &Path) -> Vec<String> {
        let raw = tokio::fs::read(path).await.unwrap();
        serde_json::from_slice(&raw).unwrap()
    }

    #[tokio::test]
    async fn load_without_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let provider = HostProvider::load(storage_path(&dir)).await.unwrap();
        assert!(provider.hosts().await.is_empty());
        assert_eq!(provider.pick("rtsp://cam/1").await, None);
    }

    #[tokio::test]
    async fn add_persists_a_valid_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = storage_path(&dir);
        let provider = HostProvider::load(path.clone()).await.unwrap();

        provider.add("restreamer-1:8554").await.unwrap();
        provider.add("restreamer-2:8554").await.unwrap();

        assert_eq!(
            stored_hosts(&path).await,
            vec!["restreamer-1:8554", "restreamer-2:8554"]
        );
    }

    #[tokio::test]
    async fn re_adding_a_host_does_not_duplicate_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = storage_path(&dir);
        let provider = HostProvider::load(path.clone()).await.unwrap();

        provider.add("a").await.unwrap();
        provider.add("a").await.unwrap();

        assert_eq!(provider.hosts().await, vec!["a"]);
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_original_set() {
        let dir = tempfile::tempdir().unwrap();
        let path = storage_path(&dir);
        let provider = HostProvider::load(path.clone()).await.unwrap();
        provider.add("a").await.unwrap();

        provider.add("b").await.unwrap();
        assert!(provider.remove("b").await.unwrap());

        assert_eq!(provider.hosts().await, vec!["a"]);
        assert_eq!(stored_hosts(&path).await, vec!["a"]);
    }

    #[tokio::test]
    async fn removing_an_unknown_host_reports_false() {
        let dir = tempfile::tempdir().unwrap();
        let provider = HostProvider::load(storage_path(&dir)).await.unwrap();
        assert!(!provider.remove("missing").await.unwrap());
    }

    #[tokio::test]
    async fn membership_survives_a_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = storage_path(&dir);

        {
            let provider = HostProvider::load(path.clone()).await.unwrap();
            provider.add("a").await.unwrap();
            provider.add("b").await.unwrap();
        }

        let provider = HostProvider::load(path).await.unwrap();
        assert_eq!(provider.hosts().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn pick_is_deterministic_and_falls_back_after_removal() {
        let dir = tempfile::tempdir().unwrap();
        let provider = HostProvider::load(storage_path(&dir)).await.unwrap();
        provider.add("a").await.unwrap();
        provider.add("b").await.unwrap();

        let picked = provider.pick("rtsp://cam/77").await.unwrap();
        assert!(picked == "a" || picked == "b");
        assert_eq!(provider.pick("rtsp://cam/77").await.unwrap(), picked);

        provider.remove(&picked).await.unwrap();
        let other = provider.pick("rtsp://cam/77").await.unwrap();
        assert_ne!(other, picked);
    }
}
