use crate::config::Config;
use crate::error::ServerError;
use crate::file_server::ProjectFileServer;
use crate::port_manager::PortManager;
use crate::project_id::ProjectId;
use crate::token::AccessToken;
use dashmap::DashMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

struct PoolEntry {
    server: Arc<ProjectFileServer>,
    /// Monotonic insertion order, used only to break LRU ties (spec §8:
    /// "ties broken by insertion order").
    seq: u64,
}

/// Observability snapshot for one running instance (spec §4.3 `stats`).
#[derive(Debug, Clone)]
pub struct ProjectStats {
    pub project_id: String,
    pub port: u16,
    pub last_accessed_ms_ago: u64,
}

/// Observability snapshot for the whole pool (spec §4.3 `stats`).
#[derive(Debug, Clone)]
pub struct ManagerStats {
    pub active_servers: usize,
    pub max_servers: usize,
    pub per_project_entries: Vec<ProjectStats>,
}

/// The single host-app contract surface for this subsystem (spec §6):
/// registers project roots, lazily starts/evicts per-project file
/// servers, and hands back authenticated URLs.
pub struct ServerManager {
    config: Config,
    pool: Mutex<HashMap<ProjectId, PoolEntry>>,
    registered_roots: DashMap<ProjectId, PathBuf>,
    port_manager: PortManager,
    reaper_handle: Mutex<Option<JoinHandle<()>>>,
    next_seq: AtomicU64,
}

impl ServerManager {
    /// Construct the manager and spawn its idle reaper. The reaper holds
    /// only a `Weak` reference back into the manager (spec §9's cyclic-
    /// control redesign note), so dropping every external `Arc` drops the
    /// manager even if a reap tick is mid-flight.
    pub async fn new(config: Config) -> Result<Arc<Self>, ServerError> {
        let port_manager = PortManager::new(&config)?;

        let manager = Arc::new(Self {
            config: config.clone(),
            pool: Mutex::new(HashMap::new()),
            registered_roots: DashMap::new(),
            port_manager,
            reaper_handle: Mutex::new(None),
            next_seq: AtomicU64::new(0),
        });

        let weak: Weak<ServerManager> = Arc::downgrade(&manager);
        let interval = config.reaper_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(manager) => manager.reap_idle().await,
                    None => break,
                }
            }
        });
        *manager.reaper_handle.lock().await = Some(handle);

        Ok(manager)
    }

    /// Register (or re-register) the on-disk root a project's file server
    /// will expose once started (spec §6 `registerProjectRoot`).
    pub fn register_project_root(&self, project_id: ProjectId, root: PathBuf) {
        self.registered_roots.insert(project_id, root);
    }

    /// Forget a project's root and stop its running instance, if any
    /// (spec §6 `unregisterProjectRoot`).
    pub async fn unregister_project_root(&self, project_id: &ProjectId) -> Result<(), ServerError> {
        self.registered_roots.remove(project_id);
        self.stop(project_id).await
    }

    /// Build an authenticated URL for `relative_path` within `project_id`'s
    /// root, starting (or reusing) the project's file server and evicting
    /// the LRU victim if the pool is already at capacity (spec §4.3).
    pub async fn url_for(
        &self,
        project_id: &ProjectId,
        relative_path: &str,
    ) -> Result<String, ServerError> {
        let server = self.ensure_started(project_id).await?;
        server.url_for(relative_path).await
    }

    /// Return the running instance for `project_id`, starting one if none
    /// exists. The pool lock is held for the *entire* check-evict-allocate-
    /// start-insert sequence, not just the endpoints: per spec §4.3/§5 "the
    /// manager serializes structural modifications to the pool... under a
    /// single lock; per-instance start/stop calls run while the lock is
    /// held". Releasing it in between would let two concurrent first-time
    /// callers both pass the "not started" check and both start a listener,
    /// with the second `insert` silently leaking the first (spec §8: "at
    /// most one running instance is in the pool at any instant").
    async fn ensure_started(&self, project_id: &ProjectId) -> Result<Arc<ProjectFileServer>, ServerError> {
        let mut pool = self.pool.lock().await;

        if let Some(entry) = pool.get(project_id) {
            return Ok(entry.server.clone());
        }

        let root = self
            .registered_roots
            .get(project_id)
            .map(|r| r.clone())
            .ok_or_else(|| ServerError::RootInvalid(format!("no root registered for '{project_id}'")))?;

        self.evict_if_at_capacity(&mut pool, project_id).await;

        let port = self.port_manager.allocate(project_id.as_str()).await?;
        let token = AccessToken::generate();
        let server = ProjectFileServer::start(
            project_id.as_str().to_string(),
            root,
            port,
            token,
            self.config.bind_address,
            self.config.start_timeout,
        )
        .await;

        let server = match server {
            Ok(server) => server,
            Err(err) => {
                // The port reservation is only meaningful while a listener
                // holds it; a failed start releases it back to the pool.
                self.port_manager.release(project_id.as_str());
                return Err(err);
            }
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        pool.insert(
            project_id.clone(),
            PoolEntry {
                server: server.clone(),
                seq,
            },
        );
        Ok(server)
    }

    /// If the pool is already at `max_active_servers` and `project_id`
    /// isn't already resident, stop the least-recently-accessed instance
    /// (ties broken by earliest insertion) before a new one starts, so the
    /// evicted instance's port can be reused immediately (spec §4.3, §8).
    ///
    /// Takes the already-held pool guard directly rather than re-locking,
    /// so the whole admission decision in `ensure_started` stays atomic.
    async fn evict_if_at_capacity(
        &self,
        pool: &mut HashMap<ProjectId, PoolEntry>,
        project_id: &ProjectId,
    ) {
        if pool.contains_key(project_id) || pool.len() < self.config.max_active_servers {
            return;
        }

        let victim = pool
            .iter()
            .max_by_key(|(_, entry)| (entry.server.idle_millis(), std::cmp::Reverse(entry.seq)))
            .map(|(id, _)| id.clone());

        if let Some(victim) = victim {
            if let Some(entry) = pool.remove(&victim) {
                info!(evicted = %victim, incoming = %project_id, "evicting LRU project file server");
                entry.server.stop().await;
                self.port_manager.release(victim.as_str());
            }
        }
    }

    /// Stop a project's running instance and release its port, if any is
    /// running (spec §4.3 `stop`). A no-op for projects with no live
    /// instance.
    pub async fn stop(&self, project_id: &ProjectId) -> Result<(), ServerError> {
        let entry = self.pool.lock().await.remove(project_id);
        if let Some(entry) = entry {
            entry.server.stop().await;
            self.port_manager.release(project_id.as_str());
        }
        Ok(())
    }

    /// Stop every running instance (spec §4.3 `stopAll`).
    pub async fn stop_all(&self) {
        let entries: Vec<(ProjectId, PoolEntry)> = {
            let mut pool = self.pool.lock().await;
            pool.drain().collect()
        };
        for (project_id, entry) in entries {
            entry.server.stop().await;
            self.port_manager.release(project_id.as_str());
        }
    }

    /// A point-in-time observability snapshot (spec §4.3 `stats`).
    pub async fn stats(&self) -> ManagerStats {
        let pool = self.pool.lock().await;
        let per_project_entries = pool
            .iter()
            .map(|(id, entry)| ProjectStats {
                project_id: id.as_str().to_string(),
                port: entry.server.port(),
                last_accessed_ms_ago: entry.server.idle_millis(),
            })
            .collect();
        ManagerStats {
            active_servers: pool.len(),
            max_servers: self.config.max_active_servers,
            per_project_entries,
        }
    }

    async fn reap_idle(&self) {
        let idle_timeout_ms = self.config.idle_timeout.as_millis() as u64;
        let stale: Vec<ProjectId> = {
            let pool = self.pool.lock().await;
            pool.iter()
                .filter(|(_, entry)| entry.server.idle_millis() >= idle_timeout_ms)
                .map(|(id, _)| id.clone())
                .collect()
        };
        for project_id in stale {
            info!(%project_id, "reaping idle project file server");
            if let Err(err) = self.stop(&project_id).await {
                warn!(%project_id, error = %err, "failed to reap idle project file server");
            }
        }
    }

    /// Stop every instance and the idle reaper task, in that order (spec
    /// §6 `shutdown`). The manager is unusable afterward.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.reaper_handle.lock().await.take() {
            handle.abort();
        }
        self.stop_all().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir, max_active_servers: usize) -> Config {
        let mut cfg = Config::from_env();
        cfg.state_dir = dir.path().join("state");
        cfg.port_range = 19000..=19050;
        cfg.max_active_servers = max_active_servers;
        cfg.reaper_interval = Duration::from_secs(3600);
        cfg.idle_timeout = Duration::from_secs(3600);
        cfg
    }

    #[tokio::test]
    async fn url_for_unregistered_project_is_root_invalid() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir, 2);
        let manager = ServerManager::new(cfg).await.unwrap();

        let id = ProjectId::new("proj1").unwrap();
        let result = manager.url_for(&id, "index.html").await;
        assert!(matches!(result, Err(ServerError::RootInvalid(_))));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn register_start_and_stop_round_trip() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir, 2);
        let manager = ServerManager::new(cfg).await.unwrap();

        let project_root = TempDir::new().unwrap();
        std::fs::write(project_root.path().join("index.html"), "hi").unwrap();

        let id = ProjectId::new("proj1").unwrap();
        manager.register_project_root(id.clone(), project_root.path().to_path_buf());

        let url = manager.url_for(&id, "index.html").await.unwrap();
        let resp = reqwest::get(&url).await.unwrap();
        assert_eq!(resp.status(), 200);

        let stats = manager.stats().await;
        assert_eq!(stats.active_servers, 1);

        manager.stop(&id).await.unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.active_servers, 0);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn eviction_stops_lru_victim_when_pool_is_full() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir, 1);
        let manager = ServerManager::new(cfg).await.unwrap();

        let root_a = TempDir::new().unwrap();
        std::fs::write(root_a.path().join("index.html"), "a").unwrap();
        let root_b = TempDir::new().unwrap();
        std::fs::write(root_b.path().join("index.html"), "b").unwrap();

        let id_a = ProjectId::new("proj-a").unwrap();
        let id_b = ProjectId::new("proj-b").unwrap();
        manager.register_project_root(id_a.clone(), root_a.path().to_path_buf());
        manager.register_project_root(id_b.clone(), root_b.path().to_path_buf());

        manager.url_for(&id_a, "index.html").await.unwrap();
        manager.url_for(&id_b, "index.html").await.unwrap();

        let stats = manager.stats().await;
        assert_eq!(stats.active_servers, 1);
        assert_eq!(stats.per_project_entries[0].project_id, "proj-b");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn unregister_stops_running_instance() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir, 2);
        let manager = ServerManager::new(cfg).await.unwrap();

        let project_root = TempDir::new().unwrap();
        std::fs::write(project_root.path().join("index.html"), "hi").unwrap();
        let id = ProjectId::new("proj1").unwrap();
        manager.register_project_root(id.clone(), project_root.path().to_path_buf());
        manager.url_for(&id, "index.html").await.unwrap();

        manager.unregister_project_root(&id).await.unwrap();
        let stats = manager.stats().await;
        assert_eq!(stats.active_servers, 0);

        manager.shutdown().await;
    }
}
