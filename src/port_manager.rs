use crate::config::Config;
use crate::error::ServerError;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Persisted `ProjectId -> Port` mapping, written as `{"ports": {...}}`
/// (spec §6 "Persisted state layout").
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
struct PortMappingFile {
    #[serde(default)]
    ports: HashMap<String, u16>,
}

/// Allocates and persists loopback ports for projects (spec §4.1).
///
/// Prefers reusing a project's previously assigned port so generated
/// preview URLs stay stable across app restarts; falls back to scanning
/// the configured range in ascending order.
pub struct PortManager {
    bind_address: Ipv4Addr,
    port_range: std::ops::RangeInclusive<u16>,
    mapping_path: std::path::PathBuf,
    mapping: Mutex<HashMap<String, u16>>,
    /// Ports currently held by a running server, as opposed to merely
    /// remembered in the persisted mapping for future reuse.
    in_use: Mutex<HashSet<u16>>,
}

impl PortManager {
    pub fn new(cfg: &Config) -> Result<Self, ServerError> {
        cfg.ensure_state_dir()?;
        let mapping_path = cfg.port_mapping_file();
        let mapping = load_mapping(&mapping_path)?;
        Ok(Self {
            bind_address: cfg.bind_address,
            port_range: cfg.port_range.clone(),
            mapping_path,
            mapping: Mutex::new(mapping),
            in_use: Mutex::new(HashSet::new()),
        })
    }

    /// Allocate a port for `project_id`, preferring a persisted previous
    /// assignment when it still binds successfully (spec §4.1).
    pub async fn allocate(&self, project_id: &str) -> Result<u16, ServerError> {
        let bind_address = self.bind_address;
        let preferred = {
            let mapping = self.mapping.lock().expect("port mapping lock poisoned");
            mapping.get(project_id).copied()
        };

        if let Some(port) = preferred {
            let available = tokio::task::spawn_blocking(move || can_bind(bind_address, port))
                .await
                .map_err(|e| ServerError::Io(std::io::Error::other(e.to_string())))?;
            if available {
                self.mark_in_use(project_id, port)?;
                debug!(project_id, port, "reusing persisted port");
                return Ok(port);
            }
            warn!(
                project_id,
                port, "persisted port no longer free, scanning range"
            );
        }

        let range = self.port_range.clone();
        let taken: HashSet<u16> = self.in_use.lock().expect("in_use lock poisoned").clone();
        let found = tokio::task::spawn_blocking(move || {
            for port in range {
                if taken.contains(&port) {
                    continue;
                }
                if can_bind(bind_address, port) {
                    return Some(port);
                }
            }
            None
        })
        .await
        .map_err(|e| ServerError::Io(std::io::Error::other(e.to_string())))?;

        match found {
            Some(port) => {
                self.mark_in_use(project_id, port)?;
                info!(project_id, port, "allocated new port");
                Ok(port)
            }
            None => Err(ServerError::NoPortAvailable),
        }
    }

    fn mark_in_use(&self, project_id: &str, port: u16) -> Result<(), ServerError> {
        {
            let mut mapping = self.mapping.lock().expect("port mapping lock poisoned");
            if mapping.get(project_id) != Some(&port) {
                mapping.insert(project_id.to_string(), port);
                let snapshot = mapping.clone();
                drop(mapping);
                persist(&self.mapping_path, &snapshot)?;
            }
        }
        self.in_use.lock().expect("in_use lock poisoned").insert(port);
        Ok(())
    }

    /// Mark a port as no longer bound by a running instance. The persisted
    /// mapping entry is kept so the next `allocate` for this project reuses
    /// the same port (spec §4.1's URL-stability design choice).
    pub fn release(&self, project_id: &str) {
        let port = {
            let mapping = self.mapping.lock().expect("port mapping lock poisoned");
            mapping.get(project_id).copied()
        };
        if let Some(port) = port {
            self.in_use.lock().expect("in_use lock poisoned").remove(&port);
        }
    }

    /// Pure read of the persisted mapping.
    pub fn lookup(&self, project_id: &str) -> Option<u16> {
        self.mapping
            .lock()
            .expect("port mapping lock poisoned")
            .get(project_id)
            .copied()
    }

    /// Drop all mappings. Intended for tests.
    pub fn clear(&self) -> Result<(), ServerError> {
        self.mapping.lock().expect("port mapping lock poisoned").clear();
        self.in_use.lock().expect("in_use lock poisoned").clear();
        persist(&self.mapping_path, &HashMap::new())
    }
}

fn can_bind(bind_address: Ipv4Addr, port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(bind_address, port)).is_ok()
}

fn load_mapping(path: &std::path::Path) -> Result<HashMap<String, u16>, ServerError> {
    match fs::read_to_string(path) {
        Ok(data) => {
            let parsed: PortMappingFile = serde_json::from_str(&data)?;
            Ok(parsed.ports)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
        Err(e) => Err(ServerError::Io(e)),
    }
}

fn persist(path: &std::path::Path, ports: &HashMap<String, u16>) -> Result<(), ServerError> {
    let file = PortMappingFile {
        ports: ports.clone(),
    };
    let serialized = serde_json::to_string_pretty(&file)?;
    let tmp_path = path.with_extension("tmp");
    {
        let mut f = fs::File::create(&tmp_path)?;
        f.write_all(serialized.as_bytes())?;
        f.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        let mut cfg = Config::from_env();
        cfg.state_dir = dir.path().to_path_buf();
        cfg.port_range = 18000..=18050;
        cfg
    }

    #[tokio::test]
    async fn allocate_twice_in_succession_returns_same_port() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let pm = PortManager::new(&cfg).unwrap();

        let p1 = pm.allocate("proj1").await.unwrap();
        let p2 = pm.allocate("proj1").await.unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn release_then_allocate_reuses_port() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let pm = PortManager::new(&cfg).unwrap();

        let p1 = pm.allocate("proj1").await.unwrap();
        pm.release("proj1");
        let p2 = pm.allocate("proj1").await.unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn different_projects_get_different_ports() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let pm = PortManager::new(&cfg).unwrap();

        let p1 = pm.allocate("proj1").await.unwrap();
        let p2 = pm.allocate("proj2").await.unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn mapping_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let port;
        {
            let pm = PortManager::new(&cfg).unwrap();
            port = pm.allocate("proj1").await.unwrap();
            pm.release("proj1");
        }
        {
            let pm = PortManager::new(&cfg).unwrap();
            assert_eq!(pm.lookup("proj1"), Some(port));
            let reused = pm.allocate("proj1").await.unwrap();
            assert_eq!(reused, port);
        }
    }

    #[tokio::test]
    async fn clear_drops_all_mappings() {
        let dir = TempDir::new().unwrap();
        let cfg = test_config(&dir);
        let pm = PortManager::new(&cfg).unwrap();

        pm.allocate("proj1").await.unwrap();
        pm.clear().unwrap();
        assert_eq!(pm.lookup("proj1"), None);
    }

    #[tokio::test]
    async fn exhausted_range_reports_no_port_available() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(&dir);
        cfg.port_range = 18100..=18100;
        let pm = PortManager::new(&cfg).unwrap();

        // hold the only port in range with an unrelated listener
        let _held = TcpListener::bind(SocketAddrV4::new(cfg.bind_address, 18100)).unwrap();
        let result = pm.allocate("proj1").await;
        assert!(matches!(result, Err(ServerError::NoPortAvailable)));
    }
}
