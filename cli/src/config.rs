//! Client-side state: auth credentials and resumable tunnel records.
//!
//! Lives under `UNIROUTE_CONFIG_DIR` (default: the platform config dir),
//! as `auth.json` and `tunnel-state.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uniroute_shared::Protocol;

/// Stored credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    /// Edge base URL, e.g. "https://example.com".
    pub server: String,
    pub token: String,
}

/// One resumable tunnel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelRecord {
    pub tunnel_id: String,
    pub subdomain: String,
    pub protocol: Protocol,
    pub local_target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TunnelState {
    #[serde(default)]
    pub tunnels: Vec<TunnelRecord>,
}

pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("UNIROUTE_CONFIG_DIR") {
        return Ok(PathBuf::from(dir));
    }
    dirs::config_dir()
        .map(|d| d.join("uniroute"))
        .context("no config directory available; set UNIROUTE_CONFIG_DIR")
}

fn auth_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("auth.json"))
}

fn state_path() -> Result<PathBuf> {
    Ok(config_dir()?.join("tunnel-state.json"))
}

pub fn load_auth() -> Result<Option<Auth>> {
    let path = auth_path()?;
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let auth = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(auth))
}

pub fn save_auth(auth: &Auth) -> Result<()> {
    let path = auth_path()?;
    write_json(&path, auth)
}

pub fn clear_auth() -> Result<()> {
    let path = auth_path()?;
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("failed to remove {}", path.display()))?;
    }
    Ok(())
}

pub fn load_state() -> Result<TunnelState> {
    let path = state_path()?;
    if !path.exists() {
        return Ok(TunnelState::default());
    }
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let state = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(state)
}

/// Insert or refresh a tunnel record keyed by tunnel id.
pub fn remember_tunnel(record: TunnelRecord) -> Result<()> {
    let mut state = load_state()?;
    state.tunnels.retain(|t| t.tunnel_id != record.tunnel_id);
    state.tunnels.push(record);
    write_json(&state_path()?, &state)
}

pub fn forget_tunnel(tunnel_id: &str) -> Result<()> {
    let mut state = load_state()?;
    state.tunnels.retain(|t| t.tunnel_id != tunnel_id);
    write_json(&state_path()?, &state)
}

fn write_json<T: Serialize>(path: &PathBuf, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    std::fs::write(path, raw).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Tests mutate process-wide env; serialize them.
    static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

    fn with_temp_dir<F: FnOnce()>(f: F) {
        let _guard = ENV_LOCK.lock().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::env::set_var("UNIROUTE_CONFIG_DIR", dir.path());
        f();
        std::env::remove_var("UNIROUTE_CONFIG_DIR");
    }

    #[test]
    fn test_auth_round_trip() {
        with_temp_dir(|| {
            assert!(load_auth().unwrap().is_none());
            save_auth(&Auth {
                server: "https://example.com".into(),
                token: "tok".into(),
            })
            .unwrap();
            let auth = load_auth().unwrap().unwrap();
            assert_eq!(auth.server, "https://example.com");
            clear_auth().unwrap();
            assert!(load_auth().unwrap().is_none());
        });
    }

    #[test]
    fn test_tunnel_state_upsert() {
        with_temp_dir(|| {
            remember_tunnel(TunnelRecord {
                tunnel_id: "t1".into(),
                subdomain: "myapp".into(),
                protocol: Protocol::Http,
                local_target: "127.0.0.1:3000".into(),
            })
            .unwrap();
            // Same id replaces, not duplicates.
            remember_tunnel(TunnelRecord {
                tunnel_id: "t1".into(),
                subdomain: "myapp".into(),
                protocol: Protocol::Http,
                local_target: "127.0.0.1:4000".into(),
            })
            .unwrap();
            let state = load_state().unwrap();
            assert_eq!(state.tunnels.len(), 1);
            assert_eq!(state.tunnels[0].local_target, "127.0.0.1:4000");

            forget_tunnel("t1").unwrap();
            assert!(load_state().unwrap().tunnels.is_empty());
        });
    }
}
