//! Optional YAML config file. Command line values win over file values.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use config::{Config, File as CfgFile};
use serde::Deserialize;

/// Values a config file may set; everything is optional.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct NodeConfig {
    /// UDP address to bind.
    pub udp_address: Option<SocketAddr>,
    /// Publicly reachable address to advertise; advertising one makes
    /// this node a service node.
    pub public_address: Option<SocketAddr>,
    /// NodeDB directory.
    pub nodedb: Option<PathBuf>,
    /// Directory holding the secret key files.
    pub keys_dir: Option<PathBuf>,
    /// Network tag.
    pub netid: Option<String>,
    /// Relay paths and DHT lookups for others.
    pub allow_transit: Option<bool>,
    /// Grant exit requests.
    pub allow_exit: Option<bool>,
    /// Files containing bootstrap descriptors.
    pub bootstrap: Option<Vec<PathBuf>>,
    /// Log filter, e.g. `info` or `nyx_core=debug`.
    pub log: Option<String>,
}

impl NodeConfig {
    /// Load a config file; unknown keys are ignored with a warning from
    /// the config layer, a malformed file is an error.
    pub fn load(path: &Path) -> Result<NodeConfig, config::ConfigError> {
        let mut cfg = Config::default();
        cfg.merge(CfgFile::from(path.to_path_buf()))?;
        cfg.try_into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(
            &path,
            "udp_address: \"127.0.0.1:1090\"\nallow_transit: true\nnetid: testnet\n",
        )
        .unwrap();

        let cfg = NodeConfig::load(&path).unwrap();
        assert_eq!(cfg.udp_address, Some("127.0.0.1:1090".parse().unwrap()));
        assert_eq!(cfg.allow_transit, Some(true));
        assert_eq!(cfg.netid.as_deref(), Some("testnet"));
        assert_eq!(cfg.nodedb, None);
    }

    #[test]
    fn malformed_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.yaml");
        std::fs::write(&path, ": not yaml :").unwrap();
        assert!(NodeConfig::load(&path).is_err());
    }
}
