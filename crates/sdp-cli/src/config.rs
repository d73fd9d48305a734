//! Configuration file handling for the SDP CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use sdp_core::{MacAddress, MediaMask, MediaType, NodeConfig};

/// CLI configuration: node settings plus statically provisioned peers
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    /// Engine configuration
    #[serde(flatten)]
    pub node: NodeConfig,
    /// Peers known before any handshake
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peers: Vec<PeerEntry>,
}

/// A provisioned peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    /// Peer name
    pub name: String,
    /// Hardware address, colon separated
    pub address: String,
    /// Media names the peer is reachable on
    #[serde(default)]
    pub media: Vec<String>,
}

impl PeerEntry {
    /// Parsed address and media mask
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed address or unknown media name.
    pub fn parse(&self) -> anyhow::Result<(MacAddress, MediaMask)> {
        let address: MacAddress = self
            .address
            .parse()
            .map_err(|e: String| anyhow::anyhow!("peer '{}': {}", self.name, e))?;
        let media = self
            .media
            .iter()
            .map(|m| m.parse::<MediaType>())
            .collect::<Result<MediaMask, _>>()
            .map_err(|e| anyhow::anyhow!("peer '{}': {}", self.name, e))?;
        if media.is_empty() {
            anyhow::bail!("peer '{}' lists no media", self.name);
        }
        Ok((address, media))
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("sdp/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.node.validate()?;

        if self.peers.len() > self.node.node.peer_capacity {
            anyhow::bail!(
                "{} peers configured but node.peer_capacity is {}",
                self.peers.len(),
                self.node.node.peer_capacity
            );
        }

        let local = self.node.address()?;
        for peer in &self.peers {
            let (address, _) = peer.parse()?;
            if address == local {
                anyhow::bail!("peer '{}' uses the local address {}", peer.name, address);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn peer(name: &str, address: &str, media: &[&str]) -> PeerEntry {
        PeerEntry {
            name: name.to_string(),
            address: address.to_string(),
            media: media.iter().map(|m| m.to_string()).collect(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert!(config.peers.is_empty());
        assert_eq!(config.node.node.name, "sdp-node");
    }

    #[test]
    fn test_toml_roundtrip_through_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.node.node.name = "gateway".to_string();
        config.peers.push(peer("sensor", "02:00:00:00:00:09", &["bus-can", "radio-long"]));
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[node]\nname = \"edge\"\n\n[[peers]]\nname = \"a\"\naddress = \"02:00:00:00:00:0a\"\nmedia = [\"radio-short\"]\n",
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.node.node.name, "edge");
        assert_eq!(config.node.node.peer_capacity, 16);
        assert_eq!(config.node.messaging.send_attempts, 4);
        assert!(config.validate().is_ok());

        let (address, media) = config.peers[0].parse().unwrap();
        assert_eq!(address, MacAddress([2, 0, 0, 0, 0, 0x0a]));
        assert_eq!(media, MediaType::RadioShort.into());
    }

    #[test]
    fn test_peer_validation() {
        let mut config = Config::default();
        config.peers.push(peer("bad", "02:00", &["bus-can"]));
        assert!(config.validate().is_err());

        config.peers[0] = peer("bad", "02:00:00:00:00:09", &["smoke-signal"]);
        assert!(config.validate().is_err());

        config.peers[0] = peer("mute", "02:00:00:00:00:09", &[]);
        assert!(config.validate().is_err());

        config.peers[0] = peer("me", "02:00:00:00:00:01", &["bus-can"]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("local address"));
    }

    #[test]
    fn test_node_errors_surface() {
        let mut config = Config::default();
        config.node.logging.level = "chatty".to_string();
        assert!(config.validate().is_err());
    }
}
