use serde::{Deserialize, Serialize};

/// Top-level configuration, loaded from TOML. Section and key names track
/// the hyphenated spelling of the original INI file for operator
/// familiarity; in Rust they become `snake_case` struct fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: SpiceConfig,
    #[serde(default)]
    pub ssl: SslConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpiceConfig {
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub timeout: u32,
    #[serde(default)]
    pub minimize: bool,
    #[serde(default = "default_true")]
    pub allow_control: bool,
    #[serde(default)]
    pub generate_password: bool,
    #[serde(default)]
    pub hide: bool,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub password_file: String,
    #[serde(default)]
    pub disable_ticketing: bool,
    #[serde(default)]
    pub exit_on_disconnect: bool,
    #[serde(default)]
    pub virtio_path: String,
    #[serde(default)]
    pub uinput_path: String,
    #[serde(default)]
    pub on_connect: String,
    #[serde(default)]
    pub on_disconnect: String,
    #[serde(default)]
    pub audit: bool,
    #[serde(default)]
    pub audit_message_type: String,
    #[serde(default = "default_trust")]
    pub always_trust_damage: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SslConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub ca_cert_file: String,
    #[serde(default)]
    pub certs_file: String,
    #[serde(default)]
    pub private_key_file: String,
    #[serde(default)]
    pub key_password_file: String,
    #[serde(default)]
    pub dh_key_file: String,
    #[serde(default)]
    pub ciphersuite: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_tile_count")]
    pub tile_count: u32,
    #[serde(default = "default_true")]
    pub scanline_coalescing: bool,
}

impl Default for SpiceConfig {
    fn default() -> Self {
        Self {
            display: default_display(),
            listen: default_listen(),
            timeout: 0,
            minimize: false,
            allow_control: true,
            generate_password: false,
            hide: false,
            password: String::new(),
            password_file: String::new(),
            disable_ticketing: false,
            exit_on_disconnect: false,
            virtio_path: String::new(),
            uinput_path: String::new(),
            on_connect: String::new(),
            on_disconnect: String::new(),
            audit: false,
            audit_message_type: String::new(),
            always_trust_damage: default_trust(),
        }
    }
}

impl Default for SslConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ca_cert_file: String::new(),
            certs_file: String::new(),
            private_key_file: String::new(),
            key_password_file: String::new(),
            dh_key_file: String::new(),
            ciphersuite: String::new(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            tile_count: default_tile_count(),
            scanline_coalescing: true,
        }
    }
}

impl BridgeConfig {
    /// Validate configuration semantics, returning collected issues.
    /// Entries prefixed `ERROR:` are fatal; everything else is a warning.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !self.bridge.password.is_empty()
            && !self.bridge.password_file.is_empty()
        {
            issues.push("ERROR: at most one of password / password-file / generate-password may be set".into());
        }
        if !self.bridge.password.is_empty() && self.bridge.generate_password {
            issues.push("ERROR: at most one of password / password-file / generate-password may be set".into());
        }
        if !self.bridge.password_file.is_empty() && self.bridge.generate_password {
            issues.push("ERROR: at most one of password / password-file / generate-password may be set".into());
        }

        if self.impossible_config() {
            issues.push(
                "ERROR: no password, password-file, generate-password, or disable-ticketing set"
                    .into(),
            );
        }

        if !matches!(
            self.bridge.always_trust_damage.as_str(),
            "auto" | "always" | "never"
        ) {
            issues.push(format!(
                "ERROR: always-trust-damage must be one of auto/always/never, got {:?}",
                self.bridge.always_trust_damage
            ));
        }

        if self.scan.tile_count == 0 {
            issues.push("ERROR: scan.tile_count must be >= 1".into());
        } else if self.scan.tile_count > 256 {
            issues.push(format!(
                "WARNING: scan.tile_count {} is unusually high, diffing overhead may dominate",
                self.scan.tile_count
            ));
        }

        if self.ssl.enabled && self.ssl.certs_file.is_empty() {
            issues.push("ERROR: ssl.enabled requires ssl.certs_file".into());
        }

        issues
    }

    /// Mirrors the "impossible-config" rule: refuse to start the protocol
    /// server with no way to authenticate a client.
    pub fn impossible_config(&self) -> bool {
        self.bridge.password.is_empty()
            && self.bridge.password_file.is_empty()
            && !self.bridge.generate_password
            && !self.bridge.disable_ticketing
    }
}

fn default_display() -> String {
    ":0".to_string()
}

fn default_listen() -> String {
    ":5900".to_string()
}

fn default_trust() -> String {
    "auto".to_string()
}

fn default_tile_count() -> u32 {
    32
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_impossible() {
        let config = BridgeConfig {
            bridge: SpiceConfig::default(),
            ssl: SslConfig::default(),
            scan: ScanConfig::default(),
        };
        assert!(config.impossible_config());
    }

    #[test]
    fn disable_ticketing_satisfies_impossible_config_rule() {
        let mut config = BridgeConfig {
            bridge: SpiceConfig::default(),
            ssl: SslConfig::default(),
            scan: ScanConfig::default(),
        };
        config.bridge.disable_ticketing = true;
        assert!(!config.impossible_config());
        assert!(config.validate().is_empty());
    }

    #[test]
    fn password_and_generate_password_conflict() {
        let mut config = BridgeConfig {
            bridge: SpiceConfig::default(),
            ssl: SslConfig::default(),
            scan: ScanConfig::default(),
        };
        config.bridge.password = "hunter2".into();
        config.bridge.generate_password = true;
        let issues = config.validate();
        assert!(issues.iter().any(|i| i.starts_with("ERROR:")));
    }

    #[test]
    fn deserializes_from_toml() {
        let toml_src = r#"
            [bridge]
            display = ":1"
            disable_ticketing = true

            [scan]
            tile_count = 16
        "#;
        let config: BridgeConfig = toml::from_str(toml_src).unwrap();
        assert_eq!(config.bridge.display, ":1");
        assert!(config.bridge.disable_ticketing);
        assert_eq!(config.scan.tile_count, 16);
        assert!(config.scan.scanline_coalescing);
    }
}
