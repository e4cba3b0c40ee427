//! Command-line surface (spec §6): a listen spec positional plus the
//! `--password`/`--password-file`/`--generate-password` mutually-exclusive
//! group. `clap`'s derive API earns its keep here precisely because this
//! surface is richer than a bare `--config`/`--port` pair.

use std::path::PathBuf;

use clap::Parser;
use x11bridge_proto::{BridgeConfig, SslConfig};

#[derive(Parser, Debug)]
#[command(name = "x11bridge", version, about = "X11-to-remote-desktop capture bridge")]
pub struct Cli {
    /// Listen spec `[host]:[start-port[-end-port]]`; the bridge tries each
    /// port in the range in order and keeps the first that binds.
    #[arg(default_value = ":5900")]
    pub listen: String,

    #[arg(long, overrides_with = "no_allow_control")]
    pub allow_control: bool,

    #[arg(long = "no-allow-control")]
    pub no_allow_control: bool,

    #[arg(long, default_value_t = 0)]
    pub timeout: u32,

    #[arg(long)]
    pub display: Option<String>,

    #[arg(long, group = "auth")]
    pub password: Option<String>,

    /// Path to a file containing the password, or `-` for stdin.
    #[arg(long = "password-file", group = "auth")]
    pub password_file: Option<String>,

    /// `--generate-password` with no value picks the default length (8).
    #[arg(long = "generate-password", group = "auth", num_args = 0..=1, default_missing_value = "8")]
    pub generate_password: Option<u32>,

    #[arg(long)]
    pub config: Option<PathBuf>,

    /// `--ssl` alone just enables SSL with file defaults; `--ssl=ca,cert,
    /// key,keypw,dh,cipher` (trailing fields optional, empty-string skips a
    /// field) overrides individual paths/ciphersuite.
    #[arg(long = "ssl", num_args = 0..=1, default_missing_value = "")]
    pub ssl: Option<String>,

    #[arg(long)]
    pub hide: bool,

    #[arg(long)]
    pub minimize: bool,
}

impl Cli {
    /// Overlay CLI flags onto a file-or-default `BridgeConfig`, matching
    /// `options_load`'s argument-parsing-last ordering: CLI wins over
    /// whatever the config file set.
    pub fn merge_into(&self, config: &mut BridgeConfig) {
        let bridge = &mut config.bridge;

        if self.listen != ":5900" {
            bridge.listen = self.listen.clone();
        }
        if self.allow_control {
            bridge.allow_control = true;
        }
        if self.no_allow_control {
            bridge.allow_control = false;
        }
        if self.timeout != 0 {
            bridge.timeout = self.timeout;
        }
        if let Some(display) = &self.display {
            bridge.display = display.clone();
        }
        if let Some(password) = &self.password {
            bridge.password = password.clone();
            bridge.password_file.clear();
            bridge.generate_password = false;
        }
        if let Some(path) = &self.password_file {
            bridge.password_file = path.clone();
            bridge.password.clear();
            bridge.generate_password = false;
        }
        if let Some(_len) = self.generate_password {
            bridge.generate_password = true;
            bridge.password.clear();
            bridge.password_file.clear();
        }
        if self.hide {
            bridge.hide = true;
        }
        if self.minimize {
            bridge.minimize = true;
        }
        if let Some(spec) = &self.ssl {
            apply_ssl_flag(spec, &mut config.ssl);
        }
    }

    /// The password length requested by `--generate-password[=LEN]`,
    /// defaulting to 8 per spec §6.
    pub fn generate_password_length(&self) -> u32 {
        self.generate_password.unwrap_or(8)
    }
}

/// Apply `--ssl[=ca,cert,key,keypw,dh,cipher]`: position-indexed, comma
/// separated, any field left empty (or past the end of the list) is
/// skipped rather than cleared — grounded in `options.c`'s
/// `options_handle_ssl`, which threads each token through `strtok_r` and
/// only `str_replace`s a field when its token is non-empty. The flag's mere
/// presence enables SSL, independent of how many fields follow.
fn apply_ssl_flag(spec: &str, ssl: &mut SslConfig) {
    ssl.enabled = true;
    for (index, token) in spec.split(',').enumerate() {
        if token.is_empty() {
            continue;
        }
        match index {
            0 => ssl.ca_cert_file = token.to_string(),
            1 => ssl.certs_file = token.to_string(),
            2 => ssl.private_key_file = token.to_string(),
            3 => ssl.key_password_file = token.to_string(),
            4 => ssl.dh_key_file = token.to_string(),
            5 => ssl.ciphersuite = token.to_string(),
            _ => {}
        }
    }
}

/// Parsed `[host]:[start-port[-end-port]]` listen spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenSpec {
    pub host: String,
    pub start_port: u16,
    pub end_port: u16,
}

impl ListenSpec {
    /// Grounded in `options.c`'s listen-spec parsing: an empty host binds
    /// all interfaces; a single port has `start == end`; a `start-end` range
    /// is scanned in order by the caller until one port binds.
    pub fn parse(spec: &str) -> Result<Self, String> {
        let (host, port_part) = match spec.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p),
            None => (String::new(), spec),
        };

        if port_part.is_empty() {
            return Ok(Self {
                host,
                start_port: 5900,
                end_port: 5900,
            });
        }

        let (start_str, end_str) = match port_part.split_once('-') {
            Some((s, e)) => (s, e),
            None => (port_part, port_part),
        };

        let start_port: u16 = start_str
            .parse()
            .map_err(|_| format!("invalid start port {start_str:?} in listen spec {spec:?}"))?;
        let end_port: u16 = end_str
            .parse()
            .map_err(|_| format!("invalid end port {end_str:?} in listen spec {spec:?}"))?;

        if end_port < start_port {
            return Err(format!("port range end {end_port} precedes start {start_port}"));
        }

        Ok(Self {
            host,
            start_port,
            end_port,
        })
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start_port..=self.end_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use x11bridge_proto::SpiceConfig;

    #[test]
    fn parses_bare_port() {
        let spec = ListenSpec::parse(":5900").unwrap();
        assert_eq!(spec.host, "");
        assert_eq!(spec.start_port, 5900);
        assert_eq!(spec.end_port, 5900);
    }

    #[test]
    fn parses_host_and_range() {
        let spec = ListenSpec::parse("127.0.0.1:5900-5910").unwrap();
        assert_eq!(spec.host, "127.0.0.1");
        assert_eq!(spec.start_port, 5900);
        assert_eq!(spec.end_port, 5910);
        assert_eq!(spec.ports().count(), 11);
    }

    #[test]
    fn rejects_inverted_range() {
        assert!(ListenSpec::parse(":5910-5900").is_err());
    }

    #[test]
    fn cli_overlay_prefers_explicit_password_over_generate() {
        let cli = Cli::try_parse_from(["x11bridge", "--password", "hunter2"]).unwrap();
        let mut config = BridgeConfig {
            bridge: SpiceConfig {
                generate_password: true,
                ..Default::default()
            },
            ..default_config()
        };
        cli.merge_into(&mut config);
        assert_eq!(config.bridge.password, "hunter2");
        assert!(!config.bridge.generate_password);
    }

    #[test]
    fn ssl_flag_alone_enables_with_no_paths() {
        let mut ssl = SslConfig::default();
        apply_ssl_flag("", &mut ssl);
        assert!(ssl.enabled);
        assert!(ssl.certs_file.is_empty());
    }

    #[test]
    fn ssl_flag_sets_positional_fields_and_skips_empty() {
        let mut ssl = SslConfig::default();
        apply_ssl_flag("ca.pem,,key.pem", &mut ssl);
        assert!(ssl.enabled);
        assert_eq!(ssl.ca_cert_file, "ca.pem");
        assert!(ssl.certs_file.is_empty());
        assert_eq!(ssl.private_key_file, "key.pem");
    }

    #[test]
    fn cli_overlay_applies_ssl_flag() {
        let cli = Cli::try_parse_from(["x11bridge", "--ssl", "ca.pem,certs.pem"]).unwrap();
        let mut config = default_config();
        cli.merge_into(&mut config);
        assert!(config.ssl.enabled);
        assert_eq!(config.ssl.ca_cert_file, "ca.pem");
        assert_eq!(config.ssl.certs_file, "certs.pem");
    }

    fn default_config() -> BridgeConfig {
        BridgeConfig {
            bridge: SpiceConfig::default(),
            ssl: Default::default(),
            scan: Default::default(),
        }
    }
}
