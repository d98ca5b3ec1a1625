//! Process-wide tunables and node configuration.
//!
//! `Globals` is a plain value passed by reference to the subsystems that
//! need it -- initialised once from `--co-globals k=v,...` or a TOML
//! config file, read-mostly thereafter.

use std::path::Path;

use serde::{Deserialize, Serialize};

use trellis_protocol::ConnectionDesc;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Globals {
    /// Default timeout for blocking operations in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Idle interval after which peers get pinged.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Streaming chunk size for object data bursts.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Instance cache capacity in entries; 0 disables the cache.
    #[serde(default = "default_cache_entries")]
    pub instance_cache_entries: usize,
    /// Instance cache entries older than this are expired on idle.
    #[serde(default = "default_cache_age_ms")]
    pub instance_cache_age_ms: u64,
    /// Commit history retained per master object, in versions.
    #[serde(default = "default_history")]
    pub commit_history: usize,
}

fn default_timeout_ms() -> u64 {
    10_000
}
fn default_keepalive_ms() -> u64 {
    5_000
}
fn default_chunk_size() -> usize {
    65_536
}
fn default_cache_entries() -> usize {
    128
}
fn default_cache_age_ms() -> u64 {
    60_000
}
fn default_history() -> usize {
    16
}

impl Default for Globals {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
            chunk_size: default_chunk_size(),
            instance_cache_entries: default_cache_entries(),
            instance_cache_age_ms: default_cache_age_ms(),
            commit_history: default_history(),
        }
    }
}

impl Globals {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn keepalive(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.keepalive_ms)
    }

    /// Render as the `k=v,...` form `apply_kv` accepts, so config-file
    /// globals can travel through the same flag path as CLI overrides.
    pub fn to_kv(&self) -> String {
        format!(
            "timeout_ms={},keepalive_ms={},chunk_size={},instance_cache_entries={},instance_cache_age_ms={},commit_history={}",
            self.timeout_ms,
            self.keepalive_ms,
            self.chunk_size,
            self.instance_cache_entries,
            self.instance_cache_age_ms,
            self.commit_history,
        )
    }

    /// Apply `k=v,...` overrides. Unknown keys and bad values are
    /// reported, not fatal; the remaining overrides still apply.
    pub fn apply_kv(&mut self, kv: &str) -> bool {
        let mut clean = true;
        for pair in kv.split(',').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                tracing::warn!(pair, "ignoring malformed global override");
                clean = false;
                continue;
            };
            let applied = match key.trim() {
                "timeout_ms" => parse_into(value, &mut self.timeout_ms),
                "keepalive_ms" => parse_into(value, &mut self.keepalive_ms),
                "chunk_size" => parse_into(value, &mut self.chunk_size),
                "instance_cache_entries" => parse_into(value, &mut self.instance_cache_entries),
                "instance_cache_age_ms" => parse_into(value, &mut self.instance_cache_age_ms),
                "commit_history" => parse_into(value, &mut self.commit_history),
                other => {
                    tracing::warn!(key = other, "unknown global override");
                    false
                }
            };
            clean &= applied;
        }
        clean
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.trim().parse() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => {
            tracing::warn!(value, "ignoring unparsable global override");
            false
        }
    }
}

/// Node configuration, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Listener descriptions in `kind:host:port[:group]` form.
    #[serde(default)]
    pub listen: Vec<String>,
    #[serde(default)]
    pub globals: Option<Globals>,
}

impl NodeConfig {
    /// Load config from file, or default if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: NodeConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    pub fn listeners(&self) -> Result<Vec<ConnectionDesc>, trellis_protocol::ProtocolError> {
        self.listen.iter().map(|s| s.parse()).collect()
    }
}

/// Parse the minimal core flag set: `--co-listen <desc>` (repeatable) and
/// `--co-globals <k=v,...>`. Unrelated arguments pass through untouched.
pub fn parse_core_args(
    args: &[String],
) -> Result<(Vec<ConnectionDesc>, Globals), trellis_protocol::ProtocolError> {
    let mut descs = Vec::new();
    let mut globals = Globals::default();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--co-listen" => {
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    i += 1;
                    descs.push(args[i].parse()?);
                } else {
                    tracing::warn!("no argument given to --co-listen");
                }
            }
            "--co-globals" => {
                if i + 1 < args.len() && !args[i + 1].starts_with('-') {
                    i += 1;
                    if !globals.apply_kv(&args[i]) {
                        tracing::warn!(value = %args[i], "invalid global overrides, using defaults where unparsable");
                    }
                } else {
                    tracing::warn!("no argument given to --co-globals");
                }
            }
            _ => {}
        }
        i += 1;
    }

    Ok((descs, globals))
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_protocol::ConnectionKind;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_defaults() {
        let globals = Globals::default();
        assert_eq!(globals.timeout_ms, 10_000);
        assert_eq!(globals.chunk_size, 65_536);
        assert_eq!(globals.commit_history, 16);
    }

    #[test]
    fn test_apply_kv() {
        let mut globals = Globals::default();
        assert!(globals.apply_kv("timeout_ms=500,chunk_size=1024"));
        assert_eq!(globals.timeout_ms, 500);
        assert_eq!(globals.chunk_size, 1024);
    }

    #[test]
    fn test_to_kv_roundtrip() {
        let mut globals = Globals::default();
        globals.timeout_ms = 777;
        globals.commit_history = 3;

        let mut back = Globals::default();
        assert!(back.apply_kv(&globals.to_kv()));
        assert_eq!(back, globals);
    }

    #[test]
    fn test_later_kv_overrides_earlier() {
        // Config-file globals then CLI globals: the last value wins.
        let (_, globals) = parse_core_args(&args(&[
            "--co-globals",
            "timeout_ms=100,keepalive_ms=200",
            "--co-globals",
            "timeout_ms=999",
        ]))
        .unwrap();
        assert_eq!(globals.timeout_ms, 999);
        assert_eq!(globals.keepalive_ms, 200);
    }

    #[test]
    fn test_apply_kv_bad_pairs_reported() {
        let mut globals = Globals::default();
        assert!(!globals.apply_kv("timeout_ms=abc,keepalive_ms=77"));
        // The parsable override still applied.
        assert_eq!(globals.keepalive_ms, 77);
        assert_eq!(globals.timeout_ms, 10_000);
    }

    #[test]
    fn test_parse_core_args() {
        let (descs, globals) = parse_core_args(&args(&[
            "--co-listen",
            "tcpip:127.0.0.1:9000",
            "--co-listen",
            "mcast:0.0.0.0:9001:wall",
            "--co-globals",
            "timeout_ms=123",
            "--unrelated",
        ]))
        .unwrap();
        assert_eq!(descs.len(), 2);
        assert_eq!(descs[0].kind, ConnectionKind::Tcp);
        assert_eq!(descs[1].group, "wall");
        assert_eq!(globals.timeout_ms, 123);
    }

    #[test]
    fn test_parse_core_args_missing_value() {
        let (descs, _) = parse_core_args(&args(&["--co-listen"])).unwrap();
        assert!(descs.is_empty());
    }

    #[test]
    fn test_config_toml() {
        let toml_str = r#"
listen = ["tcpip:0.0.0.0:4242"]

[globals]
timeout_ms = 2000
"#;
        let cfg: NodeConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(cfg.listeners().unwrap().len(), 1);
        assert_eq!(cfg.globals.unwrap().timeout_ms, 2000);
    }

    #[test]
    fn test_load_or_default_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");
        std::fs::write(&path, "listen = [\"tcpip:127.0.0.1:9100\"]\n").unwrap();

        let cfg = NodeConfig::load_or_default(&path).unwrap();
        assert_eq!(cfg.listen, vec!["tcpip:127.0.0.1:9100"]);

        let missing = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(missing.listen.is_empty());
    }
}
