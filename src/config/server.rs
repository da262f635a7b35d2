use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;

/// One tool-server registry entry: the command to launch and the environment
/// it runs with. One session is created per entry at startup.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    pub name: String,
    pub command: PathBuf,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub workdir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawServer {
    name: String,
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: HashMap<String, String>,
    workdir: Option<String>,
}

impl From<RawServer> for ServerConfig {
    fn from(raw: RawServer) -> Self {
        let expand = |s: &str| -> String {
            shellexpand::full(s)
                .map(|cow| cow.into_owned())
                .unwrap_or_else(|_| s.to_string())
        };

        Self {
            name: raw.name,
            command: PathBuf::from(expand(&raw.command)),
            args: raw.args.iter().map(|arg| expand(arg)).collect(),
            env: raw.env,
            workdir: raw.workdir.map(|dir| PathBuf::from(expand(&dir))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expands_tilde_in_command() {
        let raw = RawServer {
            name: "files".to_string(),
            command: "~/bin/mcp-files".to_string(),
            args: vec!["--root".to_string(), "~/docs".to_string()],
            env: HashMap::new(),
            workdir: None,
        };

        let config = ServerConfig::from(raw);
        let command = config.command.to_str().expect("valid utf8");
        assert!(!command.starts_with('~'));
        assert!(command.ends_with("bin/mcp-files"));
        assert!(!config.args[1].starts_with('~'));
    }

    #[test]
    fn keeps_plain_values_untouched() {
        let raw = RawServer {
            name: "calc".to_string(),
            command: "/usr/local/bin/mcp-calc".to_string(),
            args: vec!["--stdio".to_string()],
            env: HashMap::from([("CALC_MODE".to_string(), "strict".to_string())]),
            workdir: Some("/tmp".to_string()),
        };

        let config = ServerConfig::from(raw);
        assert_eq!(config.command, PathBuf::from("/usr/local/bin/mcp-calc"));
        assert_eq!(config.args, vec!["--stdio".to_string()]);
        assert_eq!(config.env.get("CALC_MODE").map(String::as_str), Some("strict"));
        assert_eq!(config.workdir, Some(PathBuf::from("/tmp")));
    }
}
