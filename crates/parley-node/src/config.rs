use std::path::PathBuf;

/// Environment-derived configuration. `.env` in the application directory is
/// loaded first; real environment variables win.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub discovery_relays: Vec<String>,
    pub nwc_string: Option<String>,
    pub parent_url: Option<String>,
    pub parent_token: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_base_url: String,
    pub openrouter_api_key: Option<String>,
    pub docstore_url: Option<String>,
    pub app_dir: PathBuf,
}

fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let app_dir = var("PARLEY_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs_home().join(".parley")
            });

        Self {
            port: var("PORT").and_then(|v| v.parse().ok()).unwrap_or(8480),
            discovery_relays: var("DISCOVERY_RELAYS")
                .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or_default(),
            nwc_string: var("NWC_STRING"),
            parent_url: var("PARENT_URL"),
            parent_token: var("PARENT_TOKEN"),
            openai_api_key: var("OPENAI_API_KEY"),
            openai_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://openrouter.ai/api/v1".into()),
            openrouter_api_key: var("OPENROUTER_API_KEY"),
            docstore_url: var("DOCSTORE_URL"),
            app_dir,
        }
    }

    pub fn docstore_path(&self) -> PathBuf {
        self.app_dir.join("docstore.db")
    }

    pub fn admin_db_path(&self) -> PathBuf {
        self.app_dir.join("askexperts.db")
    }

    pub fn rag_path(&self) -> PathBuf {
        self.app_dir.join("rag")
    }

    pub fn keyfile_path(&self) -> PathBuf {
        self.app_dir.join("identity.key")
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relays_parse_from_comma_separated_var() {
        std::env::set_var("DISCOVERY_RELAYS", "ws://a, ws://b");
        let config = Config::from_env();
        assert_eq!(config.discovery_relays, vec!["ws://a", "ws://b"]);
        std::env::remove_var("DISCOVERY_RELAYS");
    }
}
