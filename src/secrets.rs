// src/secrets.rs
// Secrets are read once at startup from files under the configured secrets
// directory. Values are held in memory and never logged; only file paths
// appear in log output.

use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::config::Config;

#[derive(Default, Clone)]
pub struct Secrets {
    pub redis_password: Option<String>,
    pub ip_reputation_api_key: Option<String>,
    pub llm_api_token: Option<String>,
    pub community_api_key: Option<String>,
    pub smtp_password: Option<String>,
}

impl std::fmt::Debug for Secrets {
    // Redacted on purpose: a Debug-formatted Runtime must not leak secrets.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("redis_password", &self.redis_password.is_some())
            .field("ip_reputation_api_key", &self.ip_reputation_api_key.is_some())
            .field("llm_api_token", &self.llm_api_token.is_some())
            .field("community_api_key", &self.community_api_key.is_some())
            .field("smtp_password", &self.smtp_password.is_some())
            .finish()
    }
}

impl Secrets {
    pub fn load(cfg: &Config) -> Self {
        let dir = &cfg.secrets_dir;
        Secrets {
            redis_password: read_secret(dir, &cfg.redis_password_filename),
            ip_reputation_api_key: read_secret(dir, &cfg.ip_reputation_api_key_filename),
            llm_api_token: read_secret(dir, &cfg.llm_api_token_filename),
            community_api_key: read_secret(dir, &cfg.community_api_key_filename),
            smtp_password: read_secret(dir, &cfg.smtp_password_filename),
        }
    }
}

fn read_secret(dir: &Path, filename: &str) -> Option<String> {
    let path = dir.join(filename);
    if !path.exists() {
        debug!(path = %path.display(), "secret file not present");
        return None;
    }
    match fs::read_to_string(&path) {
        Ok(contents) => {
            let trimmed = contents.trim();
            if trimmed.is_empty() {
                warn!(path = %path.display(), "secret file is empty");
                None
            } else {
                debug!(path = %path.display(), "loaded secret");
                Some(trimmed.to_string())
            }
        }
        Err(err) => {
            warn!(path = %path.display(), error = %err, "failed to read secret file");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_and_trims_secret_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("api_key.txt");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "  s3cret-value  ").unwrap();

        assert_eq!(
            read_secret(dir.path(), "api_key.txt"),
            Some("s3cret-value".to_string())
        );
        assert_eq!(read_secret(dir.path(), "missing.txt"), None);
    }

    #[test]
    fn empty_secret_file_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("empty.txt"), "  \n").unwrap();
        assert_eq!(read_secret(dir.path(), "empty.txt"), None);
    }

    #[test]
    fn debug_output_never_contains_values() {
        let secrets = Secrets {
            smtp_password: Some("hunter2".into()),
            ..Secrets::default()
        };
        let rendered = format!("{:?}", secrets);
        assert!(!rendered.contains("hunter2"));
    }
}
