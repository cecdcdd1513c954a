use std::env;
use std::path::PathBuf;

use crate::infrastructure::downloader::Credentials;

/// Application configuration loaded once from environment variables
/// (`spec.md` §9 "Global state", `spec.md` §12).
#[derive(Debug, Clone)]
pub struct Config {
    pub civitai_token: Option<String>,
    pub huggingface_token: Option<String>,
    pub models_root: PathBuf,
    pub cache_dir: PathBuf,
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// `./models` and `./.comfydock/cache` when the corresponding
    /// variables are unset.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            civitai_token: env::var("CIVITAI_TOKEN").ok(),
            huggingface_token: env::var("HUGGINGFACE_TOKEN").ok(),
            models_root: env::var("COMFYDOCK_MODELS_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("models")),
            cache_dir: env::var("COMFYDOCK_CACHE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".comfydock/cache")),
        }
    }

    #[must_use]
    pub fn credentials(&self) -> Credentials {
        Credentials {
            civitai_token: self.civitai_token.clone(),
            huggingface_token: self.huggingface_token.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::from_env()
    }
}
