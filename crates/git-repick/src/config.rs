use std::env;
use std::fs;
use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

/// Default lines of surrounding code added when presenting a section to the
/// model.
pub const DEFAULT_SECTION_EXTRA_CONTEXT: usize = 10;
/// Context lines used for the fixed-width window when no enclosing section
/// can be found.
pub const DEFAULT_WINDOW_CONTEXT: usize = 5;
/// Reject a repair when the destination section length differs from the
/// source section by more than this many lines.
pub const DEFAULT_MAX_SECTION_LENGTH_DIFFERENCE: usize = 50;

pub struct Config {
    git_path: String,
    patch_path: String,
    llm_endpoint: Option<String>,
    llm_model: String,
    llm_region: String,
    llm_cache_path: Option<PathBuf>,
    llm_max_retries: u32,
    llm_retry_delay_ms: u64,
    llm_timeout_secs: u64,
    llm_max_tokens: u32,
    validation_timeout_secs: u64,
    section_start_patterns: Vec<String>,
    section_extra_context: usize,
    window_context: usize,
    max_section_length_difference: usize,
}

#[derive(Deserialize, Serialize, Default)]
pub struct FileConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_cache_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_retry_delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_start_patterns: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_extra_context: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_context: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_section_length_difference: Option<usize>,
}

static CONFIG: OnceLock<Config> = OnceLock::new();

impl Config {
    /// Access the global configuration. Lazily initializes if not already
    /// initialized.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(build_config)
    }

    /// Returns the command to invoke git.
    pub fn git_cmd(&self) -> &str {
        &self.git_path
    }

    /// Returns the command to invoke the patch tool.
    pub fn patch_cmd(&self) -> &str {
        &self.patch_path
    }

    pub fn llm_endpoint(&self) -> Option<&str> {
        self.llm_endpoint.as_deref()
    }

    pub fn llm_model(&self) -> &str {
        &self.llm_model
    }

    pub fn llm_region(&self) -> &str {
        &self.llm_region
    }

    /// Default path of the on-disk LLM response cache.
    pub fn llm_cache_path(&self) -> Option<PathBuf> {
        self.llm_cache_path.clone().or_else(|| {
            dirs::cache_dir().map(|dir| dir.join("git-repick").join("llm-cache.json"))
        })
    }

    pub fn llm_max_retries(&self) -> u32 {
        self.llm_max_retries
    }

    pub fn llm_retry_delay_ms(&self) -> u64 {
        self.llm_retry_delay_ms
    }

    pub fn llm_timeout_secs(&self) -> u64 {
        self.llm_timeout_secs
    }

    pub fn llm_max_tokens(&self) -> u32 {
        self.llm_max_tokens
    }

    pub fn validation_timeout_secs(&self) -> u64 {
        self.validation_timeout_secs
    }

    pub fn section_start_patterns(&self) -> &[String] {
        &self.section_start_patterns
    }

    pub fn section_extra_context(&self) -> usize {
        self.section_extra_context
    }

    pub fn window_context(&self) -> usize {
        self.window_context
    }

    pub fn max_section_length_difference(&self) -> usize {
        self.max_section_length_difference
    }
}

fn config_file_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("GIT_REPICK_CONFIG") {
        return Some(PathBuf::from(path));
    }
    dirs::config_dir().map(|dir| dir.join("git-repick").join("config.json"))
}

fn load_file_config() -> FileConfig {
    let Some(path) = config_file_path() else {
        return FileConfig::default();
    };
    let Ok(contents) = fs::read_to_string(&path) else {
        return FileConfig::default();
    };
    match serde_json::from_str(&contents) {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!(
                "git-repick: ignoring malformed config file {}: {}",
                path.display(),
                e
            );
            FileConfig::default()
        }
    }
}

/// Section-start patterns for the context extractor. Language-agnostic:
/// function-like, type-like and top-level definitions at low indentation.
fn default_section_start_patterns() -> Vec<String> {
    vec![
        // C-style function definitions: return type and name at column zero,
        // with the parameter list open on the same line.
        r"^[A-Za-z_][A-Za-z0-9_\s\*]*\([^;]*$".to_string(),
        r"^[A-Za-z_][A-Za-z0-9_\s\*]*\([^;]*\)\s*\{?\s*$".to_string(),
        // Struct/enum/union/class-like definitions.
        r"^(typedef\s+)?(struct|enum|union|class)\b".to_string(),
        // Rust/Go/Python-style keyword-introduced definitions.
        r"^(pub\s+)?(fn|impl|trait|mod)\b".to_string(),
        r"^func\b".to_string(),
        r"^(def|class)\b".to_string(),
    ]
}

fn build_config() -> Config {
    let file_config = load_file_config();

    let git_path = env::var("GIT_REPICK_GIT")
        .ok()
        .or(file_config.git_path)
        .unwrap_or_else(|| "git".to_string());
    let patch_path = env::var("GIT_REPICK_PATCH")
        .ok()
        .or(file_config.patch_path)
        .unwrap_or_else(|| "patch".to_string());
    let llm_endpoint = env::var("GIT_REPICK_LLM_ENDPOINT")
        .ok()
        .or(file_config.llm_endpoint);
    let llm_model = env::var("GIT_REPICK_LLM_MODEL")
        .ok()
        .or(file_config.llm_model)
        .unwrap_or_else(|| "us.amazon.nova-pro-v1:0".to_string());
    let llm_region = env::var("GIT_REPICK_LLM_REGION")
        .ok()
        .or(file_config.llm_region)
        .unwrap_or_else(|| "us-west-2".to_string());
    let llm_cache_path = env::var("GIT_REPICK_LLM_CACHE")
        .ok()
        .map(PathBuf::from)
        .or(file_config.llm_cache_path);

    Config {
        git_path,
        patch_path,
        llm_endpoint,
        llm_model,
        llm_region,
        llm_cache_path,
        llm_max_retries: file_config.llm_max_retries.unwrap_or(3),
        llm_retry_delay_ms: file_config.llm_retry_delay_ms.unwrap_or(1000),
        llm_timeout_secs: file_config.llm_timeout_secs.unwrap_or(120),
        llm_max_tokens: file_config.llm_max_tokens.unwrap_or(8192),
        validation_timeout_secs: file_config.validation_timeout_secs.unwrap_or(1800),
        section_start_patterns: file_config
            .section_start_patterns
            .unwrap_or_else(default_section_start_patterns),
        section_extra_context: file_config
            .section_extra_context
            .unwrap_or(DEFAULT_SECTION_EXTRA_CONTEXT),
        window_context: file_config.window_context.unwrap_or(DEFAULT_WINDOW_CONTEXT),
        max_section_length_difference: file_config
            .max_section_length_difference
            .unwrap_or(DEFAULT_MAX_SECTION_LENGTH_DIFFERENCE),
    }
}
