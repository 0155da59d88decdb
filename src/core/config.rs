use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use crate::services::llm::LlmConfig;
use crate::services::persistence::PersistenceConfig;
use crate::services::prompt::TemplateId;

pub const CONFIG_FILE: &str = "config.yml";

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub persistence: PersistenceConfig,

    #[serde(default)]
    pub story: StoryConfig,

    /// Per-template prompt overrides.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub prompts: BTreeMap<TemplateId, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryConfig {
    /// Built-in profile name, YAML path, or http(s) URL.
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_languages")]
    pub languages: Vec<String>,
    pub theme_count: Option<usize>,
    pub max_characters: Option<usize>,
    #[serde(default = "default_modification_tags")]
    pub modification_tags: Vec<String>,
}

impl Default for StoryConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            language: default_language(),
            languages: default_languages(),
            theme_count: None,
            max_characters: None,
            modification_tags: default_modification_tags(),
        }
    }
}

fn default_profile() -> String {
    "paw_patrol".to_string()
}
fn default_language() -> String {
    "English".to_string()
}
fn default_languages() -> Vec<String> {
    vec![
        "English".to_string(),
        "German".to_string(),
        "Slovak".to_string(),
    ]
}
fn default_modification_tags() -> Vec<String> {
    [
        "Make it funnier",
        "Make it shorter",
        "Make it more exciting",
        "Add more dialogue",
        "Add more emojis",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// Credentials gathered on the setup screen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    pub api_key: String,
    pub supabase_url: Option<String>,
    pub supabase_anon_key: Option<String>,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Missing file means first run: defaults, and setup asks for the credential.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: Config = serde_yaml_ng::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(Path::new(CONFIG_FILE))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let content = serde_yaml_ng::to_string(self)?;
        fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Settings already present in the file, if they are enough to skip setup.
    pub fn saved_settings(&self) -> Option<Settings> {
        let api_key = self.llm.credential()?.to_string();
        Some(Settings {
            api_key,
            supabase_url: self.persistence.supabase_url.clone(),
            supabase_anon_key: self.persistence.anon_key.clone(),
        })
    }

    pub fn apply_settings(&mut self, settings: &Settings) {
        self.llm.set_credential(&settings.api_key);
        if settings.supabase_url.is_some() {
            self.persistence.supabase_url = settings.supabase_url.clone();
        }
        if settings.supabase_anon_key.is_some() {
            self.persistence.anon_key = settings.supabase_anon_key.clone();
        }
    }
}
