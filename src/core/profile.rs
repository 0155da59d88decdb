use anyhow::{anyhow, Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::core::config::StoryConfig;

const PAW_PATROL: &str = include_str!("../../profiles/paw_patrol.yml");
const MIGROS_WICHTEL: &str = include_str!("../../profiles/migros_wichtel.yml");

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CharacterOption {
    pub name: String,
    #[serde(default)]
    pub emoji: String,
}

/// Franchise data that parameterizes the prompts and the selection screens.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StoryProfile {
    pub name: String,
    pub crew: String,
    pub setting: String,
    #[serde(default)]
    pub world: String,
    #[serde(default = "default_opening_title")]
    pub opening_title: String,
    #[serde(default = "default_thinking")]
    pub thinking: String,
    #[serde(default = "default_theme_count")]
    pub theme_count: usize,
    #[serde(default = "default_max_characters")]
    pub max_characters: usize,
    #[serde(default)]
    pub intro_instructions: String,
    #[serde(default)]
    pub beat_instructions: String,
    /// Main-menu blurb keyed by language name.
    #[serde(default)]
    pub menu_intro: BTreeMap<String, String>,
    pub characters: Vec<CharacterOption>,
}

fn default_opening_title() -> String {
    "The Mission Begins".to_string()
}
fn default_thinking() -> String {
    "Thinking...".to_string()
}
fn default_theme_count() -> usize {
    6
}
fn default_max_characters() -> usize {
    3
}

impl StoryProfile {
    pub fn builtin(name: &str) -> Option<Result<Self>> {
        let source = match name {
            "paw_patrol" => PAW_PATROL,
            "migros_wichtel" => MIGROS_WICHTEL,
            _ => return None,
        };
        Some(Self::parse(source).with_context(|| format!("Invalid built-in profile {}", name)))
    }

    pub fn parse(yaml: &str) -> Result<Self> {
        let profile: StoryProfile =
            serde_yaml_ng::from_str(yaml).context("Failed to parse story profile")?;
        profile.validate()?;
        Ok(profile)
    }

    /// Resolves a built-in name, an http(s) URL, or a local YAML path.
    pub async fn load(source: &str) -> Result<Self> {
        if let Some(profile) = Self::builtin(source) {
            return profile;
        }

        let yaml = match Url::parse(source) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                info!("Fetching story profile from {}", url);
                let resp = reqwest::get(url.clone())
                    .await
                    .with_context(|| format!("Failed to fetch profile from {}", url))?;
                if !resp.status().is_success() {
                    return Err(anyhow!("Profile download failed: HTTP {}", resp.status()));
                }
                resp.text().await?
            }
            _ => tokio::fs::read_to_string(source)
                .await
                .with_context(|| format!("Failed to read profile {}", source))?,
        };

        Self::parse(&yaml)
    }

    pub async fn from_config(story: &StoryConfig) -> Result<Self> {
        let mut profile = Self::load(&story.profile).await?;
        if let Some(count) = story.theme_count {
            profile.theme_count = count;
        }
        if let Some(max) = story.max_characters {
            profile.max_characters = max;
        }
        profile.validate()?;
        Ok(profile)
    }

    fn validate(&self) -> Result<()> {
        if self.characters.is_empty() {
            anyhow::bail!("Profile {} lists no characters", self.name);
        }
        if self.max_characters == 0 {
            anyhow::bail!("Profile {} allows zero characters", self.name);
        }
        if self.theme_count == 0 {
            anyhow::bail!("Profile {} requests zero themes", self.name);
        }
        Ok(())
    }

    pub fn has_character(&self, name: &str) -> bool {
        self.characters.iter().any(|c| c.name == name)
    }
}
