use anyhow::Result;
use inquire::{Confirm, Password, PasswordDisplayMode, Text};
use std::path::Path;

use crate::core::config::{Config, Settings, CONFIG_FILE};

fn provider_label(provider: &str) -> &str {
    match provider {
        "openai" => "OpenAI",
        "gemini" => "Gemini",
        "ollama" => "Ollama",
        other => other,
    }
}

/// Asks for whatever credentials the configured provider and story store still need.
pub fn prompt_settings(config: &Config) -> Result<Settings> {
    let api_key = if config.llm.requires_credential() {
        Password::new(&format!("{} API key:", provider_label(&config.llm.provider)))
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .with_help_message("Stored in config.yml so you only enter it once")
            .prompt()?
    } else {
        String::new()
    };

    let mut settings = Settings {
        api_key: api_key.trim().to_string(),
        ..Settings::default()
    };

    let has_store = config.persistence.supabase_url.is_some() || config.persistence.proxy_url.is_some();
    if !has_store
        && Confirm::new("Save finished stories to a hosted table?")
            .with_default(false)
            .prompt()?
    {
        let url = Text::new("Table API URL:")
            .with_placeholder("https://<project>.supabase.co")
            .prompt()?;
        let anon_key = Password::new("Anon key:")
            .with_display_mode(PasswordDisplayMode::Masked)
            .without_confirmation()
            .prompt()?;
        settings.supabase_url = Some(url.trim().to_string());
        settings.supabase_anon_key = Some(anon_key.trim().to_string());
    }

    Ok(settings)
}

/// Writes accepted settings back so the next start skips setup.
pub fn remember_settings(config: &mut Config, settings: &Settings) -> Result<()> {
    remember_settings_at(config, settings, Path::new(CONFIG_FILE))?;
    println!("Configuration saved.");
    Ok(())
}

fn remember_settings_at(config: &mut Config, settings: &Settings, path: &Path) -> Result<()> {
    config.apply_settings(settings);
    config.save_to(path)
}
