use anyhow::Result;
use log::{info, warn};
use std::sync::Arc;

use story_weaver::core::config::Config;
use story_weaver::core::profile::StoryProfile;
use story_weaver::core::session::{Action, Session};
use story_weaver::services::orchestrator::{ConfigServiceFactory, Orchestrator};
use story_weaver::services::prompt::PromptBook;
use story_weaver::ui;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut config = match Config::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Error loading config: {:#}", e);
            eprintln!("Please fix or remove 'config.yml' and start again.");
            return Err(e);
        }
    };

    let profile = StoryProfile::from_config(&config.story).await?;
    info!("Loaded profile {} with {} characters", profile.name, profile.characters.len());

    let session = Session::new(Arc::new(profile), &config.story, config.llm.requires_credential());
    let prompts = PromptBook::new(&config.prompts);
    let factory = ConfigServiceFactory::new(config.clone());
    let mut orchestrator = Orchestrator::new(session, prompts, Box::new(factory));

    // A credential from an earlier run skips the setup screen
    if let Some(settings) = config.saved_settings() {
        if let Err(e) = orchestrator.dispatch(Action::SubmitSettings(settings)).await {
            warn!("Saved settings were not accepted: {}", e);
        }
    }

    ui::run(&mut orchestrator, &mut config).await
}
