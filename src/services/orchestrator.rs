use anyhow::Result;
use futures_util::future::try_join_all;
use log::{debug, info, warn};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::core::config::{Config, Settings};
use crate::core::error::{GatewayError, PersistenceError, StoryResult, ValidationError};
use crate::core::session::{Action, Effect, Outcome, Session, Translation};
use crate::core::state::{NarrativeState, Section, StoryBeat, Theme};
use crate::services::llm::{create_gateway, ModelGateway};
use crate::services::persistence::{create_store, StoryStore};
use crate::services::prompt::{PromptBook, PromptContext, TemplateId};
use crate::utils::json::{decode, lenient_list, object_of, required_str};

const OPTION_COUNT: usize = 3;
const ILLUSTRATION_SCENE_CHARS: usize = 1000;

/// Gateways bound to the credentials entered on the setup screen.
#[derive(Clone)]
pub struct Services {
    pub gateway: Arc<dyn ModelGateway>,
    pub store: Option<Arc<dyn StoryStore>>,
}

pub trait ServiceFactory: Send + Sync {
    fn connect(&self, settings: &Settings) -> Result<Services>;
}

/// Builds the configured provider and story store with the submitted credentials applied.
pub struct ConfigServiceFactory {
    config: Config,
}

impl ConfigServiceFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ServiceFactory for ConfigServiceFactory {
    fn connect(&self, settings: &Settings) -> Result<Services> {
        let mut config = self.config.clone();
        config.apply_settings(settings);
        let gateway = create_gateway(&config)?;
        info!("Using {} for story generation", gateway.provider());
        let store = create_store(&config.persistence)?;
        if store.is_none() {
            info!("No story store configured, saving is disabled");
        }
        Ok(Services {
            gateway: Arc::from(gateway),
            store: store.map(Arc::from),
        })
    }
}

#[derive(Deserialize)]
struct SectionPayload {
    title: String,
    content: String,
}

fn section_payload(value: Value) -> Result<SectionPayload, GatewayError> {
    let payload: SectionPayload = decode(value)?;
    if payload.content.trim().is_empty() {
        return Err(GatewayError::missing("content"));
    }
    Ok(payload)
}

fn parse_options(value: &Value) -> Result<Vec<String>, GatewayError> {
    let items = value
        .get("options")
        .and_then(Value::as_array)
        .ok_or_else(|| GatewayError::missing("options"))?;
    let options: Vec<String> = items
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .filter(|o| !o.is_empty())
        .take(OPTION_COUNT)
        .map(str::to_string)
        .collect();
    if options.is_empty() {
        return Err(GatewayError::missing("options"));
    }
    Ok(options)
}

/// Runs a [`Session`] against real gateways: every effect the session asks for is executed
/// and its validated outcome fed back until no work is left.
pub struct Orchestrator {
    session: Session,
    prompts: PromptBook,
    factory: Box<dyn ServiceFactory>,
    services: Option<Services>,
}

impl Orchestrator {
    pub fn new(session: Session, prompts: PromptBook, factory: Box<dyn ServiceFactory>) -> Self {
        Self {
            session,
            prompts,
            factory,
            services: None,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn can_save(&self) -> bool {
        self.services.as_ref().is_some_and(|s| s.store.is_some())
    }

    pub fn can_illustrate(&self) -> bool {
        self.services.is_some()
    }

    pub async fn dispatch(&mut self, action: Action) -> StoryResult<()> {
        let effects = self.session.apply(action).map_err(|e| {
            warn!("Rejected: {}", e);
            e
        })?;

        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            let label = effect.label();
            debug!("Running {}", label);
            match self.execute(effect).await {
                Ok(outcome) => queue.extend(self.session.resolve(outcome)),
                Err(err) => {
                    warn!("{} failed: {}", label, err);
                    self.session.fail(&err);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn execute(&mut self, effect: Effect) -> StoryResult<Outcome> {
        match effect {
            Effect::Connect(settings) => {
                let services = self
                    .factory
                    .connect(&settings)
                    .map_err(|e| ValidationError::InvalidSettings(format!("{:#}", e)))?;
                self.services = Some(services);
                Ok(Outcome::Connected)
            }
            Effect::GenerateThemes => {
                let prompt = self.render(TemplateId::Themes, &self.session.prompt_context())?;
                let value = self.gateway()?.complete(&prompt).await?;
                let themes: Vec<Theme> = lenient_list(&value, "themes");
                let themes = themes
                    .into_iter()
                    .filter(|t| !t.title.trim().is_empty())
                    .collect();
                Ok(Outcome::ThemesGenerated(themes))
            }
            Effect::GenerateIntro => {
                let prompt = self.render(TemplateId::Intro, &self.session.prompt_context())?;
                let value = self.gateway()?.complete(&prompt).await?;
                let intro = required_str(&value, "intro")?;
                if intro.trim().is_empty() {
                    return Err(GatewayError::missing("intro").into());
                }
                Ok(Outcome::IntroGenerated(intro))
            }
            Effect::GenerateOptions => {
                let ctx = self.story_context();
                let prompt = self.render(TemplateId::Options, &ctx)?;
                let value = self.gateway()?.complete(&prompt).await?;
                Ok(Outcome::OptionsGenerated(parse_options(&value)?))
            }
            Effect::GenerateBeat { choice } => {
                let ctx = self.story_context().with_choice(&choice);
                let prompt = self.render(TemplateId::NextBeat, &ctx)?;
                let value = self.gateway()?.complete(&prompt).await?;
                let payload = section_payload(value)?;
                Ok(Outcome::BeatGenerated(StoryBeat::new(payload.title, payload.content)))
            }
            Effect::GenerateOutro { twist } => {
                let id = if twist { TemplateId::OutroTwist } else { TemplateId::Outro };
                let prompt = self.render(id, &self.story_context())?;
                let value = self.gateway()?.complete(&prompt).await?;
                let payload = section_payload(value)?;
                Ok(Outcome::OutroGenerated(StoryBeat::new(payload.title, payload.content)))
            }
            Effect::Translate { language } => {
                let translation = self.translate(&language).await?;
                Ok(Outcome::Translated(Box::new(translation)))
            }
            Effect::RegenerateSection { section, instruction } => {
                let original = self.original_text(section)?;
                let ctx = self
                    .session
                    .prompt_context()
                    .with_story(self.session.revision_context())
                    .with_revision(section.to_string(), &original, instruction);
                let prompt = self.render(TemplateId::RegenerateSection, &ctx)?;
                let value = self.gateway()?.complete(&prompt).await?;
                let payload = section_payload(value)?;
                Ok(Outcome::SectionRegenerated {
                    section,
                    title: payload.title,
                    content: payload.content,
                })
            }
            Effect::Illustrate(section) => {
                let scene: String = self
                    .original_text(section)?
                    .chars()
                    .take(ILLUSTRATION_SCENE_CHARS)
                    .collect();
                let ctx = self.session.prompt_context().with_text(&scene);
                let prompt = self.render(TemplateId::Illustration, &ctx)?;
                let url = self.gateway()?.generate_image(&prompt).await?;
                Ok(Outcome::ImageGenerated { section, url })
            }
            Effect::SaveStory(record) => {
                let stored = self.store()?.append(record).await?;
                Ok(Outcome::StorySaved(stored))
            }
            Effect::ListStories => {
                let records = self.store()?.list_all().await?;
                debug!("Listed {} saved stories", records.len());
                Ok(Outcome::StoriesListed(records))
            }
        }
    }

    /// Theme, then intro, then every beat at once, then the outro. Nothing is committed here;
    /// the session swaps everything in only when this returns `Ok`.
    async fn translate(&self, language: &str) -> StoryResult<Translation> {
        let gateway = self.gateway()?;
        let gateway = gateway.as_ref();
        let ctx = PromptContext::new(self.session.profile(), language);
        info!("Translating story to {}", language);

        let theme = match self.session.theme() {
            Some(theme) => {
                let value = self
                    .translate_object(
                        gateway,
                        &ctx,
                        &[
                            ("title", theme.title.as_str()),
                            ("description", theme.description.as_str()),
                        ],
                    )
                    .await?;
                Some(decode::<Theme>(value)?)
            }
            None => None,
        };

        let narrative = self.session.narrative();
        let intro = if narrative.has_intro() {
            self.translate_text(gateway, &ctx, &narrative.intro).await?
        } else {
            String::new()
        };

        let beats = try_join_all(
            narrative
                .beats
                .iter()
                .map(|beat| self.translate_section(gateway, &ctx, beat)),
        )
        .await?;

        let outro = match self.session.outro() {
            Some(outro) => Some(self.translate_section(gateway, &ctx, outro).await?),
            None => None,
        };

        Ok(Translation {
            language: language.to_string(),
            theme,
            narrative: NarrativeState {
                intro,
                intro_image_url: narrative.intro_image_url.clone(),
                beats,
            },
            outro,
        })
    }

    async fn translate_section(
        &self,
        gateway: &dyn ModelGateway,
        ctx: &PromptContext,
        beat: &StoryBeat,
    ) -> StoryResult<StoryBeat> {
        let value = self
            .translate_object(
                gateway,
                ctx,
                &[("title", beat.title.as_str()), ("content", beat.content.as_str())],
            )
            .await?;
        let payload = section_payload(value)?;
        Ok(StoryBeat {
            title: payload.title,
            content: payload.content,
            image_url: beat.image_url.clone(),
        })
    }

    async fn translate_object(
        &self,
        gateway: &dyn ModelGateway,
        ctx: &PromptContext,
        pairs: &[(&str, &str)],
    ) -> StoryResult<Value> {
        let keys: Vec<&str> = pairs.iter().map(|(key, _)| *key).collect();
        let json = object_of(pairs).to_string();
        let prompt = self.render(TemplateId::TranslateObject, &ctx.clone().with_json(&keys, json))?;
        Ok(gateway.complete(&prompt).await?)
    }

    async fn translate_text(
        &self,
        gateway: &dyn ModelGateway,
        ctx: &PromptContext,
        text: &str,
    ) -> StoryResult<String> {
        let prompt = self.render(TemplateId::TranslateText, &ctx.clone().with_text(text))?;
        let value = gateway.complete(&prompt).await?;
        Ok(required_str(&value, "translation")?)
    }

    fn story_context(&self) -> PromptContext {
        self.session
            .prompt_context()
            .with_story(self.session.narrative().story_context())
    }

    fn original_text(&self, section: Section) -> Result<String, ValidationError> {
        self.session
            .section_text(section)
            .map(str::to_string)
            .ok_or_else(|| ValidationError::NoSuchSection(section.to_string()))
    }

    fn render(&self, id: TemplateId, ctx: &PromptContext) -> Result<String, ValidationError> {
        let prompt = self.prompts.render(id, ctx)?;
        debug!("Prompt {} ({} chars)", id, prompt.len());
        Ok(prompt)
    }

    fn gateway(&self) -> Result<Arc<dyn ModelGateway>, ValidationError> {
        self.services
            .as_ref()
            .map(|s| s.gateway.clone())
            .ok_or(ValidationError::MissingCredential)
    }

    fn store(&self) -> Result<Arc<dyn StoryStore>, PersistenceError> {
        self.services
            .as_ref()
            .and_then(|s| s.store.clone())
            .ok_or(PersistenceError::NotConfigured(
                "set a table API URL and anon key, or a proxy URL",
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StoryConfig;
    use crate::core::error::StoryError;
    use crate::core::profile::StoryProfile;
    use crate::core::session::Phase;
    use crate::services::persistence::{NewStoryRecord, RecordId, StoredRecord};
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;
    use std::fmt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    type Reply = Box<dyn Fn(&str) -> Result<Value, GatewayError> + Send + Sync>;

    struct ScriptedGateway {
        prompts: Mutex<Vec<String>>,
        reply: Reply,
    }

    impl fmt::Debug for ScriptedGateway {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("ScriptedGateway").finish()
        }
    }

    impl ScriptedGateway {
        fn calls(&self) -> usize {
            self.prompts.lock().unwrap().len()
        }

        fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl ModelGateway for ScriptedGateway {
        async fn complete(&self, prompt: &str) -> Result<Value, GatewayError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            (self.reply)(prompt)
        }

        async fn generate_image(&self, prompt: &str) -> Result<String, GatewayError> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok("https://img.example/scene.png".to_string())
        }

        fn provider(&self) -> &'static str {
            "scripted"
        }
    }

    #[derive(Debug, Default)]
    struct MemoryStore {
        records: Mutex<Vec<StoredRecord>>,
        failing_lists: AtomicUsize,
        failing_appends: AtomicUsize,
    }

    #[async_trait]
    impl StoryStore for MemoryStore {
        async fn append(&self, record: NewStoryRecord) -> Result<StoredRecord, PersistenceError> {
            let failing = self.failing_appends.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_appends.store(failing - 1, Ordering::SeqCst);
                return Err(PersistenceError::Upstream {
                    status: 500,
                    message: "insert failed".to_string(),
                });
            }
            let mut records = self.records.lock().unwrap();
            let stored = StoredRecord {
                id: RecordId::Int(records.len() as i64 + 1),
                created_at: Utc::now(),
                title: record.title,
                description: record.description,
                text: record.text,
            };
            records.push(stored.clone());
            Ok(stored)
        }

        async fn list_all(&self) -> Result<Vec<StoredRecord>, PersistenceError> {
            let failing = self.failing_lists.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_lists.store(failing - 1, Ordering::SeqCst);
                return Err(PersistenceError::Upstream {
                    status: 503,
                    message: "Service Unavailable".to_string(),
                });
            }
            Ok(self.records.lock().unwrap().clone())
        }
    }

    struct MockFactory {
        gateway: Arc<ScriptedGateway>,
        store: Arc<MemoryStore>,
    }

    impl ServiceFactory for MockFactory {
        fn connect(&self, _settings: &Settings) -> Result<Services> {
            Ok(Services {
                gateway: self.gateway.clone(),
                store: Some(self.store.clone()),
            })
        }
    }

    /// Answers each template with canned JSON. Beat n is "Bn"/"bn" except the first.
    fn story_reply() -> impl Fn(&str) -> Result<Value, GatewayError> + Send + Sync {
        let beats = AtomicUsize::new(0);
        move |prompt: &str| {
            let reply = if prompt.contains("Revise one part") {
                json!({"title": "Right Path", "content": "They went right."})
            } else if prompt.contains("story themes") {
                json!({"themes": [
                    {"title": "T1", "description": "D1"},
                    {"title": "No description"}
                ]})
            } else if prompt.contains("Write the intro") {
                json!({"intro": "Once upon a time"})
            } else if prompt.contains("next-move options") {
                json!({"options": ["Go left", "Go right", "Wait", "Sleep"]})
            } else if prompt.contains("The user chose") {
                let n = beats.fetch_add(1, Ordering::SeqCst) + 1;
                if n == 1 {
                    json!({"title": "Left Path", "content": "They went left."})
                } else {
                    json!({"title": format!("B{}", n), "content": format!("b{}", n)})
                }
            } else if prompt.contains("final twist") {
                json!({"title": "Twist", "content": "A surprise!"})
            } else if prompt.contains("warm, cozy conclusion") {
                json!({"title": "Home", "content": "And they slept well."})
            } else {
                return Err(GatewayError::Empty);
            };
            Ok(reply)
        }
    }

    /// Translator replies on top of [`story_reply`]; any object containing `fail_on` errors.
    fn translating_reply(fail_on: Option<&'static str>) -> impl Fn(&str) -> Result<Value, GatewayError> + Send + Sync {
        let story = story_reply();
        move |prompt: &str| {
            if !prompt.contains("professional translator") {
                return story(prompt);
            }
            if let Some(marker) = fail_on {
                if prompt.contains(marker) {
                    return Err(GatewayError::Upstream {
                        provider: "scripted",
                        status: 500,
                        message: "The server is overloaded".to_string(),
                    });
                }
            }
            if prompt.contains("\"translation\"") {
                Ok(json!({"translation": "Es war einmal"}))
            } else if prompt.contains("\"description\"") {
                Ok(json!({"title": "Thema", "description": "Beschreibung"}))
            } else {
                Ok(json!({"title": "Titel", "content": "Inhalt"}))
            }
        }
    }

    fn orchestrator<F>(reply: F) -> (Orchestrator, Arc<ScriptedGateway>, Arc<MemoryStore>)
    where
        F: Fn(&str) -> Result<Value, GatewayError> + Send + Sync + 'static,
    {
        let gateway = Arc::new(ScriptedGateway {
            prompts: Mutex::new(Vec::new()),
            reply: Box::new(reply),
        });
        let store = Arc::new(MemoryStore::default());
        let profile = StoryProfile::builtin("paw_patrol").unwrap().unwrap();
        let session = Session::new(Arc::new(profile), &StoryConfig::default(), true);
        let factory = MockFactory {
            gateway: gateway.clone(),
            store: store.clone(),
        };
        let orch = Orchestrator::new(session, PromptBook::default(), Box::new(factory));
        (orch, gateway, store)
    }

    fn settings(key: &str) -> Settings {
        Settings {
            api_key: key.to_string(),
            ..Settings::default()
        }
    }

    /// Drives a fresh orchestrator up to the first set of options.
    async fn start_story(orch: &mut Orchestrator) {
        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();
        orch.dispatch(Action::NewStory).await.unwrap();
        orch.dispatch(Action::SelectTheme(0)).await.unwrap();
        orch.dispatch(Action::ToggleCharacter("Chase".to_string())).await.unwrap();
        orch.dispatch(Action::ConfirmCharacters).await.unwrap();
    }

    async fn finish_story(orch: &mut Orchestrator) {
        start_story(orch).await;
        orch.dispatch(Action::ChooseOption(0)).await.unwrap();
        orch.dispatch(Action::WrapUp).await.unwrap();
        orch.dispatch(Action::FinishStory { twist: false }).await.unwrap();
    }

    #[tokio::test]
    async fn test_full_story_flow() {
        let (mut orch, gateway, _store) = orchestrator(story_reply());

        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::MainMenu);

        orch.dispatch(Action::NewStory).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::ThemeSelection);
        assert_eq!(
            orch.session().theme_candidates(),
            &[Theme {
                title: "T1".to_string(),
                description: "D1".to_string()
            }]
        );

        orch.dispatch(Action::SelectTheme(0)).await.unwrap();
        orch.dispatch(Action::ToggleCharacter("Chase".to_string())).await.unwrap();
        orch.dispatch(Action::ConfirmCharacters).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::StoryWriting);
        assert_eq!(orch.session().narrative().intro, "Once upon a time");
        assert_eq!(orch.session().options(), &["Go left", "Go right", "Wait"]);

        orch.dispatch(Action::ChooseOption(0)).await.unwrap();
        let prompts = gateway.prompts.lock().unwrap().clone();
        let beat_prompt = &prompts[prompts.len() - 2];
        assert!(beat_prompt.contains("The user chose: \"Go left\""));
        assert!(beat_prompt.contains("**Story so far:**\nOnce upon a time"));
        assert!(gateway.last_prompt().contains("Once upon a time\n\nThey went left."));

        orch.dispatch(Action::WrapUp).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::OutroDecision);
        orch.dispatch(Action::FinishStory { twist: false }).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::OutroResult);

        assert_eq!(
            orch.session().full_text(),
            "Part 1: The Mission Begins\nOnce upon a time\n\n\
             Part 2: Left Path\nThey went left.\n\n\
             The End: Home\nAnd they slept well."
        );
    }

    #[tokio::test]
    async fn test_twist_uses_its_own_template() {
        let (mut orch, gateway, _store) = orchestrator(story_reply());
        start_story(&mut orch).await;
        orch.dispatch(Action::WrapUp).await.unwrap();
        orch.dispatch(Action::FinishStory { twist: true }).await.unwrap();
        assert!(gateway.last_prompt().contains("final twist"));
        assert_eq!(orch.session().outro().map(|o| o.title.as_str()), Some("Twist"));
    }

    #[tokio::test]
    async fn test_missing_credential_never_connects() {
        let (mut orch, gateway, _store) = orchestrator(story_reply());
        let err = orch
            .dispatch(Action::SubmitSettings(settings("")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::Validation(ValidationError::MissingCredential)));
        assert_eq!(orch.session().phase(), Phase::Setup);
        assert!(!orch.can_save());
        assert_eq!(gateway.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_themes_show_no_candidates() {
        let (mut orch, _gateway, _store) = orchestrator(|_: &str| Ok(json!({"themes": "none"})));
        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();
        orch.dispatch(Action::NewStory).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::ThemeSelection);
        assert!(orch.session().theme_candidates().is_empty());
        assert!(orch.session().last_error().is_none());
    }

    #[tokio::test]
    async fn test_theme_gateway_failure_is_surfaced() {
        let (mut orch, _gateway, _store) =
            orchestrator(|_: &str| Err(GatewayError::InvalidJson("Sorry, I can't".to_string())));
        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();
        let err = orch.dispatch(Action::NewStory).await.unwrap_err();
        assert!(matches!(err, StoryError::Gateway(GatewayError::InvalidJson(_))));
        assert_eq!(orch.session().phase(), Phase::ThemeSelection);
        assert!(!orch.session().is_busy());
        assert!(orch.session().last_error().is_some());

        // the user can ask again
        assert!(orch.dispatch(Action::RefreshThemes).await.is_err());
    }

    #[tokio::test]
    async fn test_intro_shape_error_keeps_phase() {
        let attempts = AtomicUsize::new(0);
        let story = story_reply();
        let (mut orch, _gateway, _store) = orchestrator(move |prompt: &str| {
            if prompt.contains("Write the intro") && attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                return Ok(json!({"story": "Once upon a time"}));
            }
            story(prompt)
        });

        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();
        orch.dispatch(Action::NewStory).await.unwrap();
        orch.dispatch(Action::SelectTheme(0)).await.unwrap();
        orch.dispatch(Action::ToggleCharacter("Chase".to_string())).await.unwrap();
        let err = orch.dispatch(Action::ConfirmCharacters).await.unwrap_err();
        assert!(matches!(err, StoryError::Gateway(GatewayError::Shape(_))));
        assert_eq!(orch.session().phase(), Phase::IntroGeneration);
        assert!(!orch.session().narrative().has_intro());

        orch.dispatch(Action::RetryIntro).await.unwrap();
        assert_eq!(orch.session().phase(), Phase::StoryWriting);
        assert_eq!(orch.session().options().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_save_can_be_retried() {
        let (mut orch, _gateway, store) = orchestrator(story_reply());
        finish_story(&mut orch).await;
        store.failing_appends.store(1, Ordering::SeqCst);

        let err = orch.dispatch(Action::Save).await.unwrap_err();
        assert!(matches!(err, StoryError::Persistence(PersistenceError::Upstream { status: 500, .. })));
        assert!(!orch.session().is_saved());
        assert!(!orch.session().is_busy());
        assert_eq!(orch.session().last_error(), Some("story store error (500): insert failed"));
        assert_eq!(orch.session().phase(), Phase::OutroResult);

        orch.dispatch(Action::Save).await.unwrap();
        assert!(orch.session().is_saved());
        assert!(orch.session().last_error().is_none());
        assert_eq!(store.records.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_twice_persists_once() {
        let (mut orch, _gateway, store) = orchestrator(story_reply());
        finish_story(&mut orch).await;

        orch.dispatch(Action::Save).await.unwrap();
        orch.dispatch(Action::Save).await.unwrap();

        let records = store.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].title, "T1");
        assert_eq!(records[0].description, "D1");
        assert!(records[0].text.starts_with("Part 1: The Mission Begins\nOnce upon a time"));
        assert!(orch.session().is_saved());
    }

    #[tokio::test]
    async fn test_listing_twice_returns_same_set() {
        let (mut orch, _gateway, store) = orchestrator(story_reply());
        finish_story(&mut orch).await;
        orch.dispatch(Action::Save).await.unwrap();
        orch.dispatch(Action::Restart).await.unwrap();

        orch.dispatch(Action::OpenSavedStories).await.unwrap();
        let first: Vec<RecordId> = orch
            .session()
            .saved_stories()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        orch.dispatch(Action::RetryListing).await.unwrap();
        let second: Vec<RecordId> = orch
            .session()
            .saved_stories()
            .unwrap()
            .iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(first, second);
        assert_eq!(first.len(), store.records.lock().unwrap().len());
    }

    #[tokio::test]
    async fn test_failed_listing_can_be_retried() {
        let (mut orch, _gateway, store) = orchestrator(story_reply());
        store.failing_lists.store(1, Ordering::SeqCst);
        orch.dispatch(Action::SubmitSettings(settings("k"))).await.unwrap();

        let err = orch.dispatch(Action::OpenSavedStories).await.unwrap_err();
        assert!(matches!(err, StoryError::Persistence(PersistenceError::Upstream { status: 503, .. })));
        assert_eq!(orch.session().phase(), Phase::SavedStories);
        assert!(orch.session().saved_stories().is_none());

        orch.dispatch(Action::RetryListing).await.unwrap();
        assert_eq!(orch.session().saved_stories().map(|s| s.len()), Some(0));
    }

    #[tokio::test]
    async fn test_translation_failure_changes_nothing() {
        let (mut orch, _gateway, _store) = orchestrator(translating_reply(Some("\"B2\"")));
        start_story(&mut orch).await;
        orch.dispatch(Action::ChooseOption(0)).await.unwrap();
        orch.dispatch(Action::ChooseOption(1)).await.unwrap();
        let before = orch.session().narrative().clone();
        let options_before = orch.session().options().to_vec();
        assert_eq!(before.beats.len(), 2);

        orch.dispatch(Action::RequestLanguage("German".to_string())).await.unwrap();
        let err = orch.dispatch(Action::ConfirmLanguage).await.unwrap_err();
        assert!(err.to_string().contains("The server is overloaded"));

        let session = orch.session();
        assert_eq!(session.language(), "English");
        assert_eq!(session.narrative(), &before);
        assert_eq!(session.theme().map(|t| t.title.as_str()), Some("T1"));
        assert_eq!(session.options(), options_before.as_slice());
        assert!(!session.is_busy());
        assert!(session.pending_language().is_none());
    }

    #[tokio::test]
    async fn test_translation_commits_everything_and_refreshes_options() {
        let (mut orch, gateway, _store) = orchestrator(translating_reply(None));
        start_story(&mut orch).await;
        orch.dispatch(Action::ChooseOption(0)).await.unwrap();
        orch.dispatch(Action::ChooseOption(2)).await.unwrap();
        orch.dispatch(Action::Illustrate(Section::Beat(0))).await.unwrap();

        orch.dispatch(Action::RequestLanguage("German".to_string())).await.unwrap();
        orch.dispatch(Action::ConfirmLanguage).await.unwrap();

        let session = orch.session();
        assert_eq!(session.language(), "German");
        assert_eq!(
            session.theme(),
            Some(&Theme {
                title: "Thema".to_string(),
                description: "Beschreibung".to_string()
            })
        );
        assert_eq!(session.narrative().intro, "Es war einmal");
        assert_eq!(session.narrative().beats.len(), 2);
        assert!(session.narrative().beats.iter().all(|b| b.title == "Titel" && b.content == "Inhalt"));
        assert_eq!(
            session.narrative().beats[0].image_url.as_deref(),
            Some("https://img.example/scene.png")
        );
        assert!(gateway.last_prompt().contains("The response should be in German."));
        assert_eq!(session.options().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_modification_makes_no_call() {
        let (mut orch, gateway, _store) = orchestrator(story_reply());
        start_story(&mut orch).await;
        let calls = gateway.calls();

        let err = orch
            .dispatch(Action::Regenerate {
                section: Section::Intro,
                tags: Vec::new(),
                note: "   ".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoryError::Validation(ValidationError::EmptyModification)));
        assert_eq!(gateway.calls(), calls);
    }

    #[tokio::test]
    async fn test_regenerate_beat_in_place() {
        let (mut orch, gateway, _store) = orchestrator(story_reply());
        start_story(&mut orch).await;
        orch.dispatch(Action::ChooseOption(0)).await.unwrap();
        orch.dispatch(Action::ChooseOption(0)).await.unwrap();

        orch.dispatch(Action::Regenerate {
            section: Section::Beat(0),
            tags: vec!["Make it shorter".to_string()],
            note: "Go right instead".to_string(),
        })
        .await
        .unwrap();

        let prompt = gateway.last_prompt();
        assert!(prompt.contains("**Part to revise (Part 2):**\nThey went left."));
        assert!(prompt.contains("**Requested changes:** Make it shorter. Go right instead"));

        let beats = &orch.session().narrative().beats;
        assert_eq!(beats.len(), 2);
        assert_eq!(beats[0], StoryBeat::new("Right Path", "They went right."));
        assert_eq!(beats[1].title, "B2");
    }

    #[test]
    fn test_parse_options_truncates_and_requires_key() {
        let options = parse_options(&json!({"options": ["a", " ", "b", "c", "d"]})).unwrap();
        assert_eq!(options, ["a", "b", "c"]);
        assert!(parse_options(&json!({"choices": ["a"]})).is_err());
        assert!(parse_options(&json!({"options": []})).is_err());
    }
}
