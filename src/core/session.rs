//! The story session as an explicit state machine.
//!
//! [`Session::apply`] validates a user [`Action`] against the current phase and returns the
//! [`Effect`]s (network work) it needs. Whoever runs those effects reports back with
//! [`Session::resolve`] on success or [`Session::fail`] on error. Nothing in here performs I/O.

use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;

use crate::core::config::{Settings, StoryConfig};
use crate::core::error::{StoryError, ValidationError};
use crate::core::profile::StoryProfile;
use crate::core::state::{
    render_full_text, CharacterSelection, NarrativeState, Outro, Section, StoryBeat, Theme,
};
use crate::services::persistence::{sort_newest_first, NewStoryRecord, StoredRecord};
use crate::services::prompt::PromptContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Setup,
    MainMenu,
    ThemeSelection,
    CharacterSelection,
    IntroGeneration,
    StoryWriting,
    OutroDecision,
    OutroResult,
    SavedStories,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Setup => "setup",
            Phase::MainMenu => "main menu",
            Phase::ThemeSelection => "theme selection",
            Phase::CharacterSelection => "character selection",
            Phase::IntroGeneration => "intro generation",
            Phase::StoryWriting => "story writing",
            Phase::OutroDecision => "outro decision",
            Phase::OutroResult => "outro result",
            Phase::SavedStories => "saved stories",
        };
        f.write_str(name)
    }
}

/// Something the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    SubmitSettings(Settings),
    NewStory,
    RefreshThemes,
    SelectTheme(usize),
    ToggleCharacter(String),
    ConfirmCharacters,
    RetryIntro,
    RefreshOptions,
    ChooseOption(usize),
    WrapUp,
    FinishStory { twist: bool },
    Save,
    Restart,
    OpenSavedStories,
    RetryListing,
    ViewStory(usize),
    CloseStory,
    BackToMenu,
    RequestLanguage(String),
    ConfirmLanguage,
    CancelLanguage,
    Regenerate {
        section: Section,
        tags: Vec<String>,
        note: String,
    },
    Illustrate(Section),
}

/// Network work the session needs done. Each one answers with exactly one [`Outcome`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    Connect(Settings),
    GenerateThemes,
    GenerateIntro,
    GenerateOptions,
    GenerateBeat { choice: String },
    GenerateOutro { twist: bool },
    Translate { language: String },
    RegenerateSection { section: Section, instruction: String },
    Illustrate(Section),
    SaveStory(NewStoryRecord),
    ListStories,
}

impl Effect {
    /// Short label for logs and spinners.
    pub fn label(&self) -> &'static str {
        match self {
            Effect::Connect(_) => "connect",
            Effect::GenerateThemes => "themes",
            Effect::GenerateIntro => "intro",
            Effect::GenerateOptions => "options",
            Effect::GenerateBeat { .. } => "next part",
            Effect::GenerateOutro { .. } => "ending",
            Effect::Translate { .. } => "translation",
            Effect::RegenerateSection { .. } => "revision",
            Effect::Illustrate(_) => "illustration",
            Effect::SaveStory(_) => "save",
            Effect::ListStories => "saved stories",
        }
    }
}

/// Everything a successful translation replaces in one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub language: String,
    pub theme: Option<Theme>,
    pub narrative: NarrativeState,
    pub outro: Option<Outro>,
}

/// Validated result of an [`Effect`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Connected,
    ThemesGenerated(Vec<Theme>),
    IntroGenerated(String),
    OptionsGenerated(Vec<String>),
    BeatGenerated(StoryBeat),
    OutroGenerated(Outro),
    Translated(Box<Translation>),
    SectionRegenerated {
        section: Section,
        title: String,
        content: String,
    },
    ImageGenerated {
        section: Section,
        url: String,
    },
    StorySaved(StoredRecord),
    StoriesListed(Vec<StoredRecord>),
}

#[derive(Debug)]
pub struct Session {
    phase: Phase,
    profile: Arc<StoryProfile>,
    credential_required: bool,
    language: String,
    languages: Vec<String>,
    modification_tags: Vec<String>,
    theme_candidates: Vec<Theme>,
    theme: Option<Theme>,
    selection: CharacterSelection,
    narrative: NarrativeState,
    options: Vec<String>,
    outro: Option<Outro>,
    saved: Option<StoredRecord>,
    saved_stories: Option<Vec<StoredRecord>>,
    viewing: Option<usize>,
    pending_language: Option<String>,
    busy: bool,
    last_error: Option<String>,
}

impl Session {
    pub fn new(profile: Arc<StoryProfile>, story: &StoryConfig, credential_required: bool) -> Self {
        let selection = CharacterSelection::new(profile.max_characters);
        Self {
            phase: Phase::Setup,
            profile,
            credential_required,
            language: story.language.clone(),
            languages: story.languages.clone(),
            modification_tags: story.modification_tags.clone(),
            theme_candidates: Vec::new(),
            theme: None,
            selection,
            narrative: NarrativeState::default(),
            options: Vec::new(),
            outro: None,
            saved: None,
            saved_stories: None,
            viewing: None,
            pending_language: None,
            busy: false,
            last_error: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn profile(&self) -> &StoryProfile {
        &self.profile
    }

    pub fn language(&self) -> &str {
        &self.language
    }

    pub fn languages(&self) -> &[String] {
        &self.languages
    }

    pub fn modification_tags(&self) -> &[String] {
        &self.modification_tags
    }

    pub fn theme_candidates(&self) -> &[Theme] {
        &self.theme_candidates
    }

    pub fn theme(&self) -> Option<&Theme> {
        self.theme.as_ref()
    }

    pub fn selection(&self) -> &CharacterSelection {
        &self.selection
    }

    pub fn narrative(&self) -> &NarrativeState {
        &self.narrative
    }

    pub fn options(&self) -> &[String] {
        &self.options
    }

    pub fn outro(&self) -> Option<&Outro> {
        self.outro.as_ref()
    }

    pub fn is_saved(&self) -> bool {
        self.saved.is_some()
    }

    /// `None` until a listing succeeded.
    pub fn saved_stories(&self) -> Option<&[StoredRecord]> {
        self.saved_stories.as_deref()
    }

    pub fn viewed_story(&self) -> Option<&StoredRecord> {
        let index = self.viewing?;
        self.saved_stories.as_ref()?.get(index)
    }

    pub fn pending_language(&self) -> Option<&str> {
        self.pending_language.as_deref()
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn full_text(&self) -> String {
        render_full_text(&self.profile.opening_title, &self.narrative, self.outro.as_ref())
    }

    /// Prompt context carrying everything the current story has bound so far.
    pub fn prompt_context(&self) -> PromptContext {
        let mut ctx = PromptContext::new(&self.profile, &self.language)
            .with_characters(self.selection.names());
        if let Some(theme) = &self.theme {
            ctx = ctx.with_theme(theme);
        }
        ctx
    }

    /// Story context including the outro, used when revising a single section.
    pub fn revision_context(&self) -> String {
        let mut context = self.narrative.story_context();
        if let Some(outro) = &self.outro {
            context.push_str("\n\n");
            context.push_str(&outro.content);
        }
        context
    }

    pub fn section_text(&self, section: Section) -> Option<&str> {
        self.narrative.section_text(section, self.outro.as_ref())
    }

    pub fn apply(&mut self, action: Action) -> Result<Vec<Effect>, ValidationError> {
        if self.busy {
            return Err(ValidationError::Busy);
        }

        let effects = match action {
            Action::SubmitSettings(settings) => {
                self.expect_phase("submit settings", &[Phase::Setup])?;
                if self.credential_required && settings.api_key.trim().is_empty() {
                    return Err(ValidationError::MissingCredential);
                }
                vec![Effect::Connect(settings)]
            }
            Action::NewStory => {
                self.expect_phase("new story", &[Phase::MainMenu])?;
                self.reset_story();
                self.enter(Phase::ThemeSelection);
                vec![Effect::GenerateThemes]
            }
            Action::RefreshThemes => {
                self.expect_phase("show other themes", &[Phase::ThemeSelection])?;
                self.theme_candidates.clear();
                vec![Effect::GenerateThemes]
            }
            Action::SelectTheme(index) => {
                self.expect_phase("select theme", &[Phase::ThemeSelection])?;
                let theme = self
                    .theme_candidates
                    .get(index)
                    .cloned()
                    .ok_or(ValidationError::NoSuchTheme(index))?;
                info!("Theme selected: {}", theme.title);
                self.theme = Some(theme);
                self.selection = CharacterSelection::new(self.profile.max_characters);
                self.enter(Phase::CharacterSelection);
                Vec::new()
            }
            Action::ToggleCharacter(name) => {
                self.expect_phase("toggle character", &[Phase::CharacterSelection])?;
                if !self.profile.has_character(&name) {
                    return Err(ValidationError::UnknownCharacter(name));
                }
                if !self.selection.toggle(&name) {
                    debug!("{} not added, selection is at its cap of {}", name, self.selection.max());
                }
                Vec::new()
            }
            Action::ConfirmCharacters => {
                self.expect_phase("confirm characters", &[Phase::CharacterSelection])?;
                if self.selection.is_empty() {
                    return Err(ValidationError::EmptySelection);
                }
                self.narrative = NarrativeState::default();
                self.enter(Phase::IntroGeneration);
                vec![Effect::GenerateIntro]
            }
            Action::RetryIntro => {
                self.expect_phase("retry intro", &[Phase::IntroGeneration])?;
                vec![Effect::GenerateIntro]
            }
            Action::RefreshOptions => {
                self.expect_phase("refresh options", &[Phase::StoryWriting])?;
                self.options.clear();
                vec![Effect::GenerateOptions]
            }
            Action::ChooseOption(index) => {
                self.expect_phase("choose option", &[Phase::StoryWriting])?;
                let choice = self
                    .options
                    .get(index)
                    .cloned()
                    .ok_or(ValidationError::NoSuchOption(index))?;
                self.options.clear();
                vec![Effect::GenerateBeat { choice }]
            }
            Action::WrapUp => {
                self.expect_phase("wrap it up", &[Phase::StoryWriting])?;
                self.options.clear();
                self.enter(Phase::OutroDecision);
                Vec::new()
            }
            Action::FinishStory { twist } => {
                self.expect_phase("finish story", &[Phase::OutroDecision])?;
                vec![Effect::GenerateOutro { twist }]
            }
            Action::Save => {
                self.expect_phase("save", &[Phase::OutroResult])?;
                if self.saved.is_some() {
                    debug!("Story already saved, ignoring");
                    return Ok(Vec::new());
                }
                let (title, description) = self
                    .theme
                    .as_ref()
                    .map(|t| (t.title.clone(), t.description.clone()))
                    .unwrap_or_default();
                vec![Effect::SaveStory(NewStoryRecord {
                    title,
                    description,
                    text: self.full_text(),
                })]
            }
            Action::Restart => {
                self.expect_phase(
                    "restart",
                    &[
                        Phase::ThemeSelection,
                        Phase::CharacterSelection,
                        Phase::IntroGeneration,
                        Phase::StoryWriting,
                        Phase::OutroDecision,
                        Phase::OutroResult,
                    ],
                )?;
                self.reset_story();
                self.enter(Phase::MainMenu);
                Vec::new()
            }
            Action::OpenSavedStories => {
                self.expect_phase("open saved stories", &[Phase::MainMenu])?;
                self.saved_stories = None;
                self.viewing = None;
                self.enter(Phase::SavedStories);
                vec![Effect::ListStories]
            }
            Action::RetryListing => {
                self.expect_phase("retry listing", &[Phase::SavedStories])?;
                vec![Effect::ListStories]
            }
            Action::ViewStory(index) => {
                self.expect_phase("view story", &[Phase::SavedStories])?;
                let count = self.saved_stories.as_ref().map_or(0, Vec::len);
                if index >= count {
                    return Err(ValidationError::NoSuchStory(index));
                }
                self.viewing = Some(index);
                Vec::new()
            }
            Action::CloseStory => {
                self.expect_phase("close story", &[Phase::SavedStories])?;
                self.viewing = None;
                Vec::new()
            }
            Action::BackToMenu => {
                self.expect_phase("back", &[Phase::SavedStories])?;
                self.viewing = None;
                self.enter(Phase::MainMenu);
                Vec::new()
            }
            Action::RequestLanguage(language) => {
                if self.phase == Phase::Setup {
                    return Err(self.wrong_phase("change language"));
                }
                if !self.languages.contains(&language) {
                    return Err(ValidationError::UnknownLanguage(language));
                }
                if language == self.language {
                    return Err(ValidationError::SameLanguage(language));
                }
                self.pending_language = Some(language);
                Vec::new()
            }
            Action::ConfirmLanguage => {
                let language = self
                    .pending_language
                    .take()
                    .ok_or(ValidationError::NothingToConfirm)?;
                vec![Effect::Translate { language }]
            }
            Action::CancelLanguage => {
                self.pending_language = None;
                Vec::new()
            }
            Action::Regenerate { section, tags, note } => {
                self.expect_section_phase("regenerate section", section)?;
                let instruction = modification_instruction(&tags, &note)?;
                if self.section_text(section).is_none() {
                    return Err(ValidationError::NoSuchSection(section.to_string()));
                }
                vec![Effect::RegenerateSection { section, instruction }]
            }
            Action::Illustrate(section) => {
                self.expect_section_phase("illustrate section", section)?;
                if self.section_text(section).is_none() {
                    return Err(ValidationError::NoSuchSection(section.to_string()));
                }
                vec![Effect::Illustrate(section)]
            }
        };

        self.last_error = None;
        self.busy = !effects.is_empty();
        Ok(effects)
    }

    /// Commits the result of an effect and returns any follow-up work.
    pub fn resolve(&mut self, outcome: Outcome) -> Vec<Effect> {
        let effects = match outcome {
            Outcome::Connected => {
                self.reset_story();
                self.enter(Phase::MainMenu);
                Vec::new()
            }
            Outcome::ThemesGenerated(mut themes) => {
                themes.truncate(self.profile.theme_count);
                debug!("{} theme candidates", themes.len());
                self.theme_candidates = themes;
                Vec::new()
            }
            Outcome::IntroGenerated(intro) => {
                self.narrative.intro = intro;
                self.enter(Phase::StoryWriting);
                vec![Effect::GenerateOptions]
            }
            Outcome::OptionsGenerated(options) => {
                self.options = options;
                Vec::new()
            }
            Outcome::BeatGenerated(beat) => {
                info!("Part {} written: {}", self.narrative.beats.len() + 2, beat.title);
                self.narrative.append_beat(beat);
                vec![Effect::GenerateOptions]
            }
            Outcome::OutroGenerated(outro) => {
                self.outro = Some(outro);
                self.saved = None;
                self.enter(Phase::OutroResult);
                Vec::new()
            }
            Outcome::Translated(translation) => self.commit_translation(*translation),
            Outcome::SectionRegenerated { section, title, content } => {
                if let Err(err) = self.narrative.replace_section(section, title, content, &mut self.outro) {
                    warn!("Revised section was dropped: {}", err);
                    self.last_error = Some(err.to_string());
                }
                Vec::new()
            }
            Outcome::ImageGenerated { section, url } => {
                if let Err(err) = self.narrative.set_image(section, url, &mut self.outro) {
                    warn!("Illustration was dropped: {}", err);
                    self.last_error = Some(err.to_string());
                }
                Vec::new()
            }
            Outcome::StorySaved(record) => {
                info!("Story saved with id {}", record.id);
                self.saved = Some(record);
                Vec::new()
            }
            Outcome::StoriesListed(mut records) => {
                sort_newest_first(&mut records);
                self.saved_stories = Some(records);
                self.viewing = None;
                Vec::new()
            }
        };

        self.busy = !effects.is_empty();
        effects
    }

    /// Records a failed effect. The phase and story stay as they were.
    pub fn fail(&mut self, err: &StoryError) {
        self.busy = false;
        self.last_error = Some(err.to_string());
    }

    fn commit_translation(&mut self, translation: Translation) -> Vec<Effect> {
        info!("Story switched to {}", translation.language);
        self.language = translation.language;
        if translation.theme.is_some() {
            self.theme = translation.theme;
        }
        self.narrative = translation.narrative;
        self.outro = translation.outro;

        match self.phase {
            Phase::ThemeSelection => {
                self.theme_candidates.clear();
                vec![Effect::GenerateThemes]
            }
            Phase::StoryWriting => {
                self.options.clear();
                vec![Effect::GenerateOptions]
            }
            _ => Vec::new(),
        }
    }

    fn reset_story(&mut self) {
        self.theme_candidates.clear();
        self.theme = None;
        self.selection = CharacterSelection::new(self.profile.max_characters);
        self.narrative = NarrativeState::default();
        self.options.clear();
        self.outro = None;
        self.saved = None;
    }

    fn enter(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("Phase {} -> {}", self.phase, phase);
            self.phase = phase;
        }
    }

    fn expect_phase(&self, action: &'static str, allowed: &[Phase]) -> Result<(), ValidationError> {
        if allowed.contains(&self.phase) {
            Ok(())
        } else {
            Err(self.wrong_phase(action))
        }
    }

    /// The outro can only be touched once it exists; other sections while writing too.
    fn expect_section_phase(&self, action: &'static str, section: Section) -> Result<(), ValidationError> {
        match section {
            Section::Outro => self.expect_phase(action, &[Phase::OutroResult]),
            _ => self.expect_phase(action, &[Phase::StoryWriting, Phase::OutroResult]),
        }
    }

    fn wrong_phase(&self, action: &'static str) -> ValidationError {
        ValidationError::WrongPhase {
            action,
            phase: self.phase.to_string(),
        }
    }
}

/// Preset tags first, then the free text, as one instruction.
fn modification_instruction(tags: &[String], note: &str) -> Result<String, ValidationError> {
    let mut parts: Vec<&str> = tags
        .iter()
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .collect();
    let note = note.trim();
    if !note.is_empty() {
        parts.push(note);
    }
    if parts.is_empty() {
        return Err(ValidationError::EmptyModification);
    }
    Ok(parts.join(". "))
}
