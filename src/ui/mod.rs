//! Terminal front end: one inquire prompt per screen, an indicatif spinner while the model works.

use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use inquire::{Confirm, InquireError, MultiSelect, Select, Text};
use log::debug;
use std::time::Duration;

use crate::core::config::Config;
use crate::core::session::{Action, Phase, Session};
use crate::core::state::Section;
use crate::services::orchestrator::Orchestrator;
use crate::services::setup;

const NEW_STORY: &str = "✨ Create a new story";
const SAVED_STORIES: &str = "📚 Saved stories";
const CHANGE_LANGUAGE: &str = "🌐 Change language";
const QUIT: &str = "Quit";
const OTHER_THEMES: &str = "🔄 Show me other themes";
const OTHER_OPTIONS: &str = "🔄 Other ideas";
const WRAP_UP: &str = "🏁 Wrap it up";
const EDIT_PART: &str = "✏️  Change a part";
const ILLUSTRATE_PART: &str = "🎨 Illustrate a part";
const START_OVER: &str = "↩️  Start over";
const TRY_AGAIN: &str = "Try again";
const BACK: &str = "Back";
const DONE: &str = "Done";

pub async fn run(orchestrator: &mut Orchestrator, config: &mut Config) -> Result<()> {
    loop {
        let action = match screen(orchestrator, config) {
            Ok(Some(action)) => action,
            Ok(None) => break,
            Err(err) => match err.downcast_ref::<InquireError>() {
                Some(InquireError::OperationCanceled) => match on_escape(orchestrator.session()) {
                    Escape::Go(action) => action,
                    Escape::Redraw => continue,
                    Escape::Leave => break,
                },
                Some(InquireError::OperationInterrupted) => break,
                _ => return Err(err),
            },
        };

        let entered = match &action {
            Action::SubmitSettings(settings) => Some(settings.clone()),
            _ => None,
        };
        debug!("Action {:?}", action);

        let spinner = spinner(&orchestrator.session().profile().thinking)?;
        let result = orchestrator.dispatch(action).await;
        spinner.finish_and_clear();

        match result {
            Ok(()) => {
                if let Some(settings) = entered {
                    setup::remember_settings(config, &settings)?;
                }
            }
            Err(err) => println!("⚠️  {}", err),
        }
    }
    Ok(())
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(120));
    Ok(pb)
}

/// Where Esc leads from the current screen.
#[derive(Debug, PartialEq)]
enum Escape {
    Go(Action),
    Redraw,
    Leave,
}

fn on_escape(session: &Session) -> Escape {
    if session.pending_language().is_some() {
        return Escape::Go(Action::CancelLanguage);
    }
    match session.phase() {
        Phase::Setup | Phase::MainMenu => Escape::Leave,
        Phase::SavedStories if session.viewed_story().is_some() => Escape::Go(Action::CloseStory),
        Phase::SavedStories => Escape::Go(Action::BackToMenu),
        _ => Escape::Redraw,
    }
}

fn screen(orchestrator: &Orchestrator, config: &Config) -> Result<Option<Action>> {
    if orchestrator.session().pending_language().is_some() {
        return confirm_language(orchestrator.session()).map(Some);
    }
    next_action(orchestrator, config)
}

/// `None` means the user wants to leave.
fn next_action(orchestrator: &Orchestrator, config: &Config) -> Result<Option<Action>> {
    let session = orchestrator.session();
    match session.phase() {
        Phase::Setup => Ok(Some(Action::SubmitSettings(setup::prompt_settings(config)?))),
        Phase::MainMenu => main_menu(session),
        Phase::ThemeSelection => theme_selection(session).map(Some),
        Phase::CharacterSelection => character_selection(session).map(Some),
        Phase::IntroGeneration => {
            let choice = Select::new("The intro could not be written.", vec![TRY_AGAIN, START_OVER]).prompt()?;
            Ok(Some(if choice == TRY_AGAIN {
                Action::RetryIntro
            } else {
                Action::Restart
            }))
        }
        Phase::StoryWriting => story_writing(orchestrator).map(Some),
        Phase::OutroDecision => {
            let choice = Select::new(
                "How should the story end?",
                vec!["🌙 End it here", "🎉 Add a final twist"],
            )
            .prompt()?;
            Ok(Some(Action::FinishStory {
                twist: choice.contains("twist"),
            }))
        }
        Phase::OutroResult => outro_result(orchestrator),
        Phase::SavedStories => saved_stories(session).map(Some),
    }
}

fn main_menu(session: &Session) -> Result<Option<Action>> {
    if let Some(intro) = session.profile().menu_intro.get(session.language()) {
        println!("\n{}\n", intro);
    }
    let mut items = vec![NEW_STORY, SAVED_STORIES];
    if can_change_language(session) {
        items.push(CHANGE_LANGUAGE);
    }
    items.push(QUIT);
    let choice = Select::new(&format!("{} story weaver", session.profile().name), items).prompt()?;
    match choice {
        NEW_STORY => Ok(Some(Action::NewStory)),
        SAVED_STORIES => Ok(Some(Action::OpenSavedStories)),
        CHANGE_LANGUAGE => language_menu(session).map(Some),
        _ => Ok(None),
    }
}

fn other_languages(session: &Session) -> Vec<String> {
    session
        .languages()
        .iter()
        .filter(|l| l.as_str() != session.language())
        .cloned()
        .collect()
}

fn can_change_language(session: &Session) -> bool {
    !other_languages(session).is_empty()
}

/// Esc here returns to the screen that opened the menu.
fn language_menu(session: &Session) -> Result<Action> {
    match Select::new("Language:", other_languages(session)).prompt() {
        Ok(language) => Ok(Action::RequestLanguage(language)),
        Err(InquireError::OperationCanceled) => Ok(Action::CancelLanguage),
        Err(err) => Err(err.into()),
    }
}

fn confirm_language(session: &Session) -> Result<Action> {
    let target = session.pending_language().unwrap_or_default();
    let yes = Confirm::new(&format!("Translate everything written so far to {}?", target))
        .with_default(true)
        .prompt()?;
    Ok(if yes {
        Action::ConfirmLanguage
    } else {
        Action::CancelLanguage
    })
}

fn theme_selection(session: &Session) -> Result<Action> {
    let themes = session.theme_candidates();
    if themes.is_empty() {
        println!("No themes this time.");
    }
    let mut items: Vec<String> = themes
        .iter()
        .map(|t| format!("{} - {}", t.title, t.description))
        .collect();
    items.push(OTHER_THEMES.to_string());
    if can_change_language(session) {
        items.push(CHANGE_LANGUAGE.to_string());
    }
    items.push(START_OVER.to_string());

    let picked = Select::new("Pick a theme:", items).raw_prompt()?;
    if picked.index < themes.len() {
        return Ok(Action::SelectTheme(picked.index));
    }
    match picked.value.as_str() {
        OTHER_THEMES => Ok(Action::RefreshThemes),
        CHANGE_LANGUAGE => language_menu(session),
        _ => Ok(Action::Restart),
    }
}

fn character_selection(session: &Session) -> Result<Action> {
    let selection = session.selection();
    let characters = &session.profile().characters;
    let mut items: Vec<String> = characters
        .iter()
        .map(|c| {
            let mark = if selection.contains(&c.name) { "[x]" } else { "[ ]" };
            format!("{} {} {}", mark, c.emoji, c.name)
        })
        .collect();
    items.extend([DONE, START_OVER].map(String::from));

    let prompt = format!(
        "Who joins the mission? ({}/{})",
        selection.len(),
        selection.max()
    );
    let picked = Select::new(&prompt, items).raw_prompt()?;
    match characters.get(picked.index) {
        Some(c) => Ok(Action::ToggleCharacter(c.name.clone())),
        None if picked.value == DONE => Ok(Action::ConfirmCharacters),
        None => Ok(Action::Restart),
    }
}

fn story_writing(orchestrator: &Orchestrator) -> Result<Action> {
    let session = orchestrator.session();
    if let Some(latest) = sections(session).last() {
        print_section(session, *latest);
    }

    let options = session.options();
    let mut items: Vec<String> = options.to_vec();
    if options.is_empty() {
        items.push(TRY_AGAIN.to_string());
    } else {
        items.push(OTHER_OPTIONS.to_string());
    }
    items.extend([WRAP_UP, EDIT_PART].map(String::from));
    if orchestrator.can_illustrate() {
        items.push(ILLUSTRATE_PART.to_string());
    }
    if can_change_language(session) {
        items.push(CHANGE_LANGUAGE.to_string());
    }
    items.push(START_OVER.to_string());

    let picked = Select::new("What happens next?", items).raw_prompt()?;
    if picked.index < options.len() {
        return Ok(Action::ChooseOption(picked.index));
    }
    match picked.value.as_str() {
        TRY_AGAIN | OTHER_OPTIONS => Ok(Action::RefreshOptions),
        WRAP_UP => Ok(Action::WrapUp),
        EDIT_PART => edit_section(session),
        ILLUSTRATE_PART => Ok(Action::Illustrate(pick_section(session, "Which part?")?)),
        CHANGE_LANGUAGE => language_menu(session),
        _ => Ok(Action::Restart),
    }
}

fn outro_result(orchestrator: &Orchestrator) -> Result<Option<Action>> {
    let session = orchestrator.session();
    println!("\n{}\n", session.full_text());

    let mut items = Vec::new();
    if orchestrator.can_save() && !session.is_saved() {
        items.push("💾 Save story");
    }
    items.push(EDIT_PART);
    if orchestrator.can_illustrate() {
        items.push(ILLUSTRATE_PART);
    }
    if can_change_language(session) {
        items.push(CHANGE_LANGUAGE);
    }
    items.extend([START_OVER, QUIT]);

    let choice = Select::new("The End. What now?", items).prompt()?;
    match choice {
        EDIT_PART => edit_section(session).map(Some),
        ILLUSTRATE_PART => Ok(Some(Action::Illustrate(pick_section(session, "Which part?")?))),
        CHANGE_LANGUAGE => language_menu(session).map(Some),
        START_OVER => Ok(Some(Action::Restart)),
        QUIT => Ok(None),
        _ => Ok(Some(Action::Save)),
    }
}

fn saved_stories(session: &Session) -> Result<Action> {
    if let Some(story) = session.viewed_story() {
        println!("\n{}\n\n{}\n", story.title, story.text);
        Select::new("", vec![BACK]).prompt()?;
        return Ok(Action::CloseStory);
    }

    let Some(stories) = session.saved_stories() else {
        let choice = Select::new("Saved stories could not be loaded.", vec![TRY_AGAIN, BACK]).prompt()?;
        return Ok(if choice == TRY_AGAIN {
            Action::RetryListing
        } else {
            Action::BackToMenu
        });
    };
    if stories.is_empty() {
        println!("No saved stories yet.");
    }

    let mut items: Vec<String> = stories
        .iter()
        .map(|s| format!("{} ({})", s.title, s.created_at.format("%Y-%m-%d %H:%M")))
        .collect();
    items.push(BACK.to_string());

    let picked = Select::new("Saved stories:", items).raw_prompt()?;
    if picked.index < stories.len() {
        Ok(Action::ViewStory(picked.index))
    } else {
        Ok(Action::BackToMenu)
    }
}

fn edit_section(session: &Session) -> Result<Action> {
    let section = pick_section(session, "Which part should change?")?;
    let tags = MultiSelect::new("Preset changes:", session.modification_tags().to_vec()).prompt()?;
    let note = Text::new("Anything else? (optional)").prompt()?;
    Ok(Action::Regenerate { section, tags, note })
}

fn pick_section(session: &Session, prompt: &str) -> Result<Section> {
    let available = sections(session);
    let labels: Vec<String> = available.iter().map(|s| section_label(session, *s)).collect();
    let picked = Select::new(prompt, labels).raw_prompt()?;
    Ok(available[picked.index])
}

/// Sections in reading order.
fn sections(session: &Session) -> Vec<Section> {
    let mut all = Vec::new();
    if session.narrative().has_intro() {
        all.push(Section::Intro);
    }
    all.extend((0..session.narrative().beats.len()).map(Section::Beat));
    if session.outro().is_some() {
        all.push(Section::Outro);
    }
    all
}

fn section_label(session: &Session, section: Section) -> String {
    let title = match section {
        Section::Intro => Some(session.profile().opening_title.as_str()),
        Section::Beat(i) => session.narrative().beats.get(i).map(|b| b.title.as_str()),
        Section::Outro => session.outro().map(|o| o.title.as_str()),
    };
    match title {
        Some(title) => format!("{}: {}", section, title),
        None => section.to_string(),
    }
}

fn print_section(session: &Session, section: Section) {
    let text = session.section_text(section).unwrap_or_default();
    println!("\n{}\n{}\n", section_label(session, section), text);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{Settings, StoryConfig};
    use crate::core::profile::StoryProfile;
    use crate::core::session::Outcome;
    use crate::core::state::{StoryBeat, Theme};
    use crate::services::persistence::{RecordId, StoredRecord};
    use chrono::Utc;
    use std::sync::Arc;

    fn menu_session(story: &StoryConfig) -> Session {
        let profile = StoryProfile::builtin("paw_patrol").unwrap().unwrap();
        let mut s = Session::new(Arc::new(profile), story, false);
        s.apply(Action::SubmitSettings(Settings::default())).unwrap();
        s.resolve(Outcome::Connected);
        s
    }

    fn writing_session() -> Session {
        let mut s = menu_session(&StoryConfig::default());
        s.apply(Action::NewStory).unwrap();
        s.resolve(Outcome::ThemesGenerated(vec![Theme {
            title: "T1".to_string(),
            description: "D1".to_string(),
        }]));
        s.apply(Action::SelectTheme(0)).unwrap();
        s.apply(Action::ToggleCharacter("Chase".to_string())).unwrap();
        s.apply(Action::ConfirmCharacters).unwrap();
        s.resolve(Outcome::IntroGenerated("Once upon a time".to_string()));
        s.resolve(Outcome::OptionsGenerated(vec!["Go left".to_string()]));
        s.apply(Action::ChooseOption(0)).unwrap();
        s.resolve(Outcome::BeatGenerated(StoryBeat::new("Left Path", "They went left.")));
        s
    }

    #[test]
    fn test_sections_in_reading_order() {
        let session = writing_session();
        assert_eq!(sections(&session), vec![Section::Intro, Section::Beat(0)]);
    }

    #[test]
    fn test_section_labels() {
        let session = writing_session();
        assert_eq!(section_label(&session, Section::Intro), "Part 1: The Mission Begins");
        assert_eq!(section_label(&session, Section::Beat(0)), "Part 2: Left Path");
        assert_eq!(section_label(&session, Section::Outro), "The End");
    }

    #[test]
    fn test_escape_leaves_from_the_menu() {
        let session = menu_session(&StoryConfig::default());
        assert_eq!(on_escape(&session), Escape::Leave);
    }

    #[test]
    fn test_escape_redraws_story_screens() {
        let session = writing_session();
        assert_eq!(on_escape(&session), Escape::Redraw);
    }

    #[test]
    fn test_escape_cancels_a_pending_language() {
        let mut session = writing_session();
        session.apply(Action::RequestLanguage("German".to_string())).unwrap();
        assert_eq!(on_escape(&session), Escape::Go(Action::CancelLanguage));
    }

    #[test]
    fn test_escape_steps_back_through_saved_stories() {
        let mut session = menu_session(&StoryConfig::default());
        session.apply(Action::OpenSavedStories).unwrap();
        session.resolve(Outcome::StoriesListed(vec![StoredRecord {
            id: RecordId::Int(1),
            created_at: Utc::now(),
            title: "Story 1".to_string(),
            description: String::new(),
            text: "Part 1: x".to_string(),
        }]));
        assert_eq!(on_escape(&session), Escape::Go(Action::BackToMenu));

        session.apply(Action::ViewStory(0)).unwrap();
        assert_eq!(on_escape(&session), Escape::Go(Action::CloseStory));
    }

    #[test]
    fn test_language_menu_hidden_with_a_single_language() {
        let story = StoryConfig {
            languages: vec!["English".to_string()],
            ..StoryConfig::default()
        };
        let session = menu_session(&story);
        assert!(other_languages(&session).is_empty());
        assert!(!can_change_language(&session));
    }

    #[test]
    fn test_language_menu_offers_only_other_languages() {
        let session = menu_session(&StoryConfig::default());
        assert!(can_change_language(&session));
        assert!(!other_languages(&session).contains(&"English".to_string()));
        assert_eq!(other_languages(&session).len(), session.languages().len() - 1);
    }
}
