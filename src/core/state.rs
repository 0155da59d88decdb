use crate::core::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;

const PART_SEPARATOR: &str = "\n\n";

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Theme {
    pub title: String,
    pub description: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct StoryBeat {
    pub title: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl StoryBeat {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
            image_url: None,
        }
    }
}

/// The closing section. Same shape as a beat but never part of the beat list.
pub type Outro = StoryBeat;

/// Addresses one rendered section of the story.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Section {
    Intro,
    Beat(usize),
    Outro,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Section::Intro => write!(f, "Part 1"),
            Section::Beat(i) => write!(f, "Part {}", i + 2),
            Section::Outro => write!(f, "The End"),
        }
    }
}

#[derive(Serialize, Deserialize, Default, Clone, Debug, PartialEq, Eq)]
pub struct NarrativeState {
    pub intro: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intro_image_url: Option<String>,
    pub beats: Vec<StoryBeat>,
}

impl NarrativeState {
    /// Intro followed by every beat's content, blank-line separated.
    pub fn story_context(&self) -> String {
        std::iter::once(self.intro.as_str())
            .chain(self.beats.iter().map(|b| b.content.as_str()))
            .collect::<Vec<_>>()
            .join(PART_SEPARATOR)
    }

    pub fn append_beat(&mut self, beat: StoryBeat) {
        self.beats.push(beat);
    }

    pub fn has_intro(&self) -> bool {
        !self.intro.is_empty()
    }

    /// Swaps the text of one section and drops its image, which no longer matches.
    pub fn replace_section(
        &mut self,
        section: Section,
        title: String,
        content: String,
        outro: &mut Option<Outro>,
    ) -> Result<(), ValidationError> {
        match section {
            Section::Intro => {
                if !self.has_intro() {
                    return Err(ValidationError::NoSuchSection(section.to_string()));
                }
                self.intro = content;
                self.intro_image_url = None;
            }
            Section::Beat(i) => {
                let beat = self
                    .beats
                    .get_mut(i)
                    .ok_or_else(|| ValidationError::NoSuchSection(section.to_string()))?;
                *beat = StoryBeat::new(title, content);
            }
            Section::Outro => {
                let current = outro
                    .as_mut()
                    .ok_or_else(|| ValidationError::NoSuchSection(section.to_string()))?;
                *current = StoryBeat::new(title, content);
            }
        }
        Ok(())
    }

    pub fn set_image(
        &mut self,
        section: Section,
        url: String,
        outro: &mut Option<Outro>,
    ) -> Result<(), ValidationError> {
        let slot = match section {
            Section::Intro if self.has_intro() => &mut self.intro_image_url,
            Section::Beat(i) => match self.beats.get_mut(i) {
                Some(beat) => &mut beat.image_url,
                None => return Err(ValidationError::NoSuchSection(section.to_string())),
            },
            Section::Outro => match outro.as_mut() {
                Some(o) => &mut o.image_url,
                None => return Err(ValidationError::NoSuchSection(section.to_string())),
            },
            Section::Intro => return Err(ValidationError::NoSuchSection(section.to_string())),
        };
        *slot = Some(url);
        Ok(())
    }

    /// Text of a section, used as the "original" in regeneration and illustration prompts.
    pub fn section_text<'a>(&'a self, section: Section, outro: Option<&'a Outro>) -> Option<&'a str> {
        match section {
            Section::Intro if self.has_intro() => Some(&self.intro),
            Section::Intro => None,
            Section::Beat(i) => self.beats.get(i).map(|b| b.content.as_str()),
            Section::Outro => outro.map(|o| o.content.as_str()),
        }
    }
}

/// Ordered, duplicate-free set of chosen character names with a cap.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CharacterSelection {
    names: Vec<String>,
    max: usize,
}

impl CharacterSelection {
    pub fn new(max: usize) -> Self {
        Self {
            names: Vec::new(),
            max,
        }
    }

    /// Adds or removes `name`. Adding beyond the cap is ignored.
    /// Returns whether the selection changed.
    pub fn toggle(&mut self, name: &str) -> bool {
        if let Some(pos) = self.names.iter().position(|n| n == name) {
            self.names.remove(pos);
            return true;
        }
        if self.names.len() < self.max {
            self.names.push(name.to_string());
            return true;
        }
        false
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

/// Full story text as displayed at the end and stored by the story store.
pub fn render_full_text(opening_title: &str, narrative: &NarrativeState, outro: Option<&Outro>) -> String {
    let mut parts = Vec::with_capacity(narrative.beats.len() + 2);
    parts.push(format!("Part 1: {}\n{}", opening_title, narrative.intro));
    for (i, beat) in narrative.beats.iter().enumerate() {
        parts.push(format!("Part {}: {}\n{}", i + 2, beat.title, beat.content));
    }
    if let Some(outro) = outro {
        parts.push(format!("The End: {}\n{}", outro.title, outro.content));
    }
    parts.join(PART_SEPARATOR)
}
