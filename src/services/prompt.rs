//! Prompt templates and their rendering.
//!
//! Templates are plain strings with `{{name}}` placeholders. Single braces are left alone so
//! templates can show JSON examples. Every placeholder must resolve from the [`PromptContext`];
//! an unresolved one is a [`ValidationError`] and the prompt is never sent.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::core::error::ValidationError;
use crate::core::profile::StoryProfile;
use crate::core::state::Theme;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateId {
    Themes,
    Intro,
    Options,
    NextBeat,
    Outro,
    OutroTwist,
    TranslateObject,
    TranslateText,
    RegenerateSection,
    Illustration,
}

impl TemplateId {
    pub const ALL: [TemplateId; 10] = [
        TemplateId::Themes,
        TemplateId::Intro,
        TemplateId::Options,
        TemplateId::NextBeat,
        TemplateId::Outro,
        TemplateId::OutroTwist,
        TemplateId::TranslateObject,
        TemplateId::TranslateText,
        TemplateId::RegenerateSection,
        TemplateId::Illustration,
    ];

    fn default_template(self) -> &'static str {
        match self {
            TemplateId::Themes => THEMES,
            TemplateId::Intro => INTRO,
            TemplateId::Options => OPTIONS,
            TemplateId::NextBeat => NEXT_BEAT,
            TemplateId::Outro => OUTRO,
            TemplateId::OutroTwist => OUTRO_TWIST,
            TemplateId::TranslateObject => TRANSLATE_OBJECT,
            TemplateId::TranslateText => TRANSLATE_TEXT,
            TemplateId::RegenerateSection => REGENERATE_SECTION,
            TemplateId::Illustration => ILLUSTRATION,
        }
    }
}

impl fmt::Display for TemplateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TemplateId::Themes => "themes",
            TemplateId::Intro => "intro",
            TemplateId::Options => "options",
            TemplateId::NextBeat => "next_beat",
            TemplateId::Outro => "outro",
            TemplateId::OutroTwist => "outro_twist",
            TemplateId::TranslateObject => "translate_object",
            TemplateId::TranslateText => "translate_text",
            TemplateId::RegenerateSection => "regenerate_section",
            TemplateId::Illustration => "illustration",
        };
        f.write_str(name)
    }
}

const THEMES: &str = "You are a creative assistant. Generate {{count}} exciting and child-friendly story themes for a {{franchise}} adventure {{setting}}. {{world}} \
For each theme, provide a short, catchy title with a relevant emoji, and a one-sentence description of the main story. \
Output a single JSON object with a \"themes\" key, which is an array of objects. Each object should have \"title\" and \"description\" keys. \
The response should be in {{language}}.";

const INTRO: &str = "You are a creative children's storyteller. Write the intro for a {{franchise}} story in {{language}}.
**Theme:** {{theme_title}} - {{theme_description}}
**{{crew}} on the mission:** {{characters}}
**Context:** {{world}}
**Instructions:**
{{intro_instructions}}
**Output:** A single JSON object with an \"intro\" key containing the story text.";

const OPTIONS: &str = "Based on the story so far, provide 3 exciting and logical next-move options for the {{franchise}} {{crew}}. Keep them short and action-oriented. The response should be in {{language}}.
**Story so far:**
{{story}}
**Output:** A JSON object with an \"options\" key, which is an array of 3 strings.";

const NEXT_BEAT: &str = "The user chose: \"{{choice}}\". Write the next part of the story in {{language}} in rich, multi-paragraph detail. {{beat_instructions}}
**Story so far:**
{{story}}
**Output:** A JSON object with two keys: \"title\" (a short, creative title for this new part of the story) and \"content\" (the new story text).";

const OUTRO: &str = "Write a warm, cozy conclusion in {{language}} to the adventure. Show the team coming together, celebrating their success. Perfect for a bedtime wind-down.
**Story so far:**
{{story}}
**Output:** A JSON object with a \"title\" for the outro section and \"content\" for the final story text.";

const OUTRO_TWIST: &str = "The user wants a final twist! Write one last, fun, surprising mini-challenge or obstacle in {{language}}, and then quickly resolve it before writing the warm, cozy conclusion.
**Story so far:**
{{story}}
**Output:** A JSON object with a \"title\" for the outro section and \"content\" for the final story text.";

const TRANSLATE_OBJECT: &str = "You are a professional translator. Translate the string values for the following keys in the provided JSON object to {{language}}: {{keys}}. \
Crucially, you must preserve the original paragraph structure and newlines (\\n) within the string values. \
Return the entire JSON object with the translations, keeping the JSON structure identical.
JSON object:
{{json}}";

const TRANSLATE_TEXT: &str = "You are a professional translator. Translate the following text to {{language}}. \
Crucially, you must preserve the original paragraph structure and newlines (\\n) in the translated text. \
Return a single JSON object with one key, \"translation\", containing only the translated text.
Text to translate:
\"{{text}}\"";

const REGENERATE_SECTION: &str = "You are a story editor. Revise one part of an existing {{franchise}} story in {{language}}.
**Theme:** {{theme_title}} - {{theme_description}}
**{{crew}} on the mission:** {{characters}}
**Full story so far (for context):**
{{story}}
**Part to revise ({{section}}):**
{{text}}
**Requested changes:** {{instruction}}
Rewrite only the part to revise. Keep the cheerful, age-appropriate tone and make it flow with the rest of the story.
**Output:** A JSON object with two keys: \"title\" (a short title for this part) and \"content\" (the revised text).";

const ILLUSTRATION: &str = "A warm, colorful children's book illustration for a {{franchise}} story. Scene: {{text}}";

/// Everything a template may refer to.
#[derive(Debug, Default, Clone)]
pub struct PromptContext {
    pub language: String,
    pub franchise: String,
    pub crew: String,
    pub setting: String,
    pub world: String,
    pub count: usize,
    pub intro_instructions: String,
    pub beat_instructions: String,
    pub theme: Option<Theme>,
    pub characters: Vec<String>,
    pub story: Option<String>,
    pub choice: Option<String>,
    pub section: Option<String>,
    pub instruction: Option<String>,
    pub keys: Vec<String>,
    pub json: Option<String>,
    pub text: Option<String>,
}

impl PromptContext {
    pub fn new(profile: &StoryProfile, language: &str) -> Self {
        Self {
            language: language.to_string(),
            franchise: profile.name.clone(),
            crew: profile.crew.clone(),
            setting: profile.setting.clone(),
            world: profile.world.clone(),
            count: profile.theme_count,
            intro_instructions: profile.intro_instructions.trim_end().to_string(),
            beat_instructions: profile.beat_instructions.clone(),
            ..Default::default()
        }
    }

    pub fn with_theme(mut self, theme: &Theme) -> Self {
        self.theme = Some(theme.clone());
        self
    }

    pub fn with_characters(mut self, characters: &[String]) -> Self {
        self.characters = characters.to_vec();
        self
    }

    pub fn with_story(mut self, story: String) -> Self {
        self.story = Some(story);
        self
    }

    pub fn with_choice(mut self, choice: &str) -> Self {
        self.choice = Some(choice.to_string());
        self
    }

    pub fn with_revision(mut self, section: String, original: &str, instruction: String) -> Self {
        self.section = Some(section);
        self.text = Some(original.to_string());
        self.instruction = Some(instruction);
        self
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = Some(text.to_string());
        self
    }

    pub fn with_json(mut self, keys: &[&str], json: String) -> Self {
        self.keys = keys.iter().map(|k| k.to_string()).collect();
        self.json = Some(json);
        self
    }

    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "language" => Some(self.language.clone()),
            "franchise" => Some(self.franchise.clone()),
            "crew" => Some(capitalize(&self.crew)),
            "setting" => Some(self.setting.clone()),
            "world" => Some(self.world.clone()),
            "count" => Some(self.count.to_string()),
            "intro_instructions" => Some(self.intro_instructions.clone()),
            "beat_instructions" => Some(self.beat_instructions.clone()),
            "theme_title" => self.theme.as_ref().map(|t| t.title.clone()),
            "theme_description" => self.theme.as_ref().map(|t| t.description.clone()),
            "characters" if !self.characters.is_empty() => Some(self.characters.join(", ")),
            "story" => self.story.clone(),
            "choice" => self.choice.clone(),
            "section" => self.section.clone(),
            "instruction" => self.instruction.clone(),
            "keys" if !self.keys.is_empty() => Some(self.keys.join(", ")),
            "json" => self.json.clone(),
            "text" => self.text.clone(),
            _ => None,
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct PromptBook {
    templates: BTreeMap<TemplateId, String>,
}

impl Default for PromptBook {
    fn default() -> Self {
        Self::new(&BTreeMap::new())
    }
}

impl PromptBook {
    /// Built-in templates with `overrides` taking precedence.
    pub fn new(overrides: &BTreeMap<TemplateId, String>) -> Self {
        let templates = TemplateId::ALL
            .iter()
            .map(|id| {
                let text = overrides
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.default_template().to_string());
                (*id, text)
            })
            .collect();
        Self { templates }
    }

    pub fn render(&self, id: TemplateId, ctx: &PromptContext) -> Result<String, ValidationError> {
        let template = self
            .templates
            .get(&id)
            .map(String::as_str)
            .unwrap_or_else(|| id.default_template());

        let mut out = String::with_capacity(template.len() + 256);
        let mut rest = template;
        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                // unterminated: keep the remainder verbatim
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = after[..end].trim();
            let value = ctx.lookup(name).ok_or_else(|| ValidationError::MissingPromptValue {
                template: id.to_string(),
                placeholder: name.to_string(),
            })?;
            out.push_str(&value);
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> StoryProfile {
        StoryProfile::builtin("paw_patrol").unwrap().unwrap()
    }

    #[test]
    fn test_themes_prompt_embeds_count_and_language() {
        let book = PromptBook::default();
        let ctx = PromptContext::new(&profile(), "German");
        let prompt = book.render(TemplateId::Themes, &ctx).unwrap();
        assert!(prompt.contains("Generate 9 exciting"));
        assert!(prompt.contains("Paw Patrol adventure set in or around Adventure Bay"));
        assert!(prompt.ends_with("The response should be in German."));
        assert!(!prompt.contains("{{"));
    }

    #[test]
    fn test_intro_prompt_requires_theme_and_characters() {
        let book = PromptBook::default();
        let ctx = PromptContext::new(&profile(), "English");
        let err = book.render(TemplateId::Intro, &ctx).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingPromptValue {
                template: "intro".to_string(),
                placeholder: "theme_title".to_string(),
            }
        );

        let theme = Theme {
            title: "T1".to_string(),
            description: "D1".to_string(),
        };
        let ctx = ctx
            .with_theme(&theme)
            .with_characters(&["Chase".to_string(), "Skye".to_string()]);
        let prompt = book.render(TemplateId::Intro, &ctx).unwrap();
        assert!(prompt.contains("**Theme:** T1 - D1"));
        assert!(prompt.contains("**Pups on the mission:** Chase, Skye"));
        assert!(prompt.contains("Ryder summons all the pups"));
    }

    #[test]
    fn test_overrides_replace_defaults() {
        let mut overrides = BTreeMap::new();
        overrides.insert(TemplateId::Options, "Options for: {{ story }} in {{language}}".to_string());
        let book = PromptBook::new(&overrides);
        let ctx = PromptContext::new(&profile(), "Slovak").with_story("A\n\nb1".to_string());
        assert_eq!(
            book.render(TemplateId::Options, &ctx).unwrap(),
            "Options for: A\n\nb1 in Slovak"
        );
        // other templates keep their defaults
        assert!(book.render(TemplateId::Outro, &ctx).unwrap().contains("warm, cozy conclusion"));
    }

    #[test]
    fn test_single_braces_and_unterminated_placeholders_pass_through() {
        let mut overrides = BTreeMap::new();
        overrides.insert(TemplateId::Illustration, "{\"scene\": \"{{text}}\"} {{oops".to_string());
        let book = PromptBook::new(&overrides);
        let ctx = PromptContext::new(&profile(), "English").with_text("a bridge");
        assert_eq!(
            book.render(TemplateId::Illustration, &ctx).unwrap(),
            "{\"scene\": \"a bridge\"} {{oops"
        );
    }

    #[test]
    fn test_unknown_placeholder_is_rejected() {
        let mut overrides = BTreeMap::new();
        overrides.insert(TemplateId::Outro, "{{mood}} ending".to_string());
        let book = PromptBook::new(&overrides);
        let ctx = PromptContext::new(&profile(), "English");
        assert!(matches!(
            book.render(TemplateId::Outro, &ctx),
            Err(ValidationError::MissingPromptValue { .. })
        ));
    }
}
