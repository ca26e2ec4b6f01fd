use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::llm::formatter::{FormatError, PromptData, format_prompt};

const SYSTEM_SUFFIX: &str = ".system.txt";
const USER_SUFFIX: &str = ".user.txt";
const TEXT_SUFFIX: &str = ".txt";
const SCHEMA_MARKER: &str = ".schema.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prompt {
    Text(String),
    Pair {
        system: Option<String>,
        user: Option<String>,
    },
}

impl Prompt {
    pub fn text(template: impl Into<String>) -> Self {
        Self::Text(template.into())
    }

    pub fn pair(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self::Pair {
            system: Some(system.into()),
            user: Some(user.into()),
        }
    }

    /// The template that receives placeholder substitution.
    pub fn user_template(&self) -> Option<&str> {
        match self {
            Self::Text(template) => Some(template.as_str()),
            Self::Pair { user, .. } => user.as_deref(),
        }
    }

    pub fn system_template(&self) -> Option<&str> {
        match self {
            Self::Text(_) => None,
            Self::Pair { system, .. } => system.as_deref(),
        }
    }

    /// Same prompt with the user-facing half replaced; a pair keeps its system half.
    pub fn with_user_template(&self, user: String) -> Self {
        match self {
            Self::Text(_) => Self::Text(user),
            Self::Pair { system, .. } => Self::Pair {
                system: system.clone(),
                user: Some(user),
            },
        }
    }

    /// Formats the user half with `data`. The system half is passed through verbatim.
    pub fn render(&self, data: &PromptData) -> Result<RenderedPrompt, FormatError> {
        let user = self
            .user_template()
            .filter(|template| !template.is_empty())
            .map(|template| format_prompt(template, data))
            .transpose()?;
        let system = self
            .system_template()
            .filter(|template| !template.is_empty())
            .map(ToString::to_string);

        Ok(RenderedPrompt { system, user })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPrompt {
    pub system: Option<String>,
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum PairHalf {
    System,
    User,
}

#[derive(Debug, Clone, Default)]
pub struct PromptTable {
    prompts: BTreeMap<String, Prompt>,
}

impl PromptTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads `<name>.txt`, `<name>.system.txt` and `<name>.user.txt` files.
    ///
    /// Schema files, empty files and unreadable files are skipped. A missing
    /// directory yields an empty table.
    pub fn load_dir(directory: &Path) -> Self {
        let mut table = Self::new();
        if !directory.is_dir() {
            warn!(path = %directory.display(), "prompt directory not found");
            return table;
        }

        let entries = match fs::read_dir(directory) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %directory.display(), "failed to read prompt directory: {err}");
                return table;
            }
        };

        let mut files = entries
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| path.is_file())
            .collect::<Vec<_>>();
        files.sort();

        for path in files {
            let Some(file_name) = path.file_name().and_then(|name| name.to_str()) else {
                continue;
            };
            if !file_name.ends_with(TEXT_SUFFIX) || file_name.contains(SCHEMA_MARKER) {
                debug!(file = file_name, "skipping non-prompt file");
                continue;
            }

            let content = match fs::read_to_string(&path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), "failed to read prompt file: {err}");
                    continue;
                }
            };
            if content.trim().is_empty() {
                warn!(path = %path.display(), "skipping empty prompt file");
                continue;
            }

            table.insert_file(file_name, content);
        }

        table.warn_incomplete_pairs();
        info!(count = table.len(), path = %directory.display(), "loaded prompt templates");
        table
    }

    fn insert_file(&mut self, file_name: &str, content: String) {
        if let Some(name) = file_name.strip_suffix(SYSTEM_SUFFIX) {
            self.insert_half(name, PairHalf::System, content);
        } else if let Some(name) = file_name.strip_suffix(USER_SUFFIX) {
            self.insert_half(name, PairHalf::User, content);
        } else if let Some(name) = file_name.strip_suffix(TEXT_SUFFIX) {
            self.prompts.insert(name.to_string(), Prompt::Text(content));
        }
    }

    fn insert_half(&mut self, name: &str, half: PairHalf, content: String) {
        let entry = self.prompts.entry(name.to_string()).or_insert(Prompt::Pair {
            system: None,
            user: None,
        });
        let (system, user) = match entry {
            Prompt::Pair { system, user } => (system.take(), user.take()),
            Prompt::Text(_) => (None, None),
        };
        *entry = match half {
            PairHalf::System => Prompt::Pair {
                system: Some(content),
                user,
            },
            PairHalf::User => Prompt::Pair {
                system,
                user: Some(content),
            },
        };
    }

    fn warn_incomplete_pairs(&self) {
        for (name, prompt) in &self.prompts {
            if let Prompt::Pair { system, user } = prompt {
                match (system.is_some(), user.is_some()) {
                    (true, false) => warn!(prompt = %name, "prompt has system part but no user part"),
                    (false, true) => warn!(prompt = %name, "prompt has user part but no system part"),
                    _ => {}
                }
            }
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, prompt: Prompt) -> Option<Prompt> {
        self.prompts.insert(name.into(), prompt)
    }

    pub fn get(&self, name: &str) -> Option<&Prompt> {
        self.prompts.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.prompts.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.prompts.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

impl FromIterator<(String, Prompt)> for PromptTable {
    fn from_iter<I: IntoIterator<Item = (String, Prompt)>>(iter: I) -> Self {
        Self {
            prompts: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use serde_json::json;

    use super::{Prompt, PromptTable};
    use crate::llm::formatter::FormatError;

    #[test]
    fn load_dir_builds_plain_and_pair_prompts() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("greet.txt"), "Hello {name}").expect("write");
        fs::write(dir.path().join("story.system.txt"), "You tell stories.").expect("write");
        fs::write(dir.path().join("story.user.txt"), "Tell a story about {topic}").expect("write");
        fs::write(dir.path().join("story.schema.txt"), "{\"title\": \"...\"}").expect("write");
        fs::write(dir.path().join("blank.txt"), "  \n").expect("write");
        fs::write(dir.path().join("readme.md"), "ignored").expect("write");

        let table = PromptTable::load_dir(dir.path());

        assert_eq!(table.names().collect::<Vec<_>>(), vec!["greet", "story"]);
        assert_eq!(table.get("greet"), Some(&Prompt::text("Hello {name}")));
        assert_eq!(
            table.get("story"),
            Some(&Prompt::pair("You tell stories.", "Tell a story about {topic}"))
        );
    }

    #[test]
    fn load_dir_of_missing_directory_is_empty() {
        let table = PromptTable::load_dir(std::path::Path::new("/no/such/prompts"));
        assert!(table.is_empty());
    }

    #[test]
    fn render_formats_only_the_user_half() {
        let prompt = Prompt::pair("System {not_a_key}", "Describe {thing}");
        let data = json!({"thing": "a lamp"}).as_object().cloned().expect("object");

        let rendered = prompt.render(&data).expect("user keys are present");
        assert_eq!(rendered.system.as_deref(), Some("System {not_a_key}"));
        assert_eq!(rendered.user.as_deref(), Some("Describe a lamp"));
    }

    #[test]
    fn render_fails_on_missing_user_keys() {
        let prompt = Prompt::text("Describe {thing} in {style}");
        let data = json!({"thing": "a lamp"}).as_object().cloned().expect("object");

        let err = prompt.render(&data).expect_err("style is missing");
        assert_eq!(
            err,
            FormatError::MissingDataKeys {
                missing: vec!["style".to_string()]
            }
        );
    }

    #[test]
    fn with_user_template_keeps_system_half() {
        let prompt = Prompt::pair("sys", "user");
        assert_eq!(
            prompt.with_user_template("augmented".to_string()),
            Prompt::pair("sys", "augmented")
        );
        assert_eq!(
            Prompt::text("plain").with_user_template("augmented".to_string()),
            Prompt::text("augmented")
        );
    }
}
