use std::path::{Path, PathBuf};

use tracing::debug;

/// Per-file size cap (characters) for workspace convention files.
const MAX_FILE_CHARS: usize = 20_000;
/// Share of the cap spent on the head of an oversized file.
const HEAD_SHARE: f64 = 0.7;
/// Share of the cap spent on the tail.
const TAIL_SHARE: f64 = 0.2;

/// Known workspace files in load order.
const KNOWN_FILES: &[&str] = &[
    "SOUL.md",
    "IDENTITY.md",
    "AGENTS.md",
    "USER.md",
    "TOOLS.md",
    "MEMORY.md",
    "BOOTSTRAP.md",
];

/// Preamble prepended in OAuth mode, where the provider requires the
/// assistant to state what it is.
const OAUTH_IDENTITY_PREAMBLE: &str =
    "You are a personal assistant powered by Claude, operating on behalf of a single user.";

/// Two-tier system prompt.
///
/// The static tier (identity + convention files + skills) is stable across
/// turns and carries the provider cache breakpoint; the volatile tier
/// (current date/time) changes every turn and is placed last so it does not
/// break the cached prefix.
#[derive(Debug, Clone)]
pub struct SystemPrompt {
    pub static_tier: String,
    pub volatile_tier: String,
}

impl SystemPrompt {
    /// A single-tier prompt (no caching structure). Used for internal calls
    /// such as compaction summarisation.
    pub fn plain(text: impl Into<String>) -> Self {
        Self {
            static_tier: text.into(),
            volatile_tier: String::new(),
        }
    }

    /// Flatten both tiers into one string.
    pub fn to_plain_text(&self) -> String {
        if self.volatile_tier.is_empty() {
            self.static_tier.clone()
        } else {
            format!("{}\n\n{}", self.static_tier, self.volatile_tier)
        }
    }
}

/// Assembles the system prompt from workspace convention files and the
/// skills catalogue.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    workspace_dir: PathBuf,
    oauth: bool,
}

impl PromptBuilder {
    pub fn new(workspace_dir: impl Into<PathBuf>, oauth: bool) -> Self {
        Self {
            workspace_dir: workspace_dir.into(),
            oauth,
        }
    }

    pub fn build(&self) -> SystemPrompt {
        let mut sections: Vec<String> = Vec::new();

        if self.oauth {
            sections.push(OAUTH_IDENTITY_PREAMBLE.to_string());
        }

        for &name in KNOWN_FILES {
            let path = self.workspace_dir.join(name);
            if let Some(content) = read_and_truncate(&path) {
                sections.push(format!("## FILE: {name}\n\n{content}"));
            }
        }

        if let Some(skills) = self.skills_catalogue() {
            sections.push(skills);
        }

        let volatile = format!(
            "Current date/time: {}",
            chrono::Local::now().format("%Y-%m-%d %H:%M %Z")
        );

        SystemPrompt {
            static_tier: sections.join("\n\n"),
            volatile_tier: volatile,
        }
    }

    /// Render `skills/*/SKILL.md` as a name + description list.
    fn skills_catalogue(&self) -> Option<String> {
        let skills_dir = self.workspace_dir.join("skills");
        let entries = std::fs::read_dir(&skills_dir).ok()?;

        let mut dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .collect();
        dirs.sort();

        let mut lines: Vec<String> = Vec::new();
        for dir in dirs {
            let manifest = dir.join("SKILL.md");
            let Ok(content) = std::fs::read_to_string(&manifest) else {
                continue;
            };
            let name = dir
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("unnamed")
                .to_string();
            match first_description_line(&content) {
                Some(desc) => lines.push(format!("- {name}: {desc}")),
                None => lines.push(format!("- {name}")),
            }
        }

        if lines.is_empty() {
            None
        } else {
            debug!(count = lines.len(), "loaded skills catalogue");
            Some(format!("## Skills\n\n{}", lines.join("\n")))
        }
    }
}

/// First non-empty line that is not a markdown heading.
fn first_description_line(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
}

/// Read a file, reducing oversized content to a head-plus-tail
/// representation: 70% head, 20% tail, explicit marker between.
fn read_and_truncate(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    if content.trim().is_empty() {
        return None;
    }
    if content.len() <= MAX_FILE_CHARS {
        return Some(content);
    }

    let head_len = (MAX_FILE_CHARS as f64 * HEAD_SHARE) as usize;
    let tail_len = (MAX_FILE_CHARS as f64 * TAIL_SHARE) as usize;

    let head_end = floor_char_boundary(&content, head_len);
    let tail_start = ceil_char_boundary(&content, content.len() - tail_len);

    Some(format!(
        "{}\n\n[... truncated {} characters ...]\n\n{}",
        &content[..head_end],
        content.len() - head_end - (content.len() - tail_start),
        &content[tail_start..]
    ))
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}
