//! Labeled prompt sections

use loom_common::db::{BranchCanon, CreatorProfile, PathNode};

/// Character budget for the rendered story path
pub const STORY_PATH_BUDGET: usize = 12_000;

/// Nodes nearest the target that are always rendered in full
const RECENT_NODES_KEPT: usize = 6;

/// Ordered `[LABEL]` sections joined by blank lines
#[derive(Debug, Default)]
pub struct PromptBuilder {
    sections: Vec<(String, String)>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn section(mut self, label: &str, body: impl Into<String>) -> Self {
        self.sections.push((label.to_string(), body.into()));
        self
    }

    /// Add the section only when a body is present and non-blank
    pub fn optional(self, label: &str, body: Option<String>) -> Self {
        match body {
            Some(body) if !body.trim().is_empty() => self.section(label, body),
            _ => self,
        }
    }

    pub fn labels(&self) -> Vec<&str> {
        self.sections.iter().map(|(label, _)| label.as_str()).collect()
    }

    pub fn build(self) -> String {
        self.sections
            .into_iter()
            .map(|(label, body)| format!("[{}]\n{}", label, body.trim_end()))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

fn render_node(index: usize, node: &PathNode) -> String {
    let label = node
        .label
        .as_deref()
        .map(|l| format!(" ({})", l))
        .unwrap_or_default();
    format!("{}. {}{}\n{}", index + 1, node.title, label, node.content.trim())
}

/// Root-first story path within `budget` characters
///
/// The root and the most recent nodes stay in full; when the whole path does
/// not fit, the nodes in between are replaced by one elision marker.
pub fn render_story_path(path: &[PathNode], budget: usize) -> String {
    let rendered: Vec<String> = path.iter().enumerate().map(|(i, n)| render_node(i, n)).collect();
    let total: usize = rendered.iter().map(|r| r.len() + 2).sum();
    if total <= budget || rendered.len() <= RECENT_NODES_KEPT + 1 {
        return rendered.join("\n\n");
    }

    let mut kept_tail: Vec<&String> = Vec::new();
    let mut used = rendered[0].len();
    for entry in rendered[1..].iter().rev() {
        if kept_tail.len() >= RECENT_NODES_KEPT && used + entry.len() > budget {
            break;
        }
        used += entry.len() + 2;
        kept_tail.push(entry);
    }
    kept_tail.reverse();

    let elided = rendered.len() - 1 - kept_tail.len();
    let mut parts = vec![rendered[0].clone()];
    if elided > 0 {
        parts.push(format!("… {} earlier beats summarized away …", elided));
    }
    parts.extend(kept_tail.into_iter().cloned());
    parts.join("\n\n")
}

pub fn render_canon(canon: &BranchCanon) -> String {
    let mut lines = Vec::new();
    if !canon.setting.trim().is_empty() {
        lines.push(format!("Setting: {}", canon.setting.trim()));
    }
    if !canon.tone.trim().is_empty() {
        lines.push(format!("Tone: {}", canon.tone.trim()));
    }
    if !canon.characters.is_empty() {
        lines.push("Characters:".to_string());
        for character in &canon.characters {
            if character.description.trim().is_empty() {
                lines.push(format!("- {}", character.name));
            } else {
                lines.push(format!("- {}: {}", character.name, character.description.trim()));
            }
        }
    }
    if !canon.rules.is_empty() {
        lines.push("World rules:".to_string());
        for rule in &canon.rules {
            lines.push(format!("- {}", rule));
        }
    }
    lines.join("\n")
}

/// Creator preferences, stated affirmatively
pub fn render_profile(profile: &CreatorProfile) -> String {
    let mut lines = Vec::new();
    if !profile.writing_style.trim().is_empty() {
        lines.push(format!("Writing style: {}", profile.writing_style.trim()));
    }
    if !profile.preferred_genres.is_empty() {
        lines.push(format!("Preferred genres: {}", profile.preferred_genres.join(", ")));
    }
    if !profile.favorite_themes.is_empty() {
        lines.push(format!("Favorite themes: {}", profile.favorite_themes.join(", ")));
    }
    if !profile.disliked_elements.is_empty() {
        lines.push(format!(
            "Reserved for other stories: {}",
            profile.disliked_elements.join(", ")
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn path(len: usize, content_len: usize) -> Vec<PathNode> {
        (0..len)
            .map(|i| PathNode {
                node_id: Uuid::new_v4(),
                title: format!("Beat {}", i),
                content: "x".repeat(content_len),
                label: None,
            })
            .collect()
    }

    #[test]
    fn test_builder_skips_blank_optional_sections() {
        let prompt = PromptBuilder::new()
            .section("STYLE", "Lyrical.")
            .optional("CANON", Some("  ".to_string()))
            .optional("PROFILE", None)
            .section("OUTPUT FORMAT", "Plain prose.")
            .build();
        assert_eq!(prompt, "[STYLE]\nLyrical.\n\n[OUTPUT FORMAT]\nPlain prose.");
    }

    #[test]
    fn test_short_path_rendered_in_full() {
        let rendered = render_story_path(&path(3, 10), STORY_PATH_BUDGET);
        assert!(rendered.starts_with("1. Beat 0"));
        assert!(rendered.contains("3. Beat 2"));
        assert!(!rendered.contains("summarized away"));
    }

    #[test]
    fn test_long_path_keeps_root_and_recent() {
        let nodes = path(40, 500);
        let rendered = render_story_path(&nodes, 5_000);
        assert!(rendered.starts_with("1. Beat 0"));
        assert!(rendered.contains("40. Beat 39"));
        assert!(rendered.contains("earlier beats summarized away"));
        assert!(!rendered.contains("2. Beat 1\n"));
    }

    #[test]
    fn test_profile_has_affirmative_wording() {
        let profile = CreatorProfile {
            preferred_genres: vec!["noir".to_string()],
            writing_style: "terse".to_string(),
            favorite_themes: vec![],
            disliked_elements: vec!["gore".to_string()],
            exploration_ratio: 0.5,
        };
        let rendered = render_profile(&profile);
        assert!(rendered.contains("Reserved for other stories: gore"));
        assert!(!rendered.to_lowercase().contains("free of"));
        assert!(!rendered.to_lowercase().contains("avoid"));
    }
}
