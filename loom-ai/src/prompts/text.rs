//! Text task prompts

use loom_common::db::CreatorProfile;

use super::sections::{render_canon, render_profile, render_story_path, PromptBuilder, STORY_PATH_BUDGET};
use super::{CanonDiffParams, ExpandParams, MergeProposalParams, SuggestParams};
use crate::context::AIContext;

fn style_body(ctx: &AIContext, profile: Option<&CreatorProfile>) -> String {
    match profile.map(|p| p.writing_style.trim()).filter(|s| !s.is_empty()) {
        Some(style) => format!("{}\nWrite in this style: {}", ctx.system_prompt, style),
        None => format!(
            "{}\nMatch the voice, tense and point of view of the story so far.",
            ctx.system_prompt
        ),
    }
}

/// Style, vision, canon and story path: the shared head of every text prompt
fn story_head(ctx: &AIContext, profile: Option<&CreatorProfile>) -> PromptBuilder {
    PromptBuilder::new()
        .section("STYLE", style_body(ctx, profile))
        .optional("PROJECT VISION", profile.map(render_profile))
        .optional("CANON", ctx.branch_canon.as_ref().map(render_canon))
        .section("STORY SO FAR", render_story_path(&ctx.active_path, STORY_PATH_BUDGET))
}

fn target_title(ctx: &AIContext) -> &str {
    ctx.target().map(|n| n.title.as_str()).unwrap_or("the current beat")
}

pub fn compose_suggest(ctx: &AIContext, params: &SuggestParams) -> String {
    let split = params.split();
    let task = format!(
        "Propose exactly {total} possible next beats that follow \"{title}\".\n\
         Exactly {exploratory} of them are exploratory: each takes the story in a fresh, surprising direction \
         that still fits the established world.\n\
         Exactly {aligned} of them are aligned: each continues naturally along the direction the story is already heading.",
        total = params.num_suggestions,
        title = target_title(ctx),
        exploratory = split.exploratory,
        aligned = split.aligned,
    );

    story_head(ctx, params.profile.as_ref())
        .section("TASK", task)
        .optional("INSTRUCTIONS", params.instructions.clone())
        .section(
            "OUTPUT FORMAT",
            format!(
                "Your entire reply is one JSON object:\n\
                 {{\"suggestions\": [{{\"title\": string, \"content\": string, \"kind\": \"exploratory\" | \"aligned\", \"rationale\": string}}]}}\n\
                 The array holds exactly {} entries; each content is one to three paragraphs of story prose.",
                params.num_suggestions
            ),
        )
        .build()
}

pub fn compose_expand(ctx: &AIContext, params: &ExpandParams) -> String {
    let task = format!(
        "Rewrite \"{}\" as a fuller scene of about {} words. Keep every event of the beat and \
         enrich it with sensory detail, interiority and dialogue where it serves the moment.",
        target_title(ctx),
        params.target_words
    );

    story_head(ctx, params.profile.as_ref())
        .section("TASK", task)
        .optional("INSTRUCTIONS", params.instructions.clone())
        .section(
            "OUTPUT FORMAT",
            "Continuous story paragraphs only, beginning with the first sentence of the scene.",
        )
        .build()
}

pub fn compose_canon_diff(ctx: &AIContext, params: &CanonDiffParams) -> String {
    let content = params
        .content
        .clone()
        .or_else(|| ctx.target().map(|n| n.content.clone()))
        .unwrap_or_default();
    let current = ctx
        .branch_canon
        .as_ref()
        .map(render_canon)
        .filter(|c| !c.trim().is_empty())
        .unwrap_or_else(|| "The canon for this branch is still empty.".to_string());

    PromptBuilder::new()
        .section("STYLE", format!("{}\nAct as a meticulous continuity editor.", ctx.system_prompt))
        .section("CURRENT CANON", current)
        .section("STORY SO FAR", render_story_path(&ctx.active_path, STORY_PATH_BUDGET))
        .section("NEW CONTENT", content)
        .section(
            "TASK",
            "List the canon changes the new content implies: new facts to add, existing facts it updates, \
             and facts it retires. Report only changes the new content supports directly.",
        )
        .section(
            "OUTPUT FORMAT",
            "Your entire reply is one JSON object:\n\
             {\"changes\": [{\"field\": \"setting\" | \"tone\" | \"characters\" | \"rules\", \
             \"operation\": \"add\" | \"update\" | \"remove\", \"value\": string, \"reason\": string}]}\n\
             An unchanged canon is {\"changes\": []}.",
        )
        .build()
}

pub fn compose_merge(ctx: &AIContext, params: &MergeProposalParams) -> String {
    let incoming_title = params
        .incoming_path
        .last()
        .map(|n| n.title.as_str())
        .unwrap_or("the incoming branch");

    PromptBuilder::new()
        .section("STYLE", style_body(ctx, None))
        .optional("CANON", ctx.branch_canon.as_ref().map(render_canon))
        .section("BRANCH A", render_story_path(&ctx.active_path, STORY_PATH_BUDGET / 2))
        .section("BRANCH B", render_story_path(&params.incoming_path, STORY_PATH_BUDGET / 2))
        .section(
            "TASK",
            format!(
                "Write one beat that brings \"{}\" and \"{}\" together so both branches continue from it. \
                 Reconcile every contradiction between the branches explicitly within the story.",
                target_title(ctx),
                incoming_title
            ),
        )
        .optional("INSTRUCTIONS", params.instructions.clone())
        .section(
            "OUTPUT FORMAT",
            "Your entire reply is one JSON object:\n\
             {\"title\": string, \"content\": string, \"reconciled_points\": [string]}",
        )
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::GenerationTask;
    use loom_common::db::{BranchCanon, PathNode};
    use uuid::Uuid;

    const NEGATIVE_PHRASES: [&str; 8] = [
        "do not", "don't", "never", "avoid", "free of", "nothing else", "no headings", "no commentary",
    ];

    fn ctx() -> AIContext {
        let node = |title: &str| PathNode {
            node_id: Uuid::new_v4(),
            title: title.to_string(),
            content: format!("{} unfolds.", title),
            label: None,
        };
        AIContext {
            system_prompt: "You co-write fiction.".to_string(),
            branch_canon: None,
            active_path: vec![node("Arrival"), node("The Storm")],
        }
    }

    fn labels(prompt: &str) -> Vec<&str> {
        prompt
            .lines()
            .filter(|l| l.starts_with('[') && l.ends_with(']'))
            .collect()
    }

    fn suggest(n: usize, ratio: f64) -> SuggestParams {
        SuggestParams {
            num_suggestions: n,
            instructions: None,
            profile: None,
            exploration_ratio: Some(ratio),
        }
    }

    #[test]
    fn test_suggest_states_split_counts() {
        let prompt = compose_suggest(&ctx(), &suggest(5, 0.4));
        assert!(prompt.contains("exactly 5 possible next beats"));
        assert!(prompt.contains("Exactly 2 of them are exploratory"));
        assert!(prompt.contains("Exactly 3 of them are aligned"));

        let none = compose_suggest(&ctx(), &suggest(5, 0.0));
        assert!(none.contains("Exactly 0 of them are exploratory"));
        assert!(none.contains("Exactly 5 of them are aligned"));

        let all = compose_suggest(&ctx(), &suggest(5, 1.0));
        assert!(all.contains("Exactly 5 of them are exploratory"));
        assert!(all.contains("Exactly 0 of them are aligned"));
    }

    #[test]
    fn test_style_first_output_format_last() {
        let c = ctx();
        let tasks = [
            GenerationTask::Suggest(suggest(3, 0.3)),
            GenerationTask::Expand(ExpandParams {
                target_words: 400,
                instructions: Some("More rain.".to_string()),
                profile: None,
            }),
            GenerationTask::CanonDiff(CanonDiffParams { content: None }),
            GenerationTask::MergeProposal(MergeProposalParams {
                incoming_path: c.active_path.clone(),
                instructions: None,
            }),
        ];
        for task in tasks {
            let prompt = task.compose(&c);
            let labels = labels(&prompt);
            assert_eq!(labels.first(), Some(&"[STYLE]"), "{:?}", task.kind());
            assert_eq!(labels.last(), Some(&"[OUTPUT FORMAT]"), "{:?}", task.kind());
            let lower = prompt.to_lowercase();
            for phrase in NEGATIVE_PHRASES {
                assert!(!lower.contains(phrase), "{:?} contains {:?}", task.kind(), phrase);
            }
        }
    }

    #[test]
    fn test_canon_and_profile_sections_only_when_present() {
        let mut c = ctx();
        let bare = compose_suggest(&c, &suggest(2, 0.5));
        assert!(!bare.contains("[CANON]"));
        assert!(!bare.contains("[PROJECT VISION]"));

        c.branch_canon = Some(BranchCanon {
            branch_id: Uuid::new_v4(),
            setting: "A flooded archive".to_string(),
            ..BranchCanon::default()
        });
        let mut params = suggest(2, 0.5);
        params.profile = Some(CreatorProfile {
            preferred_genres: vec!["mystery".to_string()],
            writing_style: "spare".to_string(),
            favorite_themes: vec![],
            disliked_elements: vec![],
            exploration_ratio: 0.5,
        });
        let rich = compose_suggest(&c, &params);
        assert!(rich.contains("[CANON]\nSetting: A flooded archive"));
        assert!(rich.contains("[PROJECT VISION]"));
        assert!(rich.contains("Write in this style: spare"));
    }

    #[test]
    fn test_canon_diff_defaults_to_target_content() {
        let prompt = compose_canon_diff(&ctx(), &CanonDiffParams { content: None });
        assert!(prompt.contains("[NEW CONTENT]\nThe Storm unfolds."));
        assert!(prompt.contains("still empty"));
    }
}
