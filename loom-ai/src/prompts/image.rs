//! Image and extraction prompts
//!
//! Scene prompts ground every recognized character in its stored identity
//! block, placed directly after the style section so appearance stays stable
//! across illustrations of the same timeline.

use loom_common::db::CharacterReference;

use super::sections::{render_story_path, PromptBuilder};
use super::{ExtractedCharacter, PortraitParams, SceneImageParams, DEFAULT_IMAGE_STYLE};
use crate::context::AIContext;

/// Story text given to the extraction calls
const EXTRACTION_PATH_BUDGET: usize = 4_000;

fn style_body(style: Option<&str>, ctx: &AIContext) -> String {
    let base = style
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_IMAGE_STYLE)
        .to_string();
    match ctx
        .branch_canon
        .as_ref()
        .map(|c| c.tone.trim())
        .filter(|t| !t.is_empty())
    {
        Some(tone) => format!("{}\nMood: {}", base, tone),
        None => base,
    }
}

fn words(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// References whose name appears as whole words in the scene text or among the extracted characters
pub fn matching_references<'a>(
    references: &'a [CharacterReference],
    scene_text: &str,
    characters: &[ExtractedCharacter],
) -> Vec<&'a CharacterReference> {
    let scene_words = words(scene_text);
    let extracted: Vec<Vec<String>> = characters.iter().map(|c| words(&c.name)).collect();
    references
        .iter()
        .filter(|r| {
            let name = words(&r.name);
            !name.is_empty()
                && (scene_words.windows(name.len()).any(|w| w == name.as_slice())
                    || extracted.iter().any(|c| *c == name))
        })
        .collect()
}

fn characters_present_body(characters: &[ExtractedCharacter], grounded: &[&CharacterReference]) -> String {
    if characters.is_empty() && grounded.is_empty() {
        return "The frame contains only the environment: landscape, architecture and light.".to_string();
    }

    let mut lines = Vec::new();
    for character in characters {
        let mut line = format!("- {}", character.name.trim());
        if !character.action.trim().is_empty() {
            line.push_str(&format!(": {}", character.action.trim()));
        }
        if !character.appearance_notes.trim().is_empty() {
            line.push_str(&format!(" ({})", character.appearance_notes.trim()));
        }
        lines.push(line);
    }
    for reference in grounded {
        let listed = characters
            .iter()
            .any(|c| c.name.trim().eq_ignore_ascii_case(reference.name.trim()));
        if !listed {
            lines.push(format!("- {}", reference.name.trim()));
        }
    }
    if !grounded.is_empty() {
        lines.push(
            "Each named character's appearance matches their CHARACTER IDENTITY block exactly: \
             same face, hair, build, clothing and colors."
                .to_string(),
        );
    }
    lines.join("\n")
}

pub fn compose_scene(ctx: &AIContext, params: &SceneImageParams) -> String {
    let grounded = matching_references(&params.references, &params.scene_description, &params.characters);

    let mut builder = PromptBuilder::new().section("STYLE", style_body(params.style.as_deref(), ctx));
    for reference in &grounded {
        builder = builder.section(
            &format!("CHARACTER IDENTITY: {}", reference.name.trim()),
            reference.identity_block.trim(),
        );
    }

    let setting = &params.setting;
    let setting_body = if setting.is_empty() {
        None
    } else {
        let mut lines = Vec::new();
        if !setting.location.trim().is_empty() {
            lines.push(format!("Location: {}", setting.location.trim()));
        }
        if !setting.time_of_day.trim().is_empty() {
            lines.push(format!("Time of day: {}", setting.time_of_day.trim()));
        }
        if !setting.atmosphere.trim().is_empty() {
            lines.push(format!("Atmosphere: {}", setting.atmosphere.trim()));
        }
        Some(lines.join("\n"))
    };

    builder
        .optional("SETTING", setting_body)
        .section("SCENE", params.scene_description.trim())
        .section("CHARACTERS PRESENT", characters_present_body(&params.characters, &grounded))
        .section(
            "FRAME",
            "One single illustration in landscape orientation, artwork filling the frame edge to edge, \
             purely pictorial: the artwork is the whole image.",
        )
        .build()
}

pub fn compose_portrait(ctx: &AIContext, params: &PortraitParams) -> String {
    PromptBuilder::new()
        .section("STYLE", style_body(params.style.as_deref(), ctx))
        .section(
            "SUBJECT",
            format!("{}\n{}", params.name.trim(), params.description.trim()),
        )
        .section(
            "FRAME",
            "Head-and-shoulders portrait of exactly one person, centered, facing the viewer, \
             against a plain softly lit backdrop, purely pictorial.",
        )
        .build()
}

fn extraction_head(ctx: &AIContext, scene: &str) -> PromptBuilder {
    PromptBuilder::new()
        .section("STYLE", "Act as a precise script supervisor. Report only what the text states or clearly implies.")
        .section("STORY SO FAR", render_story_path(&ctx.active_path, EXTRACTION_PATH_BUDGET))
        .section("SCENE", scene.trim())
}

pub fn setting_extraction_prompt(ctx: &AIContext, scene: &str) -> String {
    extraction_head(ctx, scene)
        .section("TASK", "Identify where and when the scene takes place and its atmosphere.")
        .section(
            "OUTPUT FORMAT",
            "Your entire reply is one JSON object:\n\
             {\"location\": string, \"time_of_day\": string, \"atmosphere\": string}\n\
             Use an empty string for anything the text leaves open.",
        )
        .build()
}

pub fn character_extraction_prompt(ctx: &AIContext, scene: &str) -> String {
    extraction_head(ctx, scene)
        .section(
            "TASK",
            "List every person physically visible in the scene, with what they are doing and any appearance details the text gives.",
        )
        .section(
            "OUTPUT FORMAT",
            "Your entire reply is one JSON object:\n\
             {\"characters\": [{\"name\": string, \"appearance_notes\": string, \"action\": string}]}\n\
             A scene with nobody in it is {\"characters\": []}.",
        )
        .build()
}
