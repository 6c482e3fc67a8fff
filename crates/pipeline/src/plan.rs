//! Unit construction: which units a stage fans out into and what each
//! unit sends to its provider.
//!
//! Payloads reference upstream artifacts by their output refs, so a stage
//! only ever sees outputs of units that completed before it started.

use serde_json::{json, Value};
use vidgen_core::failure::{ErrorKind, UnitFailure};
use vidgen_core::steps::StepName;
use vidgen_core::units::{GenerationUnit, UnitKey, UnitSubject};
use vidgen_db::models::script::{ScriptOutline, ScriptScene};
use vidgen_db::models::video_generation::VideoGeneration;

/// Clip length requested when a scene does not specify one.
pub const DEFAULT_CLIP_SECS: f32 = 5.0;

/// Fresh units for one stage of a run over `outline`.
///
/// Image generation renders the character roster first, then one image per
/// scene. Merge and lip-sync operate on the whole run.
pub fn plan_units(step: StepName, outline: &ScriptOutline) -> Vec<GenerationUnit> {
    let scenes = (0..outline.scenes.len() as u32).map(UnitSubject::Scene);
    let subjects: Vec<UnitSubject> = match step {
        StepName::AudioGeneration | StepName::VideoGeneration => scenes.collect(),
        StepName::ImageGeneration => (0..outline.characters.len() as u32)
            .map(UnitSubject::Character)
            .chain(scenes)
            .collect(),
        StepName::AudioVideoMerge | StepName::LipSync => vec![UnitSubject::Whole],
    };

    subjects
        .into_iter()
        .map(|subject| GenerationUnit::new(UnitKey::new(step, subject)))
        .collect()
}

/// Provider payload for one unit.
///
/// Returns an `InvalidInput` failure when the unit cannot be described,
/// for instance because its scene was removed from the script.
pub fn build_payload(
    key: &UnitKey,
    generation: &VideoGeneration,
    outline: &ScriptOutline,
) -> Result<Value, UnitFailure> {
    let policy = generation.quality_tier.policy();
    let mut payload = json!({
        "unit": key.to_string(),
        "generation_id": generation.id,
        "width": policy.width,
        "height": policy.height,
        "watermark": policy.watermark,
    });

    let body = match (key.step, key.subject) {
        (StepName::AudioGeneration, UnitSubject::Scene(i)) => {
            let scene = scene(outline, i)?;
            if scene.narration.trim().is_empty() && scene.dialogue.is_none() {
                return Err(invalid(format!("scene {i} has no narration or dialogue")));
            }
            let voice = scene
                .speaker_position
                .and_then(|pos| outline.characters.iter().find(|c| c.position == pos))
                .and_then(|c| c.voice.clone());
            json!({
                "kind": "narration",
                "text": scene.narration,
                "dialogue": scene.dialogue,
                "voice": voice,
            })
        }
        (StepName::ImageGeneration, UnitSubject::Character(i)) => {
            let character = outline
                .characters
                .get(i as usize)
                .ok_or_else(|| invalid(format!("character {i} is no longer part of the script")))?;
            json!({
                "kind": "character_portrait",
                "prompt": format!("Portrait of {}: {}", character.name, character.description),
            })
        }
        (StepName::ImageGeneration, UnitSubject::Scene(i)) => {
            let scene = scene(outline, i)?;
            let character_refs: Vec<&str> = (0..outline.characters.len() as u32)
                .filter_map(|c| {
                    generation.output_of(&UnitKey::new(
                        StepName::ImageGeneration,
                        UnitSubject::Character(c),
                    ))
                })
                .collect();
            json!({
                "kind": "scene_image",
                "prompt": scene.visual_description,
                "character_refs": character_refs,
            })
        }
        (StepName::VideoGeneration, UnitSubject::Scene(i)) => {
            let scene = scene(outline, i)?;
            let duration = scene
                .duration_secs
                .unwrap_or(DEFAULT_CLIP_SECS)
                .min(policy.max_clip_duration_secs as f32);
            json!({
                "kind": "scene_clip",
                "prompt": scene.visual_description,
                "image_ref": generation.output_of(&UnitKey::new(
                    StepName::ImageGeneration,
                    UnitSubject::Scene(i),
                )),
                "duration_secs": duration,
            })
        }
        (StepName::AudioVideoMerge, UnitSubject::Whole) => {
            let tracks: Vec<Value> = (0..outline.scenes.len() as u32)
                .filter_map(|i| {
                    let clip = generation
                        .output_of(&UnitKey::new(StepName::VideoGeneration, UnitSubject::Scene(i)))?;
                    let audio = generation
                        .output_of(&UnitKey::new(StepName::AudioGeneration, UnitSubject::Scene(i)));
                    Some(json!({ "scene": i, "clip": clip, "audio": audio }))
                })
                .collect();
            if tracks.is_empty() {
                return Err(invalid("no video clips to merge"));
            }
            json!({ "kind": "merge", "tracks": tracks })
        }
        (StepName::LipSync, UnitSubject::Whole) => {
            let video_ref = generation
                .output_of(&UnitKey::new(StepName::AudioVideoMerge, UnitSubject::Whole))
                .ok_or_else(|| invalid("merged video is missing"))?;
            let audio_refs: Vec<&str> = (0..outline.scenes.len() as u32)
                .filter_map(|i| {
                    generation
                        .output_of(&UnitKey::new(StepName::AudioGeneration, UnitSubject::Scene(i)))
                })
                .collect();
            json!({ "kind": "lip_sync", "video_ref": video_ref, "audio_refs": audio_refs })
        }
        (step, subject) => {
            return Err(invalid(format!("{step} has no unit for {subject:?}")));
        }
    };

    if let (Value::Object(base), Value::Object(extra)) = (&mut payload, body) {
        base.extend(extra);
    }
    Ok(payload)
}

fn scene(outline: &ScriptOutline, index: u32) -> Result<&ScriptScene, UnitFailure> {
    outline
        .scenes
        .get(index as usize)
        .ok_or_else(|| invalid(format!("scene {index} is no longer part of the script")))
}

fn invalid(detail: impl Into<String>) -> UnitFailure {
    UnitFailure::new(ErrorKind::InvalidInput, detail)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
