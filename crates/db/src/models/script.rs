//! Read model of a script: the ordered scenes and the character roster.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use vidgen_core::types::DbId;

/// A row from the `script_scenes` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScriptScene {
    pub id: DbId,
    pub script_id: DbId,
    pub chapter_id: DbId,
    pub position: i32,
    pub visual_description: String,
    pub narration: String,
    pub dialogue: Option<String>,
    /// Position of the speaking character in the roster, if any.
    pub speaker_position: Option<i32>,
    pub duration_secs: Option<f32>,
}

/// A row from the `script_characters` table.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ScriptCharacter {
    pub id: DbId,
    pub script_id: DbId,
    pub position: i32,
    pub name: String,
    pub description: String,
    pub voice: Option<String>,
}

/// Everything the pipeline needs to build generation units for a chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptOutline {
    pub script_id: DbId,
    pub chapter_id: DbId,
    pub scenes: Vec<ScriptScene>,
    pub characters: Vec<ScriptCharacter>,
}
