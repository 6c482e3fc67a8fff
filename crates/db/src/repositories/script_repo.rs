//! Read-only access to the script read model.

use sqlx::PgPool;
use vidgen_core::types::DbId;

use crate::models::script::{ScriptCharacter, ScriptOutline, ScriptScene};

/// Loads scenes and characters for unit construction.
pub struct ScriptRepo;

impl ScriptRepo {
    /// Scenes of one chapter, in script order.
    pub async fn list_scenes(
        pool: &PgPool,
        script_id: DbId,
        chapter_id: DbId,
    ) -> Result<Vec<ScriptScene>, sqlx::Error> {
        sqlx::query_as::<_, ScriptScene>(
            "SELECT id, script_id, chapter_id, position, visual_description, narration, \
                    dialogue, speaker_position, duration_secs \
             FROM script_scenes \
             WHERE script_id = $1 AND chapter_id = $2 \
             ORDER BY position ASC",
        )
        .bind(script_id)
        .bind(chapter_id)
        .fetch_all(pool)
        .await
    }

    /// The script's character roster, in roster order.
    pub async fn list_characters(
        pool: &PgPool,
        script_id: DbId,
    ) -> Result<Vec<ScriptCharacter>, sqlx::Error> {
        sqlx::query_as::<_, ScriptCharacter>(
            "SELECT id, script_id, position, name, description, voice \
             FROM script_characters \
             WHERE script_id = $1 \
             ORDER BY position ASC",
        )
        .bind(script_id)
        .fetch_all(pool)
        .await
    }

    /// Load a chapter outline. Returns `None` when the chapter has no scenes.
    pub async fn load_outline(
        pool: &PgPool,
        script_id: DbId,
        chapter_id: DbId,
    ) -> Result<Option<ScriptOutline>, sqlx::Error> {
        let scenes = Self::list_scenes(pool, script_id, chapter_id).await?;
        if scenes.is_empty() {
            return Ok(None);
        }
        let characters = Self::list_characters(pool, script_id).await?;
        Ok(Some(ScriptOutline {
            script_id,
            chapter_id,
            scenes,
            characters,
        }))
    }
}
