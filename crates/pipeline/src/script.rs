//! Read-only access to the script a run generates from.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use vidgen_core::types::DbId;
use vidgen_db::models::script::ScriptOutline;
use vidgen_db::repositories::ScriptRepo;

use crate::store::StoreError;

#[async_trait]
pub trait ScriptSource: Send + Sync {
    /// Scenes and characters of a chapter; `None` when the chapter has no scenes.
    async fn load_outline(
        &self,
        script_id: DbId,
        chapter_id: DbId,
    ) -> Result<Option<ScriptOutline>, StoreError>;
}

pub struct PgScriptSource {
    pool: PgPool,
}

impl PgScriptSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ScriptSource for PgScriptSource {
    async fn load_outline(
        &self,
        script_id: DbId,
        chapter_id: DbId,
    ) -> Result<Option<ScriptOutline>, StoreError> {
        Ok(ScriptRepo::load_outline(&self.pool, script_id, chapter_id).await?)
    }
}

/// Fixed set of outlines held in memory.
#[derive(Default)]
pub struct StaticScriptSource {
    outlines: HashMap<(DbId, DbId), ScriptOutline>,
}

impl StaticScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outline(mut self, outline: ScriptOutline) -> Self {
        self.outlines
            .insert((outline.script_id, outline.chapter_id), outline);
        self
    }
}

#[async_trait]
impl ScriptSource for StaticScriptSource {
    async fn load_outline(
        &self,
        script_id: DbId,
        chapter_id: DbId,
    ) -> Result<Option<ScriptOutline>, StoreError> {
        Ok(self
            .outlines
            .get(&(script_id, chapter_id))
            .filter(|o| !o.scenes.is_empty())
            .cloned())
    }
}
