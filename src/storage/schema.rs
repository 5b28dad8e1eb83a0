//! Database schema constants.
//!
//! This module contains the SQL schema for the SQLite storage backend.
//! Every statement is idempotent (`IF NOT EXISTS`).

/// SQL schema for creating the projects table.
pub const CREATE_PROJECTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id                  TEXT PRIMARY KEY,
    name                TEXT NOT NULL,
    default_checkpoint  TEXT,
    prompt_template     TEXT NOT NULL,
    negative_prompt     TEXT,
    created_at          TEXT NOT NULL
)
"#;

/// SQL schema for creating the characters table.
pub const CREATE_CHARACTERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS characters (
    id                      TEXT PRIMARY KEY,
    project_id              TEXT NOT NULL REFERENCES projects(id),
    slug                    TEXT NOT NULL,
    name                    TEXT NOT NULL,
    design_prompt           TEXT NOT NULL DEFAULT '',
    checkpoint              TEXT,
    replenish_target        INTEGER,
    replenish_enabled       INTEGER NOT NULL DEFAULT 1,
    training_dataset_path   TEXT,
    model_path              TEXT,
    training_status         TEXT NOT NULL DEFAULT 'not_started',
    training_error          TEXT,
    created_at              TEXT NOT NULL,
    UNIQUE(project_id, slug)
)
"#;

/// SQL schema for creating the generated_images table.
pub const CREATE_GENERATED_IMAGES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generated_images (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    character_slug  TEXT NOT NULL,
    filename        TEXT NOT NULL,
    review_status   TEXT NOT NULL DEFAULT 'pending'
                    CHECK (review_status IN ('pending', 'approved', 'rejected')),
    quality_score   REAL CHECK (quality_score IS NULL OR (quality_score >= 0.0 AND quality_score <= 1.0)),
    issues          TEXT NOT NULL DEFAULT '[]',
    caption         TEXT,
    score_attempts  INTEGER NOT NULL DEFAULT 0,
    score_error     TEXT,
    checkpoint      TEXT NOT NULL,
    sampler         TEXT NOT NULL,
    steps           INTEGER NOT NULL,
    seed            INTEGER,
    job_id          TEXT,
    feedback        TEXT,
    created_at      TEXT NOT NULL,
    reviewed_at     TEXT
)
"#;

/// SQL schema for creating the generation_jobs table.
pub const CREATE_GENERATION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS generation_jobs (
    id              TEXT PRIMARY KEY,
    project_id      TEXT NOT NULL REFERENCES projects(id),
    character_slug  TEXT NOT NULL,
    batch_size      INTEGER NOT NULL CHECK (batch_size > 0),
    prompt          TEXT NOT NULL,
    negative_prompt TEXT,
    params          TEXT NOT NULL,
    origin          TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'pending'
                    CHECK (status IN ('pending', 'generating', 'completed', 'failed')),
    backend_handle  TEXT,
    error_message   TEXT,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL
)
"#;

/// SQL schema for creating the pipeline_entries table.
pub const CREATE_PIPELINE_ENTRIES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_entries (
    entity_type TEXT NOT NULL CHECK (entity_type IN ('project', 'character')),
    entity_id   TEXT NOT NULL,
    phase       TEXT NOT NULL,
    position    INTEGER NOT NULL,
    status      TEXT NOT NULL
                CHECK (status IN ('pending', 'active', 'completed', 'skipped', 'failed')),
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (entity_type, entity_id, phase)
)
"#;

/// SQL schema for creating the pipeline_audit table.
pub const CREATE_PIPELINE_AUDIT_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_audit (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    phase       TEXT NOT NULL,
    from_status TEXT NOT NULL,
    to_status   TEXT NOT NULL,
    actor       TEXT NOT NULL CHECK (actor IN ('auto', 'operator')),
    reason      TEXT NOT NULL,
    at          TEXT NOT NULL
)
"#;

/// SQL schema for creating the scenes table.
pub const CREATE_SCENES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS scenes (
    id                      TEXT PRIMARY KEY,
    project_id              TEXT NOT NULL REFERENCES projects(id),
    title                   TEXT NOT NULL,
    target_duration_seconds REAL,
    actual_duration_seconds REAL,
    final_video_path        TEXT,
    assembled_shot_count    INTEGER,
    updated_at              TEXT NOT NULL
)
"#;

/// SQL schema for creating the shots table.
pub const CREATE_SHOTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS shots (
    id                      TEXT PRIMARY KEY,
    scene_id                TEXT NOT NULL REFERENCES scenes(id) ON DELETE CASCADE,
    shot_number             INTEGER NOT NULL,
    shot_type               TEXT NOT NULL,
    camera_angle            TEXT NOT NULL,
    duration_seconds        REAL NOT NULL,
    motion_prompt           TEXT NOT NULL,
    source_image_path       TEXT,
    seed                    INTEGER,
    steps                   INTEGER,
    engine                  TEXT NOT NULL,
    transition_kind         TEXT NOT NULL DEFAULT 'cut',
    transition_duration     REAL NOT NULL DEFAULT 0,
    status                  TEXT NOT NULL DEFAULT 'draft'
                            CHECK (status IN ('draft', 'pending', 'generating', 'completed', 'failed')),
    backend_handle          TEXT,
    output_video_path       TEXT,
    error_message           TEXT,
    quality_score           REAL,
    generation_time_seconds REAL,
    updated_at              TEXT NOT NULL,
    UNIQUE(scene_id, shot_number)
)
"#;

/// SQL schema for creating the episodes table.
pub const CREATE_EPISODES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS episodes (
    id                      TEXT PRIMARY KEY,
    project_id              TEXT NOT NULL REFERENCES projects(id),
    title                   TEXT NOT NULL,
    status                  TEXT NOT NULL DEFAULT 'draft'
                            CHECK (status IN ('draft', 'assembled', 'published')),
    final_video_path        TEXT,
    actual_duration_seconds REAL,
    scenes_missing          TEXT NOT NULL DEFAULT '[]',
    updated_at              TEXT NOT NULL
)
"#;

/// SQL schema for creating the episode_scenes table.
///
/// The scene reference is non-owning; deleting a referenced scene is
/// rejected by the foreign key.
pub const CREATE_EPISODE_SCENES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS episode_scenes (
    episode_id          TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
    scene_id            TEXT NOT NULL REFERENCES scenes(id) ON DELETE RESTRICT,
    position            INTEGER NOT NULL,
    transition_kind     TEXT NOT NULL DEFAULT 'cut',
    transition_duration REAL NOT NULL DEFAULT 0,
    PRIMARY KEY (episode_id, position)
)
"#;

/// SQL schema for creating the settings table.
pub const CREATE_SETTINGS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS settings (
    key         TEXT PRIMARY KEY,
    value       TEXT NOT NULL,
    updated_at  TEXT NOT NULL
)
"#;

/// SQL for creating indexes.
pub const CREATE_INDEXES: &str = r#"
CREATE INDEX IF NOT EXISTS idx_images_character ON generated_images(project_id, character_slug);
CREATE INDEX IF NOT EXISTS idx_images_status ON generated_images(review_status);
CREATE INDEX IF NOT EXISTS idx_images_unscored ON generated_images(score_attempts, created_at)
    WHERE quality_score IS NULL;
CREATE INDEX IF NOT EXISTS idx_jobs_character_status ON generation_jobs(project_id, character_slug, status);
CREATE INDEX IF NOT EXISTS idx_pipeline_status ON pipeline_entries(status);
CREATE INDEX IF NOT EXISTS idx_audit_entity ON pipeline_audit(entity_type, entity_id);
CREATE INDEX IF NOT EXISTS idx_shots_scene ON shots(scene_id);
CREATE INDEX IF NOT EXISTS idx_shots_status ON shots(status);
CREATE INDEX IF NOT EXISTS idx_episode_scenes_scene ON episode_scenes(scene_id)
"#;

/// Returns all schema creation statements in dependency order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_PROJECTS_TABLE,
        CREATE_CHARACTERS_TABLE,
        CREATE_GENERATED_IMAGES_TABLE,
        CREATE_GENERATION_JOBS_TABLE,
        CREATE_PIPELINE_ENTRIES_TABLE,
        CREATE_PIPELINE_AUDIT_TABLE,
        CREATE_SCENES_TABLE,
        CREATE_SHOTS_TABLE,
        CREATE_EPISODES_TABLE,
        CREATE_EPISODE_SCENES_TABLE,
        CREATE_SETTINGS_TABLE,
        CREATE_INDEXES,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_statements_are_idempotent() {
        for statement in all_schema_statements() {
            assert!(
                statement.contains("IF NOT EXISTS"),
                "statement is not idempotent: {}",
                statement
            );
        }
    }

    #[test]
    fn test_scene_reference_is_restricted() {
        assert!(CREATE_EPISODE_SCENES_TABLE.contains("ON DELETE RESTRICT"));
    }
}
