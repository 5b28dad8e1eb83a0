//! Persisted replenishment switches and targets.
//!
//! The global switch and the global target live in the `settings` table so
//! operator changes survive restarts. Per-character values live on the
//! character row and take precedence.

use crate::storage::{Character, Database, DatabaseError};

const ENABLED_KEY: &str = "replenish.enabled";
const TARGET_KEY: &str = "replenish.target";

/// Reader/writer for replenishment settings.
#[derive(Debug, Clone)]
pub struct ReplenishSettings {
    db: Database,
    default_target: u32,
    default_enabled: bool,
}

impl ReplenishSettings {
    /// `default_target` and `default_enabled` apply until an operator
    /// stores a value.
    pub fn new(db: Database, default_target: u32, default_enabled: bool) -> Self {
        Self {
            db,
            default_target,
            default_enabled,
        }
    }

    pub async fn global_enabled(&self) -> Result<bool, DatabaseError> {
        Ok(match self.db.get_setting(ENABLED_KEY).await? {
            Some(value) => value == "true",
            None => self.default_enabled,
        })
    }

    pub async fn set_global_enabled(&self, enabled: bool) -> Result<(), DatabaseError> {
        self.db
            .set_setting(ENABLED_KEY, if enabled { "true" } else { "false" })
            .await
    }

    pub async fn global_target(&self) -> Result<u32, DatabaseError> {
        let stored = self.db.get_setting(TARGET_KEY).await?;
        Ok(stored
            .and_then(|value| value.parse().ok())
            .unwrap_or(self.default_target))
    }

    pub async fn set_global_target(&self, target: u32) -> Result<(), DatabaseError> {
        self.db.set_setting(TARGET_KEY, &target.to_string()).await
    }

    /// The character's own target, else the global one.
    pub async fn target_for(&self, character: &Character) -> Result<u32, DatabaseError> {
        match character.replenish_target {
            Some(target) => Ok(target),
            None => self.global_target().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::test_support::*;

    #[tokio::test]
    async fn test_defaults_until_stored() {
        let (_dir, db) = temp_db().await;
        let settings = ReplenishSettings::new(db, 40, true);

        assert!(settings.global_enabled().await.unwrap());
        assert_eq!(settings.global_target().await.unwrap(), 40);

        settings.set_global_enabled(false).await.unwrap();
        settings.set_global_target(12).await.unwrap();
        assert!(!settings.global_enabled().await.unwrap());
        assert_eq!(settings.global_target().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_character_target_overrides_global() {
        let (_dir, db) = temp_db().await;
        let (_, mut character) = project_with_character(&db, "mira").await;
        let settings = ReplenishSettings::new(db, 40, true);

        assert_eq!(settings.target_for(&character).await.unwrap(), 40);
        character.replenish_target = Some(15);
        assert_eq!(settings.target_for(&character).await.unwrap(), 15);
    }
}
