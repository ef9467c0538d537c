//! Save-file persistence: export, import and metadata peeking.
//!
//! A save is one self-contained JSON document. Rollback history is stripped
//! at export time; effective stats are recomputed on load rather than
//! trusted from storage.

use crate::world::{GameState, WorldSettings};
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;
use tokio::fs;

/// Errors from persistence operations.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },
}

/// Current save file version.
const SAVE_VERSION: u32 = 1;

/// A saved game with everything needed to resume play.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SavedGame {
    /// Save format version for compatibility checking.
    pub version: u32,

    /// When the save was created (unix seconds as text).
    pub saved_at: String,

    /// Metadata readable without touching the full state.
    pub metadata: SaveMetadata,

    /// The full game state, with rollback history stripped.
    pub state: GameState,

    /// The world configuration.
    pub settings: WorldSettings,
}

/// Metadata about the save file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub character_name: String,
    pub genre: String,
    pub turn_count: usize,
    pub days_elapsed: u32,
    #[serde(default)]
    pub saved_at: String,
}

impl SavedGame {
    /// Package the live state for export. History is dropped here: it is a
    /// rollback aid, not part of the portable save.
    pub fn new(state: &GameState, settings: &WorldSettings) -> Self {
        let mut state = state.clone();
        state.history.clear();

        let saved_at = epoch_now();
        let metadata = SaveMetadata {
            character_name: state.character.display_name.clone(),
            genre: settings.genre.name().to_string(),
            turn_count: state.turns.len(),
            days_elapsed: state.game_time.day as u32,
            saved_at: saved_at.clone(),
        };

        Self {
            version: SAVE_VERSION,
            saved_at,
            metadata,
            state,
            settings: settings.clone(),
        }
    }

    /// Unpack into live state, rehydrating characters so effective stats
    /// are rederived and identity defaults filled.
    pub fn into_parts(mut self) -> (GameState, WorldSettings) {
        self.state.hydrate();
        (self.state, self.settings)
    }

    /// Save to a JSON file.
    pub async fn save_json(&self, path: impl AsRef<Path>) -> Result<(), PersistError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Load from a JSON file.
    pub async fn load_json(path: impl AsRef<Path>) -> Result<Self, PersistError> {
        let content = fs::read_to_string(path).await?;
        let saved: Self = serde_json::from_str(&content)?;

        if saved.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: saved.version,
            });
        }

        Ok(saved)
    }

    /// Read a save's metadata without deserializing the full state.
    pub async fn peek_metadata(path: impl AsRef<Path>) -> Result<SaveMetadata, PersistError> {
        let content = fs::read_to_string(path).await?;

        #[derive(Deserialize)]
        struct Partial {
            version: u32,
            metadata: SaveMetadata,
        }

        let partial: Partial = serde_json::from_str(&content)?;

        if partial.version != SAVE_VERSION {
            return Err(PersistError::VersionMismatch {
                expected: SAVE_VERSION,
                found: partial.version,
            });
        }

        Ok(partial.metadata)
    }
}

/// Merge an imported save into a collection, overwriting on save-id
/// collision. Confirmation of the overwrite is the caller's concern.
pub fn merge_import(saves: &mut Vec<SavedGame>, incoming: SavedGame) {
    match saves
        .iter_mut()
        .find(|s| s.state.save_id == incoming.state.save_id)
    {
        Some(existing) => *existing = incoming,
        None => saves.push(incoming),
    }
}

/// Information about a save file on disk.
#[derive(Debug, Clone)]
pub struct SaveInfo {
    pub path: String,
    pub metadata: SaveMetadata,
}

/// List all readable save files in a directory.
pub async fn list_saves(dir: impl AsRef<Path>) -> Result<Vec<SaveInfo>, PersistError> {
    let mut saves = Vec::new();
    let mut entries = fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().map(|e| e == "json").unwrap_or(false) {
            if let Ok(metadata) = SavedGame::peek_metadata(&path).await {
                saves.push(SaveInfo {
                    path: path.to_string_lossy().to_string(),
                    metadata,
                });
            }
        }
    }

    saves.sort_by(|a, b| b.metadata.saved_at.cmp(&a.metadata.saved_at));
    Ok(saves)
}

/// Auto-save file name for a character.
pub fn auto_save_path(base_dir: impl AsRef<Path>, character_name: &str) -> std::path::PathBuf {
    let sanitized = character_name
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>();
    base_dir.as_ref().join(format!("{sanitized}_autosave.json"))
}

/// Current timestamp as unix seconds.
fn epoch_now() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", now.as_secs())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::{Character, Item, Stats};
    use crate::genre::Genre;

    fn sample() -> (GameState, WorldSettings) {
        let mut character = Character::new("Hero");
        character.base_stats = Stats::new(10, 10, 10, 10, 10, 10);
        character.equip(
            "weapon",
            Item {
                id: "blade".to_string(),
                name: "Blade".to_string(),
                description: String::new(),
                effects: Stats::new(4, 0, 0, 0, 0, 0),
            },
        );
        let mut state = GameState::new(character);
        state.history.push(state.snapshot());
        (state, WorldSettings::new(Genre::Cultivation))
    }

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("{name}-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_export_strips_history() {
        let (state, settings) = sample();
        assert!(!state.history.is_empty());

        let saved = SavedGame::new(&state, &settings);
        assert!(saved.state.history.is_empty());
        assert_eq!(saved.metadata.character_name, "Hero");
        assert_eq!(saved.metadata.genre, "cultivation");
    }

    #[test]
    fn test_load_rederives_stats() {
        let (state, settings) = sample();
        let mut saved = SavedGame::new(&state, &settings);
        // Simulate a tampered or stale persisted effective stat.
        saved.state.character.stats.strength = 999;

        let (loaded, _) = saved.into_parts();
        assert_eq!(loaded.character.stats.strength, 14);
    }

    #[test]
    fn test_merge_import_overwrites_by_id() {
        let (state, settings) = sample();
        let mut saves = vec![SavedGame::new(&state, &settings)];

        let mut modified = state.clone();
        modified.total_token_count = 777;
        merge_import(&mut saves, SavedGame::new(&modified, &settings));
        assert_eq!(saves.len(), 1);
        assert_eq!(saves[0].state.total_token_count, 777);

        let other = GameState::new(Character::new("Other"));
        merge_import(&mut saves, SavedGame::new(&other, &settings));
        assert_eq!(saves.len(), 2);
    }

    #[tokio::test]
    async fn test_json_roundtrip() {
        let (state, settings) = sample();
        let saved = SavedGame::new(&state, &settings);
        let path = temp_path("saga-roundtrip");

        saved.save_json(&path).await.unwrap();
        let loaded = SavedGame::load_json(&path).await.unwrap();
        let _ = fs::remove_file(&path).await;

        assert_eq!(loaded.state.save_id, state.save_id);
        assert_eq!(loaded.metadata.turn_count, 0);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let (state, settings) = sample();
        let mut saved = SavedGame::new(&state, &settings);
        saved.version = 99;
        let path = temp_path("saga-version");

        let content = serde_json::to_string(&saved).unwrap();
        fs::write(&path, content).await.unwrap();

        let result = SavedGame::load_json(&path).await;
        let _ = fs::remove_file(&path).await;
        assert!(matches!(
            result,
            Err(PersistError::VersionMismatch { found: 99, .. })
        ));
    }

    #[tokio::test]
    async fn test_peek_metadata() {
        let (state, settings) = sample();
        let saved = SavedGame::new(&state, &settings);
        let path = temp_path("saga-peek");

        saved.save_json(&path).await.unwrap();
        let metadata = SavedGame::peek_metadata(&path).await.unwrap();
        let _ = fs::remove_file(&path).await;

        assert_eq!(metadata.character_name, "Hero");
    }

    #[test]
    fn test_auto_save_path_sanitizes() {
        let path = auto_save_path("/saves", "Vô Danh!?");
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.ends_with("_autosave.json"));
        assert!(!name.contains('!'));
        assert!(!name.contains('?'));
    }
}
