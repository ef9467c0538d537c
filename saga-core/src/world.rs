//! The game world: root state aggregate, calendar, turn history and the
//! world configuration chosen at creation time.

use crate::character::Character;
use crate::genre::Genre;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

// ============================================================================
// Time
// ============================================================================

/// In-game calendar: 60-minute hours, 24-hour days, 30-day months,
/// 12-month years. Never regresses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GameTime {
    pub year: i32,
    pub month: u8,
    pub day: u8,
    pub hour: u8,
    pub minute: u8,
    pub weather: String,
}

impl GameTime {
    pub fn new(year: i32, month: u8, day: u8, hour: u8, minute: u8) -> Self {
        Self {
            year,
            month,
            day,
            hour,
            minute,
            weather: "clear".to_string(),
        }
    }

    pub fn advance_minutes(&mut self, minutes: u32) {
        let total_minutes = self.minute as u32 + minutes;
        self.minute = (total_minutes % 60) as u8;
        let hours_to_add = total_minutes / 60;
        self.advance_hours(hours_to_add);
    }

    pub fn advance_hours(&mut self, hours: u32) {
        let total_hours = self.hour as u32 + hours;
        self.hour = (total_hours % 24) as u8;
        let days_to_add = total_hours / 24;
        self.advance_days(days_to_add);
    }

    pub fn advance_days(&mut self, days: u32) {
        let total_days = self.day as u32 + days;
        self.day = ((total_days - 1) % 30 + 1) as u8;
        let months_to_add = (total_days - 1) / 30;
        self.advance_months(months_to_add);
    }

    pub fn advance_months(&mut self, months: u32) {
        let total_months = self.month as u32 + months;
        self.month = ((total_months - 1) % 12 + 1) as u8;
        let years_to_add = (total_months - 1) / 12;
        self.year += years_to_add as i32;
    }

    pub fn is_daytime(&self) -> bool {
        self.hour >= 6 && self.hour < 18
    }

    pub fn time_of_day(&self) -> &'static str {
        match self.hour {
            5..=7 => "dawn",
            8..=11 => "morning",
            12..=13 => "midday",
            14..=17 => "afternoon",
            18..=20 => "evening",
            _ => "night",
        }
    }
}

impl Default for GameTime {
    fn default() -> Self {
        Self::new(1, 1, 1, 8, 0)
    }
}

// ============================================================================
// Knowledge base
// ============================================================================

/// The kinds of entities tracked in the knowledge base. The tag form is the
/// marker used in `[TAG:Name]` mentions inside turn summaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Npc,
    Location,
    Faction,
    Monster,
    Pc,
}

impl EntityKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EntityKind::Npc => "NPC",
            EntityKind::Location => "LOC",
            EntityKind::Faction => "FACTION",
            EntityKind::Monster => "MONSTER",
            EntityKind::Pc => "PC",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "NPC" => Some(EntityKind::Npc),
            "LOC" | "LOCATION" => Some(EntityKind::Location),
            "FACTION" => Some(EntityKind::Faction),
            "MONSTER" => Some(EntityKind::Monster),
            "PC" => Some(EntityKind::Pc),
            _ => None,
        }
    }
}

/// A non-acting world entity (location or faction).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldEntity {
    pub id: String,
    pub name: String,
    pub display_name: String,
    pub description: String,
}

impl WorldEntity {
    /// Fill missing identity fields, mirroring character hydration.
    pub fn hydrate(&mut self) {
        if self.id.trim().is_empty() {
            self.id = Uuid::new_v4().to_string();
        }
        if self.name.trim().is_empty() && !self.display_name.trim().is_empty() {
            self.name = self.display_name.clone();
        }
        if self.display_name.trim().is_empty() && !self.name.trim().is_empty() {
            self.display_name = self.name.clone();
        }
        if self.name.trim().is_empty() {
            self.name = "Unknown".to_string();
            self.display_name = "Unknown".to_string();
        }
    }
}

/// Every non-player entity known to the session, grouped by kind.
/// Append-only except for in-place stat edits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeBase {
    pub npcs: Vec<Character>,
    pub locations: Vec<WorldEntity>,
    pub factions: Vec<WorldEntity>,
    pub monsters: Vec<Character>,
    pub pcs: Vec<Character>,
}

impl KnowledgeBase {
    /// Find an acting entity (NPC, monster or companion PC) by id.
    pub fn find_actor(&self, id: &str) -> Option<&Character> {
        self.npcs
            .iter()
            .chain(self.monsters.iter())
            .chain(self.pcs.iter())
            .find(|c| c.id == id)
    }

    /// Mutable variant of [`KnowledgeBase::find_actor`].
    pub fn find_actor_mut(&mut self, id: &str) -> Option<&mut Character> {
        self.npcs
            .iter_mut()
            .chain(self.monsters.iter_mut())
            .chain(self.pcs.iter_mut())
            .find(|c| c.id == id)
    }

    /// Find an acting entity by name or display name, case-insensitive.
    pub fn find_actor_by_name(&self, name: &str) -> Option<&Character> {
        let lower = name.to_lowercase();
        self.npcs
            .iter()
            .chain(self.monsters.iter())
            .chain(self.pcs.iter())
            .find(|c| c.name.to_lowercase() == lower || c.display_name.to_lowercase() == lower)
    }

    /// Names and display names of every known entity, for mention matching.
    pub fn all_names(&self) -> Vec<(EntityKind, String)> {
        let mut names = Vec::new();
        let mut add = |kind: EntityKind, name: &str, display: &str| {
            names.push((kind, name.to_string()));
            if display != name {
                names.push((kind, display.to_string()));
            }
        };
        for c in &self.npcs {
            add(EntityKind::Npc, &c.name, &c.display_name);
        }
        for l in &self.locations {
            add(EntityKind::Location, &l.name, &l.display_name);
        }
        for f in &self.factions {
            add(EntityKind::Faction, &f.name, &f.display_name);
        }
        for m in &self.monsters {
            add(EntityKind::Monster, &m.name, &m.display_name);
        }
        for p in &self.pcs {
            add(EntityKind::Pc, &p.name, &p.display_name);
        }
        names
    }

    /// Hydrate every entry; called on load and after merges.
    pub fn hydrate(&mut self) {
        for c in self
            .npcs
            .iter_mut()
            .chain(self.monsters.iter_mut())
            .chain(self.pcs.iter_mut())
        {
            c.hydrate();
        }
        for e in self.locations.iter_mut().chain(self.factions.iter_mut()) {
            e.hydrate();
        }
    }
}

// ============================================================================
// Turns, actions and memories
// ============================================================================

/// Who produced a message inside a turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum MessageKind {
    PlayerAction,
    Narration,
    SystemNotice,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnMessage {
    pub kind: MessageKind,
    pub text: String,
}

/// One resolved exchange. Immutable once appended to the turn log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: String,
    pub story: String,
    pub messages: Vec<TurnMessage>,
    pub chosen_action: String,
    pub token_count: u64,
    pub summary: Option<String>,
    pub world_event: Option<String>,
}

/// A suggested next action, replaced wholesale each turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SuggestedAction {
    pub description: String,
    /// Optional odds annotation supplied by the model, e.g. "70%".
    pub success_chance: Option<String>,
    pub risk: Option<String>,
}

/// A short-term memory snippet extracted from a turn summary.
/// Bounded by manual pinning, not auto-evicted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNote {
    pub text: String,
    pub pinned: bool,
}

// ============================================================================
// Quests and auxiliary collections
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum QuestStatus {
    #[default]
    Active,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestObjective {
    pub description: String,
    pub completed: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Quest {
    pub id: String,
    pub title: String,
    pub description: String,
    pub objectives: Vec<QuestObjective>,
    pub status: QuestStatus,
}

/// An item listed in a sect store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreListing {
    pub name: String,
    pub price: i64,
    pub stock: i64,
}

/// A sect trading post (cultivation genre).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SectStore {
    pub id: String,
    pub name: String,
    pub inventory: Vec<StoreListing>,
}

/// A guild record (cultivation genre).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Guild {
    pub id: String,
    pub name: String,
    pub members: Vec<String>,
    pub reputation: i32,
}

// ============================================================================
// World settings
// ============================================================================

/// Status of a canon timeline event (fanfiction genre).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CanonEventStatus {
    #[default]
    Pending,
    Unfolding,
    Diverged,
    Resolved,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonEvent {
    pub title: String,
    pub status: CanonEventStatus,
}

/// Canon tracking for fanfiction worlds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonSettings {
    pub timeline: Vec<CanonEvent>,
    /// How close the story still is to its source canon, 0..=100.
    pub compatibility: u8,
    pub intervention_points: i32,
}

impl Default for CanonSettings {
    fn default() -> Self {
        Self {
            timeline: Vec::new(),
            compatibility: 100,
            intervention_points: 0,
        }
    }
}

/// Configuration chosen at world creation. Mutable only in small increments
/// during play, through the same delta-merge path as the game state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorldSettings {
    pub genre: Genre,
    pub setting: String,
    pub difficulty: String,
    pub narrative_voice: String,
    pub writing_style: String,
    pub lore_rules: Vec<String>,
    /// Present only for fanfiction worlds.
    pub canon: Option<CanonSettings>,
}

impl WorldSettings {
    pub fn new(genre: Genre) -> Self {
        Self {
            genre,
            difficulty: "balanced".to_string(),
            narrative_voice: "second person".to_string(),
            ..Self::default()
        }
    }

    pub fn with_setting(mut self, setting: impl Into<String>) -> Self {
        self.setting = setting.into();
        self
    }

    pub fn with_difficulty(mut self, difficulty: impl Into<String>) -> Self {
        self.difficulty = difficulty.into();
        self
    }

    pub fn with_writing_style(mut self, style: impl Into<String>) -> Self {
        self.writing_style = style.into();
        self
    }

    pub fn with_canon(mut self, canon: CanonSettings) -> Self {
        self.canon = Some(canon);
        self
    }
}

/// Application-level settings that shape requests rather than the world.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    pub model: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    /// When true, memories extracted from turn summaries start pinned.
    pub auto_pin_memories: bool,
    /// Permits mature scene content in generated narrative.
    pub allow_mature_content: bool,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            model: "gemini-2.5-flash".to_string(),
            temperature: 0.9,
            max_output_tokens: 8192,
            auto_pin_memories: false,
            allow_mature_content: false,
        }
    }
}

// ============================================================================
// Game state
// ============================================================================

/// The root state aggregate for one play session. A single live instance is
/// owned by the session controller; every turn produces a new value from the
/// previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GameState {
    pub save_id: String,
    pub character: Character,
    pub knowledge_base: KnowledgeBase,

    pub turns: Vec<Turn>,
    pub actions: Vec<SuggestedAction>,
    pub memories: Vec<MemoryNote>,
    /// Pre-turn snapshots for rollback. Stripped at export time.
    pub history: Vec<GameState>,

    pub game_time: GameTime,

    pub is_in_combat: bool,
    /// Ordered entity ids; the player's id is included when present.
    pub combatants: Vec<String>,
    pub combat_turn_number: u32,
    pub combat_log: Vec<String>,

    pub is_intimate_scene: bool,
    pub intimacy_step: u32,

    pub quests: Vec<Quest>,
    pub sect_stores: Vec<SectStore>,
    pub guilds: Vec<Guild>,
    /// Genre-specific auxiliary records keyed by collection name.
    pub world_state: BTreeMap<String, serde_json::Value>,

    pub total_token_count: u64,
}

impl GameState {
    pub fn new(character: Character) -> Self {
        Self {
            save_id: Uuid::new_v4().to_string(),
            character,
            game_time: GameTime::default(),
            ..Self::default()
        }
    }

    /// A copy suitable for pushing onto `history`: its own history is
    /// dropped so snapshots do not nest.
    pub fn snapshot(&self) -> GameState {
        let mut copy = self.clone();
        copy.history.clear();
        copy
    }

    /// Pin or unpin a short-term memory note. Returns false when the index
    /// is out of range.
    pub fn set_memory_pinned(&mut self, index: usize, pinned: bool) -> bool {
        match self.memories.get_mut(index) {
            Some(note) => {
                note.pinned = pinned;
                true
            }
            None => false,
        }
    }

    /// Reset the combat sub-state to its steady-state form.
    pub fn clear_combat(&mut self) {
        self.is_in_combat = false;
        self.combat_turn_number = 0;
        self.combatants.clear();
        self.combat_log.clear();
    }

    /// Hydrate the player and every knowledge-base entity. Called after
    /// load and after any merge that may have introduced partial records.
    pub fn hydrate(&mut self) {
        if self.save_id.trim().is_empty() {
            self.save_id = Uuid::new_v4().to_string();
        }
        // Day and month are 1-based; zero here would break the rollover
        // arithmetic.
        if self.game_time.day == 0 {
            self.game_time.day = 1;
        }
        if self.game_time.month == 0 {
            self.game_time.month = 1;
        }
        self.character.hydrate();
        self.knowledge_base.hydrate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_minutes_rollover() {
        let mut time = GameTime::new(1, 1, 1, 23, 50);
        time.advance_minutes(1500);

        // 1500 minutes = 25h; 23:50 + 25h -> day 3, 00:50.
        assert_eq!(time.minute, 50);
        assert_eq!(time.hour, 0);
        assert_eq!(time.day, 3);
        assert_eq!(time.month, 1);
    }

    #[test]
    fn test_advance_minutes_month_rollover() {
        let mut time = GameTime::new(1, 1, 30, 23, 50);
        time.advance_minutes(20);

        assert_eq!(time.minute, 10);
        assert_eq!(time.hour, 0);
        assert_eq!(time.day, 1);
        assert_eq!(time.month, 2);
        assert_eq!(time.year, 1);
    }

    #[test]
    fn test_advance_months_year_rollover() {
        let mut time = GameTime::new(3, 12, 30, 0, 0);
        time.advance_days(1);

        assert_eq!(time.day, 1);
        assert_eq!(time.month, 1);
        assert_eq!(time.year, 4);
    }

    #[test]
    fn test_time_never_produces_invalid_fields() {
        let mut time = GameTime::default();
        for step in [1u32, 59, 60, 61, 1439, 1440, 43199, 43200] {
            time.advance_minutes(step);
            assert!(time.minute < 60);
            assert!(time.hour < 24);
            assert!((1..=30).contains(&time.day));
            assert!((1..=12).contains(&time.month));
        }
    }

    #[test]
    fn test_hydrate_normalizes_zeroed_calendar() {
        let mut state = GameState::default();
        state.game_time.day = 0;
        state.game_time.month = 0;
        state.hydrate();

        assert_eq!(state.game_time.day, 1);
        assert_eq!(state.game_time.month, 1);
        assert!(!state.save_id.is_empty());
    }

    #[test]
    fn test_snapshot_drops_history() {
        let mut state = GameState::new(Character::new("Hero"));
        state.history.push(GameState::default());

        let snap = state.snapshot();
        assert!(snap.history.is_empty());
        assert_eq!(snap.save_id, state.save_id);
    }

    #[test]
    fn test_clear_combat_restores_steady_state() {
        let mut state = GameState::new(Character::new("Hero"));
        state.is_in_combat = true;
        state.combat_turn_number = 4;
        state.combatants = vec!["a".to_string(), "b".to_string()];
        state.combat_log.push("clash".to_string());

        state.clear_combat();

        assert!(!state.is_in_combat);
        assert_eq!(state.combat_turn_number, 0);
        assert!(state.combatants.is_empty());
        assert!(state.combat_log.is_empty());
    }

    #[test]
    fn test_set_memory_pinned() {
        let mut state = GameState::new(Character::new("Hero"));
        state.memories.push(MemoryNote {
            text: "a quiet promise".to_string(),
            pinned: false,
        });

        assert!(state.set_memory_pinned(0, true));
        assert!(state.memories[0].pinned);
        assert!(state.set_memory_pinned(0, false));
        assert!(!state.memories[0].pinned);
        assert!(!state.set_memory_pinned(5, true));
    }

    #[test]
    fn test_knowledge_base_name_lookup() {
        let mut kb = KnowledgeBase::default();
        let mut lan = Character::new("Lan");
        lan.display_name = "Tieu Lan".to_string();
        kb.npcs.push(lan);

        assert!(kb.find_actor_by_name("lan").is_some());
        assert!(kb.find_actor_by_name("TIEU LAN").is_some());
        assert!(kb.find_actor_by_name("Mystery").is_none());
    }

    #[test]
    fn test_entity_kind_tags() {
        assert_eq!(EntityKind::Npc.tag(), "NPC");
        assert_eq!(EntityKind::from_tag("LOC"), Some(EntityKind::Location));
        assert_eq!(EntityKind::from_tag("ITEM"), None);
    }
}
