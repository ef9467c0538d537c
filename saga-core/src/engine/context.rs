//! Context assembler: turns the live game state into a bounded prompt.
//!
//! Long free-text fields (backstories, entity descriptions, the full turn
//! history) never travel; what the model sees is a structural digest plus a
//! handful of retrieved long-term memories. The assembler never touches the
//! network.

use crate::character::Character;
use crate::engine::memory_index::{ChunkStore, MemoryIndex};
use crate::engine::reducer;
use crate::world::{AppSettings, GameState, GameTime, QuestStatus, WorldSettings};
use serde::Serialize;

/// How many recent turns are digested into the prompt.
const RECENT_TURNS: usize = 4;

/// Character cap for an un-summarized story digest.
const STORY_DIGEST_CHARS: usize = 280;

/// The opaque payload handed to the request executor.
#[derive(Debug, Clone)]
pub struct PromptPayload {
    pub system: String,
    pub user: String,
    pub schema: serde_json::Value,
}

/// Builds prompts from state, settings and retrieved memory.
#[derive(Debug, Clone, Default)]
pub struct ContextAssembler;

impl ContextAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble the prompt for one player turn.
    ///
    /// `special_context`, when present, is injected as a priority
    /// instruction ahead of the player's literal action, used for
    /// out-of-band beats such as narrating a finished combat.
    pub fn build_turn_prompt<S: ChunkStore>(
        &self,
        state: &GameState,
        settings: &WorldSettings,
        app: &AppSettings,
        action: &str,
        special_context: Option<&str>,
        index: &MemoryIndex<S>,
    ) -> PromptPayload {
        let mut system = self.build_system(settings);
        if !app.allow_mature_content {
            system.push_str("Keep all scene content suitable for a general audience.\n");
        }

        let mut user = String::new();
        user.push_str("## World State\n");
        let digest = PromptState::from_state(state);
        user.push_str(
            &serde_json::to_string(&digest).unwrap_or_else(|_| "{}".to_string()),
        );
        user.push('\n');

        user.push_str("\n## Relevant Long-Term Memory\n");
        let relevant = index.find_relevant(action, &state.save_id, state);
        if relevant.is_empty() {
            user.push_str("No relevant long-term memory.\n");
        } else {
            for chunk in &relevant {
                user.push_str(&format!(
                    "- (turns {}-{}) {}\n",
                    chunk.turn_start, chunk.turn_end, chunk.content
                ));
            }
        }

        if let Some(special) = special_context {
            user.push_str("\n## Priority Context\n");
            user.push_str(special);
            user.push('\n');
        }

        user.push_str("\n## Player Action\n");
        user.push_str(action);
        user.push('\n');

        PromptPayload {
            system,
            user,
            schema: reducer::turn_response_schema(),
        }
    }

    /// Prompt for the opening scene of a freshly created world.
    pub fn build_opening_prompt(
        &self,
        settings: &WorldSettings,
        character: &Character,
    ) -> PromptPayload {
        let system = self.build_system(settings);
        let mut user = String::new();
        user.push_str("## Protagonist\n");
        user.push_str(&format!(
            "{} ({}): {}\n",
            character.display_name, character.species, character.personality
        ));
        user.push_str("\n## Player Action\n");
        user.push_str("Begin the story: set the opening scene and the protagonist's situation.\n");

        PromptPayload {
            system,
            user,
            schema: reducer::turn_response_schema(),
        }
    }

    /// Prompt for the world-enrichment pass issued alongside the opening
    /// scene: initial NPCs, locations and factions.
    pub fn build_enrichment_prompt(&self, settings: &WorldSettings) -> PromptPayload {
        let system = self.build_system(settings);
        let user = format!(
            "Invent the initial cast and geography for this {} world: a few \
             NPCs, locations and factions the story can draw on.\n\
             Return JSON: {{\"new_npcs\": [...], \"new_locations\": [...], \
             \"new_factions\": [...]}}",
            settings.genre.name()
        );

        PromptPayload {
            system,
            user,
            schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "new_npcs": { "type": "array", "items": { "type": "object" } },
                    "new_locations": { "type": "array", "items": { "type": "object" } },
                    "new_factions": { "type": "array", "items": { "type": "object" } }
                },
                "required": ["new_npcs", "new_locations", "new_factions"]
            }),
        }
    }

    fn build_system(&self, settings: &WorldSettings) -> String {
        let mut system = String::new();
        system.push_str("You are the narrator of an interactive story.\n\n");
        system.push_str(settings.genre.profile().instruction);
        system.push('\n');

        if !settings.setting.is_empty() {
            system.push_str(&format!("\nSetting: {}\n", settings.setting));
        }
        system.push_str(&format!("Difficulty: {}\n", settings.difficulty));
        if !settings.narrative_voice.is_empty() {
            system.push_str(&format!("Narrative voice: {}\n", settings.narrative_voice));
        }
        if !settings.writing_style.is_empty() {
            system.push_str(&format!("Writing style: {}\n", settings.writing_style));
        }
        if !settings.lore_rules.is_empty() {
            system.push_str("\nWorld rules:\n");
            for rule in &settings.lore_rules {
                system.push_str(&format!("- {rule}\n"));
            }
        }

        system.push_str(
            "\nAlways reply with a single JSON object matching the required \
             schema: the narrative in `story`, 2-4 suggested `actions`, and \
             the elapsed `time_cost_minutes`.\n",
        );
        system
    }
}

// ============================================================================
// Prompt-state digest
// ============================================================================

/// The bounded structural view of the state that travels in the prompt.
#[derive(Debug, Serialize)]
struct PromptState<'a> {
    character: PromptCharacter<'a>,
    npcs: Vec<PromptActor<'a>>,
    monsters: Vec<PromptActor<'a>>,
    companions: Vec<PromptActor<'a>>,
    locations: Vec<&'a str>,
    factions: Vec<&'a str>,
    game_time: &'a GameTime,
    is_in_combat: bool,
    combat_turn_number: u32,
    active_quests: Vec<&'a str>,
    pinned_memories: Vec<&'a str>,
    recent_turns: Vec<PromptTurn<'a>>,
}

#[derive(Debug, Serialize)]
struct PromptCharacter<'a> {
    name: &'a str,
    display_name: &'a str,
    species: &'a str,
    personality: &'a str,
    stats: &'a crate::character::Stats,
    health: &'a crate::character::ResourcePool,
    energy: &'a crate::character::ResourcePool,
    stress: &'a crate::character::ResourcePool,
    money: i64,
    equipment: Vec<&'a str>,
    skills: Vec<PromptSkill<'a>>,
    mood: &'a crate::character::Mood,
    key_memories: &'a [String],
}

#[derive(Debug, Serialize)]
struct PromptSkill<'a> {
    name: &'a str,
    level: u32,
}

#[derive(Debug, Serialize)]
struct PromptActor<'a> {
    name: &'a str,
    species: &'a str,
    health: &'a crate::character::ResourcePool,
    mood: &'a str,
}

#[derive(Debug, Serialize)]
struct PromptTurn<'a> {
    action: &'a str,
    digest: String,
}

impl<'a> PromptState<'a> {
    fn from_state(state: &'a GameState) -> Self {
        let kb = &state.knowledge_base;
        Self {
            character: PromptCharacter::from_character(&state.character),
            npcs: kb.npcs.iter().map(PromptActor::from_character).collect(),
            monsters: kb
                .monsters
                .iter()
                .map(PromptActor::from_character)
                .collect(),
            companions: kb.pcs.iter().map(PromptActor::from_character).collect(),
            locations: kb.locations.iter().map(|l| l.name.as_str()).collect(),
            factions: kb.factions.iter().map(|f| f.name.as_str()).collect(),
            game_time: &state.game_time,
            is_in_combat: state.is_in_combat,
            combat_turn_number: state.combat_turn_number,
            active_quests: state
                .quests
                .iter()
                .filter(|q| q.status == QuestStatus::Active)
                .map(|q| q.title.as_str())
                .collect(),
            pinned_memories: state
                .memories
                .iter()
                .filter(|m| m.pinned)
                .map(|m| m.text.as_str())
                .collect(),
            recent_turns: state
                .turns
                .iter()
                .rev()
                .take(RECENT_TURNS)
                .rev()
                .map(|t| PromptTurn {
                    action: t.chosen_action.as_str(),
                    digest: t
                        .summary
                        .clone()
                        .unwrap_or_else(|| truncate_chars(&t.story, STORY_DIGEST_CHARS)),
                })
                .collect(),
        }
    }
}

impl<'a> PromptCharacter<'a> {
    fn from_character(character: &'a Character) -> Self {
        Self {
            name: &character.name,
            display_name: &character.display_name,
            species: &character.species,
            personality: &character.personality,
            stats: &character.stats,
            health: &character.health,
            energy: &character.energy,
            stress: &character.stress,
            money: character.money,
            equipment: character
                .equipment
                .values()
                .map(|i| i.name.as_str())
                .collect(),
            skills: character
                .skills
                .iter()
                .map(|s| PromptSkill {
                    name: &s.name,
                    level: s.level,
                })
                .collect(),
            mood: &character.mood,
            key_memories: &character.key_memories,
        }
    }
}

impl<'a> PromptActor<'a> {
    fn from_character(character: &'a Character) -> Self {
        Self {
            name: &character.name,
            species: &character.species,
            health: &character.health,
            mood: &character.mood.current,
        }
    }
}

/// Truncate on a character boundary.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}
