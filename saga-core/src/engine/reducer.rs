//! Turn delta applier: validates the model's structured response and folds
//! it into a fresh copy of the previous game state.
//!
//! The merge sequence is deterministic and ordered; every step operates on
//! the copy, so a failure anywhere leaves the caller's state untouched.

use crate::character::Character;
use crate::world::{
    CanonEvent, EntityKind, GameState, Guild, MemoryNote, MessageKind, Quest, SectStore,
    SuggestedAction, Turn, TurnMessage, WorldEntity, WorldSettings,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors from parsing or applying a turn.
#[derive(Debug, Error)]
pub enum TurnError {
    /// The response violated the turn contract: missing narrative, actions
    /// or time cost. Fatal for the turn; nothing is applied.
    #[error("invalid turn structure: {0}")]
    InvalidTurnStructure(String),

    /// A character delta produced a value that no longer deserializes as a
    /// character. Fatal for the turn; nothing is applied.
    #[error("character delta for '{entity}' could not be applied: {detail}")]
    InvalidDelta { entity: String, detail: String },
}

// ============================================================================
// Response shape
// ============================================================================

/// Combat transition requested by the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CombatDirective {
    Start { combatant_ids: Vec<String> },
    End,
}

/// Intimate-scene transition requested by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntimacyDirective {
    Start,
    Stop,
}

/// A partial per-entity update: object fields merge recursively, arrays and
/// scalars replace wholesale.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CharacterDelta {
    pub entity_id: String,
    pub field_updates: serde_json::Value,
}

/// Cultivation-genre auxiliary payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CultivationDelta {
    pub sect_stores: Vec<SectStore>,
    pub guilds: Vec<Guild>,
}

/// Fanfiction-genre auxiliary payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FanfictionDelta {
    pub canon_updates: Vec<CanonEvent>,
    pub compatibility_delta: i32,
    pub intervention_points_delta: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModernJob {
    pub title: String,
    pub employer: String,
    pub income: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModernAsset {
    pub name: String,
    pub value: i64,
}

/// Modern-genre auxiliary payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModernDelta {
    pub jobs: Vec<ModernJob>,
    pub assets: Vec<ModernAsset>,
}

/// The validated intermediate representation of one turn response. Produced
/// by [`parse_turn_response`]; nothing downstream touches the raw JSON.
#[derive(Debug, Clone)]
pub struct TurnResponse {
    pub story: String,
    pub actions: Vec<SuggestedAction>,
    pub time_cost_minutes: u32,
    pub weather: Option<String>,

    pub new_npcs: Vec<Character>,
    pub new_locations: Vec<WorldEntity>,
    pub new_factions: Vec<WorldEntity>,
    pub new_monsters: Vec<Character>,

    pub combat: Option<CombatDirective>,
    pub intimacy: Option<IntimacyDirective>,

    pub summary: Option<String>,
    pub world_event: Option<String>,
    pub new_quests: Vec<Quest>,
    pub character_deltas: Vec<CharacterDelta>,

    pub cultivation: Option<CultivationDelta>,
    pub fanfiction: Option<FanfictionDelta>,
    pub modern: Option<ModernDelta>,
}

impl TurnResponse {
    /// A structurally valid but empty response, for unit tests elsewhere in
    /// the crate.
    #[doc(hidden)]
    pub fn minimal_for_tests() -> Self {
        Self {
            story: "...".to_string(),
            actions: vec![SuggestedAction {
                description: "Wait".to_string(),
                ..SuggestedAction::default()
            }],
            time_cost_minutes: 1,
            weather: None,
            new_npcs: Vec::new(),
            new_locations: Vec::new(),
            new_factions: Vec::new(),
            new_monsters: Vec::new(),
            combat: None,
            intimacy: None,
            summary: None,
            world_event: None,
            new_quests: Vec::new(),
            character_deltas: Vec::new(),
            cultivation: None,
            fanfiction: None,
            modern: None,
        }
    }
}

/// Wire shape of the model reply. Everything defaults so partial replies
/// deserialize; the required fields are enforced explicitly afterwards.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTurnResponse {
    story: String,
    actions: Vec<SuggestedAction>,
    time_cost_minutes: Option<i64>,
    weather: Option<String>,
    new_npcs: Vec<Character>,
    new_locations: Vec<WorldEntity>,
    new_factions: Vec<WorldEntity>,
    new_monsters: Vec<Character>,
    combat_status: Option<String>,
    combatant_ids: Vec<String>,
    intimacy: Option<String>,
    summary: Option<String>,
    world_event: Option<String>,
    new_quests: Vec<Quest>,
    character_deltas: Vec<CharacterDelta>,
    cultivation: Option<CultivationDelta>,
    fanfiction: Option<FanfictionDelta>,
    modern: Option<ModernDelta>,
}

/// Extract JSON from a response that might be wrapped in markdown fences.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let content_start = start + 7;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let content_start = start + 3;
        if let Some(end) = text[content_start..].find("```") {
            return text[content_start..content_start + end].trim();
        }
    }

    text
}

/// Parse and structurally validate a raw model reply.
///
/// Missing narrative, an empty action list or an absent/negative time cost
/// are contract violations, not parsing hiccups: they fail with
/// [`TurnError::InvalidTurnStructure`] and nothing may be applied.
pub fn parse_turn_response(raw: &str) -> Result<TurnResponse, TurnError> {
    let json = extract_json(raw);
    let parsed: RawTurnResponse = serde_json::from_str(json)
        .map_err(|e| TurnError::InvalidTurnStructure(format!("unreadable response: {e}")))?;

    if parsed.story.trim().is_empty() {
        return Err(TurnError::InvalidTurnStructure(
            "missing narrative text".to_string(),
        ));
    }
    if parsed.actions.is_empty() {
        return Err(TurnError::InvalidTurnStructure(
            "missing action suggestions".to_string(),
        ));
    }
    let time_cost = match parsed.time_cost_minutes {
        Some(minutes) if minutes >= 0 => minutes as u32,
        Some(minutes) => {
            return Err(TurnError::InvalidTurnStructure(format!(
                "negative time cost: {minutes}"
            )))
        }
        None => {
            return Err(TurnError::InvalidTurnStructure(
                "missing time cost".to_string(),
            ))
        }
    };

    let combat = match parsed.combat_status.as_deref().map(str::to_lowercase) {
        Some(ref s) if s == "start" => Some(CombatDirective::Start {
            combatant_ids: parsed.combatant_ids,
        }),
        Some(ref s) if s == "end" => Some(CombatDirective::End),
        Some(other) => {
            tracing::debug!(directive = %other, "ignoring unknown combat directive");
            None
        }
        None => None,
    };

    let intimacy = match parsed.intimacy.as_deref().map(str::to_lowercase) {
        Some(ref s) if s == "start" => Some(IntimacyDirective::Start),
        Some(ref s) if s == "stop" => Some(IntimacyDirective::Stop),
        _ => None,
    };

    Ok(TurnResponse {
        story: parsed.story,
        actions: parsed.actions,
        time_cost_minutes: time_cost,
        weather: parsed.weather.filter(|w| !w.trim().is_empty()),
        new_npcs: parsed.new_npcs,
        new_locations: parsed.new_locations,
        new_factions: parsed.new_factions,
        new_monsters: parsed.new_monsters,
        combat,
        intimacy,
        summary: parsed.summary.filter(|s| !s.trim().is_empty()),
        world_event: parsed.world_event.filter(|s| !s.trim().is_empty()),
        new_quests: parsed.new_quests,
        character_deltas: parsed.character_deltas,
        cultivation: parsed.cultivation,
        fanfiction: parsed.fanfiction,
        modern: parsed.modern,
    })
}

/// The JSON schema the model's reply must conform to. Sent with every turn
/// request; the reducer still re-validates independently.
pub fn turn_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "story": { "type": "string" },
            "actions": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "description": { "type": "string" },
                        "success_chance": { "type": "string" },
                        "risk": { "type": "string" }
                    },
                    "required": ["description"]
                }
            },
            "time_cost_minutes": { "type": "integer" },
            "weather": { "type": "string" },
            "new_npcs": { "type": "array", "items": { "type": "object" } },
            "new_locations": { "type": "array", "items": { "type": "object" } },
            "new_factions": { "type": "array", "items": { "type": "object" } },
            "new_monsters": { "type": "array", "items": { "type": "object" } },
            "combat_status": { "type": "string", "enum": ["start", "end"] },
            "combatant_ids": { "type": "array", "items": { "type": "string" } },
            "intimacy": { "type": "string", "enum": ["start", "stop"] },
            "summary": { "type": "string" },
            "world_event": { "type": "string" },
            "new_quests": { "type": "array", "items": { "type": "object" } },
            "character_deltas": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "entity_id": { "type": "string" },
                        "field_updates": { "type": "object" }
                    },
                    "required": ["entity_id", "field_updates"]
                }
            }
        },
        "required": ["story", "actions", "time_cost_minutes"]
    })
}

// ============================================================================
// Merge
// ============================================================================

/// Structural merge rule used for partial-field updates: plain objects merge
/// key by key recursively; arrays and scalars (and null) replace the prior
/// value wholesale.
pub fn merge_value(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(patch_map)) => {
            for (key, patch_value) in patch_map {
                match base_map.get_mut(key) {
                    Some(base_value) => merge_value(base_value, patch_value),
                    None => {
                        base_map.insert(key.clone(), patch_value.clone());
                    }
                }
            }
        }
        (base_slot, patch_value) => {
            *base_slot = patch_value.clone();
        }
    }
}

/// Apply a validated turn to a copy of the prior state.
///
/// Returns the next state and world settings. The inputs are never mutated:
/// on any error the caller's previous state remains the last known good one.
pub fn apply_turn_deltas(
    prior_state: &GameState,
    prior_settings: &WorldSettings,
    raw_response: &str,
    action_description: &str,
    token_cost: u64,
    auto_pin_memory: bool,
) -> Result<(GameState, WorldSettings), TurnError> {
    let response = parse_turn_response(raw_response)?;
    apply_validated_turn(
        prior_state,
        prior_settings,
        &response,
        action_description,
        token_cost,
        auto_pin_memory,
    )
}

/// The merge sequence proper, operating on an already-validated response.
pub fn apply_validated_turn(
    prior_state: &GameState,
    prior_settings: &WorldSettings,
    response: &TurnResponse,
    action_description: &str,
    token_cost: u64,
    auto_pin_memory: bool,
) -> Result<(GameState, WorldSettings), TurnError> {
    // 1. Work on deep copies; the inputs back the caller's rollback.
    let mut state = prior_state.clone();
    let mut settings = prior_settings.clone();

    // 2. Time advances before anything that reads it.
    state.game_time.advance_minutes(response.time_cost_minutes);
    if let Some(weather) = &response.weather {
        state.game_time.weather = weather.clone();
    }

    // 3. New entities join the knowledge base through the same hydration as
    //    load time.
    for npc in &response.new_npcs {
        if state.knowledge_base.find_actor_by_name(&npc.name).is_none() {
            let mut npc = npc.clone();
            npc.hydrate();
            state.knowledge_base.npcs.push(npc);
        }
    }
    for monster in &response.new_monsters {
        if state
            .knowledge_base
            .find_actor_by_name(&monster.name)
            .is_none()
        {
            let mut monster = monster.clone();
            monster.hydrate();
            state.knowledge_base.monsters.push(monster);
        }
    }
    for location in &response.new_locations {
        if !state
            .knowledge_base
            .locations
            .iter()
            .any(|l| l.name.eq_ignore_ascii_case(&location.name))
        {
            let mut location = location.clone();
            location.hydrate();
            state.knowledge_base.locations.push(location);
        }
    }
    for faction in &response.new_factions {
        if !state
            .knowledge_base
            .factions
            .iter()
            .any(|f| f.name.eq_ignore_ascii_case(&faction.name))
        {
            let mut faction = faction.clone();
            faction.hydrate();
            state.knowledge_base.factions.push(faction);
        }
    }

    // 4. Combat transition.
    match &response.combat {
        Some(CombatDirective::Start { combatant_ids }) => {
            let opponents = resolve_combatants(&state, combatant_ids, &response.story);
            if opponents.is_empty() {
                tracing::warn!("combat start directive with no resolvable opponents; ignored");
            } else {
                state.is_in_combat = true;
                state.combat_turn_number = 1;
                state.combat_log.clear();
                state.combatants = std::iter::once(state.character.id.clone())
                    .chain(opponents)
                    .collect();
            }
        }
        Some(CombatDirective::End) => state.clear_combat(),
        None => {}
    }

    // 5. Suggested actions are replaced wholesale.
    state.actions = response.actions.clone();

    // 6. The turn record itself.
    state.turns.push(Turn {
        id: Uuid::new_v4().to_string(),
        story: response.story.clone(),
        messages: vec![
            TurnMessage {
                kind: MessageKind::PlayerAction,
                text: action_description.to_string(),
            },
            TurnMessage {
                kind: MessageKind::Narration,
                text: response.story.clone(),
            },
        ],
        chosen_action: action_description.to_string(),
        token_count: token_cost,
        summary: response.summary.clone(),
        world_event: response.world_event.clone(),
    });

    // 7. Summary becomes a short-term memory note.
    if let Some(summary) = &response.summary {
        state.memories.push(MemoryNote {
            text: summary.clone(),
            pinned: auto_pin_memory,
        });
    }

    // 8. Rollback snapshot and cost accounting.
    state.history.push(prior_state.snapshot());
    state.total_token_count += token_cost;

    // 9. Intimate-scene counter.
    match response.intimacy {
        Some(IntimacyDirective::Start) => {
            state.is_intimate_scene = true;
            state.intimacy_step = if state.intimacy_step == 0 {
                1
            } else {
                state.intimacy_step + 1
            };
        }
        Some(IntimacyDirective::Stop) => {
            state.is_intimate_scene = false;
            state.intimacy_step = 0;
        }
        None => {
            if state.is_intimate_scene {
                state.intimacy_step += 1;
            }
        }
    }

    // 10. Tagged mentions in the summary feed per-entity key memories.
    if let Some(summary) = &response.summary {
        for (_, name) in extract_tagged_mentions(summary) {
            if state.character.name.eq_ignore_ascii_case(&name)
                || state.character.display_name.eq_ignore_ascii_case(&name)
            {
                state.character.push_key_memory(summary.clone());
                continue;
            }
            let target_id = state
                .knowledge_base
                .find_actor_by_name(&name)
                .map(|c| c.id.clone());
            if let Some(id) = target_id {
                if let Some(actor) = state.knowledge_base.find_actor_mut(&id) {
                    actor.push_key_memory(summary.clone());
                }
            }
        }
    }

    // 11. New quests, deduplicated by title.
    for quest in &response.new_quests {
        if !state
            .quests
            .iter()
            .any(|q| q.title.eq_ignore_ascii_case(&quest.title))
        {
            let mut quest = quest.clone();
            if quest.id.trim().is_empty() {
                quest.id = Uuid::new_v4().to_string();
            }
            state.quests.push(quest);
        }
    }

    // 12. Genre-specific auxiliary mechanics.
    (settings.genre.profile().extension)(&mut state, &mut settings, response);

    // 13. Per-entity partial-field updates.
    for delta in &response.character_deltas {
        apply_character_delta(&mut state, delta)?;
    }

    Ok((state, settings))
}

/// Resolve combat-start participants: explicit ids that exist in the
/// knowledge base, falling back to matching known entity names against the
/// narrative text.
fn resolve_combatants(state: &GameState, ids: &[String], story: &str) -> Vec<String> {
    let mut resolved: Vec<String> = ids
        .iter()
        .filter(|id| state.knowledge_base.find_actor(id).is_some())
        .cloned()
        .collect();

    if resolved.is_empty() {
        let story_lower = story.to_lowercase();
        for actor in state
            .knowledge_base
            .npcs
            .iter()
            .chain(state.knowledge_base.monsters.iter())
        {
            let named = !actor.name.is_empty() && story_lower.contains(&actor.name.to_lowercase());
            let displayed = !actor.display_name.is_empty()
                && story_lower.contains(&actor.display_name.to_lowercase());
            if named || displayed {
                resolved.push(actor.id.clone());
            }
        }
    }

    resolved
}

/// Apply one partial-field update to the player or a knowledge-base actor.
/// Unknown targets are skipped; a merge result that no longer deserializes
/// as a character fails the whole turn.
fn apply_character_delta(state: &mut GameState, delta: &CharacterDelta) -> Result<(), TurnError> {
    let is_player = delta.entity_id == state.character.id
        || state
            .character
            .name
            .eq_ignore_ascii_case(&delta.entity_id);

    let target = if is_player {
        Some(&mut state.character)
    } else {
        let by_id = state.knowledge_base.find_actor(&delta.entity_id).is_some();
        if by_id {
            state.knowledge_base.find_actor_mut(&delta.entity_id)
        } else {
            let id = state
                .knowledge_base
                .find_actor_by_name(&delta.entity_id)
                .map(|c| c.id.clone());
            id.and_then(|id| state.knowledge_base.find_actor_mut(&id))
        }
    };

    let Some(target) = target else {
        tracing::warn!(entity = %delta.entity_id, "character delta for unknown entity; skipped");
        return Ok(());
    };

    let mut value = serde_json::to_value(&*target).map_err(|e| TurnError::InvalidDelta {
        entity: delta.entity_id.clone(),
        detail: e.to_string(),
    })?;
    merge_value(&mut value, &delta.field_updates);

    let mut merged: Character =
        serde_json::from_value(value).map_err(|e| TurnError::InvalidDelta {
            entity: delta.entity_id.clone(),
            detail: e.to_string(),
        })?;
    // Identity is ours, not the model's; effective stats never come from a
    // merge.
    merged.id = target.id.clone();
    merged.hydrate();
    *target = merged;
    Ok(())
}

/// Scan text for `[TAG:Name]` mentions and return the recognized ones.
pub fn extract_tagged_mentions(text: &str) -> Vec<(EntityKind, String)> {
    let mut mentions = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'[' {
            i += 1;
            continue;
        }
        let Some(close) = text[i..].find(']') else {
            break;
        };
        let inner = &text[i + 1..i + close];
        if let Some((tag, name)) = inner.split_once(':') {
            if let Some(kind) = EntityKind::from_tag(tag.trim()) {
                let name = name.trim();
                if !name.is_empty() {
                    mentions.push((kind, name.to_string()));
                }
            }
        }
        i += close + 1;
    }

    mentions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::Stats;
    use crate::genre::Genre;
    use serde_json::json;

    fn base_state() -> GameState {
        let mut character = Character::new("Hero");
        character.base_stats = Stats::new(10, 10, 10, 10, 10, 10);
        character.hydrate();
        let mut state = GameState::new(character);

        let mut lan = Character::new("Lan");
        lan.base_stats = Stats::new(6, 8, 9, 7, 6, 10);
        lan.hydrate();
        state.knowledge_base.npcs.push(lan);
        state
    }

    fn settings() -> WorldSettings {
        WorldSettings::new(Genre::Generic)
    }

    fn valid_response_json() -> String {
        json!({
            "story": "The market hums with morning trade.",
            "actions": [
                { "description": "Browse the stalls" },
                { "description": "Leave quietly" }
            ],
            "time_cost_minutes": 30
        })
        .to_string()
    }

    #[test]
    fn test_parse_requires_story() {
        let raw = json!({
            "actions": [{ "description": "Wait" }],
            "time_cost_minutes": 5
        })
        .to_string();
        assert!(matches!(
            parse_turn_response(&raw),
            Err(TurnError::InvalidTurnStructure(_))
        ));
    }

    #[test]
    fn test_parse_requires_actions() {
        let raw = json!({
            "story": "Something happens.",
            "time_cost_minutes": 5
        })
        .to_string();
        assert!(matches!(
            parse_turn_response(&raw),
            Err(TurnError::InvalidTurnStructure(_))
        ));
    }

    #[test]
    fn test_parse_requires_time_cost() {
        let raw = json!({
            "story": "Something happens.",
            "actions": [{ "description": "Wait" }]
        })
        .to_string();
        assert!(matches!(
            parse_turn_response(&raw),
            Err(TurnError::InvalidTurnStructure(_))
        ));
    }

    #[test]
    fn test_parse_handles_markdown_fences() {
        let raw = format!("```json\n{}\n```", valid_response_json());
        let response = parse_turn_response(&raw).unwrap();
        assert_eq!(response.time_cost_minutes, 30);
        assert_eq!(response.actions.len(), 2);
    }

    #[test]
    fn test_apply_is_all_or_nothing() {
        let state = base_state();
        let before = serde_json::to_value(&state).unwrap();

        let raw = json!({
            "story": "Something happens.",
            "time_cost_minutes": 5
        })
        .to_string();

        let result = apply_turn_deltas(&state, &settings(), &raw, "act", 10, false);
        assert!(matches!(
            result,
            Err(TurnError::InvalidTurnStructure(_))
        ));
        assert_eq!(serde_json::to_value(&state).unwrap(), before);
    }

    #[test]
    fn test_apply_advances_time_and_appends_turn() {
        let state = base_state();
        let (next, _) =
            apply_turn_deltas(&state, &settings(), &valid_response_json(), "look", 42, false)
                .unwrap();

        assert_eq!(next.game_time.minute, 30);
        assert_eq!(next.turns.len(), 1);
        assert_eq!(next.turns[0].token_count, 42);
        assert_eq!(next.actions.len(), 2);
        assert_eq!(next.total_token_count, 42);
        assert_eq!(next.history.len(), 1);
        // The snapshot is the pre-turn state.
        assert!(next.history[0].turns.is_empty());
        // Inputs untouched.
        assert!(state.turns.is_empty());
    }

    #[test]
    fn test_combat_start_resolves_by_name_fallback() {
        let state = base_state();
        let raw = json!({
            "story": "Lan draws her blade and lunges!",
            "actions": [{ "description": "Fight back" }],
            "time_cost_minutes": 1,
            "combat_status": "start"
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "provoke", 5, false).unwrap();

        assert!(next.is_in_combat);
        assert_eq!(next.combat_turn_number, 1);
        // Player first, then the resolved opponent.
        assert_eq!(next.combatants[0], next.character.id);
        assert_eq!(next.combatants.len(), 2);
    }

    #[test]
    fn test_combat_end_clears_substate() {
        let mut state = base_state();
        state.is_in_combat = true;
        state.combat_turn_number = 3;
        state.combatants = vec![state.character.id.clone()];
        state.combat_log.push("slash".to_string());

        let raw = json!({
            "story": "The dust settles.",
            "actions": [{ "description": "Catch your breath" }],
            "time_cost_minutes": 2,
            "combat_status": "end"
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "finish", 5, false).unwrap();
        assert!(!next.is_in_combat);
        assert!(next.combatants.is_empty());
        assert!(next.combat_log.is_empty());
        assert_eq!(next.combat_turn_number, 0);
    }

    #[test]
    fn test_summary_mentions_feed_key_memories() {
        let state = base_state();
        let raw = json!({
            "story": "A quiet talk by the river.",
            "actions": [{ "description": "Keep talking" }],
            "time_cost_minutes": 10,
            "summary": "[NPC:Lan] confided her fear of the sect elders."
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "talk", 5, true).unwrap();

        let lan = next.knowledge_base.find_actor_by_name("Lan").unwrap();
        assert_eq!(lan.key_memories.len(), 1);
        assert!(lan.key_memories[0].contains("sect elders"));
        // Pinned because auto-pin was on.
        assert!(next.memories[0].pinned);
    }

    #[test]
    fn test_new_npcs_are_hydrated_and_deduplicated() {
        let state = base_state();
        let raw = json!({
            "story": "A stranger introduces himself.",
            "actions": [{ "description": "Greet him" }],
            "time_cost_minutes": 5,
            "new_npcs": [
                { "display_name": "Old Chen" },
                { "name": "Lan" }
            ]
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "wait", 5, false).unwrap();

        // Lan already existed; only Old Chen is new, with identity defaulted.
        assert_eq!(next.knowledge_base.npcs.len(), 2);
        let chen = next.knowledge_base.find_actor_by_name("Old Chen").unwrap();
        assert_eq!(chen.name, "Old Chen");
        assert!(!chen.id.is_empty());
    }

    #[test]
    fn test_character_delta_merges_objects_replaces_arrays() {
        let mut state = base_state();
        state.character.relationships.insert(
            "lan".to_string(),
            crate::character::Relationship {
                closeness: 10,
                influence: 5,
                flags: vec!["wary".to_string()],
            },
        );
        let player_id = state.character.id.clone();

        let raw = json!({
            "story": "The bond deepens.",
            "actions": [{ "description": "Continue" }],
            "time_cost_minutes": 5,
            "character_deltas": [{
                "entity_id": player_id,
                "field_updates": {
                    "money": 250,
                    "relationships": {
                        "lan": { "closeness": 25, "flags": ["trusted"] }
                    }
                }
            }]
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "bond", 5, false).unwrap();

        assert_eq!(next.character.money, 250);
        let rel = &next.character.relationships["lan"];
        // Object fields merged: influence survived the partial update.
        assert_eq!(rel.closeness, 25);
        assert_eq!(rel.influence, 5);
        // Arrays replaced wholesale.
        assert_eq!(rel.flags, vec!["trusted".to_string()]);
    }

    #[test]
    fn test_character_delta_cannot_corrupt_identity_or_stats() {
        let mut state = base_state();
        state.character.equip(
            "weapon",
            crate::character::Item {
                id: "blade".to_string(),
                name: "Blade".to_string(),
                description: String::new(),
                effects: Stats::new(2, 0, 0, 0, 0, 0),
            },
        );
        let player_id = state.character.id.clone();

        let raw = json!({
            "story": "Nothing visible changes.",
            "actions": [{ "description": "Continue" }],
            "time_cost_minutes": 5,
            "character_deltas": [{
                "entity_id": player_id,
                "field_updates": { "id": "forged", "stats": { "strength": 999 } }
            }]
        })
        .to_string();

        let (next, _) = apply_turn_deltas(&state, &settings(), &raw, "idle", 5, false).unwrap();

        assert_eq!(next.character.id, player_id);
        // Effective stats recomputed from base + equipment, not taken from
        // the delta.
        assert_eq!(next.character.stats.strength, 12);
    }

    #[test]
    fn test_intimacy_counter_transitions() {
        let state = base_state();
        let start = json!({
            "story": "s", "actions": [{ "description": "a" }], "time_cost_minutes": 1,
            "intimacy": "start"
        })
        .to_string();
        let plain = valid_response_json();
        let stop = json!({
            "story": "s", "actions": [{ "description": "a" }], "time_cost_minutes": 1,
            "intimacy": "stop"
        })
        .to_string();

        let (s1, w1) = apply_turn_deltas(&state, &settings(), &start, "x", 1, false).unwrap();
        assert!(s1.is_intimate_scene);
        assert_eq!(s1.intimacy_step, 1);

        let (s2, w2) = apply_turn_deltas(&s1, &w1, &plain, "x", 1, false).unwrap();
        assert_eq!(s2.intimacy_step, 2);

        let (s3, _) = apply_turn_deltas(&s2, &w2, &stop, "x", 1, false).unwrap();
        assert!(!s3.is_intimate_scene);
        assert_eq!(s3.intimacy_step, 0);
    }

    #[test]
    fn test_merge_value_rules() {
        let mut base = json!({
            "a": { "x": 1, "y": 2 },
            "list": [1, 2, 3],
            "scalar": "old"
        });
        merge_value(
            &mut base,
            &json!({
                "a": { "y": 20, "z": 30 },
                "list": [9],
                "scalar": "new"
            }),
        );

        assert_eq!(base["a"]["x"], 1);
        assert_eq!(base["a"]["y"], 20);
        assert_eq!(base["a"]["z"], 30);
        assert_eq!(base["list"], json!([9]));
        assert_eq!(base["scalar"], "new");
    }

    #[test]
    fn test_extract_tagged_mentions() {
        let mentions =
            extract_tagged_mentions("[NPC:Lan] met [PC:Hero] near [LOC:Azure Peak]. [junk]");
        assert_eq!(mentions.len(), 3);
        assert_eq!(mentions[0], (EntityKind::Npc, "Lan".to_string()));
        assert_eq!(mentions[2], (EntityKind::Location, "Azure Peak".to_string()));
    }

    #[test]
    fn test_extract_json_fenced() {
        let fenced = "```json\n{\"a\":1}\n```";
        assert_eq!(extract_json(fenced), "{\"a\":1}");
        assert_eq!(extract_json("{\"a\":1}"), "{\"a\":1}");
    }
}
