//! Deterministic, offline combat resolution.
//!
//! While the combat flag is set, player actions resolve here instead of
//! going to the model: pure arithmetic over effective stats, no RNG, no
//! network. When an exchange reaches a terminal condition the session issues
//! one narration turn and combat state is cleared.

use crate::world::GameState;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from the combat resolver. Combat state is left unchanged on error.
#[derive(Debug, Error)]
pub enum CombatError {
    #[error("combat is not active")]
    NotActive,

    #[error("no resolvable opponent among the combatants")]
    NoOpponent,
}

/// How a finished encounter ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombatOutcome {
    Victory,
    Defeat,
    Fled,
}

impl CombatOutcome {
    pub fn describe(&self) -> &'static str {
        match self {
            CombatOutcome::Victory => "the opponent was defeated",
            CombatOutcome::Defeat => "the protagonist was defeated",
            CombatOutcome::Fled => "the protagonist fled the fight",
        }
    }
}

/// Where the encounter state machine currently sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CombatPhase {
    Idle,
    Active,
    Resolved(CombatOutcome),
}

/// Derive the phase from the state flags.
pub fn phase(state: &GameState) -> CombatPhase {
    if state.is_in_combat {
        CombatPhase::Active
    } else {
        CombatPhase::Idle
    }
}

/// What the player chose to do this exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombatAction {
    Attack,
    Defend,
    Flee,
}

/// Map free-text player input onto a combat action. Anything unrecognized
/// is an attack.
pub fn parse_combat_action(input: &str) -> CombatAction {
    let lower = input.to_lowercase();
    if lower.contains("flee") || lower.contains("run away") || lower.contains("escape") {
        CombatAction::Flee
    } else if lower.contains("defend") || lower.contains("guard") || lower.contains("block") {
        CombatAction::Defend
    } else {
        CombatAction::Attack
    }
}

/// The outcome of one resolved exchange.
#[derive(Debug, Clone)]
pub struct CombatTurnResult {
    pub log_entry: String,
    pub damage_dealt: i64,
    pub damage_taken: i64,
    pub should_end: bool,
    pub outcome: Option<CombatOutcome>,
}

impl CombatTurnResult {
    /// Where the encounter stands after this exchange.
    pub fn phase(&self) -> CombatPhase {
        match self.outcome {
            Some(outcome) => CombatPhase::Resolved(outcome),
            None => CombatPhase::Active,
        }
    }
}

/// Resolve one player action against the first non-player combatant.
///
/// Mutates health pools, the combat log and the turn counter. Terminal
/// conditions set `should_end`; clearing the combat flags is the session's
/// job, after it has narrated the aftermath.
pub fn resolve_player_action(
    state: &mut GameState,
    action: CombatAction,
) -> Result<CombatTurnResult, CombatError> {
    if !state.is_in_combat {
        return Err(CombatError::NotActive);
    }

    let player_id = state.character.id.clone();
    let opponent_id = state
        .combatants
        .iter()
        .find(|id| **id != player_id && state.knowledge_base.find_actor(id).is_some())
        .cloned()
        .ok_or(CombatError::NoOpponent)?;

    // Pull the numbers out first so we can mutate both sides cleanly.
    let (opponent_name, opponent_stats) = {
        let opponent = state
            .knowledge_base
            .find_actor(&opponent_id)
            .ok_or(CombatError::NoOpponent)?;
        (opponent.display_name.clone(), opponent.stats)
    };
    let player_stats = state.character.stats;

    let player_attack = (player_stats.strength + player_stats.agility / 2) as i64;
    let player_guard = (player_stats.constitution / 2) as i64;
    let opponent_attack = (opponent_stats.strength + opponent_stats.agility / 2) as i64;
    let opponent_guard = (opponent_stats.constitution / 2) as i64;

    let mut damage_dealt = 0;
    let mut damage_taken = 0;
    let mut outcome = None;
    let log_entry;

    match action {
        CombatAction::Attack => {
            damage_dealt = (player_attack - opponent_guard).max(1);
            let opponent = state
                .knowledge_base
                .find_actor_mut(&opponent_id)
                .ok_or(CombatError::NoOpponent)?;
            opponent.health.adjust(-damage_dealt);
            if opponent.health.is_depleted() {
                outcome = Some(CombatOutcome::Victory);
                log_entry = format!(
                    "{} strikes {opponent_name} for {damage_dealt} and fells them.",
                    state.character.display_name
                );
            } else {
                damage_taken = (opponent_attack - player_guard).max(1);
                state.character.health.adjust(-damage_taken);
                if state.character.health.is_depleted() {
                    outcome = Some(CombatOutcome::Defeat);
                }
                log_entry = format!(
                    "{} strikes {opponent_name} for {damage_dealt}; {opponent_name} answers for {damage_taken}.",
                    state.character.display_name
                );
            }
        }
        CombatAction::Defend => {
            damage_taken = (opponent_attack - player_guard * 2).max(0);
            state.character.health.adjust(-damage_taken);
            if state.character.health.is_depleted() {
                outcome = Some(CombatOutcome::Defeat);
            }
            log_entry = format!(
                "{} guards; {opponent_name}'s blow lands for {damage_taken}.",
                state.character.display_name
            );
        }
        CombatAction::Flee => {
            if player_stats.agility > opponent_stats.agility {
                outcome = Some(CombatOutcome::Fled);
                log_entry = format!(
                    "{} breaks away from {opponent_name} and escapes.",
                    state.character.display_name
                );
            } else {
                damage_taken = (opponent_attack - player_guard).max(1);
                state.character.health.adjust(-damage_taken);
                if state.character.health.is_depleted() {
                    outcome = Some(CombatOutcome::Defeat);
                }
                log_entry = format!(
                    "{} fails to escape; {opponent_name} punishes the opening for {damage_taken}.",
                    state.character.display_name
                );
            }
        }
    }

    state.combat_log.push(log_entry.clone());
    state.combat_turn_number += 1;

    Ok(CombatTurnResult {
        log_entry,
        damage_dealt,
        damage_taken,
        should_end: outcome.is_some(),
        outcome,
    })
}
