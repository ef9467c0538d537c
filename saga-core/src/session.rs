//! GameSession - the primary public API for play.
//!
//! Wraps the credential pool, request executor, context assembler, memory
//! index and game state into one controller. One turn may be in flight at a
//! time; combat actions are resolved locally without touching the model.

use crate::character::Character;
use crate::combat::{self, CombatError, CombatOutcome, CombatPhase};
use crate::credentials::CredentialPool;
use crate::engine::context::ContextAssembler;
use crate::engine::memory_index::{self, window_complete, ChunkSource, ChunkStore, MemoryIndex};
use crate::engine::reducer::{self, TurnError};
use crate::executor::{
    ExecutorError, ExecutorNotice, GenerateRequest, GenerativeBackend, RequestExecutor,
};
use crate::world::{AppSettings, GameState, SuggestedAction, WorldSettings};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

/// Errors from GameSession operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("backend error: {0}")]
    Executor(#[from] ExecutorError),

    #[error("while applying turn: {0}")]
    Turn(#[from] TurnError),

    #[error("while resolving combat: {0}")]
    Combat(#[from] CombatError),

    /// A turn is already being processed; the submission was ignored.
    #[error("a turn is already in flight")]
    TurnInFlight,
}

/// What one submitted action produced.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub story: String,
    pub actions: Vec<SuggestedAction>,
    pub in_combat: bool,
    /// Set when the action resolved through the combat engine.
    pub combat_log_entry: Option<String>,
    pub token_count: u64,
    /// Transient retry/rotation notices surfaced during the request.
    pub notices: Vec<String>,
}

/// A live play session.
pub struct GameSession<B: GenerativeBackend + 'static, S: ChunkStore + 'static> {
    executor: Arc<Mutex<RequestExecutor<B>>>,
    memory: Arc<Mutex<MemoryIndex<S>>>,
    assembler: ContextAssembler,
    state: GameState,
    settings: WorldSettings,
    app: AppSettings,
    processing: bool,
}

impl<B, S> GameSession<B, S>
where
    B: GenerativeBackend + Clone + 'static,
    S: ChunkStore + 'static,
{
    /// Assemble a session from its parts. The credential pool is injected;
    /// the session owns it for its whole life.
    pub fn new(
        backend: B,
        pool: CredentialPool,
        store: S,
        state: GameState,
        settings: WorldSettings,
        app: AppSettings,
    ) -> Self {
        let mut state = state;
        state.hydrate();
        Self {
            executor: Arc::new(Mutex::new(RequestExecutor::new(backend, pool))),
            memory: Arc::new(Mutex::new(MemoryIndex::new(store))),
            assembler: ContextAssembler::new(),
            state,
            settings,
            app,
            processing: false,
        }
    }

    pub fn state(&self) -> &GameState {
        &self.state
    }

    /// Direct state access. Bypasses the reducer; intended for hosts that
    /// edit entities between turns.
    pub fn state_mut(&mut self) -> &mut GameState {
        &mut self.state
    }

    pub fn settings(&self) -> &WorldSettings {
        &self.settings
    }

    pub fn app_settings(&self) -> &AppSettings {
        &self.app
    }

    pub fn memory_index(&self) -> Arc<Mutex<MemoryIndex<S>>> {
        Arc::clone(&self.memory)
    }

    /// Total backend attempts made so far.
    pub async fn request_count(&self) -> u64 {
        self.executor.lock().await.request_count()
    }

    /// Roll the session back to the previous turn's snapshot.
    pub fn undo(&mut self) -> bool {
        match self.state.history.pop() {
            Some(previous) => {
                let history = std::mem::take(&mut self.state.history);
                self.state = previous;
                self.state.history = history;
                true
            }
            None => false,
        }
    }

    /// Process one player action.
    ///
    /// While a turn is pending any further submission fails with
    /// [`SessionError::TurnInFlight`]; callers treat that as a no-op. In
    /// combat the action resolves locally and only the closing exchange
    /// triggers a generative call.
    pub async fn submit_action(&mut self, action: &str) -> Result<TurnReport, SessionError> {
        if self.processing {
            return Err(SessionError::TurnInFlight);
        }
        self.processing = true;
        let result = self.process_action(action).await;
        self.processing = false;
        result
    }

    async fn process_action(&mut self, action: &str) -> Result<TurnReport, SessionError> {
        if combat::phase(&self.state) == CombatPhase::Active {
            return self.process_combat_action(action).await;
        }
        self.run_generative_turn(action, None).await
    }

    async fn process_combat_action(&mut self, action: &str) -> Result<TurnReport, SessionError> {
        let combat_action = combat::parse_combat_action(action);
        let result = combat::resolve_player_action(&mut self.state, combat_action)?;

        if result.phase() == CombatPhase::Active {
            return Ok(TurnReport {
                story: result.log_entry.clone(),
                actions: self.state.actions.clone(),
                in_combat: true,
                combat_log_entry: Some(result.log_entry),
                token_count: 0,
                notices: Vec::new(),
            });
        }

        // Terminal exchange: close the encounter locally, then let the model
        // narrate the aftermath exactly once.
        let outcome = result.outcome.unwrap_or(CombatOutcome::Fled);
        self.state.clear_combat();
        let special = format!(
            "Combat has just ended: {}. Narrate the aftermath and its \
             consequences before continuing the story.",
            outcome.describe()
        );
        let mut report = self.run_generative_turn(action, Some(special)).await?;
        report.combat_log_entry = Some(result.log_entry);
        Ok(report)
    }

    async fn run_generative_turn(
        &mut self,
        action: &str,
        special_context: Option<String>,
    ) -> Result<TurnReport, SessionError> {
        // A freshly completed window is summarized off the turn path; its
        // failure can never affect this turn.
        if window_complete(self.state.turns.len()) {
            self.spawn_chunk_task();
        }

        let payload = {
            let memory = self.memory.lock().await;
            self.assembler.build_turn_prompt(
                &self.state,
                &self.settings,
                &self.app,
                action,
                special_context.as_deref(),
                &memory,
            )
        };

        let request = GenerateRequest::new("processing turn", payload.user)
            .with_system(payload.system)
            .with_schema(payload.schema)
            .with_model(self.app.model.clone())
            .with_temperature(self.app.temperature)
            .with_max_output_tokens(self.app.max_output_tokens);

        let mut notices = Vec::new();
        let reply = {
            let mut executor = self.executor.lock().await;
            executor
                .execute(&request, |notice| notices.push(describe_notice(&notice)))
                .await?
        };

        let (next_state, next_settings) = reducer::apply_turn_deltas(
            &self.state,
            &self.settings,
            &reply.text,
            action,
            reply.total_token_count,
            self.app.auto_pin_memories,
        )?;

        self.state = next_state;
        self.settings = next_settings;

        let turn = self.state.turns.last();
        Ok(TurnReport {
            story: turn.map(|t| t.story.clone()).unwrap_or_default(),
            actions: self.state.actions.clone(),
            in_combat: self.state.is_in_combat,
            combat_log_entry: None,
            token_count: reply.total_token_count,
            notices,
        })
    }

    /// Fire-and-forget summarization of the last completed turn window.
    ///
    /// The generative call runs on a detached executor so it can never hold
    /// the shared one across a slow request and delay the next visible
    /// turn; only the attempt count is folded back for accounting.
    fn spawn_chunk_task(&self) {
        let Some(source) = ChunkSource::from_state(&self.state) else {
            return;
        };
        let executor = Arc::clone(&self.executor);
        let memory = Arc::clone(&self.memory);
        let app = self.app.clone();

        tokio::spawn(async move {
            let mut detached = {
                let executor = executor.lock().await;
                RequestExecutor::new(
                    executor.backend().clone(),
                    executor.credential_pool().clone(),
                )
            };
            let result = memory_index::summarize_window(source, &mut detached, &app).await;
            executor
                .lock()
                .await
                .add_request_count(detached.request_count());
            match result {
                Ok(chunk) => memory.lock().await.store_mut().put(chunk),
                Err(error) => {
                    tracing::warn!(%error, "background memory summarization failed");
                }
            }
        });
    }

    /// Create a new world: the opening scene and the initial cast are
    /// generated concurrently and joined; a failure in either aborts the
    /// whole creation.
    pub async fn create_world(
        backend: B,
        pool: CredentialPool,
        store: S,
        character: Character,
        settings: WorldSettings,
        app: AppSettings,
    ) -> Result<Self, SessionError> {
        let assembler = ContextAssembler::new();
        let mut state = GameState::new(character);
        state.hydrate();

        let opening_payload = assembler.build_opening_prompt(&settings, &state.character);
        let enrichment_payload = assembler.build_enrichment_prompt(&settings);

        let opening_request = GenerateRequest::new("writing opening scene", opening_payload.user)
            .with_system(opening_payload.system)
            .with_schema(opening_payload.schema)
            .with_model(app.model.clone())
            .with_temperature(app.temperature)
            .with_max_output_tokens(app.max_output_tokens);
        let enrichment_request =
            GenerateRequest::new("enriching new world", enrichment_payload.user)
                .with_system(enrichment_payload.system)
                .with_schema(enrichment_payload.schema)
                .with_model(app.model.clone())
                .with_temperature(app.temperature)
                .with_max_output_tokens(app.max_output_tokens);

        // Independent sub-requests run concurrently on separate executors
        // sharing the same pool ordering.
        let mut opening_executor = RequestExecutor::new(backend.clone(), pool.clone());
        let mut enrichment_executor = RequestExecutor::new(backend.clone(), pool.clone());
        let (opening_reply, enrichment_reply) = futures::try_join!(
            opening_executor.execute(&opening_request, |_| {}),
            enrichment_executor.execute(&enrichment_request, |_| {}),
        )?;

        // The enrichment cast lands first so the opening turn can reference
        // it.
        apply_enrichment(&mut state, &enrichment_reply.text);
        state.total_token_count += enrichment_reply.total_token_count;

        let (next_state, next_settings) = reducer::apply_turn_deltas(
            &state,
            &settings,
            &opening_reply.text,
            "begin the story",
            opening_reply.total_token_count,
            app.auto_pin_memories,
        )?;

        Ok(Self::new(backend, pool, store, next_state, next_settings, app))
    }
}

/// Fold the world-enrichment reply into a fresh state. Best-effort: an
/// unreadable enrichment leaves the cast empty rather than failing creation.
fn apply_enrichment(state: &mut GameState, raw: &str) {
    #[derive(Default, serde::Deserialize)]
    #[serde(default)]
    struct Enrichment {
        new_npcs: Vec<Character>,
        new_locations: Vec<crate::world::WorldEntity>,
        new_factions: Vec<crate::world::WorldEntity>,
    }

    let json = reducer::extract_json(raw);
    let enrichment: Enrichment = match serde_json::from_str(json) {
        Ok(e) => e,
        Err(error) => {
            tracing::warn!(%error, "world enrichment reply unreadable; starting with empty cast");
            return;
        }
    };

    for mut npc in enrichment.new_npcs {
        npc.hydrate();
        state.knowledge_base.npcs.push(npc);
    }
    for mut location in enrichment.new_locations {
        location.hydrate();
        state.knowledge_base.locations.push(location);
    }
    for mut faction in enrichment.new_factions {
        faction.hydrate();
        state.knowledge_base.factions.push(faction);
    }
}

fn describe_notice(notice: &ExecutorNotice) -> String {
    match notice {
        ExecutorNotice::Retrying {
            attempt,
            delay,
            error,
        } => format!("retrying after transient error (attempt {attempt}, waiting {delay:?}): {error}"),
        ExecutorNotice::Reprompting { attempt, error } => {
            format!("re-prompting after malformed reply (attempt {attempt}): {error}")
        }
        ExecutorNotice::CredentialRotated { error } => {
            format!("switched API credential after: {error}")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::character::Stats;
    use crate::engine::memory_index::InMemoryChunkStore;
    use crate::genre::Genre;
    use crate::testing::MockBackend;
    use serde_json::json;

    fn session_with(backend: MockBackend) -> GameSession<MockBackend, InMemoryChunkStore> {
        let mut character = Character::new("Hero");
        character.base_stats = Stats::new(14, 10, 8, 8, 10, 8);
        character.hydrate();
        let state = GameState::new(character);
        GameSession::new(
            backend,
            CredentialPool::new(vec!["test-key".to_string()]),
            InMemoryChunkStore::default(),
            state,
            WorldSettings::new(Genre::Generic),
            AppSettings::default(),
        )
    }

    fn turn_json(story: &str) -> String {
        json!({
            "story": story,
            "actions": [{ "description": "Continue" }],
            "time_cost_minutes": 10
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_turn_flows_through_reducer() {
        let backend = MockBackend::new();
        backend.push_ok(&turn_json("The gate creaks open."), 17);
        let mut session = session_with(backend);

        let report = session.submit_action("open the gate").await.unwrap();

        assert_eq!(report.story, "The gate creaks open.");
        assert_eq!(report.token_count, 17);
        assert_eq!(session.state().turns.len(), 1);
        assert_eq!(session.state().total_token_count, 17);
        assert!(!report.in_combat);
    }

    #[tokio::test]
    async fn test_invalid_structure_leaves_state_intact() {
        let backend = MockBackend::new();
        backend.push_ok("{\"story\": \"orphaned\"}", 5);
        let mut session = session_with(backend);
        let before = serde_json::to_value(session.state()).unwrap();

        let result = session.submit_action("poke the bear").await;

        assert!(matches!(
            result,
            Err(SessionError::Turn(TurnError::InvalidTurnStructure(_)))
        ));
        assert_eq!(serde_json::to_value(session.state()).unwrap(), before);
        // The flag is released; the next action goes through.
        let retry = session.submit_action("wait").await;
        assert!(retry.is_ok());
    }

    #[tokio::test]
    async fn test_combat_actions_skip_the_model() {
        let backend = MockBackend::new();
        let mut session = session_with(backend.clone());

        let mut bandit = Character::new("Bandit");
        bandit.base_stats = Stats::new(6, 6, 5, 5, 6, 5);
        bandit.hydrate();
        bandit.health = crate::character::ResourcePool::new(200);
        let bandit_id = bandit.id.clone();
        {
            let state = session.state_mut();
            state.knowledge_base.monsters.push(bandit);
            state.is_in_combat = true;
            state.combat_turn_number = 1;
            state.combatants = vec![state.character.id.clone(), bandit_id];
        }

        let report = session.submit_action("strike hard").await.unwrap();

        assert!(report.in_combat);
        assert!(report.combat_log_entry.is_some());
        assert_eq!(report.token_count, 0);
        assert!(backend.calls().is_empty());
        assert_eq!(session.state().combat_turn_number, 2);
    }

    #[tokio::test]
    async fn test_combat_end_triggers_one_narration_turn() {
        let backend = MockBackend::new();
        backend.push_ok(&turn_json("You stand over the fallen bandit."), 9);
        let mut session = session_with(backend.clone());

        let mut bandit = Character::new("Bandit");
        bandit.base_stats = Stats::new(2, 2, 2, 2, 2, 2);
        bandit.hydrate();
        bandit.health = crate::character::ResourcePool::new(1);
        let bandit_id = bandit.id.clone();
        {
            let state = session.state_mut();
            state.knowledge_base.monsters.push(bandit);
            state.is_in_combat = true;
            state.combat_turn_number = 1;
            state.combatants = vec![state.character.id.clone(), bandit_id];
        }

        let report = session.submit_action("finish it").await.unwrap();

        // Exactly one generative call, carrying the aftermath context.
        let calls = backend.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.contains("Combat has just ended"));
        assert!(!report.in_combat);
        assert!(session.state().combatants.is_empty());
        assert!(session.state().combat_log.is_empty());
        assert_eq!(report.story, "You stand over the fallen bandit.");
    }

    #[tokio::test]
    async fn test_no_opponent_surfaces_combat_error() {
        let backend = MockBackend::new();
        let mut session = session_with(backend);
        {
            let state = session.state_mut();
            state.is_in_combat = true;
            state.combatants = vec![state.character.id.clone(), "phantom".to_string()];
        }

        let result = session.submit_action("attack").await;
        assert!(matches!(
            result,
            Err(SessionError::Combat(CombatError::NoOpponent))
        ));
        // Combat state untouched.
        assert!(session.state().is_in_combat);
    }

    #[tokio::test]
    async fn test_undo_restores_previous_turn() {
        let backend = MockBackend::new();
        backend.push_ok(&turn_json("First."), 1);
        backend.push_ok(&turn_json("Second."), 1);
        let mut session = session_with(backend);

        session.submit_action("one").await.unwrap();
        session.submit_action("two").await.unwrap();
        assert_eq!(session.state().turns.len(), 2);

        assert!(session.undo());
        assert_eq!(session.state().turns.len(), 1);
        assert_eq!(session.state().turns[0].story, "First.");
    }

    #[tokio::test]
    async fn test_create_world_joins_both_requests() {
        let backend = MockBackend::new();
        // One reply per concurrent sub-request; the mock hands them out in
        // call order, and both shapes parse for either consumer thanks to
        // defaulted fields - so give both a full turn shape with the cast.
        let full = json!({
            "story": "Dawn over the sect gates.",
            "actions": [{ "description": "Enter" }],
            "time_cost_minutes": 0,
            "new_npcs": [{ "name": "Elder Su" }],
            "new_locations": [{ "name": "Azure Peak" }],
            "new_factions": [{ "name": "Azure Sect" }]
        })
        .to_string();
        backend.push_ok(&full, 21);
        backend.push_ok(&full, 34);

        let session = GameSession::create_world(
            backend.clone(),
            CredentialPool::new(vec!["test-key".to_string()]),
            InMemoryChunkStore::default(),
            Character::new("Hero"),
            WorldSettings::new(Genre::Cultivation),
            AppSettings::default(),
        )
        .await
        .unwrap();

        assert_eq!(backend.calls().len(), 2);
        assert_eq!(session.state().turns.len(), 1);
        assert!(session
            .state()
            .knowledge_base
            .find_actor_by_name("Elder Su")
            .is_some());
        assert_eq!(session.state().total_token_count, 21 + 34);
    }

    #[tokio::test]
    async fn test_create_world_aborts_when_either_request_fails() {
        let backend = MockBackend::new();
        backend.push_err(gemini::Error::Config("broken".to_string()));

        let result = GameSession::create_world(
            backend,
            CredentialPool::new(vec!["test-key".to_string()]),
            InMemoryChunkStore::default(),
            Character::new("Hero"),
            WorldSettings::new(Genre::Generic),
            AppSettings::default(),
        )
        .await;

        assert!(matches!(result, Err(SessionError::Executor(_))));
    }
}
