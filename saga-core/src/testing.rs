//! Testing utilities.
//!
//! - `MockBackend`: a scripted [`GenerativeBackend`] for deterministic tests
//!   without API calls
//! - `TestHarness`: a session wired to the mock with canned turn replies
//! - Assertion helpers for verifying session state

use crate::character::{Character, Stats};
use crate::credentials::CredentialPool;
use crate::engine::memory_index::InMemoryChunkStore;
use crate::executor::{GenerateReply, GenerateRequest, GenerativeBackend};
use crate::genre::Genre;
use crate::session::{GameSession, SessionError, TurnReport};
use crate::world::{AppSettings, GameState, WorldSettings};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// One recorded backend invocation.
#[derive(Debug, Clone)]
pub struct MockCall {
    pub operation: String,
    pub credential: String,
    pub prompt: String,
    pub temperature: f32,
}

#[derive(Default)]
struct MockInner {
    script: Mutex<VecDeque<Result<GenerateReply, gemini::Error>>>,
    routed: Mutex<std::collections::HashMap<String, VecDeque<Result<GenerateReply, gemini::Error>>>>,
    calls: Mutex<Vec<MockCall>>,
}

/// A scripted backend. Outcomes are handed out in push order; once the
/// script is exhausted every call gets a minimal valid turn reply.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<MockInner>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful reply.
    pub fn push_ok(&self, text: &str, total_token_count: u64) {
        self.inner
            .script
            .lock()
            .expect("mock script lock")
            .push_back(Ok(GenerateReply {
                text: text.to_string(),
                total_token_count,
            }));
    }

    /// Queue a successful reply served only to requests with the given
    /// operation label. Routed replies win over the main script, which keeps
    /// concurrent calls (a turn plus a background summarization) ordered
    /// deterministically.
    pub fn push_ok_for(&self, operation: &str, text: &str, total_token_count: u64) {
        self.inner
            .routed
            .lock()
            .expect("mock routed lock")
            .entry(operation.to_string())
            .or_default()
            .push_back(Ok(GenerateReply {
                text: text.to_string(),
                total_token_count,
            }));
    }

    /// Queue a failure.
    pub fn push_err(&self, error: gemini::Error) {
        self.inner
            .script
            .lock()
            .expect("mock script lock")
            .push_back(Err(error));
    }

    /// Every call made so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.calls.lock().expect("mock calls lock").clone()
    }

    fn fallback_reply() -> GenerateReply {
        GenerateReply {
            text: serde_json::json!({
                "story": "The story continues quietly.",
                "actions": [{ "description": "Carry on" }],
                "time_cost_minutes": 5
            })
            .to_string(),
            total_token_count: 0,
        }
    }
}

#[async_trait]
impl GenerativeBackend for MockBackend {
    async fn generate(
        &self,
        credential: &str,
        request: &GenerateRequest,
    ) -> Result<GenerateReply, gemini::Error> {
        self.inner
            .calls
            .lock()
            .expect("mock calls lock")
            .push(MockCall {
                operation: request.operation.clone(),
                credential: credential.to_string(),
                prompt: request.prompt.clone(),
                temperature: request.temperature,
            });

        if let Some(outcome) = self
            .inner
            .routed
            .lock()
            .expect("mock routed lock")
            .get_mut(&request.operation)
            .and_then(VecDeque::pop_front)
        {
            return outcome;
        }

        match self
            .inner
            .script
            .lock()
            .expect("mock script lock")
            .pop_front()
        {
            Some(outcome) => outcome,
            None => Ok(Self::fallback_reply()),
        }
    }
}

/// A protagonist with workable stats for scenario tests.
pub fn sample_protagonist(name: &str) -> Character {
    let mut character = Character::new(name);
    character.species = "human".to_string();
    character.personality = "steady, curious".to_string();
    character.base_stats = Stats::new(12, 10, 9, 8, 11, 9);
    character.hydrate();
    character
}

/// Test harness: a session on the mock backend with a generic world.
pub struct TestHarness {
    pub backend: MockBackend,
    pub session: GameSession<MockBackend, InMemoryChunkStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_state(GameState::new(sample_protagonist("Test Hero")))
    }

    pub fn with_state(state: GameState) -> Self {
        let backend = MockBackend::new();
        let session = GameSession::new(
            backend.clone(),
            CredentialPool::new(vec!["test-key".to_string()]),
            InMemoryChunkStore::default(),
            state,
            WorldSettings::new(Genre::Generic),
            AppSettings::default(),
        );
        Self { backend, session }
    }

    /// Queue a raw turn reply.
    pub fn expect_reply(&mut self, json: &str) -> &mut Self {
        self.backend.push_ok(json, 0);
        self
    }

    /// Queue a minimal valid turn with the given narrative.
    pub fn expect_story(&mut self, story: &str) -> &mut Self {
        let json = serde_json::json!({
            "story": story,
            "actions": [{ "description": "Continue" }],
            "time_cost_minutes": 10
        })
        .to_string();
        self.backend.push_ok(&json, 0);
        self
    }

    /// Submit a player action.
    pub async fn act(&mut self, action: &str) -> Result<TurnReport, SessionError> {
        self.session.submit_action(action).await
    }

    pub fn turn_count(&self) -> usize {
        self.session.state().turns.len()
    }

    pub fn in_combat(&self) -> bool {
        self.session.state().is_in_combat
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Assertion Helpers
// ============================================================================

/// Assert the session is in combat.
#[track_caller]
pub fn assert_in_combat(harness: &TestHarness) {
    assert!(harness.in_combat(), "Expected to be in combat");
}

/// Assert the session is NOT in combat.
#[track_caller]
pub fn assert_not_in_combat(harness: &TestHarness) {
    assert!(!harness.in_combat(), "Expected to NOT be in combat");
}

/// Assert the turn log length.
#[track_caller]
pub fn assert_turn_count(harness: &TestHarness, expected: usize) {
    let actual = harness.turn_count();
    assert_eq!(actual, expected, "Expected {expected} turns, got {actual}");
}
