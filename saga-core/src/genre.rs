//! Genre dispatch.
//!
//! Every supported genre is a variant of one closed enum, and everything
//! genre-specific (instruction template, reducer extension) is reached
//! through the single table below. No other module matches on genre names.

use crate::engine::reducer::TurnResponse;
use crate::world::{GameState, WorldSettings};
use serde::{Deserialize, Serialize};

/// The narrative rulesets a world can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Genre {
    /// Xianxia-style cultivation worlds with sects, stores and guilds.
    Cultivation,
    /// Stories set inside an existing canon with a tracked timeline.
    Fanfiction,
    /// Contemporary settings with jobs and assets.
    Modern,
    /// Fallback ruleset for anything unrecognized.
    #[default]
    #[serde(other)]
    Generic,
}

/// Per-genre behavior: the instruction block injected into every prompt and
/// the auxiliary state update applied after the common merge steps.
pub struct GenreProfile {
    pub instruction: &'static str,
    pub extension: fn(&mut GameState, &mut WorldSettings, &TurnResponse),
}

impl Genre {
    pub fn name(&self) -> &'static str {
        match self {
            Genre::Cultivation => "cultivation",
            Genre::Fanfiction => "fanfiction",
            Genre::Modern => "modern",
            Genre::Generic => "generic",
        }
    }

    /// The dispatch table. Adding a genre means adding a variant and an arm
    /// here; nothing else in the crate branches on genre.
    pub fn profile(&self) -> &'static GenreProfile {
        match self {
            Genre::Cultivation => &CULTIVATION,
            Genre::Fanfiction => &FANFICTION,
            Genre::Modern => &MODERN,
            Genre::Generic => &GENERIC,
        }
    }
}

static CULTIVATION: GenreProfile = GenreProfile {
    instruction: "This is a cultivation world. Track realms, techniques, qi \
        expenditure, sect standing and spirit-stone economy. Sect stores and \
        guild records may change as the story moves.",
    extension: apply_cultivation,
};

static FANFICTION: GenreProfile = GenreProfile {
    instruction: "This story unfolds inside an established canon. Respect the \
        canon timeline, report how close events stay to it, and account for \
        the protagonist's interventions.",
    extension: apply_fanfiction,
};

static MODERN: GenreProfile = GenreProfile {
    instruction: "This is a contemporary setting. Track employment, income \
        and owned assets alongside the narrative.",
    extension: apply_modern,
};

static GENERIC: GenreProfile = GenreProfile {
    instruction: "Narrate consistently with the established world and tone.",
    extension: apply_generic,
};

fn apply_cultivation(state: &mut GameState, _settings: &mut WorldSettings, response: &TurnResponse) {
    let Some(delta) = &response.cultivation else {
        return;
    };

    for store in &delta.sect_stores {
        match state.sect_stores.iter_mut().find(|s| s.id == store.id) {
            Some(existing) => *existing = store.clone(),
            None => state.sect_stores.push(store.clone()),
        }
    }
    for guild in &delta.guilds {
        match state.guilds.iter_mut().find(|g| g.id == guild.id) {
            Some(existing) => *existing = guild.clone(),
            None => state.guilds.push(guild.clone()),
        }
    }
}

fn apply_fanfiction(_state: &mut GameState, settings: &mut WorldSettings, response: &TurnResponse) {
    let Some(delta) = &response.fanfiction else {
        return;
    };
    let canon = settings.canon.get_or_insert_with(Default::default);

    for update in &delta.canon_updates {
        if let Some(event) = canon.timeline.iter_mut().find(|e| e.title == update.title) {
            event.status = update.status;
        }
    }
    canon.compatibility =
        (canon.compatibility as i32 + delta.compatibility_delta).clamp(0, 100) as u8;
    canon.intervention_points += delta.intervention_points_delta;
}

fn apply_modern(state: &mut GameState, _settings: &mut WorldSettings, response: &TurnResponse) {
    let Some(delta) = &response.modern else {
        return;
    };

    if !delta.jobs.is_empty() {
        let jobs = state
            .world_state
            .entry("jobs".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(list) = jobs {
            for job in &delta.jobs {
                if let Ok(value) = serde_json::to_value(job) {
                    list.push(value);
                }
            }
        }
    }
    if !delta.assets.is_empty() {
        let assets = state
            .world_state
            .entry("assets".to_string())
            .or_insert_with(|| serde_json::Value::Array(Vec::new()));
        if let serde_json::Value::Array(list) = assets {
            for asset in &delta.assets {
                if let Ok(value) = serde_json::to_value(asset) {
                    list.push(value);
                }
            }
        }
    }
}

fn apply_generic(_state: &mut GameState, _settings: &mut WorldSettings, _response: &TurnResponse) {}
