//! Characters: the player and every knowledge-base entity that can act.
//!
//! The same shape serves the player character, NPCs and monsters. Effective
//! stats are always derived from base stats plus equipment; anything loaded
//! from storage goes through [`Character::hydrate`] before use.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maximum retained key memories per character. Oldest entries are evicted
/// first.
pub const KEY_MEMORY_LIMIT: usize = 15;

/// Core attribute block, used both as base values and as item bonuses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub strength: i32,
    pub agility: i32,
    pub intellect: i32,
    pub spirit: i32,
    pub constitution: i32,
    pub charisma: i32,
}

impl Stats {
    pub fn new(
        strength: i32,
        agility: i32,
        intellect: i32,
        spirit: i32,
        constitution: i32,
        charisma: i32,
    ) -> Self {
        Self {
            strength,
            agility,
            intellect,
            spirit,
            constitution,
            charisma,
        }
    }

    /// Component-wise sum.
    pub fn plus(&self, other: &Stats) -> Stats {
        Stats {
            strength: self.strength + other.strength,
            agility: self.agility + other.agility,
            intellect: self.intellect + other.intellect,
            spirit: self.spirit + other.spirit,
            constitution: self.constitution + other.constitution,
            charisma: self.charisma + other.charisma,
        }
    }
}

/// An item occupying an equipment slot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Item {
    pub id: String,
    pub name: String,
    pub description: String,
    /// Stat bonuses granted while equipped.
    pub effects: Stats,
}

/// A learnable skill with progression tracking.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Skill {
    pub name: String,
    pub level: u32,
    pub xp: u32,
    pub mastery: String,
    pub talent: String,
}

/// How this character relates to one other entity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Relationship {
    pub closeness: i32,
    pub influence: i32,
    pub flags: Vec<String>,
}

/// Current emotional state.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Mood {
    pub current: String,
    pub intensity: u8,
    pub reason: String,
}

/// A bounded resource such as health or energy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourcePool {
    pub current: i64,
    pub max: i64,
}

impl Default for ResourcePool {
    fn default() -> Self {
        Self {
            current: 100,
            max: 100,
        }
    }
}

impl ResourcePool {
    pub fn new(max: i64) -> Self {
        Self { current: max, max }
    }

    /// Apply a delta, clamped to [0, max].
    pub fn adjust(&mut self, delta: i64) {
        self.current = (self.current + delta).clamp(0, self.max);
    }

    pub fn is_depleted(&self) -> bool {
        self.current <= 0
    }
}

/// A character: the player or any acting entity in the knowledge base.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Character {
    pub id: String,
    pub name: String,
    pub display_name: String,

    pub species: String,
    pub age: String,
    pub personality: String,
    pub backstory: String,

    /// Unmodified attributes. The source of truth.
    pub base_stats: Stats,
    /// Effective attributes: `base_stats` plus equipped-item effects.
    /// Recomputed on every hydration, never trusted from storage.
    pub stats: Stats,

    /// Slot name -> equipped item.
    pub equipment: BTreeMap<String, Item>,
    pub skills: Vec<Skill>,
    /// Other entity id -> relationship.
    pub relationships: BTreeMap<String, Relationship>,
    pub mood: Mood,

    pub health: ResourcePool,
    pub energy: ResourcePool,
    #[serde(default = "default_stress")]
    pub stress: ResourcePool,
    pub money: i64,

    /// Bounded FIFO ring of pivotal memories, newest last.
    pub key_memories: Vec<String>,
}

/// Stress begins empty, unlike the replenishable pools.
fn default_stress() -> ResourcePool {
    ResourcePool {
        current: 0,
        max: 100,
    }
}

impl Character {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let mut character = Self {
            id: Uuid::new_v4().to_string(),
            display_name: name.clone(),
            name,
            stress: default_stress(),
            ..Self::default()
        };
        character.recompute_stats();
        character
    }

    /// Normalize a character after deserialization.
    ///
    /// Fills missing identity fields, recomputes effective stats and trims
    /// the key-memory ring. Idempotent: hydrating twice equals hydrating
    /// once.
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
        if self.health.max <= 0 {
            self.health = ResourcePool::default();
        }
        if self.energy.max <= 0 {
            self.energy = ResourcePool::default();
        }
        if self.stress.max <= 0 {
            self.stress = default_stress();
        }
        self.recompute_stats();
        while self.key_memories.len() > KEY_MEMORY_LIMIT {
            self.key_memories.remove(0);
        }
    }

    /// Derive effective stats from base stats plus equipped items.
    pub fn recompute_stats(&mut self) {
        let mut effective = self.base_stats;
        for item in self.equipment.values() {
            effective = effective.plus(&item.effects);
        }
        self.stats = effective;
    }

    /// Equip an item into a slot, replacing whatever occupied it.
    pub fn equip(&mut self, slot: impl Into<String>, item: Item) {
        self.equipment.insert(slot.into(), item);
        self.recompute_stats();
    }

    /// Remove the item in a slot, if any.
    pub fn unequip(&mut self, slot: &str) -> Option<Item> {
        let removed = self.equipment.remove(slot);
        self.recompute_stats();
        removed
    }

    /// Append a key memory, evicting the oldest when the ring is full.
    pub fn push_key_memory(&mut self, memory: impl Into<String>) {
        self.key_memories.push(memory.into());
        while self.key_memories.len() > KEY_MEMORY_LIMIT {
            self.key_memories.remove(0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sword() -> Item {
        Item {
            id: "sword-1".to_string(),
            name: "Iron Sword".to_string(),
            description: String::new(),
            effects: Stats::new(3, 0, 0, 0, 0, 0),
        }
    }

    #[test]
    fn test_hydrate_fills_identity() {
        let mut character = Character {
            display_name: "Lan".to_string(),
            ..Character::default()
        };
        character.hydrate();

        assert_eq!(character.name, "Lan");
        assert!(!character.id.is_empty());
    }

    #[test]
    fn test_hydrate_is_idempotent() {
        let mut once = Character {
            name: "Vo Danh".to_string(),
            base_stats: Stats::new(5, 5, 5, 5, 5, 5),
            ..Character::default()
        };
        once.hydrate();
        let mut twice = once.clone();
        twice.hydrate();

        assert_eq!(serde_json::to_value(&once).unwrap(), serde_json::to_value(&twice).unwrap());
    }

    #[test]
    fn test_stats_derived_from_equipment() {
        let mut character = Character::new("Hero");
        character.base_stats = Stats::new(10, 8, 6, 4, 9, 7);
        character.equip("weapon", sword());

        assert_eq!(character.stats.strength, 13);

        // A stale persisted value must be overwritten on hydration.
        character.stats.strength = 999;
        character.hydrate();
        assert_eq!(character.stats.strength, 13);

        character.unequip("weapon");
        assert_eq!(character.stats.strength, 10);
    }

    #[test]
    fn test_key_memory_ring_evicts_oldest() {
        let mut character = Character::new("Hero");
        for i in 0..KEY_MEMORY_LIMIT {
            character.push_key_memory(format!("memory {i}"));
        }
        assert_eq!(character.key_memories.len(), KEY_MEMORY_LIMIT);

        character.push_key_memory("memory 15");
        assert_eq!(character.key_memories.len(), KEY_MEMORY_LIMIT);
        assert_eq!(character.key_memories[0], "memory 1");
        assert_eq!(
            character.key_memories.last().map(String::as_str),
            Some("memory 15")
        );
    }

    #[test]
    fn test_resource_pool_clamps() {
        let mut pool = ResourcePool::new(50);
        pool.adjust(-80);
        assert_eq!(pool.current, 0);
        assert!(pool.is_depleted());

        pool.adjust(200);
        assert_eq!(pool.current, 50);
    }
}
