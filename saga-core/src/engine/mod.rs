//! The turn-resolution engine: prompt assembly, long-term memory and the
//! state reducer that folds model output into the game state.

pub mod context;
pub mod memory_index;
pub mod reducer;

pub use context::{ContextAssembler, PromptPayload};
pub use memory_index::{ChunkStore, InMemoryChunkStore, MemoryChunk, MemoryIndex, CHUNK_INTERVAL};
pub use reducer::{apply_turn_deltas, parse_turn_response, TurnError, TurnResponse};
