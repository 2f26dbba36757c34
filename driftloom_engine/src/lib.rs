// Driftloom pattern engine
//
// A generative loop sequencer core. Up to eight looping note rows play
// against an external transport; the engine fills them with algorithmic
// patterns, keeps them in a shared scale, steers them away from colliding
// with each other, holds their combined loudness under a ceiling and
// slowly evolves them over time. Audio rendering lives outside this crate:
// the playback side only reads rows and density through the `Sequencer`.
//
// Architecture:
// - scale.rs: Scale table, pitch-set construction, snapping and transposition
// - placement.rs: Rhythmic step placement (Euclidean, even, random, fill)
// - generate.rs: Pattern generators (Euclidean walk, random cycle) and dispatch
// - traversal.rs: Scale traversal generator (directions, tails, lead-in)
// - counterpoint.rs: Cross-loop collision avoidance
// - matrix.rs: Notes matrix: rows, per-loop metadata, silence invariant,
//   batched change notification
// - energy.rs: Sonic energy computation, caching and balancing
// - intent.rs: Mutation intents, coalescing and validation
// - evolution.rs: Measure-boundary scheduling and the four creative modes
// - command.rs: Serde command enum for UI/config requests
// - config.rs: JSON-loadable engine configuration
// - engine.rs: `Sequencer`, the single owner of all mutable state
// - error.rs: Engine error type
//
// The engine is deterministic given a seed: every random choice goes through
// a `driftloom_prng::SeqRng` owned by the `Sequencer`.

pub mod command;
pub mod config;
pub mod counterpoint;
pub mod energy;
pub mod engine;
pub mod error;
pub mod evolution;
pub mod generate;
pub mod intent;
pub mod matrix;
pub mod placement;
pub mod scale;
pub mod traversal;

pub use engine::Sequencer;
pub use error::{EngineError, Result};
pub use matrix::LoopId;
