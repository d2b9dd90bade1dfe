//! Round lifecycle pieces: win determination, prediction checkpoints, and
//! the drawer-side end-of-round sequence.

pub mod checkpoints;
pub mod scoring;
pub mod workflow;

pub use checkpoints::CheckpointSchedule;
pub use scoring::{closeness_bucket, guess_takes_round, model_takes_round, CLOSENESS_THRESHOLDS};
pub use workflow::{DrawerWorkflow, SketchSurface};
