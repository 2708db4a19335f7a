//! Dynamic recompiler core
//!
//! Guest code is translated one block at a time. The pieces, from the
//! bottom up:
//! - `hash`: X31 and SHA-256 signatures of guest bytes
//! - `jumptable`: lock-free guest address to native entry directory
//! - `sizes`: histogram of live block sizes
//! - `block`: the translated block and its region layout
//! - `discovery`, `analysis`, `emit`: the translation passes
//! - `pipeline`: runs the passes, with the shared code cache in between
//! - `manager`: block lifecycle on top of everything else

pub mod analysis;
pub mod block;
pub mod discovery;
#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
pub mod dynasm;
pub mod emit;
pub mod hash;
pub mod helper;
pub mod jumptable;
pub mod manager;
pub mod pipeline;
pub mod sizes;
pub mod stats;

pub use block::{BlockLayout, DynaBlock, InstSize};
#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64"))]
pub use dynasm::DynasmEmitter;
pub use emit::{EmitContext, Emitter, Pass, ThreadedEmitter};
pub use hash::{x31_hash, CodeSign};
pub use helper::{AbortReason, CancelToken, CompileHelper, InstState};
pub use jumptable::{JumpEntry, JumpTable};
pub use manager::{Dynarec, DynarecBuilder, ExecContext};
pub use pipeline::NativeExits;
pub use sizes::SizeHistogram;
pub use stats::{DynarecStats, StatsSnapshot};
