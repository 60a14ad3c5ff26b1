// # -----------------------------
// # crates/common/src/lib.rs
// # -----------------------------
pub mod config;
pub mod liveness;
pub mod logging;
pub mod session;

pub use config::{ensure_private_dir, HandoffMode, HeartbeatConfig, PresenceFailSafe, Source, TetherConfig};
pub use liveness::{LivenessRegistry, Marker, MarkerFileRegistry, MemoryRegistry};
pub use session::{is_valid_approval_id, is_valid_session_id};
