// # -----------------------------
// # crates/cli/src/lib.rs
// # -----------------------------
pub mod hook;
