// Library interface for memdoc
// Safe self-update and data relocation; the binary in main.rs is a thin CLI over it

pub mod cancel;
pub mod cli;
pub mod commit;
pub mod config;
pub mod error;
pub mod lock;
pub mod relocate;
pub mod signal;
pub mod update;
pub mod version;

#[cfg(test)]
mod test_utils;
