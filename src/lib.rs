// src/lib.rs

// Import the top-level `cadre` module.
pub mod cadre;

// Re-exporting key items for easier external access: cadre::Crew instead of
// cadre::cadre::crew::Crew, and the submodules under their plain names.
pub use cadre::agent;
pub use cadre::config;
pub use cadre::coordinator;
pub use cadre::crew;
pub use cadre::error;
pub use cadre::error::CadreError;
pub use cadre::event;
pub use cadre::executor;
pub use cadre::graph;
pub use cadre::hooks;
pub use cadre::memory;
pub use cadre::message;
pub use cadre::provider;
pub use cadre::retry;
pub use cadre::runtime;
pub use cadre::sse;
pub use cadre::state;
pub use cadre::task;
pub use cadre::tool;
pub use cadre::tools;

pub use cadre::crew::{Crew, CrewBuilder, RunOutcome};
