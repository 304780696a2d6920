//! Edit-model collaborators.
//!
//! Provides:
//! - `CommandEditModel` - Streams partials from an external model process
//! - `ScriptedEditModel` - Replays scripted partials
//! - Command building utilities

pub mod command;
pub mod process;
pub mod scripted;

pub use command::{CommandBuildError, CommandBuilder, CommandParts};
pub use process::CommandEditModel;
pub use scripted::{Script, ScriptStep, ScriptedEditModel};
