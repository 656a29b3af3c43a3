//! User interface rendering and input handling.
//!
//! - **renderer**: draws the scroll view with crossterm
//! - **view**: scrollable document fed by render patches
//! - **keymapper**: keyboard input to shell byte sequences
//! - **prompt**: console answers to authentication prompts

pub mod keymapper;
pub mod prompt;
pub mod renderer;
pub mod view;

pub use keymapper::{KeyMapper, Modifiers};
pub use prompt::serve_prompts;
pub use renderer::Renderer;
pub use view::ScrollView;
