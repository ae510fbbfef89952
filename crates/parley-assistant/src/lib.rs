pub mod annotations;
pub mod backend;
pub mod dispatcher;
pub mod error;
pub mod openai;
pub mod setup;

pub use backend::{AssistantBackend, Role, Run, RunStatus, ThreadMessage};
pub use dispatcher::{ActiveChats, DispatchSettings, QueryDispatcher};
pub use error::AssistantError;
pub use openai::OpenAiAssistants;
