pub mod classifier;
pub mod executor;
pub mod filters;
pub mod handlers;
pub mod history;
pub mod model;
pub mod orchestrator;
pub mod prompts;
pub mod templates;
pub mod validator;
