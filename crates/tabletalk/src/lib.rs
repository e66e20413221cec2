#![forbid(unsafe_code)]

pub mod agent;
pub mod catalog;
pub mod chart;
pub mod cli;
pub mod compose;
pub mod config;
pub mod executor;
pub mod models;
pub mod planner;
pub mod session;
pub mod utils;
pub mod validate;

pub use agent::{Agent, AgentError, ChatRequest, TurnReport};
pub use cli::app::{Cli, Command};
