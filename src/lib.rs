//! deploy-core - task, action and executor core for bare-metal cluster deployment
//!
//! A [`task::Task`] is split by its [`task::TaskProcessor`] into per-node
//! [`action::Action`]s, which the [`executors::ExecutorRegistry`] routes to the
//! executor registered for their action type.

pub mod action;
pub mod cli;
pub mod error;
pub mod executors;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod parser;
pub mod remote;
pub mod settings;
pub mod task;
