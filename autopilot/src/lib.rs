//! Autonomous task-execution engine.
//!
//! An objective is turned into a plan of tool calls by an LLM architect that
//! may first investigate the workspace with read-only tools. The plan is then
//! executed task by task, with failed tasks revised in place and a hard stop
//! when the same step keeps failing.
//!
//! - **[`core`]**: Pure logic (plan state machine, failure memory, parameter
//!   resolution, reply parsing). No I/O.
//! - **[`io`]**: Side effects (config, processes, git, LLM backends, plan
//!   persistence, the terminal).
//! - **[`tools`]**: The tool contract, registry, permission gate and the
//!   built-in tools.
//!
//! [`orchestrator`] ties the loops ([`architect`], [`execute`], [`replan`],
//! [`supervisor`]) together per user message.

pub mod architect;
pub mod cancel;
pub mod core;
pub mod engine;
pub mod execute;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
pub mod replan;
pub mod supervisor;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod tools;
