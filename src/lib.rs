//! Agentry is a tool-use agent runtime: it lets a language model invoke
//! bounded, schema-described capabilities and drives a bounded reasoning
//! loop over them to a terminal answer.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`tools`] defines the capability contract and the registry that
//!   validates arguments, enforces timeouts, and decides parallel versus
//!   sequential batch dispatch.
//! - [`mcp`] speaks the remote tool-server protocol: a JSON-RPC envelope
//!   over a dual-framed byte stream or HTTP, plus the manager that
//!   discovers remote tools and adapts them into the registry.
//! - [`agent`] runs the reasoning loop (build context, call model,
//!   dispatch tools, decide) with explicit failure escalation.
//! - [`history`] persists per-task run state under OS advisory locks.
//! - [`api`] carries the model-facing payloads and the [`api::ChatModel`]
//!   seam hosting applications implement.
//! - [`core`] owns configuration, constants, and the shared-services
//!   state providers reach through.
//!
//! Hosts assemble the pieces themselves: load a [`core::config::Config`],
//! build a [`tools::ToolRegistry`], start an [`mcp::McpManager`], and hand
//! both to an [`agent::AgentRunner`].

pub mod agent;
pub mod api;
pub mod core;
pub mod history;
pub mod logging;
pub mod mcp;
pub mod tools;
