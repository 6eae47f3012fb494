//! # Rampart Engine
//!
//! The control and execution substrate of the Rampart web application
//! firewall: the part that owns lifetimes, registries, and dispatch, on
//! top of which inspection logic runs as modules.
//!
//! ## Features
//!
//! - Arena-style pool hierarchy with ordered, observable teardown
//! - Index-stable module registry with per-context configuration slots
//! - Fixed lifecycle event table with shape-checked hook registration
//! - Configuration context tree (engine → main → site → location)
//! - Connection and transaction lifecycle with pipelining detection
//!
//! ## Architecture
//!
//! Extensions implement the [`module::Module`] trait and are registered
//! with [`engine::Engine::module_register`], which assigns each module a
//! stable index used to address its configuration and data slots
//! everywhere in the engine. Servers embed the engine through
//! [`engine::Engine::create`] and drive it with connections and
//! transactions; the engine never owns a socket.

pub mod conn;
pub mod context;
pub mod engine;
pub mod error;
pub mod module;
pub mod pool;
pub mod vars;

pub use engine::{Engine, ServerDescriptor};
pub use error::{EngineError, EngineResult};
