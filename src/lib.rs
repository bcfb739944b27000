//! # MCP Gateway
//!
//! Launches, supervises and catalogues MCP tool servers.
//!
//! This library provides:
//! - An HTTP API to start and stop named tool servers and query their tools
//! - A process supervisor that health-gates each server on its metadata endpoint
//! - A capability registry backed by an in-memory cache and a SQLite store
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │            HTTP API              │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │          ToolRegistry            │
//!        └───────┬──────────┬──────────┬────┘
//!                │          │          │
//!                ▼          ▼          ▼
//!         Supervisor      Cache      Store
//!        (processes)   (in-memory)  (SQLite)
//! ```
//!
//! ## Start Flow
//! 1. Spawn the tool server's launch command
//! 2. Poll its metadata endpoint until it answers or the deadline passes
//! 3. Tag each capability with the server name
//! 4. Persist new `(name, server)` pairs, then cache the manifest
//!
//! ## Modules
//! - `api`: HTTP routes and shared state
//! - `config`: environment-driven configuration
//! - `registry`: supervisor, cache, store and the registry service

pub mod api;
pub mod config;
pub mod registry;

pub use config::Config;
pub use registry::ToolRegistry;
