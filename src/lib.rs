//! # Meshllm - LLM Personas for Meshtastic Networks
//!
//! Meshllm lets named LLM personas answer messages on a Meshtastic mesh. Two
//! independent processes share nothing but a directory of CSV thread logs:
//!
//! - the **bridge** records inbound radio packets into thread logs and sends
//!   queued replies back out with retry and backoff;
//! - the **agent** scans those logs for messages addressed to a persona,
//!   answers control commands directly and queues prompts for a local
//!   inference server (Ollama).
//!
//! Every log and persona file is guarded by an advisory sentinel lock, so the
//! two processes (and humans editing persona files) never clobber each other.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshllm::agent::Agent;
//! use meshllm::config::Config;
//! use meshllm::inference::backend_from_config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let backend = backend_from_config(&config.ollama);
//!     Agent::new(config, backend).run(false).await
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`storage`] - Advisory file lock and the locked CSV record store
//! - [`thread`] - Message records, thread log access and node directory layout
//! - [`persona`] - Persona files, runtime counters and the registry
//! - [`bridge`] - Inbound recording and the outbound dispatcher
//! - [`agent`] - Reply pipeline: trigger detection, control commands, worker
//! - [`inference`] - Inference backend seam and the Ollama client
//! - [`meshtastic`] - Radio transport seam
//! - [`config`] - TOML configuration with environment overrides
//!
//! ## Architecture
//!
//! ```text
//!  radio ──▶ bridge ──append inbound──▶ ┌────────────────────┐
//!                                       │ nodes/<uid>/threads │
//!  radio ◀── bridge ◀──queued rows───── │   channels/*.csv    │
//!                                       │   dms/*.csv         │
//!            agent ──scan / append────▶ └────────────────────┘
//!              │
//!              └──▶ inference server
//! ```

pub mod agent;
pub mod bridge;
pub mod config;
pub mod inference;
pub mod logutil;
pub mod meshtastic;
pub mod metrics;
pub mod persona;
pub mod storage;
pub mod thread;
