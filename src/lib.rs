//! # Ticket Flow
//!
//! Conversational ticket creation with duplicate detection.
//!
//! Chat users open a ticket through a short conversation: describe the
//! problem, review tickets that look like duplicates, confirm the form.
//! Every conversation is a versioned state machine persisted in SQLite,
//! and every ticket is checked against a similarity index built from the
//! tracker's existing tickets before it is created.
//!
//! ## Architecture
//!
//! ```text
//!  chat events ──▶ ┌──────────────┐ transitions ┌────────────────────┐
//!                  │ Orchestrator │────────────▶│ ConversationStore  │
//!  instructions ◀──└──────┬───────┘             │ (SQLite, CAS)      │
//!                         │ detect              └────────────────────┘
//!                         ▼
//!                  ┌──────────────┐   query     ┌────────────────────┐
//!                  │  Duplicate   │────────────▶│  SimilarityIndex   │
//!                  │  Detector    │             │  (SQLite vectors)  │
//!                  └──────────────┘             └─────────▲──────────┘
//!                                                         │ upsert
//!  issue tracker ──────────────────────────────▶ ┌────────┴─────────┐
//!                                   search       │ IngestionPipeline│
//!                                                └──────────────────┘
//! ```
//!
//! The runtime-free pieces (data model, transition table, store
//! algorithm, ranking, detection) live in the `ticket-flow-core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! tflow init                      # create database
//! tflow backfill OPS              # index every OPS ticket
//! tflow sync --watch              # keep the index fresh
//! tflow detect "checkout page is blank" --project OPS
//! tflow serve                     # accept chat events over HTTP
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_conversations`] | Conversation persistence |
//! | [`sqlite_index`] | Vector index |
//! | [`checkpoints`] | Ingestion checkpoints |
//! | [`embedding`] | Embedding providers |
//! | [`traits`] | Tracker and suggestion contracts |
//! | [`jira`] | Jira adapter |
//! | [`suggestions`] | OpenAI suggestion adapter |
//! | [`ingest`] | Ingestion pipeline |
//! | [`events`] | Inbound event parsing and routing |
//! | [`orchestrator`] | Flow orchestrator |
//! | [`app`] | Component wiring |
//! | [`server`] | HTTP server |

pub mod app;
pub mod checkpoints;
pub mod config;
pub mod db;
pub mod embedding;
pub mod events;
pub mod ingest;
pub mod jira;
pub mod migrate;
pub mod orchestrator;
pub mod server;
pub mod sqlite_conversations;
pub mod sqlite_index;
pub mod suggestions;
pub mod traits;
