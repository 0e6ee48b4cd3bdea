//! # Ticket Flow Core
//!
//! Runtime-free logic for ticket-flow: the conversation data model and
//! transition table, the conversation store algorithm, text
//! normalization, the similarity index abstraction, duplicate ranking,
//! and the duplicate detection engine.
//!
//! This crate contains no tokio, sqlx, or network dependencies. Storage
//! and embedding backends are supplied by the application through the
//! [`conversation::ConversationBackend`], [`index::SimilarityIndex`], and
//! [`embedding::EmbeddingProvider`] traits.

pub mod conversation;
pub mod detect;
pub mod embedding;
pub mod error;
pub mod index;
pub mod machine;
pub mod models;
pub mod ranking;
pub mod text;
pub mod ui;
