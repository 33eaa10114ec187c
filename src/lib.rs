//! # Support Labeler
//!
//! Retrieval-augmented labeling of customer support conversations.
//!
//! A small library of human-labeled samples is embedded into a vector
//! index. Each incoming conversation is redacted, gated for abuse, matched
//! against the nearest samples, and labeled by a chat model prompted with
//! those samples as few-shot examples.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐
//! │ Conversation │──▶│ Redact+Filter│──▶│  Retrieve   │◀── SampleLibrary
//! └──────────────┘   └──────┬───────┘   └──────┬──────┘    + VectorIndex
//!                           │ skipped          ▼
//!                           │           ┌─────────────┐
//!                           │           │ Prompt+LLM  │── failed
//!                           ▼           └──────┬──────┘
//!                     skipped.jsonl            ▼
//!                                        labels.jsonl
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`error`] | Validation, transient and terminal error categories |
//! | [`models`] | Samples, conversations and label records |
//! | [`retry`] | Exponential backoff shared by remote calls |
//! | [`embedding`] | Embedder trait; TF-IDF, hash, OpenAI and Ollama backends |
//! | [`index`] | In-memory vector index with JSON snapshots |
//! | [`redact`] | Ordered PII masking pipeline |
//! | [`filter`] | Abuse/off-topic gate |
//! | [`retrieval`] | Nearest-sample lookup |
//! | [`prompt`] | Few-shot prompt construction |
//! | [`llm`] | Chat backend trait and retrying label client |
//! | [`orchestrator`] | Per-conversation state machine and batch driver |
//! | [`ingest`] | Sample file ingestion |
//! | [`input`] | Conversation file loading and validation |
//! | [`export`] | Output sinks and run summary |
//! | [`commands`] | CLI subcommand implementations |

pub mod commands;
pub mod config;
pub mod embedding;
pub mod error;
pub mod export;
pub mod filter;
pub mod index;
pub mod ingest;
pub mod input;
pub mod llm;
pub mod models;
pub mod orchestrator;
pub mod prompt;
pub mod redact;
pub mod retrieval;
pub mod retry;
