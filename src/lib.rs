//! # Message QA
//!
//! Grounded question answering over a corpus of short member messages.
//!
//! Messages are fetched from a file or a paginated HTTP API, normalised into
//! [`models::Record`]s, and indexed twice: a dense (embedding) index and a
//! sparse BM25 index. Questions are answered by fusing both rankings with
//! weighted reciprocal rank fusion, prompting a language model with the
//! fused passages, checking the answer against those passages with an
//! entailment classifier, and attaching a heuristic confidence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────┐   ┌──────────────┐
//! │  Source  │──▶│ Normalizer │──▶│ Dense + BM25 │
//! │ file/API │   │  (Corpus)  │   │   indices    │
//! └──────────┘   └────────────┘   └──────┬───────┘
//!                                        │ weighted RRF
//!                                        ▼
//!                 ┌───────────┐   ┌────────────┐   ┌────────────┐
//!                 │ Generator │──▶│  Verifier  │──▶│ Confidence │
//!                 └───────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mqa fetch                        # pull messages (ETag aware)
//! mqa build-index                  # normalise + build both indices
//! mqa ask "When is Layla's trip to London?"
//! mqa serve                        # start the HTTP API
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`source`] | Message sources (file, paginated HTTP) |
//! | [`repository`] | On-disk raw and processed corpus |
//! | [`normalize`] | Cleaning, dedup, entity tagging |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | Dense and sparse indices, snapshot manager |
//! | [`retrieval`] | Retrievers and weighted RRF fusion |
//! | [`generation`] | Chat model providers |
//! | [`answer`] | Prompt construction and answer parsing |
//! | [`verifier`] | Entailment check of answers |
//! | [`confidence`] | Confidence heuristic |
//! | [`qa`] | The `ask` pipeline |
//! | [`insights`] | Data-quality report |
//! | [`evaluation`] | Gold-set evaluation |
//! | [`server`] | HTTP API |

pub mod answer;
pub mod confidence;
pub mod config;
pub mod embedding;
pub mod evaluation;
pub mod generation;
pub mod http;
pub mod index;
pub mod insights;
pub mod models;
pub mod normalize;
pub mod qa;
pub mod repository;
pub mod retrieval;
pub mod server;
pub mod services;
pub mod source;
pub mod verifier;
