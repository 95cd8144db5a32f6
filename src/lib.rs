//! # platform-fabric
//!
//! **A change-aware knowledge fabric for a cloud platform codebase.**
//!
//! The fabric ingests merged pull requests and documentation from a
//! source-hosting service, enriches them with LLM-generated narratives and
//! semantic embeddings, stores everything in PostgreSQL with
//! vector-similarity indexes, and answers retrieval queries over a small
//! MCP tool surface. A separate image tracer maps a configuration commit
//! and deployment environment to the container images deployed there and,
//! via registry labels, to the source commits that produced them.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  ┌────────────┐        ┌───────────────────────┐
//! │ Hosting API│  │ Git clones │        │ PostgreSQL + pgvector │
//! │ (PR lists) │  │ (diffs,    │        │  pr_embeddings        │
//! └─────┬──────┘  │  docs,     │        │  documents            │
//!       │         │  overlays) │        │  trace_image_cache    │
//!       ▼         └─────┬──────┘        └───────────▲───────────┘
//! ┌───────────────┐     │     ┌─────────────┐       │
//! │ PR ingestion  │◀────┼────▶│ Diff        │       │
//! │ CACHE→PROCESS │     │     │ analyzer    │──LLM──┤
//! └───────────────┘     │     └─────────────┘       │
//! ┌───────────────┐     │     ┌─────────────┐       │
//! │ Docs ingestion│◀────┘     │ Image tracer│──────▶│
//! │ (atomic swap) │           │ + cache     │       │
//! └───────────────┘           └─────────────┘       │
//!                   ┌───────────────────────────────┘
//!                   ▼
//!        ┌─────────────────────┐
//!        │ MCP tool server     │  search_prs / search_docs /
//!        │ (JSON-RPC, axum)    │  get_pr_details / trace_images
//!        └─────────────────────┘
//! ```
//!
//! ## Module Overview
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`config`] | Configuration record, TOML loading, duration parsing |
//! | [`models`] | Persisted entities and tool-facing result shapes |
//! | [`db`] / [`migrate`] | Pool setup and the ordered migration set |
//! | [`store`] | All persistence: PR rows, doc chunks, trace cache, vector search |
//! | [`gitrepo`] | Repository driver over the `git` binary with timeouts |
//! | [`llm`] | Ollama embedding/generation client behind trait seams |
//! | [`github`] | Paginated merged-PR listing from the hosting API |
//! | [`diff`] | Merge-diff map-reduce summarization |
//! | [`splitter`] | Recursive character splitter (markdown and diff modes) |
//! | [`ingest_prs`] | Two-phase CACHE/PROCESS pipeline |
//! | [`ingest_docs`] | Glob-filtered, transactional docs replacement |
//! | [`inspector`] / [`tracer`] / [`trace_service`] | Image tracing with a bounded cache |
//! | [`tools`] | Tool trait, registry, and the four retrieval tools |
//! | [`server`] | Stateless JSON-RPC tool endpoint |

pub mod config;
pub mod db;
pub mod diff;
pub mod github;
pub mod gitrepo;
pub mod ingest_docs;
pub mod ingest_prs;
pub mod inspector;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod server;
pub mod splitter;
pub mod store;
pub mod tools;
pub mod trace_service;
pub mod tracer;
