// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Robohub Core - Run Lifecycle Engine
//!
//! This crate provides the orchestration core of the robohub automation hub.
//! It manages the full lifecycle of robot runs: intake, fair queueing,
//! claim-based dispatch to workers, log fan-out, cooperative cancellation,
//! retries and retention, persisting all state to SQLite for crash resilience.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Callers                                 │
//! │                (HTTP API, portal, CI deploy hook)                        │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        robohub-server                                    │
//! │     (HTTP/WS surface, Scheduler, SLA Monitor, Watchdog, Cleanup)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ RunEngine operations                         │ Queue claim
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │    robohub-core       │◄───────────────────│      robohub-worker         │
//! │  (This Crate)         │  RunEngine + Store │  (one process per host)     │
//! │  Engine/Queue/LogBus  │                    │                             │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │        SQLite         │
//! │  (Durable Storage)    │
//! └───────────────────────┘
//! ```
//!
//! # Run State Machine
//!
//! ```text
//!                     ┌─────────┐
//!          ┌──────────│ PENDING │─────────────┐
//!          │          └────┬────┘             │
//!          │               │ claim            │ dispatch-fatal
//!     cancel               ▼                  │
//!          │          ┌─────────┐             │
//!          │   ┌──────│ RUNNING │──────┐      │
//!          │   │      └────┬────┘      │      │
//!          │   │           │           │      │
//!          │ cancel    finish ok   finish err │
//!          │   │           │       or timeout │
//!          ▼   ▼           ▼           ▼      ▼
//!     ┌──────────┐   ┌─────────┐   ┌──────────┐
//!     │ CANCELED │   │ SUCCESS │   │  FAILED  │
//!     └──────────┘   └─────────┘   └──────────┘
//! ```
//!
//! `SUCCESS`, `FAILED` and `CANCELED` are terminal; no transition leaves a
//! terminal state. Every transition is funneled through [`engine::RunEngine`]
//! and enforced with conditional updates in [`persistence::Store`].
//!
//! # Modules
//!
//! - [`blobstore`]: Artifact bytes keyed by sha256 digest
//! - [`cipher`]: Symmetric envelope for secret env values at rest
//! - [`clock`]: Wall clock, timezone resolution, schedule windows
//! - [`config`]: Shared configuration from environment variables
//! - [`cron`]: 5-field cron expressions walked in local time
//! - [`engine`]: The RunEngine state machine and watchdog operations
//! - [`error`]: Error types with stable error-code mapping
//! - [`logbus`]: Per-run log pub/sub with catch-up from the store
//! - [`migrations`]: Embedded database migrations
//! - [`model`]: Status, trigger and environment enums
//! - [`persistence`]: SQLite persistence layer behind the `Store` trait
//! - [`queue`]: FIFO queue of dispatchable runs with claim semantics

#![deny(missing_docs)]

/// Artifact byte storage keyed by content digest.
pub mod blobstore;

/// Symmetric envelope encryption for env bindings.
pub mod cipher;

/// Wall-clock helpers, timezone resolution, and schedule windows.
pub mod clock;

/// Shared configuration loaded from environment variables.
pub mod config;

/// 5-field cron expression parsing and local-time fire walking.
pub mod cron;

/// The authoritative run state machine.
pub mod engine;

/// Error types for core operations with error-code mapping.
pub mod error;

/// Per-run log pub/sub with seamless catch-up.
pub mod logbus;

/// Embedded database migrations.
pub mod migrations;

/// Domain enums shared across the workspace.
pub mod model;

/// SQLite persistence behind the `Store` trait.
pub mod persistence;

/// FIFO run queue with deferral and hold-out semantics.
pub mod queue;

pub use engine::RunEngine;
pub use error::CoreError;
