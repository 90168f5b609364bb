//! Event-sourced command-processing engine.
//!
//! `logfold` accepts commands, runs them through a deterministic
//! functional core that produces events, durably appends those events to
//! a totally-ordered append-only log, updates in-memory projections,
//! reactively dispatches follow-up commands from state machines, and
//! then performs post-commit side effects. On restart it rebuilds all
//! in-memory state by replaying the log.
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Core`] | Deterministic interpreter: commands in, events and projections out |
//! | [`ChangeState`] / [`ViewState`] | Projections consulted by mappers / queries and machines |
//! | [`StateMachine`] | Reactive rule issuing follow-up commands when a view changes |
//! | [`Coordinator`] / [`Handle`] | FIFO serializer binding core work to durable appends |
//! | [`SqliteStore`] | Writer/reader pair over the append-only SQLite log |
//! | [`EffectHandler`] | Post-commit callback feeding outcomes back as facts |
//! | [`Engine`] | Recovered projections behind a started coordinator |
//!
//! # Quick Start
//!
//! ```no_run
//! use logfold::{Command, Engine};
//! use serde_json::json;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Engine::open("/var/lib/logfold/lss.db", None).await?;
//!
//! let commit = engine
//!     .handle()
//!     .execute(Command::new(
//!         "Subscription.Create",
//!         json!({"plan": "gold", "createdBy": "a@b"}),
//!     ))
//!     .await?;
//! assert_eq!(commit.events[0].event_type, "Subscription.Created");
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod core;
pub mod domain;
pub mod effect;
pub mod engine;
pub mod error;
pub mod event;
pub mod lss;
pub mod recovery;

pub use config::Config;
pub use coordinator::{Commit, Coordinator, Handle};
pub use core::{ChangeState, Core, CoreBuilder, StateMachine, TriggerCtx, ViewState};
pub use effect::{EffectHandler, NoopEffect};
pub use engine::{Engine, EngineBuilder, self_check};
pub use error::{CoreError, EffectError, SelfCheckError, StorageError, SubmitError};
pub use event::{Command, Event, EventDraft};
pub use lss::{LogWriter, ReadOrder, SqliteReader, SqliteStore, SqliteWriter};
