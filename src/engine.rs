//! Top-level entry point that composes the store, the functional core,
//! the coordinator, and the effect registry into a single `Engine`.

use std::sync::Arc;

use serde_json::json;

use crate::coordinator::{Coordinator, Handle};
use crate::core::{ChangeState, Core, CoreBuilder, StateMachine, ViewState};
use crate::domain;
use crate::domain::email::{EMAILS_TO_SEND, EmailSender, LoggingMailer};
use crate::domain::subscription::{SUBSCRIPTION_CREATE, SUBSCRIPTION_CREATED, SUBSCRIPTION_LIST};
use crate::effect::{EffectHandler, NoopEffect};
use crate::error::{SelfCheckError, StorageError};
use crate::event::Command;
use crate::lss::{SqliteReader, SqliteStore};
use crate::recovery;

/// A running engine: recovered projections behind a started coordinator.
pub struct Engine {
    handle: Handle,
    reader: SqliteReader,
}

impl Engine {
    /// Start registering projections, machines, and effects.
    pub fn builder() -> EngineBuilder {
        EngineBuilder {
            core: Core::builder(),
            effects: Vec::new(),
        }
    }

    /// Open the engine with the full domain vocabulary registered.
    ///
    /// When `sendgrid_api_key` is present the email effect handler is
    /// registered; otherwise a no-op handler keeps the fan-out wiring
    /// identical.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store cannot be opened or replay
    /// fails.
    pub async fn open(
        database_url: &str,
        sendgrid_api_key: Option<&str>,
    ) -> Result<Engine, StorageError> {
        let effect: Arc<dyn EffectHandler> = if sendgrid_api_key.is_some() {
            Arc::new(EmailSender::new(Arc::new(LoggingMailer)))
        } else {
            tracing::info!("no mail transport configured, outbound effects disabled");
            Arc::new(NoopEffect)
        };

        Engine::builder()
            .with_domain()
            .effect(effect)
            .open(database_url)
            .await
    }

    /// Handle for submitting work to the coordinator.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Reader for partition-ordered and full-log reads.
    pub fn reader(&self) -> &SqliteReader {
        &self.reader
    }

    /// Stop the coordinator once queued work has drained.
    pub async fn shutdown(&self) {
        self.handle.shutdown().await;
    }
}

/// Registers projections and effects, then opens an [`Engine`].
pub struct EngineBuilder {
    core: CoreBuilder,
    effects: Vec<Arc<dyn EffectHandler>>,
}

impl EngineBuilder {
    /// Register the built-in domain vocabulary.
    pub fn with_domain(mut self) -> Self {
        self.core = domain::register(self.core);
        self
    }

    /// Register a change-state entry.
    pub fn change(mut self, entry: Box<dyn ChangeState>) -> Self {
        self.core = self.core.change(entry);
        self
    }

    /// Register a view-state entry.
    pub fn view(mut self, entry: Box<dyn ViewState>) -> Self {
        self.core = self.core.view(entry);
        self
    }

    /// Register a state machine.
    pub fn machine(mut self, machine: Arc<dyn StateMachine>) -> Self {
        self.core = self.core.machine(machine);
        self
    }

    /// Register a post-commit effect handler.
    pub fn effect(mut self, handler: Arc<dyn EffectHandler>) -> Self {
        self.effects.push(handler);
        self
    }

    /// Open the store, replay the log, and start the coordinator.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store cannot be opened or a
    /// persisted record cannot be replayed.
    pub async fn open(self, database_url: &str) -> Result<Engine, StorageError> {
        let (writer, reader) = SqliteStore::open(database_url)?;
        let mut core = self.core.build();
        let replayed = recovery::replay(&mut core, &reader)?;
        tracing::info!(replayed, "projections rebuilt from log");

        let handle = Coordinator::start(core, Box::new(writer), self.effects);
        Ok(Engine { handle, reader })
    }
}

/// Built-in end-to-end check for `--test-mode`.
///
/// Runs a create/query round trip against a throwaway database and
/// verifies the commit shape, the projection contents, and sequential id
/// allocation.
///
/// # Errors
///
/// Returns [`SelfCheckError`] describing the first failed step.
pub async fn self_check() -> Result<(), SelfCheckError> {
    let path = std::env::temp_dir().join(format!("logfold-selfcheck-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let url = path.to_string_lossy().into_owned();

    let result = self_check_at(&url).await;
    let _ = std::fs::remove_file(&path);
    result
}

async fn self_check_at(database_url: &str) -> Result<(), SelfCheckError> {
    let engine = Engine::builder().with_domain().open(database_url).await?;
    let handle = engine.handle();

    let commit = handle
        .execute(Command::new(
            SUBSCRIPTION_CREATE,
            json!({"plan": "gold", "createdBy": "selfcheck@local"}),
        ))
        .await?;
    ensure(
        commit.events.len() == 1,
        "subscription create yields exactly one event",
    )?;
    ensure(
        commit.events[0].event_type == SUBSCRIPTION_CREATED,
        "created event carries the expected type",
    )?;

    let entry = handle
        .query(vec![SUBSCRIPTION_LIST.to_string(), "sub-1".to_string()])
        .await?;
    ensure(
        entry
            == Some(json!({
                "plan": "gold",
                "createdBy": "selfcheck@local",
                "members": [],
            })),
        "subscription list reflects the creation",
    )?;

    let second = handle
        .execute(Command::new(
            SUBSCRIPTION_CREATE,
            json!({"plan": "iron", "createdBy": "selfcheck@local"}),
        ))
        .await?;
    ensure(
        second.events[0].data["subscriptionId"] == "sub-2",
        "subscription ids are allocated sequentially",
    )?;

    let queue = handle
        .query(vec![EMAILS_TO_SEND.to_string(), "list".to_string()])
        .await?;
    ensure(
        queue == Some(json!([])),
        "no notifications queued without assignments",
    )?;

    engine.shutdown().await;
    Ok(())
}

fn ensure(condition: bool, step: &str) -> Result<(), SelfCheckError> {
    if condition {
        tracing::debug!(step, "self-check step passed");
        Ok(())
    } else {
        Err(SelfCheckError::Assertion(step.to_string()))
    }
}
