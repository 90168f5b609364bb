//! End-to-end tests for the engine: command round trips, the assignment
//! fixpoint, rollback, recovery, fatal storage failures, and the email
//! retry cap, all against temporary SQLite stores.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tempfile::TempDir;

use logfold::domain::{EmailSender, MailTransport, Notification};
use logfold::{
    Command, Core, CoreError, Coordinator, EffectError, Engine, Event, EventDraft, Handle,
    LogWriter, SqliteStore, StorageError, SubmitError, domain, recovery,
};

fn db_url(dir: &TempDir) -> String {
    dir.path().join("lss.db").to_string_lossy().into_owned()
}

async fn open_engine(url: &str) -> Engine {
    Engine::builder()
        .with_domain()
        .open(url)
        .await
        .expect("engine should open")
}

fn create_subscription() -> Command {
    Command::new(
        "Subscription.Create",
        json!({"plan": "gold", "createdBy": "a@b"}),
    )
}

fn assign_members(subscription_id: &str, members: &[&str]) -> Command {
    Command::new(
        "Subscription.Assign.Members",
        json!({"subscriptionId": subscription_id, "members": members}),
    )
}

async fn query(handle: &Handle, path: &[&str]) -> Option<Value> {
    handle
        .query(path.iter().map(|s| s.to_string()).collect())
        .await
        .expect("query should succeed")
}

/// Poll a projection until `predicate` holds or the deadline passes.
async fn wait_for_view<F>(handle: &Handle, path: &[&str], predicate: F) -> Option<Value>
where
    F: Fn(&Option<Value>) -> bool,
{
    for _ in 0..200 {
        let value = query(handle, path).await;
        if predicate(&value) {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    query(handle, path).await
}

// ---------------------------------------------------------------------------
// Command round trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_subscription_happy_path() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    let commit = handle
        .execute(create_subscription())
        .await
        .expect("execute should succeed");

    assert_eq!(commit.events.len(), 1);
    assert_eq!(commit.events[0].event_type, "Subscription.Created");
    assert_eq!(
        commit.events[0].data,
        json!({"subscriptionId": "sub-1", "plan": "gold", "createdBy": "a@b"})
    );

    let entry = query(handle, &["Subscription.List", "sub-1"]).await;
    assert_eq!(
        entry,
        Some(json!({"plan": "gold", "createdBy": "a@b", "members": []}))
    );

    // A second create allocates the next id.
    let second = handle
        .execute(create_subscription())
        .await
        .expect("second execute should succeed");
    assert_eq!(second.events[0].data["subscriptionId"], "sub-2");
}

#[tokio::test]
async fn unknown_command_is_rejected_and_engine_continues() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    let result = handle
        .execute(Command::new("No.Such.Command", json!({})))
        .await;
    assert!(matches!(
        result,
        Err(SubmitError::Rejected(CoreError::UnknownCommand { .. }))
    ));

    // The next job proceeds normally.
    handle
        .execute(create_subscription())
        .await
        .expect("engine should keep working");
}

// ---------------------------------------------------------------------------
// Assignment fixpoint
// ---------------------------------------------------------------------------

#[tokio::test]
async fn assignment_runs_machine_to_fixpoint_in_one_transaction() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    handle
        .execute(create_subscription())
        .await
        .expect("create should succeed");

    let commit = handle
        .execute(assign_members("sub-1", &["m1", "m2"]))
        .await
        .expect("assign should succeed");

    // The batch start event is present...
    let started: Vec<&Event> = commit
        .events
        .iter()
        .filter(|e| e.event_type == "Members.AssignmentStarted")
        .collect();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].data["members"], json!(["m1", "m2"]));

    // ...and the machine's follow-ups landed in the same transaction.
    let assigned: Vec<&Event> = commit
        .events
        .iter()
        .filter(|e| e.event_type == "Member.AssignedToSubscription")
        .collect();
    assert_eq!(assigned.len(), 2);

    // Members are pending until their notification is delivered.
    let tracker = query(handle, &["Assignment.Tracker", "sub-1"]).await.expect("tracker entry");
    assert_eq!(tracker["pending"], json!(["m1", "m2"]));
    assert_eq!(tracker["completed"], json!([]));
    assert_eq!(tracker["failed"], json!([]));

    // The notification queue was filled by the assignment fold.
    let queue = query(handle, &["Emails.To.Send", "list"]).await.expect("queue");
    assert_eq!(queue.as_array().map(Vec::len), Some(2));
}

#[tokio::test]
async fn repeated_assignment_does_not_duplicate_members() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    handle
        .execute(create_subscription())
        .await
        .expect("create should succeed");
    handle
        .execute(assign_members("sub-1", &["m1"]))
        .await
        .expect("first assign should succeed");

    let commit = handle
        .execute(assign_members("sub-1", &["m1"]))
        .await
        .expect("repeat assign should succeed");

    // The repeat batch starts, but the machine's re-issued command is
    // absorbed by the assignment dedup: no second member event.
    assert!(
        commit
            .events
            .iter()
            .all(|e| e.event_type != "Member.AssignedToSubscription")
    );
    let members = query(handle, &["Subscription.List", "sub-1", "members"]).await;
    assert_eq!(members, Some(json!(["m1"])));
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failing_section_rolls_back_mid_transaction_work() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    let before = query(handle, &["Subscription.List"]).await;

    // Produce a valid create, then fail the section.
    let result = handle
        .submit(|core: &mut Core| {
            core.produce(&create_subscription())?;
            Err::<(), _>(CoreError::mapper("simulated failure after produce"))
        })
        .await;
    assert!(matches!(result, Err(SubmitError::Rejected(_))));

    // Nothing stuck: the projection equals its pre-transaction value and
    // the next create still allocates sub-1.
    assert_eq!(query(handle, &["Subscription.List"]).await, before);
    let commit = handle
        .execute(create_subscription())
        .await
        .expect("create after rollback should succeed");
    assert_eq!(commit.events[0].data["subscriptionId"], "sub-1");
}

// ---------------------------------------------------------------------------
// Ordering and determinism
// ---------------------------------------------------------------------------

#[tokio::test]
async fn order_ids_are_consecutive_within_and_across_transactions() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    let first = handle
        .execute(create_subscription())
        .await
        .expect("create should succeed");
    let second = handle
        .execute(assign_members("sub-1", &["m1", "m2"]))
        .await
        .expect("assign should succeed");

    // Within a transaction: consecutive, in emission order.
    let ids: Vec<i64> = second.events.iter().map(|e| e.order_id).collect();
    for window in ids.windows(2) {
        assert_eq!(window[1], window[0] + 1);
    }
    // Across transactions: strictly greater than anything before.
    let first_max = first.events.iter().map(|e| e.order_id).max().expect("ids");
    assert!(ids[0] > first_max);
}

#[tokio::test]
async fn replaying_the_same_log_twice_yields_identical_projections() {
    let dir = TempDir::new().expect("tmpdir");
    let url = db_url(&dir);

    {
        let engine = open_engine(&url).await;
        engine
            .handle()
            .execute(create_subscription())
            .await
            .expect("create");
        engine
            .handle()
            .execute(assign_members("sub-1", &["m1", "m2"]))
            .await
            .expect("assign");
        engine.shutdown().await;
    }

    let fold = || {
        let (_writer, reader) = SqliteStore::open(&url).expect("open");
        let mut core = domain::register(Core::builder()).build();
        recovery::replay(&mut core, &reader).expect("replay");
        (
            core.query(&["Subscription.List"]),
            core.query(&["Assignment.Tracker"]),
            core.query(&["Emails.To.Send"]),
        )
    };

    assert_eq!(fold(), fold());
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn recovery_rebuilds_from_externally_seeded_log() {
    let dir = TempDir::new().expect("tmpdir");
    let url = db_url(&dir);

    // Seed the log directly, as an earlier deployment would have.
    {
        let (mut writer, _reader) = SqliteStore::open(&url).expect("open");
        writer
            .physical_append(vec![EventDraft::new(
                "sub-sub-1",
                "Subscription.Created",
                json!({"subscriptionId": "sub-1", "plan": "p", "createdBy": "u"}),
            )])
            .expect("seed append");
    }

    let engine = open_engine(&url).await;
    let plan = query(engine.handle(), &["Subscription.List", "sub-1", "plan"]).await;
    assert_eq!(plan, Some(json!("p")));

    // The recovered id counter continues after the replayed event.
    let commit = engine
        .handle()
        .execute(create_subscription())
        .await
        .expect("create after recovery");
    assert_eq!(commit.events[0].data["subscriptionId"], "sub-2");
}

#[tokio::test]
async fn recovery_after_clean_run_matches_live_state() {
    let dir = TempDir::new().expect("tmpdir");
    let url = db_url(&dir);

    let live = {
        let engine = open_engine(&url).await;
        let handle = engine.handle();
        handle.execute(create_subscription()).await.expect("create");
        handle
            .execute(assign_members("sub-1", &["m1"]))
            .await
            .expect("assign");
        let state = (
            query(handle, &["Subscription.List"]).await,
            query(handle, &["Assignment.Tracker"]).await,
        );
        engine.shutdown().await;
        state
    };

    let engine = open_engine(&url).await;
    let recovered = (
        query(engine.handle(), &["Subscription.List"]).await,
        query(engine.handle(), &["Assignment.Tracker"]).await,
    );
    assert_eq!(recovered, live);
}

// ---------------------------------------------------------------------------
// Fatal storage failure
// ---------------------------------------------------------------------------

struct BrokenWriter;

impl LogWriter for BrokenWriter {
    fn physical_append(&mut self, _drafts: Vec<EventDraft>) -> Result<Vec<Event>, StorageError> {
        Err(StorageError::Io(std::io::Error::other("disk failure")))
    }
}

#[tokio::test]
async fn storage_failure_stops_engine_and_recovery_restores_prior_state() {
    let dir = TempDir::new().expect("tmpdir");
    let url = db_url(&dir);

    // Phase 1: a healthy run commits one subscription.
    {
        let engine = open_engine(&url).await;
        engine
            .handle()
            .execute(create_subscription())
            .await
            .expect("create");
        engine.shutdown().await;
    }

    // Phase 2: same log, but every append now fails.
    {
        let (_writer, reader) = SqliteStore::open(&url).expect("open");
        let mut core = domain::register(Core::builder()).build();
        recovery::replay(&mut core, &reader).expect("replay");
        let handle = Coordinator::start(core, Box::new(BrokenWriter), vec![]);

        let result = handle.execute(create_subscription()).await;
        assert!(matches!(result, Err(SubmitError::Fatal(_))));

        let mut fatal = handle.fatal_signal();
        fatal
            .wait_for(|fatal| *fatal)
            .await
            .expect("fatal watch should fire");

        // The coordinator refuses all further work.
        let result = handle.execute(create_subscription()).await;
        assert!(matches!(
            result,
            Err(SubmitError::Stopped) | Err(SubmitError::Fatal(_))
        ));
    }

    // Phase 3: restart on the same log; only the durable state survives.
    let engine = open_engine(&url).await;
    let list = query(engine.handle(), &["Subscription.List"]).await.expect("list");
    let subscriptions = list.as_object().expect("object");
    assert_eq!(subscriptions.len(), 1);
    assert!(subscriptions.contains_key("sub-1"));
}

// ---------------------------------------------------------------------------
// Email delivery and the retry cap
// ---------------------------------------------------------------------------

struct RecordingMailer {
    delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl MailTransport for RecordingMailer {
    async fn deliver(&self, notification: &Notification) -> Result<(), EffectError> {
        self.delivered
            .lock()
            .expect("delivered lock")
            .push(notification.member_id.clone());
        Ok(())
    }
}

struct FailingMailer;

#[async_trait]
impl MailTransport for FailingMailer {
    async fn deliver(&self, _notification: &Notification) -> Result<(), EffectError> {
        Err(EffectError::Transport("smtp unreachable".to_string()))
    }
}

#[tokio::test]
async fn delivered_notifications_complete_members() {
    let dir = TempDir::new().expect("tmpdir");
    let mailer = Arc::new(RecordingMailer {
        delivered: Mutex::new(Vec::new()),
    });
    let engine = Engine::builder()
        .with_domain()
        .effect(Arc::new(EmailSender::new(mailer.clone())))
        .open(&db_url(&dir))
        .await
        .expect("engine should open");
    let handle = engine.handle();

    handle.execute(create_subscription()).await.expect("create");
    handle
        .execute(assign_members("sub-1", &["m1", "m2"]))
        .await
        .expect("assign");

    // Delivery drains the queue and completes the members.
    let queue = wait_for_view(handle, &["Emails.To.Send", "list"], |v| {
        *v == Some(json!([]))
    })
    .await;
    assert_eq!(queue, Some(json!([])));

    let tracker = wait_for_view(handle, &["Assignment.Tracker", "sub-1"], |v| {
        v.as_ref()
            .and_then(|t| t.get("pending"))
            .is_some_and(|p| *p == json!([]))
    })
    .await
    .expect("tracker entry");
    assert_eq!(tracker["pending"], json!([]));
    let mut completed: Vec<String> = tracker["completed"]
        .as_array()
        .expect("completed array")
        .iter()
        .filter_map(|v| v.as_str().map(String::from))
        .collect();
    completed.sort();
    assert_eq!(completed, vec!["m1", "m2"]);

    // At-least-once: each member was delivered at least once.
    let delivered = mailer.delivered.lock().expect("delivered lock").clone();
    assert!(delivered.iter().any(|m| m == "m1"));
    assert!(delivered.iter().any(|m| m == "m2"));
}

#[tokio::test]
async fn undeliverable_notification_is_dropped_at_attempt_cap() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = Engine::builder()
        .with_domain()
        .effect(Arc::new(EmailSender::new(Arc::new(FailingMailer))))
        .open(&db_url(&dir))
        .await
        .expect("engine should open");
    let handle = engine.handle();

    handle.execute(create_subscription()).await.expect("create");
    handle
        .execute(assign_members("sub-1", &["m1"]))
        .await
        .expect("assign");

    // Ten failed attempts drop the notification entirely.
    let queue = wait_for_view(handle, &["Emails.To.Send", "list"], |v| {
        *v == Some(json!([]))
    })
    .await;
    assert_eq!(queue, Some(json!([])));

    // The member ends up failed, never completed.
    let tracker = wait_for_view(handle, &["Assignment.Tracker", "sub-1"], |v| {
        v.as_ref()
            .and_then(|t| t.get("failed"))
            .is_some_and(|f| *f == json!(["m1"]))
    })
    .await
    .expect("tracker entry");
    assert_eq!(tracker["failed"], json!(["m1"]));
    assert_eq!(tracker["completed"], json!([]));
}

#[tokio::test]
async fn email_failure_consumed_at_attempt_nine_drops_notification() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    handle.execute(create_subscription()).await.expect("create");
    handle
        .execute(assign_members("sub-1", &["m1"]))
        .await
        .expect("assign");

    // Drive the attempt counter to nine through consumed facts.
    let outcome = json!({
        "notificationId": "mail-1",
        "subscriptionId": "sub-1",
        "memberId": "m1",
    });
    for _ in 0..9 {
        handle
            .ingest(EventDraft::new("sub-sub-1", "Email.Failed", outcome.clone()))
            .await
            .expect("ingest should succeed");
    }
    let attempt = query(handle, &["Emails.To.Send", "list", "0", "attempt"]).await;
    assert_eq!(attempt, Some(json!(9)));

    // The tenth failure crosses the cap: the notification is gone.
    handle
        .ingest(EventDraft::new("sub-sub-1", "Email.Failed", outcome))
        .await
        .expect("ingest should succeed");
    let queue = query(handle, &["Emails.To.Send", "list"]).await;
    assert_eq!(queue, Some(json!([])));
}

// ---------------------------------------------------------------------------
// Query semantics
// ---------------------------------------------------------------------------

#[tokio::test]
async fn query_distinguishes_absent_from_empty() {
    let dir = TempDir::new().expect("tmpdir");
    let engine = open_engine(&db_url(&dir)).await;
    let handle = engine.handle();

    // Present but empty container.
    assert_eq!(
        query(handle, &["Emails.To.Send", "list"]).await,
        Some(json!([]))
    );
    // Absent paths.
    assert_eq!(query(handle, &["Emails.To.Send", "nope"]).await, None);
    assert_eq!(query(handle, &["No.Such.View"]).await, None);
    assert_eq!(query(handle, &["Subscription.List", "sub-1"]).await, None);
}
