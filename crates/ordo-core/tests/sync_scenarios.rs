//! End-to-end sync stories against an in-process server double
//!
//! Each test walks one offline/online scenario through the real store,
//! repositories and engines; only the HTTP layer is replaced.

mod common;

use std::sync::Arc;

use serde_json::{json, Value};
use uuid::Uuid;

use common::FakeServer;
use ordo_core::db::LocalStore;
use ordo_core::models::{
    EntityKind, NewOrder, OpStatus, OpType, Order, OrderId, OrderPatch,
};
use ordo_core::repo::OrderRepository;
use ordo_core::sync::{PullEngine, PushEngine, RecordingInvalidator, SyncTransport};
use ordo_core::util::now_ms;

struct Harness {
    store: LocalStore,
    server: Arc<FakeServer>,
    push: PushEngine,
    pull: PullEngine,
    orders: OrderRepository,
}

fn harness() -> Harness {
    let store = LocalStore::open_in_memory().unwrap();
    let server = Arc::new(FakeServer::new());
    let invalidator = Arc::new(RecordingInvalidator::default());
    let transport: Arc<dyn SyncTransport> = server.clone();

    Harness {
        push: PushEngine::new(store.clone(), transport.clone(), invalidator.clone()),
        pull: PullEngine::new(store.clone(), transport, invalidator),
        orders: OrderRepository::new(store.clone()),
        store,
        server,
    }
}

fn new_order(partner_id: Uuid) -> NewOrder {
    NewOrder {
        partner_id,
        status: 0,
        order_date: None,
        delivery_date: "2024-06-15".to_string(),
        comment: None,
    }
}

/// A local order row as if it had been synced earlier at `version`.
fn synced_order(id: OrderId, partner_id: Uuid, status: i64, version: i64) -> Order {
    Order {
        id,
        partner_id,
        status,
        order_date: None,
        delivery_date: "2024-06-15".to_string(),
        comment: None,
        created_at: now_ms(),
        updated_at: now_ms(),
        version,
        deleted_at: None,
    }
}

/// Make a failed op due immediately so the next push picks it up.
async fn make_retry_due(store: &LocalStore, id: Uuid) {
    store
        .with_conn(move |conn| {
            conn.execute(
                "UPDATE outbox SET next_retry_at = 0 WHERE id = ?",
                rusqlite::params![id.to_string()],
            )?;
            Ok(())
        })
        .await
        .unwrap();
}

// Scenario 1: offline create, then sync once "online".
#[tokio::test]
async fn offline_create_then_sync() {
    let h = harness();
    let partner = Uuid::now_v7();

    let order = h.orders.create(new_order(partner)).await.unwrap();

    // While offline: exactly one pending CREATE, and the recap already
    // shows the optimistic row.
    let ops = h.store.list_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].op_type, OpType::Create);
    assert_eq!(ops[0].status, OpStatus::Pending);

    let recap = h.orders.recap("2024-06-15").await.unwrap();
    assert_eq!(recap.len(), 1);
    assert_eq!(recap[0].orders[0].order.id, order.id);

    // Online: push drains the outbox.
    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.success_count, 1);

    let ops = h.store.list_operations().await.unwrap();
    assert_eq!(ops[0].status, OpStatus::Synced);

    // The server's change log serves the CREATE from sync id zero.
    let page = h.server.pull(0, 100).await.unwrap();
    assert_eq!(page.operations.len(), 1);
    assert_eq!(page.operations[0].operation_type, OpType::Create);
    assert_eq!(page.operations[0].entity_id, order.id.as_uuid());
}

// Scenario 2: CREATE + two UPDATEs coalesce into one CREATE on the wire.
#[tokio::test]
async fn offline_edits_coalesce_into_one_create() {
    let h = harness();
    let partner = Uuid::now_v7();

    let order = h.orders.create(new_order(partner)).await.unwrap();
    h.orders
        .update(
            &order.id,
            OrderPatch {
                status: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.orders
        .update(
            &order.id,
            OrderPatch {
                comment: Some("hello".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    h.push.run().await.unwrap();

    let requests = h.server.push_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].operations.len(), 1);
    let wire_op = &requests[0].operations[0];
    assert_eq!(wire_op.operation_type, OpType::Create);
    assert_eq!(wire_op.expected_version, None);
    assert_eq!(wire_op.data.get("status"), Some(&Value::from(1)));
    assert_eq!(wire_op.data.get("comment"), Some(&Value::from("hello")));
    assert_eq!(
        wire_op.data.get("partner_id"),
        Some(&Value::from(partner.to_string()))
    );

    // All three outbox rows end up synced.
    let ops = h.store.list_operations().await.unwrap();
    assert_eq!(ops.len(), 3);
    assert!(ops.iter().all(|op| op.status == OpStatus::Synced));
}

// Scenario 3: a stale update loses a contested field to the server.
#[tokio::test]
async fn conflict_adopts_server_value_and_version() {
    let h = harness();
    let id = OrderId::new();
    let partner = Uuid::now_v7();

    // The server already moved the order to status 2, version 2.
    h.server.apply_from_other_client(ordo_core::protocol::PushOperation {
        id: Uuid::now_v7(),
        entity_type: EntityKind::Order,
        entity_id: id.as_uuid(),
        operation_type: OpType::Create,
        data: json!({"partner_id": partner.to_string(), "delivery_date": "2024-06-15", "status": 0}),
        expected_version: None,
        timestamp: "2024-06-15T09:00:00+00:00".to_string(),
    });
    h.server.apply_from_other_client(ordo_core::protocol::PushOperation {
        id: Uuid::now_v7(),
        entity_type: EntityKind::Order,
        entity_id: id.as_uuid(),
        operation_type: OpType::Update,
        data: json!({"status": 2}),
        expected_version: Some(1),
        timestamp: "2024-06-15T09:30:00+00:00".to_string(),
    });

    // This client still believes version 1, status 0, and edits status.
    h.store
        .put_order(&synced_order(id, partner, 0, 1))
        .await
        .unwrap();
    h.orders
        .update(
            &id,
            OrderPatch {
                status: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.conflict_count, 1);

    // Server value won: status 2 at version 3, op marked synced.
    let local = h.store.get_order(&id).await.unwrap().unwrap();
    assert_eq!(local.status, 2);
    assert_eq!(local.version, 3);

    let ops = h.store.list_operations().await.unwrap();
    assert!(ops.iter().all(|op| op.status == OpStatus::Synced));

    let server_row = h.server.order(id.as_uuid()).unwrap();
    assert_eq!(server_row.get("status"), Some(&Value::from(2)));
    assert_eq!(server_row.get("version"), Some(&Value::from(3)));
}

// Scenario 4: edit loses against a concurrent delete; the pull then
// removes the row locally.
#[tokio::test]
async fn update_of_remotely_deleted_order_is_rejected_then_pulled() {
    let h = harness();
    let id = OrderId::new();
    let partner = Uuid::now_v7();

    h.server.apply_from_other_client(ordo_core::protocol::PushOperation {
        id: Uuid::now_v7(),
        entity_type: EntityKind::Order,
        entity_id: id.as_uuid(),
        operation_type: OpType::Create,
        data: json!({"partner_id": partner.to_string(), "delivery_date": "2024-06-15", "status": 0}),
        expected_version: None,
        timestamp: "2024-06-15T09:00:00+00:00".to_string(),
    });
    // Client B deletes on the server.
    h.server.apply_from_other_client(ordo_core::protocol::PushOperation {
        id: Uuid::now_v7(),
        entity_type: EntityKind::Order,
        entity_id: id.as_uuid(),
        operation_type: OpType::Delete,
        data: json!({}),
        expected_version: Some(1),
        timestamp: "2024-06-15T09:10:00+00:00".to_string(),
    });

    // Client A, offline since version 1, edits the comment.
    h.store
        .put_order(&synced_order(id, partner, 0, 1))
        .await
        .unwrap();
    h.orders
        .update(
            &id,
            OrderPatch {
                comment: Some("priority customer".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.rejected_count, 1);

    let op = &h.store.list_operations().await.unwrap()[0];
    assert_eq!(op.status, OpStatus::Rejected);
    assert_eq!(op.last_error.as_deref(), Some("entity deleted"));

    // Until the pull, A still sees its comment.
    let local = h.store.get_order(&id).await.unwrap().unwrap();
    assert_eq!(local.comment.as_deref(), Some("priority customer"));

    // The pull replays CREATE + DELETE and soft-deletes the row.
    h.pull.run().await.unwrap();
    assert!(h.store.get_order(&id).await.unwrap().is_none());
    let any = h.store.get_order_any(&id).await.unwrap().unwrap();
    assert!(any.deleted_at.is_some());
}

// Scenario 5: a pulled server edit rebases under the local pending edit.
#[tokio::test]
async fn rebase_keeps_local_intent_and_outbox_untouched() {
    let h = harness();
    let id = OrderId::new();
    let partner = Uuid::now_v7();

    h.store
        .put_order(&synced_order(id, partner, 0, 1))
        .await
        .unwrap();
    h.orders
        .update(
            &id,
            OrderPatch {
                status: Some(1),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let before: Vec<_> = h.store.list_operations().await.unwrap();
    assert_eq!(before.len(), 1);

    // Another client's comment edit arrives through the log.
    h.server.append_log(
        EntityKind::Order,
        id.as_uuid(),
        OpType::Update,
        json!({"comment": "remote", "version": 2}),
    );

    let outcome = h.pull.run().await.unwrap();
    assert_eq!(outcome.rebased, 1);

    // Both intents are visible: the server's comment and the local status.
    let local = h.store.get_order(&id).await.unwrap().unwrap();
    assert_eq!(local.comment.as_deref(), Some("remote"));
    assert_eq!(local.status, 1);
    assert_eq!(local.version, 2);

    // The outbox is byte-for-byte what it was before the pull.
    let after = h.store.list_operations().await.unwrap();
    assert_eq!(before, after);
    assert_eq!(after[0].expected_version(), Some(1));
}

// Scenario 6: transport failures back off exponentially, then succeed.
#[tokio::test]
async fn backoff_retries_until_the_server_recovers() {
    let h = harness();
    let order = h.orders.create(new_order(Uuid::now_v7())).await.unwrap();
    let op_id = h.store.list_operations().await.unwrap()[0].id;

    h.server.fail_next_pushes(3);

    for attempt in 1..=3_i64 {
        let before = now_ms();
        let result = h.push.run().await;
        assert!(result.is_err(), "attempt {attempt} should fail");

        let op = h.store.get_operation(op_id).await.unwrap().unwrap();
        assert_eq!(op.status, OpStatus::Failed);
        assert_eq!(op.retry_count, attempt);
        let expected_delay = 1_000 * (1 << (attempt - 1));
        let deadline = op.next_retry_at.unwrap();
        assert!(
            deadline >= before + expected_delay && deadline <= now_ms() + expected_delay,
            "attempt {attempt}: deadline {deadline} not ~{expected_delay}ms out"
        );

        make_retry_due(&h.store, op_id).await;
    }

    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.success_count, 1);

    let op = h.store.get_operation(op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OpStatus::Synced);
    assert!(h
        .server
        .order(order.id.as_uuid())
        .is_some());
}

// CREATE followed by DELETE produces zero network traffic and both rows
// end synced.
#[tokio::test]
async fn create_delete_pair_cancels_without_network() {
    let h = harness();
    let order = h.orders.create(new_order(Uuid::now_v7())).await.unwrap();
    h.orders.delete(&order.id).await.unwrap();

    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.processed, 2);
    assert_eq!(outcome.success_count, 2);

    assert!(h.server.push_requests().is_empty());
    let ops = h.store.list_operations().await.unwrap();
    assert_eq!(ops.len(), 2);
    assert!(ops.iter().all(|op| op.status == OpStatus::Synced));
}

// push(); push(): the second push sends nothing.
#[tokio::test]
async fn second_push_with_no_new_writes_sends_nothing() {
    let h = harness();
    h.orders.create(new_order(Uuid::now_v7())).await.unwrap();

    h.push.run().await.unwrap();
    let requests_after_first = h.server.push_requests().len();

    let outcome = h.push.run().await.unwrap();
    assert_eq!(outcome.processed, 0);
    assert_eq!(h.server.push_requests().len(), requests_after_first);
}

// apply(op); apply(op): the second application is a no-op.
#[tokio::test]
async fn double_apply_of_a_log_op_is_idempotent() {
    let h = harness();
    let id = OrderId::new();
    let partner = Uuid::now_v7();

    h.store
        .put_order(&synced_order(id, partner, 0, 1))
        .await
        .unwrap();
    h.server.append_log(
        EntityKind::Order,
        id.as_uuid(),
        OpType::Update,
        json!({"status": 5, "version": 2, "updated_at": "2024-06-15T10:00:00+00:00"}),
    );

    h.pull.run().await.unwrap();
    let first = h.store.get_order(&id).await.unwrap().unwrap();

    // Rewind the cursor and ingest the same op again.
    h.store.set_last_sync_id(0).await.unwrap();
    h.pull.run().await.unwrap();
    let second = h.store.get_order(&id).await.unwrap().unwrap();

    assert_eq!(first, second);
    assert_eq!(second.status, 5);
    assert_eq!(second.version, 2);
}

// After a completed pull, every log entry up to the cursor is reflected
// exactly once, even across pages.
#[tokio::test]
async fn pull_ingests_every_log_entry_once() {
    let h = harness();
    let partner = Uuid::now_v7();
    let mut ids = Vec::new();

    for i in 0..5 {
        let entity = Uuid::now_v7();
        ids.push(entity);
        h.server.append_log(
            EntityKind::Order,
            entity,
            OpType::Create,
            json!({
                "partner_id": partner.to_string(),
                "delivery_date": "2024-06-15",
                "status": i,
                "version": 1
            }),
        );
    }

    // Force paging with a tiny page size.
    let store = h.store.clone();
    let transport: Arc<dyn SyncTransport> = h.server.clone();
    let paged = PullEngine::new(store.clone(), transport, Arc::new(RecordingInvalidator::default()))
        .with_page_limit(2);

    let outcome = paged.run().await.unwrap();
    assert_eq!(outcome.applied, 5);
    assert_eq!(outcome.last_sync_id, 5);
    assert_eq!(store.last_sync_id().await.unwrap(), 5);

    for (i, entity) in ids.iter().enumerate() {
        let order = store
            .get_order(&OrderId::from(*entity))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, i as i64);
        assert_eq!(order.version, 1);
    }
}
