use std::{
    collections::HashSet,
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use anyhow::Result;
use notify_pipeline::{
    models::{
        notification::{GroupNotification, RecipientTimeOffset},
        outcome::{DropReason, Outcome},
    },
    pipeline::{MessageHandler, claim::ClaimGuard, fanout::FanoutStage},
};
use serde_json::json;
use uuid::Uuid;

use crate::support::{FakeIdentity, MemoryClaims, MemoryStore, RecordingPublisher, id_envelope};

const SINGLE_QUEUE: &str = "queue_raw_single_messages";

struct Fixture {
    claims: Arc<MemoryClaims>,
    store: Arc<MemoryStore>,
    identity: Arc<FakeIdentity>,
    publisher: Arc<RecordingPublisher>,
    stage: FanoutStage,
    group: GroupNotification,
}

fn fixture(send_with_gmt: bool, members: Vec<RecipientTimeOffset>) -> Fixture {
    let group = GroupNotification {
        id: Uuid::new_v4(),
        source: "news@example.com".to_string(),
        destination_group_id: Uuid::new_v4(),
        template_id: Uuid::new_v4(),
        subject: "Weekly digest".to_string(),
        message: json!({"week": 42}),
        send_with_gmt,
    };

    let claims = Arc::new(MemoryClaims::with_rows(&[group.id]));
    let store = Arc::new(MemoryStore::default());
    let identity = Arc::new(FakeIdentity::default());
    let publisher = Arc::new(RecordingPublisher::default());

    store.add_group(group.clone());
    identity.add_group(group.destination_group_id, members);

    let stage = FanoutStage::new(
        ClaimGuard::new(claims.clone(), 5),
        store.clone(),
        identity.clone(),
        publisher.clone(),
        SINGLE_QUEUE.to_string(),
    );

    Fixture {
        claims,
        store,
        identity,
        publisher,
        stage,
        group,
    }
}

fn member(hours: i32, minutes: i32) -> RecipientTimeOffset {
    RecipientTimeOffset {
        user_id: Uuid::new_v4(),
        hours,
        minutes,
    }
}

/// Test: K recipients produce exactly K children pointing at the parent
#[tokio::test]
async fn test_fanout_produces_one_child_per_recipient() -> Result<()> {
    let members = vec![member(0, 0), member(3, 0), member(-2, 30)];
    let f = fixture(false, members.clone());

    let outcome = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(outcome, Outcome::Completed));

    let inserted = f.store.inserted.lock().unwrap().clone();
    assert_eq!(inserted.len(), 3);

    let recipients: HashSet<Uuid> = inserted.values().map(|c| c.destination_id).collect();
    let expected: HashSet<Uuid> = members.iter().map(|m| m.user_id).collect();
    assert_eq!(recipients, expected);

    for child in inserted.values() {
        assert_eq!(child.group_id, f.group.id);
        assert_eq!(child.template_id, f.group.template_id);
        assert_eq!(child.source, f.group.source);
        assert_eq!(child.subject, f.group.subject);
        assert_eq!(child.message, f.group.message);
        assert_eq!(child.delay, 0);
    }

    let published = f.publisher.take();
    assert_eq!(published.len(), 3);

    let published_ids: HashSet<Uuid> = published
        .iter()
        .map(|p| Uuid::parse_str(std::str::from_utf8(&p.body).unwrap()).unwrap())
        .collect();
    let inserted_ids: HashSet<Uuid> = inserted.keys().copied().collect();
    assert_eq!(published_ids, inserted_ids);

    for message in &published {
        assert_eq!(message.queue, SINGLE_QUEUE);
        assert_eq!(message.correlation_id, "req-test");
        assert_eq!(message.delay, Duration::ZERO);
    }

    Ok(())
}

/// Test: GMT scheduling delays each child by its recipient's offset
#[tokio::test]
async fn test_gmt_scheduling_sets_per_recipient_delay() -> Result<()> {
    let east = member(5, 0);
    let west = member(-3, 30);
    let utc = member(0, 0);
    let f = fixture(true, vec![east, west, utc]);

    let outcome = f.stage.handle(&id_envelope(f.group.id)).await;
    assert!(matches!(outcome, Outcome::Completed));

    let delay_of = |user_id: Uuid| {
        f.store
            .inserted
            .lock()
            .unwrap()
            .values()
            .find(|c| c.destination_id == user_id)
            .map(|c| c.delay)
    };
    assert_eq!(delay_of(east.user_id), Some(68_400));
    assert_eq!(delay_of(west.user_id), Some(12_600));
    assert_eq!(delay_of(utc.user_id), Some(0));

    let east_id = f.group.child_id(east.user_id).to_string();
    let east_message = f
        .publisher
        .take()
        .into_iter()
        .find(|p| p.body == east_id.as_bytes())
        .expect("east child published");
    assert_eq!(east_message.delay, Duration::from_secs(68_400));

    Ok(())
}

/// Test: A fan-out retried after a partial publish failure creates no duplicate rows
#[tokio::test]
async fn test_retried_fanout_does_not_duplicate_children() -> Result<()> {
    let f = fixture(false, vec![member(1, 0), member(2, 0), member(3, 0)]);
    f.publisher.fail_from(Some(1));

    let first = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(first, Outcome::Retry(_)));
    assert!(!f.claims.is_claimed(f.group.id), "Claim is released for the retry");
    assert_eq!(f.store.inserted_count(), 3);
    assert_eq!(f.publisher.count(), 1);

    f.publisher.fail_from(None);
    let second = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(second, Outcome::Completed));
    assert_eq!(f.store.insert_calls.load(Ordering::SeqCst), 2);
    assert_eq!(f.store.inserted_count(), 3, "Children are inserted once");

    let published: HashSet<Vec<u8>> = f.publisher.take().into_iter().map(|p| p.body).collect();
    assert_eq!(published.len(), 3, "Every child is published on the retry");

    Ok(())
}

/// Test: An identity failure leaves nothing inserted and retries
#[tokio::test]
async fn test_identity_failure_retries_fanout() -> Result<()> {
    let f = fixture(false, vec![member(0, 0)]);
    f.identity.failing.store(true, Ordering::SeqCst);

    let outcome = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(outcome, Outcome::Retry(_)));
    assert_eq!(f.store.inserted_count(), 0);
    assert!(!f.claims.is_claimed(f.group.id));

    Ok(())
}

/// Test: A fanned-out group notification is never expanded again
#[tokio::test]
async fn test_completed_fanout_is_not_repeated() -> Result<()> {
    let f = fixture(false, vec![member(0, 0), member(0, 0)]);

    f.stage.handle(&id_envelope(f.group.id)).await;
    let again = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(again, Outcome::Drop(DropReason::AlreadyClaimed)));
    assert_eq!(f.store.insert_calls.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: An empty group completes without publishing
#[tokio::test]
async fn test_empty_group_completes() -> Result<()> {
    let f = fixture(true, vec![]);

    let outcome = f.stage.handle(&id_envelope(f.group.id)).await;

    assert!(matches!(outcome, Outcome::Completed));
    assert_eq!(f.publisher.count(), 0);
    assert_eq!(f.store.inserted_count(), 0);

    Ok(())
}
