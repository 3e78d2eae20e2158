//! Conversation log ordering and consistency properties
//!
//! Randomized interleavings of append/update/finalize must never violate
//! the ordinal and pending invariants, whatever order a turn (or a buggy
//! caller) issues them in.

mod common;

use rand::Rng;

use common::setup_store;
use rpchat::{ConversationRepo, Error, MessageRole, MessageStatus, DEFAULT_SESSION_TITLE};

/// Assert the two log invariants for a session: ordinals 1..=n with no
/// gaps, and at most one pending message.
fn assert_invariants(store: &ConversationRepo, session_id: &str) {
    let history = store.read_history(session_id).unwrap();
    for (i, message) in history.iter().enumerate() {
        assert_eq!(
            message.ordinal,
            i as i64 + 1,
            "ordinal gap in session {session_id}"
        );
    }

    let pending = history
        .iter()
        .filter(|m| m.status == MessageStatus::Pending)
        .count();
    assert!(pending <= 1, "{pending} pending messages in {session_id}");
    assert_eq!(store.pending_count(session_id).unwrap(), pending);
}

/// Random walks over the append/update/finalize surface: legal operations
/// succeed, illegal ones fail, and the invariants hold at every step.
#[test]
fn test_random_interleavings_preserve_invariants() {
    let mut rng = rand::thread_rng();

    for _ in 0..25 {
        let store = setup_store();
        let session = store.create_session(DEFAULT_SESSION_TITLE).unwrap();
        let mut pending: Option<i64> = None;
        let mut appended = 0i64;

        for _ in 0..40 {
            match rng.gen_range(0..6) {
                // append a new finalized message
                0 | 1 => {
                    let ordinal = store.next_ordinal(&session.id).unwrap();
                    assert_eq!(ordinal, appended + 1);
                    store
                        .append_or_update(
                            &session.id,
                            ordinal,
                            MessageRole::User,
                            "hello",
                            MessageStatus::Complete,
                        )
                        .unwrap();
                    appended += 1;
                }
                // append or grow the pending message
                2 | 3 => {
                    if let Some(ordinal) = pending {
                        store
                            .append_or_update(
                                &session.id,
                                ordinal,
                                MessageRole::Assistant,
                                "longer content",
                                MessageStatus::Pending,
                            )
                            .unwrap();
                    } else {
                        let ordinal = store.next_ordinal(&session.id).unwrap();
                        store
                            .append_or_update(
                                &session.id,
                                ordinal,
                                MessageRole::Assistant,
                                "",
                                MessageStatus::Pending,
                            )
                            .unwrap();
                        pending = Some(ordinal);
                        appended += 1;
                    }
                }
                // finalize the pending message
                4 => {
                    if let Some(ordinal) = pending.take() {
                        let status = if rng.gen_bool(0.5) {
                            MessageStatus::Complete
                        } else {
                            MessageStatus::Interrupted
                        };
                        store.finalize(&session.id, ordinal, status).unwrap();
                    }
                }
                // illegal operations must be rejected without effect
                _ => {
                    let gap = appended + 1 + rng.gen_range(1..5);
                    let err = store
                        .append_or_update(
                            &session.id,
                            gap,
                            MessageRole::User,
                            "gap",
                            MessageStatus::Complete,
                        )
                        .unwrap_err();
                    assert!(matches!(err, Error::Storage(_)));

                    if pending.is_some() {
                        let ordinal = store.next_ordinal(&session.id).unwrap();
                        let err = store
                            .append_or_update(
                                &session.id,
                                ordinal,
                                MessageRole::Assistant,
                                "second pending",
                                MessageStatus::Pending,
                            )
                            .unwrap_err();
                        assert!(matches!(err, Error::Storage(_)));
                    }
                }
            }

            assert_invariants(&store, &session.id);
        }
    }
}

/// Ordinals are never reused: finalizing then appending keeps counting up.
#[test]
fn test_ordinals_never_reused() {
    let store = setup_store();
    let session = store.create_session(DEFAULT_SESSION_TITLE).unwrap();

    for expected in 1..=20i64 {
        let ordinal = store.next_ordinal(&session.id).unwrap();
        assert_eq!(ordinal, expected);
        store
            .append_or_update(
                &session.id,
                ordinal,
                MessageRole::User,
                "msg",
                MessageStatus::Pending,
            )
            .unwrap();
        store
            .finalize(&session.id, ordinal, MessageStatus::Complete)
            .unwrap();
    }

    let history = store.read_history(&session.id).unwrap();
    assert_eq!(history.len(), 20);
    assert_invariants(&store, &session.id);
}

/// A reader mid-stream sees the latest consistent snapshot of the
/// pending slot, not intermediate rows.
#[test]
fn test_reader_sees_latest_snapshot() {
    let store = setup_store();
    let session = store.create_session(DEFAULT_SESSION_TITLE).unwrap();

    store
        .append_or_update(&session.id, 1, MessageRole::Assistant, "", MessageStatus::Pending)
        .unwrap();

    let mut content = String::new();
    for delta in ["He", "llo", " wor", "ld"] {
        content.push_str(delta);
        store
            .append_or_update(
                &session.id,
                1,
                MessageRole::Assistant,
                &content,
                MessageStatus::Pending,
            )
            .unwrap();

        let snapshot = store.read_history(&session.id).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].content, content);
    }

    store
        .finalize(&session.id, 1, MessageStatus::Complete)
        .unwrap();
    let final_read = store.read_history(&session.id).unwrap();
    assert_eq!(final_read[0].content, "Hello world");
}

/// Sessions are isolated: invariants are per session.
#[test]
fn test_pending_is_per_session() {
    let store = setup_store();
    let a = store.create_session("a").unwrap();
    let b = store.create_session("b").unwrap();

    store
        .append_or_update(&a.id, 1, MessageRole::Assistant, "", MessageStatus::Pending)
        .unwrap();
    // a pending message in session a does not block session b
    store
        .append_or_update(&b.id, 1, MessageRole::Assistant, "", MessageStatus::Pending)
        .unwrap();

    assert_eq!(store.pending_count(&a.id).unwrap(), 1);
    assert_eq!(store.pending_count(&b.id).unwrap(), 1);
}

/// The store survives on disk across pool lifetimes.
#[test]
fn test_persistence_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rpchat.db");

    let session_id = {
        let store = ConversationRepo::new(rpchat::store::init(&path).unwrap());
        let session = store.create_session(DEFAULT_SESSION_TITLE).unwrap();
        store
            .append_or_update(
                &session.id,
                1,
                MessageRole::User,
                "persisted",
                MessageStatus::Complete,
            )
            .unwrap();
        session.id
    };

    let store = ConversationRepo::new(rpchat::store::init(&path).unwrap());
    let history = store.read_history(&session_id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].content, "persisted");
}
