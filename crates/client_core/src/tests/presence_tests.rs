use super::*;

fn at(raw: &str) -> DateTime<Utc> {
    raw.parse().expect("timestamp")
}

fn snapshot() -> PresenceAction {
    PresenceAction::Snapshot(vec![
        PresenceRecordPayload {
            user_id: UserId(1),
            visible_status: Some(PresenceStatus::Online),
            last_seen_at: None,
            hidden: Some(true),
        },
        PresenceRecordPayload {
            user_id: UserId(2),
            visible_status: Some(PresenceStatus::Offline),
            last_seen_at: Some(at("2024-03-01T08:00:00Z")),
            hidden: None,
        },
    ])
}

#[test]
fn snapshot_is_idempotent() {
    let once = apply(PresenceState::default(), snapshot());
    let twice = apply(once.clone(), snapshot());
    assert_eq!(once, twice);
    assert_eq!(once.len(), 2);
}

#[test]
fn snapshot_keeps_fields_the_record_omits() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Offline {
            user_id: UserId(5),
            last_seen_at: Some(at("2024-03-01T09:00:00Z")),
            hidden: Some(true),
        },
    );
    let state = apply(
        state,
        PresenceAction::Snapshot(vec![PresenceRecordPayload {
            user_id: UserId(5),
            visible_status: None,
            last_seen_at: None,
            hidden: None,
        }]),
    );

    let record = state.get(UserId(5)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Offline);
    assert_eq!(record.last_seen_at, Some(at("2024-03-01T09:00:00Z")));
    assert!(record.hidden);
}

#[test]
fn snapshot_drops_last_seen_for_online_users() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Snapshot(vec![PresenceRecordPayload {
            user_id: UserId(3),
            visible_status: Some(PresenceStatus::Online),
            last_seen_at: Some(at("2024-03-01T09:00:00Z")),
            hidden: None,
        }]),
    );
    assert_eq!(state.get(UserId(3)).expect("record").last_seen_at, None);
}

#[test]
fn online_clears_last_seen_and_defaults_hidden() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Offline {
            user_id: UserId(1),
            last_seen_at: Some(at("2024-03-01T09:00:00Z")),
            hidden: Some(true),
        },
    );
    let state = apply(
        state,
        PresenceAction::Online {
            user_id: UserId(1),
            hidden: None,
        },
    );
    let record = state.get(UserId(1)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Online);
    assert_eq!(record.last_seen_at, None);
    assert!(!record.hidden);
}

#[test]
fn offline_preserves_hidden_when_not_given() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Online {
            user_id: UserId(1),
            hidden: Some(true),
        },
    );
    let state = apply(
        state,
        PresenceAction::Offline {
            user_id: UserId(1),
            last_seen_at: None,
            hidden: None,
        },
    );
    let record = state.get(UserId(1)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Offline);
    assert!(record.hidden);
}

#[test]
fn visibility_after_offline_never_clobbers_hidden() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Offline {
            user_id: UserId(4),
            last_seen_at: Some(at("2024-03-01T10:00:00Z")),
            hidden: Some(true),
        },
    );
    let state = apply(
        state,
        PresenceAction::Visibility {
            user_id: UserId(4),
            visible_status: PresenceStatus::Online,
            hidden: None,
        },
    );
    let record = state.get(UserId(4)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Online);
    assert_eq!(record.last_seen_at, None);
    assert!(record.hidden);
}

#[test]
fn visibility_to_offline_keeps_previous_last_seen() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Offline {
            user_id: UserId(4),
            last_seen_at: Some(at("2024-03-01T10:00:00Z")),
            hidden: None,
        },
    );
    let state = apply(
        state,
        PresenceAction::Visibility {
            user_id: UserId(4),
            visible_status: PresenceStatus::Offline,
            hidden: Some(true),
        },
    );
    let record = state.get(UserId(4)).expect("record");
    assert_eq!(record.last_seen_at, Some(at("2024-03-01T10:00:00Z")));
    assert!(record.hidden);
}

#[test]
fn last_seen_only_touches_last_seen() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Offline {
            user_id: UserId(6),
            last_seen_at: None,
            hidden: Some(true),
        },
    );
    let state = apply(
        state,
        PresenceAction::LastSeen {
            user_id: UserId(6),
            last_seen_at: at("2024-03-02T07:30:00Z"),
            hidden: None,
        },
    );
    let record = state.get(UserId(6)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Offline);
    assert_eq!(record.last_seen_at, Some(at("2024-03-02T07:30:00Z")));
    assert!(record.hidden);
}

#[test]
fn last_seen_heartbeat_for_online_user_is_ignored() {
    let state = apply(
        PresenceState::default(),
        PresenceAction::Online {
            user_id: UserId(6),
            hidden: None,
        },
    );
    let state = apply(
        state,
        PresenceAction::LastSeen {
            user_id: UserId(6),
            last_seen_at: at("2024-03-02T07:30:00Z"),
            hidden: Some(true),
        },
    );
    let record = state.get(UserId(6)).expect("record");
    assert_eq!(record.visible_status, PresenceStatus::Online);
    assert_eq!(record.last_seen_at, None);
    assert!(record.hidden);
}

#[test]
fn no_action_removes_a_user() {
    let mut state = apply(PresenceState::default(), snapshot());
    for action in [
        PresenceAction::Snapshot(Vec::new()),
        PresenceAction::Offline {
            user_id: UserId(1),
            last_seen_at: None,
            hidden: None,
        },
        PresenceAction::Visibility {
            user_id: UserId(2),
            visible_status: PresenceStatus::Offline,
            hidden: None,
        },
    ] {
        state = apply(state, action);
    }
    assert!(state.get(UserId(1)).is_some());
    assert!(state.get(UserId(2)).is_some());
}

#[test]
fn store_hides_last_seen_when_hidden() {
    let mut store = PresenceStore::new();
    store.ingest(PresenceEvent::Offline {
        user_id: UserId(9),
        last_seen_at: Some(at("2024-03-02T07:30:00Z")),
        hidden: Some(true),
    });
    assert!(!store.is_online(UserId(9)));
    assert_eq!(store.last_seen_for_display(UserId(9)), None);
    assert_eq!(
        store.get(UserId(9)).expect("record").last_seen_at,
        Some(at("2024-03-02T07:30:00Z"))
    );

    store.ingest(PresenceEvent::Visibility {
        user_id: UserId(9),
        visible_status: PresenceStatus::Offline,
        hidden: Some(false),
    });
    assert_eq!(
        store.last_seen_for_display(UserId(9)),
        Some(at("2024-03-02T07:30:00Z"))
    );
}

#[test]
fn unknown_user_is_not_online() {
    let store = PresenceStore::new();
    assert!(!store.is_online(UserId(77)));
    assert!(store.get(UserId(77)).is_none());
}
