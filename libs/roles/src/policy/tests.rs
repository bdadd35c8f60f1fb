use super::*;
use crate::messages::Height;

#[test]
fn test_defaults() {
    let p = PolicySnapshot::new("isaac".into());
    p.verify().unwrap();
    assert_eq!(ThresholdRatio(67), p.threshold_ratio);
    assert_eq!(time::Duration::seconds(5), p.timeout_waiting_proposal);
    assert_eq!(time::Duration::seconds(2), p.wait_broadcasting_accept_ballot);
    assert_eq!(time::Duration::seconds(30), p.timeout_process_proposal);
    assert_eq!(time::Duration::seconds(3), p.network_connection_timeout);
    assert_eq!(10, p.limit_manifests_per_worker);
}

#[test]
fn test_setters_validate() {
    let p = LocalPolicy::new(PolicySnapshot::new("isaac".into())).unwrap();
    p.set_threshold_ratio(ThresholdRatio(100)).unwrap();
    assert!(p.set_threshold_ratio(ThresholdRatio(0)).is_err());
    assert!(p.set_threshold_ratio(ThresholdRatio(101)).is_err());
    assert!(p.set_timeout_waiting_proposal(time::Duration::ZERO).is_err());
    assert!(p.set_limit_blocks_per_once(0).is_err());
    p.set_timeout_waiting_proposal(time::Duration::milliseconds(10))
        .unwrap();
    let s = p.snapshot();
    assert_eq!(ThresholdRatio(100), s.threshold_ratio);
    assert_eq!(time::Duration::milliseconds(10), s.timeout_waiting_proposal);
}

#[test]
fn test_reload_from_state() {
    let p = LocalPolicy::new(PolicySnapshot::new("isaac".into())).unwrap();
    assert!(!p.reload(None).unwrap());

    let update = PolicyUpdate {
        max_operations_in_proposal: Some(7),
        timeout_waiting_proposal_ms: Some(1500),
        ..PolicyUpdate::default()
    };
    let mut state = State::empty(POLICY_STATE_KEY);
    state.value = Some(StateValue::Hinted(serde_json::to_value(&update).unwrap()));
    state.height = Height(3);
    assert!(p.reload(Some(&state)).unwrap());
    let s = p.snapshot();
    assert_eq!(7, s.max_operations_in_proposal);
    assert_eq!(time::Duration::milliseconds(1500), s.timeout_waiting_proposal);
    // Reloading the same state changes nothing.
    assert!(!p.reload(Some(&state)).unwrap());

    // An invalid update is rejected as a whole.
    let bad = PolicyUpdate {
        max_operations_in_proposal: Some(9),
        limit_blocks_per_once: Some(0),
        ..PolicyUpdate::default()
    };
    state.value = Some(StateValue::Hinted(serde_json::to_value(&bad).unwrap()));
    assert!(p.reload(Some(&state)).is_err());
    assert_eq!(7, p.snapshot().max_operations_in_proposal);
}

#[test]
fn test_snapshot_json() {
    let p = PolicySnapshot::new("isaac".into());
    let json = serde_json::to_value(&p).unwrap();
    assert_eq!(5000, json["timeout_waiting_proposal"]);
    let got: PolicySnapshot = serde_json::from_value(json).unwrap();
    assert_eq!(p, got);
}

#[test]
fn test_update_from_snapshot() {
    let mut want = PolicySnapshot::new("isaac".into());
    want.threshold_ratio = ThresholdRatio(80);
    want.timeout_waiting_proposal = time::Duration::milliseconds(1500);
    want.limit_blocks_per_syncer = 7;
    let p = LocalPolicy::new(PolicySnapshot::new("isaac".into())).unwrap();
    p.update(&PolicyUpdate::from_snapshot(&want)).unwrap();
    assert_eq!(want, p.snapshot());
}
