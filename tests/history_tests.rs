//! Ordering invariant of the history store under arbitrary arrival order.

use std::sync::Arc;

use benchwatch::error::AppendError;
use benchwatch::history::{BackfillPolicy, HistoryStore};
use benchwatch::model::{Commit, Measurement, MeasurementRecord, Run};
use chrono::{DateTime, Duration};
use proptest::prelude::*;

fn record(i: usize, minute: i64, name: &str, value: u32) -> MeasurementRecord {
    let ts = DateTime::parse_from_rfc3339("2020-12-03T12:00:00+01:00").unwrap()
        + Duration::minutes(minute);
    let meta = Arc::new(Run::new(Commit::new(format!("c{i}"), ts), 0, "cargo").metadata());
    MeasurementRecord::from_measurement(&Measurement::new(name, value as f64, 1.0, "ns/iter"), meta)
        .unwrap()
}

fn assert_ordered(store: &HistoryStore) -> Result<(), TestCaseError> {
    for name in store.names() {
        let history = store.history(&name).unwrap();
        let stamps: Vec<_> = history.iter().map(|r| r.timestamp()).collect();
        prop_assert!(stamps.windows(2).all(|w| w[0] <= w[1]), "{} out of order", name);
    }
    Ok(())
}

proptest! {
    #[test]
    fn test_reject_policy_keeps_histories_ordered(
        appends in prop::collection::vec((0i64..500, "[xyz]", 0u32..1000), 0..60)
    ) {
        let store = HistoryStore::new(BackfillPolicy::Reject);
        let mut accepted = 0;
        for (i, (minute, name, value)) in appends.into_iter().enumerate() {
            match store.append(record(i, minute, &name, value)) {
                Ok(_) => accepted += 1,
                Err(AppendError::OutOfOrderInsert { latest, found, .. }) => prop_assert!(found < latest),
                Err(other) => prop_assert!(false, "unexpected {:?}", other),
            }
        }
        assert_ordered(&store)?;
        let stored: usize = store.names().iter().map(|n| store.history(n).unwrap().len()).sum();
        prop_assert_eq!(stored, accepted);
    }

    #[test]
    fn test_resort_policy_accepts_everything_in_order(
        appends in prop::collection::vec((0i64..500, "[xyz]", 0u32..1000), 0..60)
    ) {
        let store = HistoryStore::new(BackfillPolicy::Resort);
        let total = appends.len();
        for (i, (minute, name, value)) in appends.into_iter().enumerate() {
            prop_assert!(store.append(record(i, minute, &name, value)).is_ok());
        }
        assert_ordered(&store)?;
        prop_assert_eq!(store.run_count(), total);
    }
}

#[test]
fn test_equal_timestamps_keep_arrival_order() {
    let store = HistoryStore::new(BackfillPolicy::Resort);
    store.append(record(0, 10, "x", 1)).unwrap();
    store.append(record(1, 20, "x", 2)).unwrap();
    store.append(record(2, 10, "x", 3)).unwrap();
    let values: Vec<f64> = store.history("x").unwrap().values().collect();
    assert_eq!(values, vec![1.0, 3.0, 2.0]);
}

#[test]
fn test_unknown_benchmark_has_no_history() {
    let store = HistoryStore::default();
    store.append(record(0, 0, "x", 1)).unwrap();
    assert!(store.history("y").is_none());
    assert!(store.window("y", 3).is_empty());
    assert_eq!(store.names().into_iter().collect::<Vec<_>>(), vec!["x".to_string()]);
}
