use super::*;
use crate::protocol::now_ms;

fn open_store(dir: &Path) -> DiskDatastore {
    DiskDatastore::open(dir, RecordLogOptions::default()).unwrap()
}

#[test]
fn record_then_get_range_returns_the_value() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let variable = Variable::parse("/test/a{h=x}").unwrap();
    store.record(&variable, Value::double(1_000, 1.0)).unwrap();

    let stream = store.get_range(&variable, 0, 0);
    assert_eq!(stream.values.len(), 1);
    assert_eq!(stream.values[0].timestamp, 1_000);
    assert_eq!(stream.values[0].as_double(), Some(1.0));
}

#[test]
fn record_rejects_bad_names_and_future_timestamps() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());

    let unrooted = Variable::new("no-slash");
    assert!(matches!(
        store.record(&unrooted, Value::double(1_000, 1.0)),
        Err(StoreError::InvalidVariable(_))
    ));
    let bare = Variable::new("/");
    assert!(store.record(&bare, Value::double(1_000, 1.0)).is_err());

    let variable = Variable::new("/ok");
    let future = now_ms() + 120_000;
    assert!(matches!(
        store.record(&variable, Value::double(future, 1.0)),
        Err(StoreError::InvalidArgument(_))
    ));
    // Within the one-second drift allowance is fine.
    assert!(store
        .record(&variable, Value::double(now_ms() + 500, 1.0))
        .is_ok());
}

#[test]
fn get_range_is_half_open_and_zero_end_means_now() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let variable = Variable::new("/range");
    for ts in [1_000u64, 2_000, 3_000, 4_000] {
        store.record(&variable, Value::double(ts, ts as f64)).unwrap();
    }
    let mid = store.get_range(&variable, 2_000, 4_000);
    let got: Vec<u64> = mid.values.iter().map(|v| v.timestamp).collect();
    assert_eq!(got, vec![2_000, 3_000]);

    let all = store.get_range(&variable, 0, 0);
    assert_eq!(all.values.len(), 4);

    let missing = store.get_range(&Variable::new("/absent"), 0, 0);
    assert!(missing.values.is_empty());
}

#[test]
fn find_variables_and_prefix_list() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    for name in ["/cpu/load{host=a}", "/cpu/load{host=b}", "/mem/free{host=a}"] {
        let variable = Variable::parse(name).unwrap();
        store.record(&variable, Value::double(1_000, 0.0)).unwrap();
    }

    let cpu = store.find_variables(&Variable::parse("/cpu/*").unwrap());
    assert_eq!(cpu.len(), 2);
    let host_a = store.find_variables(&Variable::parse("*{host=a}").unwrap());
    assert_eq!(host_a.len(), 2);

    let listed = store.list_variables("/cpu/");
    assert_eq!(listed.len(), 2);
    assert!(store.list_variables("/nothing").is_empty());
}

#[test]
fn merge_iterator_orders_across_streams_with_stable_ties() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let a = Variable::parse("/m{s=a}").unwrap();
    let b = Variable::parse("/m{s=b}").unwrap();
    for ts in [1_000u64, 3_000, 5_000] {
        store.record(&a, Value::double(ts, 1.0)).unwrap();
    }
    for ts in [1_000u64, 2_000, 5_000] {
        store.record(&b, Value::double(ts, 2.0)).unwrap();
    }

    let merged: Vec<(Arc<Variable>, Value)> = store
        .find(&Variable::parse("/m{s=*}").unwrap(), 0, 6_000)
        .collect();
    let timestamps: Vec<u64> = merged.iter().map(|(_, v)| v.timestamp).collect();
    assert_eq!(timestamps, vec![1_000, 1_000, 2_000, 3_000, 5_000, 5_000]);
    // Ties resolve to the earlier stream in the sorted stream list.
    assert_eq!(merged[0].0.get_label("s"), Some("a"));
    assert_eq!(merged[1].0.get_label("s"), Some("b"));

    // The multiset matches the union of per-variable ranges.
    let union: usize = [&a, &b]
        .iter()
        .map(|v| store.get_range(v, 0, 6_000).values.len())
        .sum();
    assert_eq!(merged.len(), union);
}

#[test]
fn merge_iterator_respects_the_time_window() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let variable = Variable::new("/w");
    for ts in [500u64, 1_500, 2_500] {
        store.record(&variable, Value::double(ts, 0.0)).unwrap();
    }
    let inside: Vec<u64> = store
        .find(&Variable::new("/w"), 1_000, 2_500)
        .map(|(_, v)| v.timestamp)
        .collect();
    assert_eq!(inside, vec![1_500]);
}

#[test]
fn flush_then_reopen_replays_acknowledged_writes() {
    let tmp = tempfile::tempdir().unwrap();
    let variable = Variable::parse("/durable{k=v}").unwrap();
    {
        let store = open_store(tmp.path());
        for i in 0..100u64 {
            store
                .record(&variable, Value::double(1_000 + i, i as f64))
                .unwrap();
        }
        store.record_log().flush().unwrap();
        // Dropped without any shutdown niceties, like a crash.
    }
    let store = open_store(tmp.path());
    let stream = store.get_range(&variable, 0, 0);
    assert_eq!(stream.values.len(), 100);
    assert_eq!(stream.values[99].as_double(), Some(99.0));
}

#[test]
fn out_of_order_appends_keep_the_stream_sorted() {
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(tmp.path());
    let variable = Variable::new("/sorted");
    for ts in [3_000u64, 1_000, 2_000] {
        store.record(&variable, Value::double(ts, 0.0)).unwrap();
    }
    let got: Vec<u64> = store
        .get_range(&variable, 0, 0)
        .values
        .iter()
        .map(|v| v.timestamp)
        .collect();
    assert_eq!(got, vec![1_000, 2_000, 3_000]);
}
