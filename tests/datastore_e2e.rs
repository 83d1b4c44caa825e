//! End-to-end flows over the library API: durability across restart,
//! corrupt-log recovery, and the record-log → indexed-file → file-manager
//! pipeline.

use rand::Rng;

use tidemark::mutate::apply_mutations;
use tidemark::protocol::{Mutation, MutationKind, Value, ValueStream};
use tidemark::store::file_manager::StoreFileManager;
use tidemark::store::record_log::{RecordLog, RecordLogOptions};
use tidemark::store::DiskDatastore;
use tidemark::variable::Variable;

fn small_log_options() -> RecordLogOptions {
    RecordLogOptions {
        max_log_size_bytes: 1024,
        queue_capacity: 10_000,
    }
}

#[test]
fn restart_replays_every_flushed_sample() {
    let tmp = tempfile::tempdir().unwrap();
    let variable = Variable::parse("/e2e/replay{host=a}").unwrap();
    {
        let store = DiskDatastore::open(tmp.path(), RecordLogOptions::default()).unwrap();
        for i in 0..1000u64 {
            store
                .record(&variable, Value::double(10_000 + i * 100, i as f64))
                .unwrap();
        }
        store.record_log().flush().unwrap();
        // Dropped without rotating or reindexing, like a crash before the
        // indexer ran.
    }
    let store = DiskDatastore::open(tmp.path(), RecordLogOptions::default()).unwrap();
    let stream = store.get_range(&variable, 0, 0);
    assert_eq!(stream.values.len(), 1000);
    assert_eq!(stream.values[0].as_double(), Some(0.0));
    assert_eq!(stream.values[999].as_double(), Some(999.0));
}

#[test]
fn corrupted_log_replays_partially_without_panicking() {
    let tmp = tempfile::tempdir().unwrap();
    let log = RecordLog::new(tmp.path(), RecordLogOptions::default());
    let total = 200u64;
    for i in 0..total {
        log.add(ValueStream::single(
            Variable::new("/e2e/corrupt"),
            Value::double(1_000 + i, i as f64),
        ))
        .unwrap();
    }
    log.flush().unwrap();

    // Flip 10 random bytes anywhere in the log.
    let path = log.filename();
    let mut bytes = std::fs::read(&path).unwrap();
    let mut rng = rand::thread_rng();
    for _ in 0..10 {
        let at = rng.gen_range(0..bytes.len());
        bytes[at] ^= 0xff;
    }
    std::fs::write(&path, &bytes).unwrap();

    let replayed = log.replay().count();
    assert!(replayed >= 1, "nothing survived the corruption");
    assert!(
        replayed < total as usize,
        "corruption should cost at least one record"
    );
}

#[test]
fn rotate_reindex_then_serve_from_the_file_manager() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DiskDatastore::open(tmp.path(), small_log_options()).unwrap();
    let gauge = Variable::parse("/pipeline/gauge{host=a}").unwrap();
    let constant = Variable::parse("/pipeline/constant").unwrap();
    for i in 0..60u64 {
        store
            .record(&gauge, Value::double(1_000 + i * 50, (i % 7) as f64))
            .unwrap();
        store.record(&constant, Value::double(1_000 + i * 50, 42.0)).unwrap();
    }
    store.record_log().flush().unwrap();
    store.record_log().rotate().unwrap();
    assert!(store.record_log().reindex());

    let manager = StoreFileManager::new(tmp.path());
    assert_eq!(manager.num_open_files(), 1);

    let gauges = manager.get_variable(&Variable::parse("/pipeline/gauge{host=*}").unwrap());
    assert_eq!(gauges.len(), 1);
    assert_eq!(gauges[0].values.len(), 60);

    // The constant stream was RLE-collapsed during reindexing.
    let constants = manager.get_variable(&constant);
    assert_eq!(constants.len(), 1);
    assert_eq!(constants[0].values.len(), 1);
    assert_eq!(constants[0].values[0].end_timestamp, Some(1_000 + 59 * 50));
}

#[test]
fn rate_mutation_over_recorded_data() {
    let tmp = tempfile::tempdir().unwrap();
    let store = DiskDatastore::open(tmp.path(), RecordLogOptions::default()).unwrap();
    let variable = Variable::new("/m");
    for (ts, v) in [(0u64, 10.0), (1_000, 20.0), (2_000, 40.0)] {
        store.record(&variable, Value::double(ts, v)).unwrap();
    }
    let raw = store.get_range(&variable, 0, 0);
    let out = apply_mutations(&[Mutation::plain(MutationKind::Rate)], &raw).unwrap();
    let got: Vec<(u64, f64)> = out
        .values
        .iter()
        .map(|v| (v.timestamp, v.as_double().unwrap()))
        .collect();
    assert_eq!(got, vec![(1_000, 0.01), (2_000, 0.02)]);
}
