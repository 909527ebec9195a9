//! End-to-end engine tests: durability, recovery, concurrency, and
//! back-pressure through the public `Db` surface.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use loam::{Db, DbOptions, LoamError, SequenceNumber, WriteBatch, WriteConfig, WriteOptions};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

fn open(dir: &std::path::Path) -> Db {
    Db::open(DbOptions::new(dir)).unwrap()
}

fn open_with(dir: &std::path::Path, write: WriteConfig) -> Db {
    let mut options = DbOptions::new(dir);
    options.write = write;
    Db::open(options).unwrap()
}

#[test]
fn put_get_delete_round_trip() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());

    let s1 = db.put("alpha", "1").unwrap();
    assert_eq!(s1, SequenceNumber(1));
    assert_eq!(db.get(b"alpha"), Some(b"1".to_vec()));

    db.delete("alpha").unwrap();
    assert_eq!(db.get(b"alpha"), None);
    assert_eq!(db.get(b"never-written"), None);
}

#[test]
fn batch_is_atomic_and_ordered() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());

    let mut batch = WriteBatch::new();
    batch
        .put(b"a".to_vec(), b"1".to_vec())
        .put(b"b".to_vec(), b"2".to_vec())
        .delete(b"a".to_vec());
    let seq = db.write(batch, &WriteOptions::default()).unwrap();
    assert_eq!(seq, SequenceNumber(1));
    assert_eq!(db.last_sequence(), SequenceNumber(3));

    assert_eq!(db.get(b"a"), None, "delete in the same batch wins");
    assert_eq!(db.get(b"b"), Some(b"2".to_vec()));
}

#[test]
fn merge_appends_to_existing_value() {
    let dir = tempdir().unwrap();
    let db = open(dir.path());
    db.put("tags", "red").unwrap();
    db.merge("tags", "green").unwrap();
    db.merge("tags", "blue").unwrap();
    assert_eq!(db.get(b"tags"), Some(b"red,green,blue".to_vec()));
}

#[test]
fn reopen_recovers_committed_writes() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.put("persist", "yes").unwrap();
        db.write(
            {
                let mut b = WriteBatch::new();
                b.put(b"sync".to_vec(), b"also".to_vec());
                b
            },
            &WriteOptions {
                sync: true,
                ..WriteOptions::default()
            },
        )
        .unwrap();
        assert_eq!(db.last_sequence(), SequenceNumber(2));
    }

    let db = open(dir.path());
    assert_eq!(db.get(b"persist"), Some(b"yes".to_vec()));
    assert_eq!(db.get(b"sync"), Some(b"also".to_vec()));
    // Sequences continue where the log left off.
    let next = db.put("more", "data").unwrap();
    assert_eq!(next, SequenceNumber(3));
}

#[test]
fn disable_wal_writes_vanish_on_reopen() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.put("logged", "1").unwrap();
        db.write(
            {
                let mut b = WriteBatch::new();
                b.put(b"volatile".to_vec(), b"1".to_vec());
                b
            },
            &WriteOptions {
                disable_wal: true,
                ..WriteOptions::default()
            },
        )
        .unwrap();
        // Visible while the engine lives.
        assert_eq!(db.get(b"volatile"), Some(b"1".to_vec()));
    }

    let db = open(dir.path());
    assert_eq!(db.get(b"logged"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"volatile"), None);
}

#[test]
fn flush_freezes_but_keeps_reads_and_recovery() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.put("before", "1").unwrap();
        db.flush().unwrap();
        db.put("after", "2").unwrap();

        // Both sides of the freeze remain readable.
        assert_eq!(db.get(b"before"), Some(b"1".to_vec()));
        assert_eq!(db.get(b"after"), Some(b"2".to_vec()));
    }

    // Both segments replay on reopen.
    let db = open(dir.path());
    assert_eq!(db.get(b"before"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"after"), Some(b"2".to_vec()));
}

#[test]
fn torn_wal_tail_loses_only_the_tail() {
    let dir = tempdir().unwrap();
    {
        let db = open(dir.path());
        db.put("intact", "1").unwrap();
    }
    // Corrupt the newest segment's tail byte, as a crash mid-append
    // would.
    let mut segments: Vec<_> = fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.extension().is_some_and(|e| e == "log"))
        .collect();
    segments.sort();
    let newest_with_data = segments
        .iter()
        .rev()
        .find(|p| fs::metadata(p).unwrap().len() > 8)
        .unwrap();
    let mut data = fs::read(newest_with_data).unwrap();
    let len = data.len();
    data[len - 1] ^= 0xff;
    fs::write(newest_with_data, &data).unwrap();

    let db = open(dir.path());
    assert_eq!(db.get(b"intact"), None, "the torn record is discarded");
    assert_eq!(db.last_sequence(), SequenceNumber::ZERO);
}

#[test]
fn stall_gate_blocks_and_rejects_at_engine_level() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open(dir.path()));
    db.stall_writes();

    let err = db
        .write(
            {
                let mut b = WriteBatch::new();
                b.put(b"now-or-never".to_vec(), b"x".to_vec());
                b
            },
            &WriteOptions {
                no_slowdown: true,
                ..WriteOptions::default()
            },
        )
        .unwrap_err();
    assert_eq!(err, LoamError::WriteStall);

    let dbp = Arc::clone(&db);
    let patient = thread::spawn(move || dbp.put("patient", "v"));
    thread::sleep(Duration::from_millis(60));
    assert!(!patient.is_finished());

    db.resume_writes();
    patient.join().unwrap().unwrap();
    assert_eq!(db.get(b"patient"), Some(b"v".to_vec()));
}

fn concurrent_workload(write: WriteConfig) {
    let dir = tempdir().unwrap();
    let db = Arc::new(open_with(dir.path(), write));
    let threads = 8;
    let writes = 50;
    let barrier = Arc::new(Barrier::new(threads));

    let mut handles = Vec::new();
    for t in 0..threads {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(t as u64);
            barrier.wait();
            for i in 0..writes {
                let mut batch = WriteBatch::new();
                batch.put(
                    format!("t{t}-k{i}").into_bytes(),
                    format!("v{i}").into_bytes(),
                );
                if rng.gen_bool(0.3) {
                    batch.put(format!("t{t}-dup{i}").into_bytes(), b"d".to_vec());
                }
                let opts = WriteOptions {
                    sync: rng.gen_bool(0.1),
                    ..WriteOptions::default()
                };
                db.write(batch, &opts).unwrap();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..writes {
            assert_eq!(
                db.get(format!("t{t}-k{i}").as_bytes()),
                Some(format!("v{i}").into_bytes()),
                "t{t}-k{i} must be readable"
            );
        }
    }

    // Everything survives a crashless reopen too.
    drop(db);
    let db = open(dir.path());
    assert_eq!(db.get(b"t0-k0"), Some(b"v0".to_vec()));
}

#[test]
fn concurrent_writers_unified() {
    concurrent_workload(WriteConfig::default());
}

#[test]
fn concurrent_writers_pipelined() {
    concurrent_workload(WriteConfig {
        enable_pipelined_write: true,
        ..WriteConfig::default()
    });
}

#[test]
fn concurrent_writers_with_interleaved_flushes() {
    let dir = tempdir().unwrap();
    let db = Arc::new(open(dir.path()));
    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers + 1));

    let mut handles = Vec::new();
    for t in 0..writers {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..40 {
                db.put(format!("t{t}-k{i}"), format!("v{i}")).unwrap();
            }
        }));
    }

    let flusher = {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..5 {
                db.flush().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
        })
    };

    for h in handles {
        h.join().unwrap();
    }
    flusher.join().unwrap();

    for t in 0..writers {
        for i in 0..40 {
            assert_eq!(
                db.get(format!("t{t}-k{i}").as_bytes()),
                Some(format!("v{i}").into_bytes())
            );
        }
    }

    // Rotation produced multiple segments, and all of them replay.
    drop(db);
    let db = open(dir.path());
    assert_eq!(db.get(b"t0-k39"), Some(b"v39".to_vec()));
    assert_eq!(db.last_sequence(), SequenceNumber(4 * 40));
}
