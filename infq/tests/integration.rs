//! End-to-end tests driving `InfQ` through a real directory on disk,
//! exercising the three tiers, the snapshot/restore protocol, and restart.

use std::time::Duration;

use infq::{Error, InfQ, InfqConfig};

fn small_queue(dir: &std::path::Path) -> InfQ {
    let config = InfqConfig::builder()
        .data_path(dir)
        .mem_block_size(64)
        .pushq_blocks_num(3)
        .popq_blocks_num(2)
        .block_usage_to_dump(0.5)
        .build()
        .expect("valid config");
    InfQ::open(config).expect("open queue")
}

fn pop_blocking(q: &InfQ, buf: &mut [u8]) -> (usize, i64) {
    for _ in 0..200 {
        match q.pop(buf) {
            Ok(Some(result)) => return result,
            Ok(None) => panic!("queue unexpectedly empty"),
            Err(Error::NotReady) => std::thread::sleep(Duration::from_millis(5)),
            Err(err) => panic!("pop failed: {err}"),
        }
    }
    panic!("pop never became ready: loader did not catch up in time");
}

fn elem(i: i64) -> Vec<u8> {
    format!("element-{i:04}").into_bytes()
}

#[test]
fn pushes_and_pops_stay_in_fifo_order_in_memory() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    for i in 0..3 {
        q.push(&elem(i)).unwrap();
    }

    let mut buf = [0u8; 64];
    for i in 0..3 {
        let (len, idx) = pop_blocking(&q, &mut buf);
        assert_eq!(idx, i);
        assert_eq!(&buf[..len], elem(i).as_slice());
    }
    assert!(!q.just_pop().unwrap());
}

#[test]
fn overflow_to_disk_then_full_drain_preserves_order() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    const N: i64 = 60;
    for i in 0..N {
        q.push(&elem(i)).unwrap();
    }

    // Small rings guarantee the file chain fills up along the way.
    let stats = q.fetch_stats();
    assert!(stats.fileq_blocks_num > 0, "expected overflow to disk with such small rings");

    let mut buf = [0u8; 64];
    for i in 0..N {
        let (len, idx) = pop_blocking(&q, &mut buf);
        assert_eq!(idx, i);
        assert_eq!(&buf[..len], elem(i).as_slice());
    }
    assert_eq!(q.size(), 0);
}

#[test]
fn at_resolves_elements_across_all_three_tiers() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    const N: i64 = 50;
    for i in 0..N {
        q.push(&elem(i)).unwrap();
    }
    let stats = q.fetch_stats();
    assert!(stats.fileq_blocks_num > 0, "need data parked on disk to exercise the file-chain path");

    let mut buf = [0u8; 64];
    for i in 0..N {
        let len = q.at(i, &mut buf).unwrap();
        assert_eq!(&buf[..len], elem(i).as_slice(), "at({i}) before popping");
    }

    // Pop half, then re-check `at` against the new relative base.
    for _ in 0..(N / 2) {
        pop_blocking(&q, &mut buf);
    }
    for i in 0..(N / 2) {
        let len = q.at(i, &mut buf).unwrap();
        assert_eq!(&buf[..len], elem(N / 2 + i).as_slice(), "at({i}) after popping half the queue");
    }
}

#[test]
fn dump_then_load_restores_state_discarding_later_pushes() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    const N: i64 = 20;
    for i in 0..N {
        q.push(&elem(i)).unwrap();
    }

    let snapshot = q.dump().unwrap();
    assert_eq!(q.size(), N);

    for i in N..(N + 10) {
        q.push(&elem(i)).unwrap();
    }
    assert_eq!(q.size(), N + 10);

    q.load(&snapshot).unwrap();
    assert_eq!(q.size(), N);

    let mut buf = [0u8; 64];
    for i in 0..N {
        let (len, idx) = pop_blocking(&q, &mut buf);
        assert_eq!(idx, i);
        assert_eq!(&buf[..len], elem(i).as_slice());
    }
}

#[test]
fn diff_retention_survives_two_snapshot_cycles() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    for i in 0..20 {
        q.push(&elem(i)).unwrap();
    }
    let first_snapshot = q.dump().unwrap();
    q.done_dump().unwrap();
    let first_meta = q.fetch_dump_meta();

    for i in 20..40 {
        q.push(&elem(i)).unwrap();
    }
    let second_snapshot = q.dump().unwrap();
    q.done_dump().unwrap();
    let second_meta = q.fetch_dump_meta();

    assert_ne!(first_meta.global_ele_idx, second_meta.global_ele_idx);

    // The first snapshot must still describe a loadable, self-consistent
    // generation even though a second snapshot has since been taken and
    // confirmed — done_dump only retires files the newer generation does
    // not also need. Drop `q` first so its executors stop touching the
    // shared directory while each restorer reads from it.
    drop(q);

    {
        let restorer = small_queue(dir.path());
        restorer.load(&first_snapshot).unwrap();
        assert_eq!(restorer.size(), 20);
    }
    {
        let restorer = small_queue(dir.path());
        restorer.load(&second_snapshot).unwrap();
        assert_eq!(restorer.size(), 40);
    }
}

#[test]
fn done_dump_retires_a_superseded_generations_exclusive_files() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());

    for i in 0..60 {
        q.push(&elem(i)).unwrap();
    }
    assert!(q.fetch_stats().fileq_blocks_num > 0, "need file-chain entries to retire");

    let first_snapshot = q.dump().unwrap();
    q.done_dump().unwrap();
    let first_meta = q.fetch_dump_meta();

    // Draining moves the file chain's front suffix forward: the loader
    // consumes file-chain entries into the pop ring, leaving their backing
    // files on disk until a later snapshot's diff decides they're no
    // longer reachable by anyone.
    let mut buf = [0u8; 64];
    for _ in 0..30 {
        pop_blocking(&q, &mut buf);
    }
    for i in 60..90 {
        q.push(&elem(i)).unwrap();
    }

    let second_snapshot = q.dump().unwrap();
    q.done_dump().unwrap();
    let second_meta = q.fetch_dump_meta();

    assert!(
        second_meta.file_meta.file_range.start > first_meta.file_meta.file_range.start,
        "draining should have advanced the file chain's front suffix between snapshots"
    );

    for _ in 0..200 {
        if q.fetch_stats().unlink_exec.pending_jobs == 0 {
            break;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(q.fetch_stats().unlink_exec.pending_jobs, 0, "unlinker did not drain in time");

    drop(q);

    // The first snapshot's exclusive suffix range is gone: it can no
    // longer be restored once the second snapshot has been confirmed.
    {
        let restorer = small_queue(dir.path());
        assert!(restorer.load(&first_snapshot).is_err(), "first snapshot should no longer be restorable");
    }
    // The second snapshot remains fully intact.
    {
        let restorer = small_queue(dir.path());
        restorer.load(&second_snapshot).unwrap();
        assert_eq!(restorer.size(), 60);
    }
}

#[test]
fn reopening_the_same_directory_restores_from_a_saved_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = {
        let q = small_queue(dir.path());
        for i in 0..15 {
            q.push(&elem(i)).unwrap();
        }
        let snapshot = q.dump().unwrap();
        q.done_dump().unwrap();
        snapshot
        // `q` drops here: background workers stop, file-chain contents stay on disk.
    };

    let reopened = small_queue(dir.path());
    reopened.load(&snapshot).unwrap();
    assert_eq!(reopened.size(), 15);

    let mut buf = [0u8; 64];
    for i in 0..15 {
        let (len, idx) = pop_blocking(&reopened, &mut buf);
        assert_eq!(idx, i);
        assert_eq!(&buf[..len], elem(i).as_slice());
    }
}

#[test]
fn destroy_completely_removes_every_file_chain_entry() {
    let dir = tempfile::tempdir().unwrap();
    let q = small_queue(dir.path());
    for i in 0..40 {
        q.push(&elem(i)).unwrap();
    }
    assert!(q.fetch_stats().fileq_blocks_num > 0);

    q.destroy_completely().unwrap();

    let remaining: Vec<_> = std::fs::read_dir(dir.path()).unwrap().filter_map(Result::ok).collect();
    assert!(remaining.is_empty(), "expected no files left after destroy_completely, found {remaining:?}");
}
