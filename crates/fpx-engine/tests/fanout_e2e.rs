#![forbid(unsafe_code)]

//! End-to-end fan-out and completion behaviour against in-memory and
//! file-backed replicas.

use fpx_backing::{BackingKind, BackingTarget, FsOpener, MemOp, MemOpener, MemTarget};
use fpx_engine::{Bio, BioCompletion, BioStatus, Device, DeviceConfig, SlowPath};
use fpx_types::{BioFlags, DeviceId, DeviceMode};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

const TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingSlowPath {
    bios: Mutex<Vec<Bio>>,
}

impl SlowPath for RecordingSlowPath {
    fn submit(&self, _device: DeviceId, bio: Bio) {
        self.bios.lock().push(bio);
    }
}

struct Rig {
    device: Device,
    targets: Vec<Arc<MemTarget>>,
    slow: Arc<RecordingSlowPath>,
}

fn rig_with(replicas: usize, kind: BackingKind, config: DeviceConfig) -> Rig {
    let opener = Arc::new(MemOpener::new());
    let targets: Vec<Arc<MemTarget>> = (0..replicas)
        .map(|i| opener.insert(&format!("/r{i}"), MemTarget::with_kind(1 << 20, kind)))
        .collect();
    let slow = Arc::new(RecordingSlowPath::default());
    let paths: Vec<String> = (0..replicas).map(|i| format!("/r{i}")).collect();
    let device = Device::new(
        DeviceConfig { paths, ..config },
        opener,
        Arc::clone(&slow) as Arc<dyn SlowPath>,
    )
    .expect("device");
    Rig {
        device,
        targets,
        slow,
    }
}

fn rig(replicas: usize) -> Rig {
    rig_with(replicas, BackingKind::RegularFile, DeviceConfig::for_device(1))
}

fn completion() -> (
    impl FnOnce(BioCompletion) + Send + 'static,
    Receiver<BioCompletion>,
) {
    let (tx, rx) = mpsc::channel();
    (
        move |c: BioCompletion| {
            let _ = tx.send(c);
        },
        rx,
    )
}

fn write(device: &Device, offset: u64, data: Vec<u8>, flags: BioFlags) -> BioCompletion {
    let (done, rx) = completion();
    device.submit(Bio::write(offset, vec![data], flags, done));
    rx.recv_timeout(TIMEOUT).expect("write completion")
}

fn read(device: &Device, offset: u64, lens: &[usize]) -> BioCompletion {
    let (done, rx) = completion();
    device.submit(Bio::read(offset, lens, done));
    rx.recv_timeout(TIMEOUT).expect("read completion")
}

#[test]
fn write_reaches_every_replica_and_completes_once() {
    let rig = rig(3);
    let (done, rx) = completion();
    rig.device.submit(Bio::write(
        4096,
        vec![vec![0xA5; 4096], vec![0x5A; 4096]],
        BioFlags::NONE,
        done,
    ));
    let completion = rx.recv_timeout(TIMEOUT).expect("completion");
    assert_eq!(completion.status, BioStatus::Ok);
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err(), "completed twice");

    for target in &rig.targets {
        let data = target.snapshot();
        assert!(data[4096..8192].iter().all(|&b| b == 0xA5));
        assert!(data[8192..12288].iter().all(|&b| b == 0x5A));
    }
    let stats = rig.device.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.completions, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.live_trackers, 0);
    assert_eq!(stats.write_segments, 6, "two segments on each of three file replicas");
}

#[test]
fn reads_are_served_by_the_primary_only() {
    let rig = rig(3);
    for (i, target) in rig.targets.iter().enumerate() {
        let fill = u8::try_from(i + 1).expect("small");
        target.write_at(0, &[fill; 8192]).expect("seed");
    }
    let completion = read(&rig.device, 0, &[4096, 4096]);
    assert_eq!(completion.status, BioStatus::Ok);
    assert!(completion.segments.iter().flatten().all(|&b| b == 1));

    assert!(rig.targets[0].ops().iter().any(|op| matches!(op, MemOp::Read { .. })));
    for replica in &rig.targets[1..] {
        assert!(!replica.ops().iter().any(|op| matches!(op, MemOp::Read { .. })));
    }
}

#[test]
fn one_failed_replica_fails_the_request_without_quorum() {
    let rig = rig(3);
    rig.targets[1].fail_writes(true);
    let completion = write(&rig.device, 0, vec![7; 512], BioFlags::NONE);
    assert_eq!(completion.status, BioStatus::IoError);
    assert_eq!(completion.status.errno(), libc::EIO);

    assert!(rig.targets[0].snapshot()[..512].iter().all(|&b| b == 7));
    assert!(rig.targets[2].snapshot()[..512].iter().all(|&b| b == 7));
    let stats = rig.device.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.completions, 1);
    assert_eq!(stats.live_trackers, 0);
}

#[test]
fn short_write_on_any_replica_is_an_io_error() {
    let rig = rig(2);
    rig.targets[0].short_write(Some(100));
    let completion = write(&rig.device, 0, vec![1; 512], BioFlags::NONE);
    assert_eq!(completion.status, BioStatus::IoError);
}

#[test]
fn short_read_zero_fills_the_remainder() {
    let opener = Arc::new(MemOpener::new());
    let primary = opener.insert("/r0", MemTarget::new(6144));
    primary.write_at(0, &[0xEE; 6144]).expect("seed");
    let device = Device::new(
        DeviceConfig {
            paths: vec!["/r0".into()],
            ..DeviceConfig::for_device(2)
        },
        opener,
        Arc::new(RecordingSlowPath::default()),
    )
    .expect("device");

    let completion = read(&device, 0, &[4096, 4096]);
    assert_eq!(completion.status, BioStatus::Ok);
    let data: Vec<u8> = completion.segments.concat();
    assert!(data[..6144].iter().all(|&b| b == 0xEE));
    assert!(data[6144..].iter().all(|&b| b == 0));
}

#[test]
fn fua_write_flushes_each_replica_after_the_write() {
    let rig = rig(2);
    let completion = write(&rig.device, 0, vec![3; 4096], BioFlags::FUA);
    assert_eq!(completion.status, BioStatus::Ok);

    for target in &rig.targets {
        assert_eq!(
            target.ops(),
            vec![MemOp::Write { offset: 0, len: 4096 }, MemOp::Sync]
        );
    }
    let stats = rig.device.stats();
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.fua, 1);
    assert_eq!(stats.flushes, 1);
}

#[test]
fn preflush_runs_before_the_write() {
    let rig = rig(2);
    let completion = write(&rig.device, 512, vec![3; 512], BioFlags::PREFLUSH);
    assert_eq!(completion.status, BioStatus::Ok);
    for target in &rig.targets {
        assert_eq!(
            target.ops(),
            vec![MemOp::Sync, MemOp::Write { offset: 512, len: 512 }]
        );
    }
    assert_eq!(rig.device.stats().preflush, 1);
}

#[test]
fn failed_fua_flush_fails_the_request() {
    let rig = rig(2);
    rig.targets[1].fail_sync(true);
    let completion = write(&rig.device, 0, vec![3; 512], BioFlags::FUA);
    assert_eq!(completion.status, BioStatus::IoError);
}

#[test]
fn flush_request_reaches_every_replica() {
    let rig = rig(3);
    let (done, rx) = completion();
    rig.device.submit(Bio::flush(done));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("flush").status, BioStatus::Ok);
    for target in &rig.targets {
        assert_eq!(target.ops(), vec![MemOp::Sync]);
    }
    assert_eq!(rig.device.stats().flushes, 1);
}

#[test]
fn sync_mode_turns_flushes_into_no_ops() {
    let config = DeviceConfig {
        mode: DeviceMode {
            sync: true,
            ..DeviceMode::READ_WRITE
        },
        ..DeviceConfig::for_device(3)
    };
    let rig = rig_with(2, BackingKind::RegularFile, config);
    let (done, rx) = completion();
    rig.device.submit(Bio::flush(done));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("flush").status, BioStatus::Ok);
    for target in &rig.targets {
        assert!(target.ops().is_empty());
    }
    let stats = rig.device.stats();
    assert_eq!(stats.flush_nops, 1);
    assert_eq!(stats.flushes, 0);
}

#[test]
fn unsupported_discard_is_success() {
    let rig = rig(2);
    for target in &rig.targets {
        target.punch_unsupported(true);
    }
    let (done, rx) = completion();
    rig.device.submit(Bio::discard(0, 8192, done));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("discard").status, BioStatus::Ok);
    assert_eq!(rig.device.stats().discards, 1);
}

#[test]
fn write_zeroes_punches_every_replica() {
    let rig = rig(2);
    write(&rig.device, 0, vec![9; 8192], BioFlags::NONE);
    let (done, rx) = completion();
    rig.device.submit(Bio::write_zeroes(4096, 4096, done));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("zeroes").status, BioStatus::Ok);
    for target in &rig.targets {
        let data = target.snapshot();
        assert!(data[..4096].iter().all(|&b| b == 9));
        assert!(data[4096..8192].iter().all(|&b| b == 0));
    }
}

#[test]
fn tracker_exhaustion_fails_with_no_memory_and_leaks_nothing() {
    let config = DeviceConfig {
        max_trackers: 2,
        ..DeviceConfig::for_device(4)
    };
    let rig = rig_with(3, BackingKind::RegularFile, config);
    let completion = write(&rig.device, 0, vec![1; 512], BioFlags::NONE);
    assert_eq!(completion.status, BioStatus::NoMemory);
    assert_eq!(completion.segments, vec![vec![1; 512]]);
    for target in &rig.targets {
        assert!(target.ops().is_empty());
    }
    let stats = rig.device.stats();
    assert_eq!(stats.live_trackers, 0);
    assert_eq!(stats.inflight, 0);

    // Reads need a single tracker and still fit.
    assert_eq!(read(&rig.device, 0, &[512]).status, BioStatus::Ok);
}

#[test]
fn read_only_device_rejects_writes() {
    let config = DeviceConfig {
        mode: DeviceMode::READ_ONLY,
        ..DeviceConfig::for_device(5)
    };
    let rig = rig_with(2, BackingKind::RegularFile, config);
    assert_eq!(
        write(&rig.device, 0, vec![1; 512], BioFlags::NONE).status,
        BioStatus::IoError
    );
    assert_eq!(read(&rig.device, 0, &[512]).status, BioStatus::Ok);
    for target in &rig.targets {
        assert!(!target.ops().iter().any(|op| matches!(op, MemOp::Write { .. })));
    }
}

#[test]
fn disconnected_device_fails_with_no_device() {
    let rig = rig(2);
    rig.device.set_connected(false).expect("disconnect");
    assert!(!rig.device.is_connected());
    assert!(!rig.device.fastpath_enabled());
    let completion = write(&rig.device, 0, vec![1; 512], BioFlags::NONE);
    assert_eq!(completion.status, BioStatus::NoDevice);

    rig.device.set_connected(true).expect("reconnect");
    assert!(rig.device.fastpath_enabled());
    assert_eq!(
        write(&rig.device, 0, vec![1; 512], BioFlags::NONE).status,
        BioStatus::Ok
    );
}

#[test]
fn device_without_backing_uses_the_slow_path() {
    let slow = Arc::new(RecordingSlowPath::default());
    let device = Device::new(
        DeviceConfig::for_device(6),
        Arc::new(MemOpener::new()),
        Arc::clone(&slow) as Arc<dyn SlowPath>,
    )
    .expect("device");
    let (done, rx) = completion();
    device.submit(Bio::write(0, vec![vec![4; 512]], BioFlags::FUA, done));

    let bio = slow.bios.lock().pop().expect("handed to slow path");
    assert_eq!(bio.segments(), &[vec![4; 512]]);
    assert!(bio.flags().fua);
    bio.complete(BioStatus::Ok);
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("completion").status, BioStatus::Ok);
    assert_eq!(device.stats().slow_path, 1);
}

#[test]
fn block_device_replicas_complete_through_the_reaper() {
    let rig = rig_with(3, BackingKind::BlockDevice, DeviceConfig::for_device(7));
    let completion = write(&rig.device, 8192, vec![0x42; 4096], BioFlags::FUA);
    assert_eq!(completion.status, BioStatus::Ok);
    for target in &rig.targets {
        assert!(target.snapshot()[8192..12288].iter().all(|&b| b == 0x42));
    }
    let stats = rig.device.stats();
    assert_eq!(stats.switched, 3);
    assert_eq!(stats.write_segments, 0, "block units bypass the flush batch counter");

    let completion = read(&rig.device, 8192, &[4096]);
    assert!(completion.segments[0].iter().all(|&b| b == 0x42));
    assert_eq!(rig.device.stats().switched, 4);
}

#[test]
fn block_device_replicas_run_concurrently() {
    let rig = rig_with(3, BackingKind::BlockDevice, DeviceConfig::for_device(8));
    for target in &rig.targets {
        target.delay(Some(Duration::from_millis(300)));
    }
    let started = Instant::now();
    let completion = write(&rig.device, 0, vec![0x17; 4096], BioFlags::NONE);
    let elapsed = started.elapsed();
    assert_eq!(completion.status, BioStatus::Ok);
    // Three 300 ms writes back to back would take at least 900 ms.
    assert!(elapsed < Duration::from_millis(750), "replicas serialized: {elapsed:?}");
    for target in &rig.targets {
        assert!(target.snapshot()[..4096].iter().all(|&b| b == 0x17));
    }
}

#[test]
fn concurrent_writers_all_complete() {
    let rig = Arc::new(rig(3));
    let writers: Vec<_> = (0..4_u64)
        .map(|w| {
            let rig = Arc::clone(&rig);
            thread::spawn(move || {
                for i in 0..16_u64 {
                    let offset = (w * 16 + i) * 4096;
                    let fill = u8::try_from(w + 1).expect("small");
                    let done = write(&rig.device, offset, vec![fill; 4096], BioFlags::NONE);
                    assert_eq!(done.status, BioStatus::Ok);
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().expect("writer");
    }
    let stats = rig.device.stats();
    assert_eq!(stats.completions, 64);
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.live_trackers, 0);
    let primary = rig.targets[0].snapshot();
    for target in &rig.targets[1..] {
        assert_eq!(target.snapshot()[..64 * 4096], primary[..64 * 4096]);
    }
}

#[test]
fn file_backed_replicas_on_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let paths: Vec<String> = (0..2)
        .map(|i| {
            let path = dir.path().join(format!("replica{i}.img"));
            std::fs::write(&path, vec![0_u8; 64 * 1024]).expect("create");
            path.to_str().expect("utf8").to_owned()
        })
        .collect();
    let device = Device::new(
        DeviceConfig {
            paths: paths.clone(),
            ..DeviceConfig::for_device(8)
        },
        Arc::new(FsOpener),
        Arc::new(RecordingSlowPath::default()),
    )
    .expect("device");
    assert_eq!(device.backing_paths(), paths);

    let written = write(&device, 4096, vec![0xC3; 4096], BioFlags::FUA);
    assert_eq!(written.status, BioStatus::Ok);
    for path in &paths {
        let bytes = std::fs::read(path).expect("read back");
        assert!(bytes[4096..8192].iter().all(|&b| b == 0xC3));
        assert_eq!(bytes.len(), 64 * 1024);
    }
    let readback = read(&device, 4096, &[4096]);
    assert!(readback.segments[0].iter().all(|&b| b == 0xC3));

    // Discard keeps the file size; unsupported filesystems report success.
    let (done, rx) = completion();
    device.submit(Bio::discard(4096, 4096, done));
    assert_eq!(rx.recv_timeout(TIMEOUT).expect("discard").status, BioStatus::Ok);
    assert_eq!(std::fs::metadata(&paths[1]).expect("meta").len(), 64 * 1024);
}

#[test]
fn background_flush_syncs_after_threshold() {
    let config = DeviceConfig {
        background_flush: true,
        flush_write_segments: 4,
        workers: 1,
        ..DeviceConfig::for_device(9)
    };
    let rig = rig_with(1, BackingKind::RegularFile, config);
    for i in 0..6_u64 {
        write(&rig.device, i * 512, vec![1; 512], BioFlags::NONE);
    }
    let stats = rig.device.stats();
    assert_eq!(stats.syncs, 1);
    assert_eq!(stats.write_segments, 1);
    assert_eq!(
        rig.targets[0].ops().iter().filter(|op| **op == MemOp::Sync).count(),
        1
    );
}

#[test]
fn slow_path_requests_are_not_counted_in_flight() {
    let rig = rig(1);
    rig.device.disable();
    let (done, _rx) = completion();
    rig.device.submit(Bio::read(0, &[512], done));
    let stats = rig.device.stats();
    assert_eq!(stats.inflight, 0);
    assert_eq!(stats.slow_path, 1);
    assert_eq!(rig.slow.bios.lock().len(), 1);
}
