use blockmirror::{
    try_create_device, ConnState, DeviceConfig, DeviceHandle, MemDisk, MirrorOptions, Protocol,
    ReadBalancing, RequestError, Role, VolatileMetadataStore,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

const CAPACITY: u64 = 1 << 20;

/// Set BLOCKMIRROR_TEST_LOG=1 to watch the pair talk.
fn logger() -> slog::Logger {
    use slog::Drain;
    if std::env::var("BLOCKMIRROR_TEST_LOG").is_ok() {
        let decorator = slog_term::TermDecorator::new().build();
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        slog::Logger::root(drain, slog::o!())
    } else {
        slog::Logger::root(slog::Discard, slog::o!())
    }
}

fn device(options: MirrorOptions) -> DeviceHandle {
    try_create_device(DeviceConfig {
        logger: logger(),
        target: Arc::new(MemDisk::new(CAPACITY)),
        meta_store: Box::new(VolatileMetadataStore::new()),
        options,
    })
    .expect("device creation")
}

async fn connect(a: &DeviceHandle, b: &DeviceHandle) {
    let (data_a, data_b) = tokio::io::duplex(1 << 16);
    let (meta_a, meta_b) = tokio::io::duplex(1 << 16);
    a.attach_transport(data_a, meta_a).await.expect("attach a");
    b.attach_transport(data_b, meta_b).await.expect("attach b");
}

async fn wait_cstate(handle: &DeviceHandle, want: ConnState) {
    let mut rx = handle.connection_state();
    timeout(Duration::from_secs(10), async {
        loop {
            if *rx.borrow() == want {
                return;
            }
            rx.changed().await.expect("device gone");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {:?}, at {:?}", want, *rx.borrow()));
}

fn block(fill: u8) -> Bytes {
    Bytes::from(vec![fill; 4096])
}

#[tokio::test]
async fn fresh_pair_connects_without_resync() {
    let a = device(MirrorOptions::default());
    let b = device(MirrorOptions::default());
    connect(&a, &b).await;
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    let status = a.status().await.unwrap();
    assert_eq!(status.dirty_blocks, 0);
    assert_eq!(status.role, Role::Secondary);
}

#[tokio::test]
async fn protocol_c_write_lands_on_both_replicas() {
    let a = device(MirrorOptions::default());
    let b = device(MirrorOptions::default());
    connect(&a, &b).await;
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    a.set_role(Role::Primary).await.unwrap();
    a.write(0, block(0xAB)).await.unwrap();

    // Protocol C: completion implies the peer wrote it.
    let mirrored = b.read(0, 4096).await.unwrap();
    assert_eq!(mirrored, block(0xAB));

    let local = a.read(0, 4096).await.unwrap();
    assert_eq!(local, block(0xAB));

    // The epoch drains: in-flight accounting returns to zero.
    timeout(Duration::from_secs(10), async {
        loop {
            let s = a.status().await.unwrap();
            if s.ap_in_flight_sectors == 0 && s.ap_pending == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("epoch never drained");

    assert_eq!(a.status().await.unwrap().dirty_blocks, 0);
}

#[tokio::test]
async fn secondary_rejects_host_writes() {
    let a = device(MirrorOptions::default());
    let err = a.write(0, block(1)).await.unwrap_err();
    assert!(matches!(err, RequestError::ReadOnly));
}

#[tokio::test]
async fn reads_can_be_balanced_to_the_peer() {
    let mut options = MirrorOptions::default();
    options.read_balancing = ReadBalancing::PreferRemote;
    let a = device(options);
    let b = device(MirrorOptions::default());
    connect(&a, &b).await;
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    a.set_role(Role::Primary).await.unwrap();
    a.write(8, block(0x5A)).await.unwrap();

    // Served by the peer, byte-identical all the same.
    let remote = a.read(8, 4096).await.unwrap();
    assert_eq!(remote, block(0x5A));
}

#[tokio::test]
async fn overlapping_writes_serialise() {
    let a = device(MirrorOptions::default());
    let b = device(MirrorOptions::default());
    connect(&a, &b).await;
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    a.set_role(Role::Primary).await.unwrap();

    let w1 = a.write(0, Bytes::from(vec![1u8; 8192]));
    let w2 = a.write(4, Bytes::from(vec![2u8; 4096]));
    let (r1, r2) = tokio::join!(w1, w2);
    r1.unwrap();
    r2.unwrap();

    // Both landed; no range can be half-written on only one replica.
    let ours = a.read(0, 8192).await.unwrap();
    let theirs = b.read(0, 8192).await.unwrap();
    assert_eq!(ours, theirs);
}

#[tokio::test]
async fn standalone_writes_resync_to_a_new_peer() {
    let a = device(MirrorOptions::default());
    a.set_role(Role::Primary).await.unwrap();

    for i in 0..4u8 {
        a.write(i as u64 * 8, block(i + 1)).await.unwrap();
    }
    let dirty = a.status().await.unwrap().dirty_blocks;
    assert!(dirty >= 4, "unmirrored writes must be tracked as dirty, got {}", dirty);

    let b = device(MirrorOptions::default());
    connect(&a, &b).await;

    // a promoted itself, so it holds the good data and becomes the sync
    // source; a running primary forces a full resync.
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    for i in 0..4u8 {
        let mirrored = b.read(i as u64 * 8, 4096).await.unwrap();
        assert_eq!(mirrored, block(i + 1), "block {} differs after resync", i);
    }
    assert_eq!(a.status().await.unwrap().dirty_blocks, 0);
    assert_eq!(b.status().await.unwrap().dirty_blocks, 0);
}

#[tokio::test]
async fn disconnect_dirties_unfinished_epochs() {
    let mut options = MirrorOptions::default();
    options.protocol = Protocol::A;
    let a = device(options.clone());
    let b = device(options);
    connect(&a, &b).await;
    wait_cstate(&a, ConnState::Connected).await;
    wait_cstate(&b, ConnState::Connected).await;

    a.set_role(Role::Primary).await.unwrap();
    a.write(0, block(0x77)).await.unwrap();

    a.disconnect().await;
    wait_cstate(&a, ConnState::Unconnected).await;

    // Without the barrier ack there is no proof the peer kept the epoch;
    // either the range is still marked dirty, or the ack won the race and
    // the replicas agree. Both are safe; silent divergence is not.
    let status = a.status().await.unwrap();
    if status.dirty_blocks == 0 {
        let mirrored = b.read(0, 4096).await.unwrap();
        assert_eq!(mirrored, block(0x77));
    }
}

#[tokio::test]
async fn merge_bvec_clamps_against_device_limit() {
    let a = device(MirrorOptions::default());

    // An empty bio always gets its first vector.
    assert_eq!(a.merge_bvec(0, 1 << 20), 1 << 20);
    // A partially built bio is clamped to the device maximum.
    assert_eq!(a.merge_bvec(4096, 64 * 1024), 32 * 1024 - 4096);
    assert_eq!(a.merge_bvec(32 * 1024, 4096), 0);
}
