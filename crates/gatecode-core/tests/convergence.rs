//! Two devices converging through one shared in-memory remote store

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use gatecode_core::remote::RetryPolicy;
use gatecode_core::{
    CodeError, Config, Device, MemoryTransport, RemoteClient, SyncEngine, SyncState,
};
use tempfile::TempDir;

struct Replica {
    engine: SyncEngine,
    transport: MemoryTransport,
    _dir: TempDir,
}

fn replica(hub: &MemoryTransport, id: &str) -> Replica {
    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let transport = hub.peer();
    let device = Device::with_id(id);
    let client = RemoteClient::new(Arc::new(transport.clone()), device.clone())
        .with_retry(RetryPolicy::none());
    let engine = SyncEngine::with_client(config, device, Some(client)).unwrap();
    Replica {
        engine,
        transport,
        _dir: dir,
    }
}

async fn wait_until<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_generated_code_reaches_other_device() {
    let hub = MemoryTransport::new();
    let a = replica(&hub, "gate-aaaa0001");
    let b = replica(&hub, "gate-bbbb0002");
    assert_eq!(a.engine.start().await, SyncState::Synced);
    assert_eq!(b.engine.start().await, SyncState::Synced);

    let record = a.engine.generate_code().await.unwrap();

    wait_until("code on b", || async {
        b.engine.list_codes().await.iter().any(|r| r.code == record.code)
    })
    .await;

    let on_b = b.engine.list_codes().await;
    assert_eq!(on_b.len(), 1);
    assert!(!on_b[0].used);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_redemption_on_one_device_blocks_the_other() {
    let hub = MemoryTransport::new();
    let a = replica(&hub, "gate-aaaa0001");
    let b = replica(&hub, "gate-bbbb0002");
    a.engine.start().await;
    b.engine.start().await;

    a.engine.create_code("DEMO1").await.unwrap();
    wait_until("code on b", || async { !b.engine.list_codes().await.is_empty() }).await;

    assert!(b.engine.verify_code("demo1").await.success);

    wait_until("usage on a", || async {
        a.engine.list_codes().await.iter().any(|r| r.used)
    })
    .await;

    assert!(matches!(
        a.engine.redeem_code("DEMO1").await,
        Err(CodeError::AlreadyUsed { .. })
    ));

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_converged_replicas_stop_writing() {
    let hub = MemoryTransport::new();
    let a = replica(&hub, "gate-aaaa0001");
    let b = replica(&hub, "gate-bbbb0002");
    a.engine.start().await;
    b.engine.start().await;

    for _ in 0..3 {
        a.engine.generate_code().await.unwrap();
        b.engine.generate_code().await.unwrap();
    }

    wait_until("six codes on both", || async {
        a.engine.list_codes().await.len() == 6 && b.engine.list_codes().await.len() == 6
    })
    .await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    // No echo loop: once converged, nobody pushes again
    let writes = (a.transport.write_count(), b.transport.write_count());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(
        (a.transport.write_count(), b.transport.write_count()),
        writes
    );

    let mut codes_a: Vec<_> = a.engine.list_codes().await.into_iter().map(|r| r.code).collect();
    let mut codes_b: Vec<_> = b.engine.list_codes().await.into_iter().map(|r| r.code).collect();
    codes_a.sort();
    codes_b.sort();
    assert_eq!(codes_a, codes_b);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_offline_device_catches_up() {
    let hub = MemoryTransport::new();
    let a = replica(&hub, "gate-aaaa0001");
    let b = replica(&hub, "gate-bbbb0002");
    a.engine.start().await;

    b.transport.set_online(false);
    assert_eq!(b.engine.start().await, SyncState::Degraded);

    a.engine.create_code("ONLINE").await.unwrap();
    b.engine.create_code("OFFLINE").await.unwrap();

    b.transport.set_online(true);
    assert_eq!(b.engine.recover().await, SyncState::Synced);

    wait_until("both codes on a", || async { a.engine.list_codes().await.len() == 2 }).await;
    assert_eq!(b.engine.list_codes().await.len(), 2);

    a.engine.stop().await;
    b.engine.stop().await;
}

#[tokio::test]
async fn test_export_import_without_remote() {
    let hub = MemoryTransport::new();
    let a = replica(&hub, "gate-aaaa0001");
    for code in ["GIFT1", "GIFT2", "GIFT3"] {
        a.engine.create_code(code).await.unwrap();
    }
    let blob = a.engine.export_unused().await.unwrap();

    let dir = TempDir::new().unwrap();
    let config = Config {
        data_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    let fresh = SyncEngine::with_transport(config, Device::generate(), None).unwrap();

    let summary = fresh.import_codes(&blob).await.unwrap();
    assert_eq!(summary.new_codes_added, 3);
    assert_eq!(summary.total_imported, 3);
    assert_eq!(fresh.list_codes().await.len(), 3);
}
