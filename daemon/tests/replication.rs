use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpListener;
use tokio::time::{sleep, timeout};

use vblock_daemon::config::{DiskConfig, NetConfig, WireProtocol};
use vblock_daemon::core::backing::{BackingStore, MemBacking};
use vblock_daemon::core::bitmap::{MemActivityLog, MemBitmap, SyncBitmap};
use vblock_daemon::core::device::Device;
use vblock_daemon::core::interval::BlockInterval;
use vblock_daemon::core::metadata::MetaStore;
use vblock_daemon::core::request::{Bio, IoKind};
use vblock_daemon::core::state::{DiskState, Role};
use vblock_daemon::p2p::PeerLink;

const CAPACITY: u64 = 1 << 20;

struct Node {
    device: Arc<Device>,
    backing: Arc<MemBacking>,
    link: Arc<PeerLink>,
}

fn build_node(
    name: &str,
    role: Role,
    protocol: WireProtocol,
    listen: Option<SocketAddr>,
    peer: Option<SocketAddr>,
) -> Node {
    let net_conf = NetConfig {
        wire_protocol: protocol,
        ..NetConfig::default()
    };
    let backing = Arc::new(MemBacking::new(CAPACITY));
    let device = Device::new(
        name.to_string(),
        role,
        net_conf,
        DiskConfig::default(),
        Arc::clone(&backing) as Arc<dyn BackingStore>,
        Arc::new(MemBitmap::new()),
        Arc::new(MemActivityLog::new()),
        Arc::new(MetaStore::load_or_init(
            format!("/nonexistent/{}.meta", name),
            role,
        )),
    );
    device.spawn_workers();
    let link = PeerLink::new(Arc::clone(&device), listen, peer);
    tokio::spawn(Arc::clone(&link).run());
    Node {
        device,
        backing,
        link,
    }
}

async fn free_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    // give the kernel a moment to release the port
    sleep(Duration::from_millis(50)).await;
    addr
}

async fn wait_connected(node: &Node) {
    timeout(Duration::from_secs(10), async {
        while node.device.get_peer().is_none() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("peers never connected");
}

fn write_bio(sector: u64, payload: &[u8]) -> Bio {
    Bio {
        kind: IoKind::Write,
        sector,
        size: payload.len() as u32,
        data: Some(Bytes::copy_from_slice(payload)),
        hard_barrier: false,
    }
}

#[tokio::test]
async fn test_protocol_c_replicates_to_peer() {
    let addr = free_port().await;
    let secondary = build_node("sec", Role::Secondary, WireProtocol::C, Some(addr), None);
    let primary = build_node("pri", Role::Primary, WireProtocol::C, None, Some(addr));

    wait_connected(&primary).await;
    wait_connected(&secondary).await;

    let payload = vec![0xC3u8; 4096];
    let rx = primary.device.submit(write_bio(8, &payload)).await;
    let result = timeout(Duration::from_secs(10), rx)
        .await
        .expect("write timed out")
        .expect("completion dropped");
    assert!(result.is_ok(), "replicated write failed: {:?}", result);

    // the data must be on the secondary's backing store
    let mirrored = secondary.backing.read(8, 4096).await.unwrap();
    assert_eq!(&mirrored[..], &payload[..]);

    // a second write fences the first epoch: its barrier goes out
    // first, the secondary answers BarrierAck(1, 1) and the first
    // request is finally destroyed
    let rx = primary.device.submit(write_bio(64, &payload)).await;
    assert!(timeout(Duration::from_secs(10), rx)
        .await
        .expect("second write timed out")
        .expect("completion dropped")
        .is_ok());

    timeout(Duration::from_secs(10), async {
        while primary.device.ap_bio() != 0 {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("completions did not drain");

    primary.link.stop();
    secondary.link.stop();
    primary.device.shutdown();
    secondary.device.shutdown();
}

#[tokio::test]
async fn test_read_shipped_to_peer_with_good_copy() {
    let addr = free_port().await;
    let secondary = build_node("sec2", Role::Secondary, WireProtocol::C, Some(addr), None);
    let primary = build_node("pri2", Role::Primary, WireProtocol::C, None, Some(addr));

    wait_connected(&primary).await;
    wait_connected(&secondary).await;

    // the good copy lives on the secondary only
    let payload = vec![0x7Eu8; 4096];
    secondary
        .backing
        .write(16, Bytes::copy_from_slice(&payload))
        .await
        .unwrap();
    primary.device.set_disk_state(DiskState::Inconsistent);
    primary
        .device
        .bitmap
        .set_out_of_sync(&BlockInterval::new(16, 4096));

    let rx = primary
        .device
        .submit(Bio {
            kind: IoKind::Read,
            sector: 16,
            size: 4096,
            data: None,
            hard_barrier: false,
        })
        .await;

    let result = timeout(Duration::from_secs(10), rx)
        .await
        .expect("read timed out")
        .expect("completion dropped")
        .expect("shipped read failed");
    assert_eq!(result, Some(Bytes::copy_from_slice(&payload)));

    primary.link.stop();
    secondary.link.stop();
    primary.device.shutdown();
    secondary.device.shutdown();
}

#[tokio::test]
async fn test_protocol_a_completes_without_peer_progress() {
    let addr = free_port().await;
    let secondary = build_node("sec3", Role::Secondary, WireProtocol::A, Some(addr), None);
    let primary = build_node("pri3", Role::Primary, WireProtocol::A, None, Some(addr));

    wait_connected(&primary).await;
    wait_connected(&secondary).await;

    let payload = vec![0x11u8; 4096];
    let rx = primary.device.submit(write_bio(0, &payload)).await;
    // completion requires only the local disk and the hand-over to the
    // socket, no acknowledgement of any kind
    assert!(timeout(Duration::from_secs(10), rx)
        .await
        .expect("protocol A write timed out")
        .expect("completion dropped")
        .is_ok());

    primary.link.stop();
    secondary.link.stop();
    primary.device.shutdown();
    secondary.device.shutdown();
}
