//! Dialing through the mock control plane

mod common;

use std::time::Duration;

use common::{echo_cluster, spawn_echo, MockControlPlane, PROMPTLY};
use podtunnel::config::{ClusterConfig, DialerConfig};
use podtunnel::k8s::PortForwardDialer;
use podtunnel::PodtunnelError;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_hello_roundtrip() {
    let mock = echo_cluster().await;
    let dialer = mock.dialer();

    let conn = dialer.dial(&CancellationToken::new(), "pods/demo.default:8080").await.unwrap();
    assert_eq!(conn.write(b"hello").await.unwrap(), 5);

    let mut buf = [0u8; 5];
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout(PROMPTLY, conn.read(&mut buf[filled..])).await.unwrap().unwrap();
        assert!(n > 0, "unexpected end of stream");
        filled += n;
    }
    assert_eq!(&buf, b"hello");
    conn.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_large_payload_arrives_in_order() {
    let mock = echo_cluster().await;
    let dialer = mock.dialer();
    let conn = dialer.dial(&CancellationToken::new(), "pods/demo.default:8080").await.unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    let writer = async {
        conn.write(&payload).await.unwrap();
        conn.close_write().unwrap();
    };
    let reader = async {
        let mut received = Vec::with_capacity(payload.len());
        let mut buf = vec![0u8; 16 * 1024];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        received
    };

    let ((), received) = timeout(Duration::from_secs(30), async { tokio::join!(writer, reader) })
        .await
        .unwrap();
    assert_eq!(received.len(), payload.len());
    assert!(received == payload, "payload corrupted or reordered");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_pod_is_dial_failed_with_server_message() {
    let mock = echo_cluster().await;
    let dialer = mock.dialer();

    let err = dialer.dial(&CancellationToken::new(), "pods/missing.default:8080").await.unwrap_err();
    match err {
        PodtunnelError::DialFailed(message) => assert_eq!(message, "pods \"missing\" not found"),
        other => panic!("expected DialFailed, got {:?}", other),
    }
    assert_eq!(dialer.registry().active_count(), 0);
}

#[tokio::test]
async fn test_invalid_descriptor() {
    let mock = echo_cluster().await;
    let dialer = mock.dialer();
    let cancel = CancellationToken::new();

    for descriptor in ["svc/demo.default:8080", "pods/demo.default:99999", "pods/.default:80", "pods/demo.:80"] {
        let err = dialer.dial(&cancel, descriptor).await.unwrap_err();
        assert!(matches!(err, PodtunnelError::InvalidTarget(_)), "{}: {:?}", descriptor, err);
    }
    assert_eq!(mock.upgrade_count(), 0);
}

#[tokio::test]
async fn test_unreachable_server_is_dial_failed() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let cluster = ClusterConfig::new(&format!("http://{}", addr)).unwrap();
    let dialer = PortForwardDialer::new(DialerConfig::new(cluster)).unwrap();
    let err = dialer.dial(&CancellationToken::new(), "pods/demo.default:8080").await.unwrap_err();
    assert!(matches!(err, PodtunnelError::DialFailed(_)), "{:?}", err);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bearer_token_is_sent() {
    let mock = echo_cluster().await;
    let conn = mock.dialer().dial(&CancellationToken::new(), "pods/demo.default:8080").await.unwrap();
    assert_eq!(mock.authorizations(), vec![Some("Bearer test-token".to_string())]);
    conn.close().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_during_handshake() {
    let mock = echo_cluster().await;
    mock.set_upgrade_delay(Duration::from_secs(10));
    let dialer = mock.dialer();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let err = timeout(PROMPTLY, dialer.dial(&cancel, "pods/demo.default:8080"))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(err, PodtunnelError::Cancelled));
    assert_eq!(dialer.registry().active_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancellation_after_dial_has_no_effect() {
    let mock = echo_cluster().await;
    let dialer = mock.dialer();
    let cancel = CancellationToken::new();

    let conn = dialer.dial(&cancel, "pods/demo.default:8080").await.unwrap();
    cancel.cancel();

    conn.write(b"still here").await.unwrap();
    let mut buf = [0u8; 10];
    let mut filled = 0;
    while filled < buf.len() {
        filled += timeout(PROMPTLY, conn.read(&mut buf[filled..])).await.unwrap().unwrap();
    }
    assert_eq!(&buf, b"still here");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dotted_pod_names() {
    let mock = MockControlPlane::start().await;
    let echo = spawn_echo().await;
    mock.add_pod("prod", "web-0.web", 443, echo);

    let conn = mock.dialer().dial(&CancellationToken::new(), "pods/web-0.web.prod:443").await.unwrap();
    assert_eq!(conn.peer_addr().to_string(), "pods/web-0.web.prod:443");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_names_outside_dns_rules_reach_the_server() {
    let mock = MockControlPlane::start().await;
    let echo = spawn_echo().await;
    mock.add_pod("SOMENAMESPACE", "SOMEPODNAME", 8080, echo);
    let dialer = mock.dialer();

    let conn = dialer.dial(&CancellationToken::new(), "pods/SOMEPODNAME.SOMENAMESPACE:8080").await.unwrap();
    conn.write(b"hi").await.unwrap();
    let mut buf = [0u8; 2];
    let mut filled = 0;
    while filled < buf.len() {
        let n = timeout(PROMPTLY, conn.read(&mut buf[filled..])).await.unwrap().unwrap();
        assert!(n > 0);
        filled += n;
    }
    assert_eq!(&buf, b"hi");

    // Unknown names are the API server's call, not a parse error
    let err = dialer.dial(&CancellationToken::new(), "pods/Missing_Pod.default:8080").await.unwrap_err();
    assert!(matches!(err, PodtunnelError::DialFailed(_)), "{:?}", err);
}
