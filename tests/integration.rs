//! End-to-end tests over real localhost TCP: one polled host, one or more
//! polled consumers, full wire round trips.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use simpleservice::{Consumer, Host, HostConfig, Visibility};

async fn pump(host: &mut Host, consumers: &mut [&mut Consumer], want: usize) -> usize {
    let mut total = 0;
    for _ in 0..400 {
        host.poll();
        for consumer in consumers.iter_mut() {
            total += consumer.poll();
        }
        if total >= want {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    total
}

async fn wait_connections(host: &Host, want: usize) {
    for _ in 0..400 {
        if host.connection_count() == want {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "expected {want} connections, saw {}",
        host.connection_count()
    );
}

#[tokio::test]
async fn full_request_roundtrip_with_token() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();

    host.bind_request("Echo", Visibility::Public, |v| v.clone())
        .unwrap();

    let mut consumer = Consumer::connect(host.local_addr()).await.unwrap();

    let reply: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
    let reply_in = reply.clone();
    consumer
        .request_with_token("secret-token", "Echo", json!({"value": 5}), move |v| {
            *reply_in.lock().unwrap() = Some(v.clone());
        })
        .unwrap();

    assert_eq!(pump(&mut host, &mut [&mut consumer], 1).await, 1);
    assert_eq!(reply.lock().unwrap().take(), Some(json!({"value": 5})));
    assert_eq!(consumer.pending_count(), 0);
    assert!(consumer.connected());
}

#[tokio::test]
async fn messages_and_requests_interleave() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();

    let messages = Arc::new(AtomicU32::new(0));
    let messages_in = messages.clone();
    host.bind_message("Log", Visibility::Private, move |_| {
        messages_in.fetch_add(1, Ordering::SeqCst);
    })
    .unwrap();
    host.bind_request("Double", Visibility::Public, |v| {
        json!(v.as_i64().unwrap_or(0) * 2)
    })
    .unwrap();

    let mut consumer = Consumer::connect(host.local_addr()).await.unwrap();

    let doubled = Arc::new(Mutex::new(Vec::new()));
    for n in 1..=3 {
        consumer.message("Log", json!({"n": n})).unwrap();
        let doubled_in = doubled.clone();
        consumer
            .request("Double", json!(n), move |v| {
                doubled_in.lock().unwrap().push(v.as_i64().unwrap());
            })
            .unwrap();
    }

    // 3 replies reach the consumer; the 3 messages land host-side.
    assert_eq!(pump(&mut host, &mut [&mut consumer], 3).await, 3);
    assert_eq!(messages.load(Ordering::SeqCst), 3);
    let mut got = doubled.lock().unwrap().clone();
    got.sort_unstable();
    assert_eq!(got, [2, 4, 6]);
}

#[tokio::test]
async fn several_consumers_share_one_host() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();
    host.bind_request("WhoAmI", Visibility::Public, |v| v.clone())
        .unwrap();

    let mut a = Consumer::connect(host.local_addr()).await.unwrap();
    let mut b = Consumer::connect(host.local_addr()).await.unwrap();
    wait_connections(&host, 2).await;

    let got_a = Arc::new(Mutex::new(None));
    let got_b = Arc::new(Mutex::new(None));
    let in_a = got_a.clone();
    let in_b = got_b.clone();
    a.request("WhoAmI", json!("a"), move |v| {
        *in_a.lock().unwrap() = Some(v.clone());
    })
    .unwrap();
    b.request("WhoAmI", json!("b"), move |v| {
        *in_b.lock().unwrap() = Some(v.clone());
    })
    .unwrap();

    assert_eq!(pump(&mut host, &mut [&mut a, &mut b], 2).await, 2);
    assert_eq!(got_a.lock().unwrap().take(), Some(json!("a")));
    assert_eq!(got_b.lock().unwrap().take(), Some(json!("b")));
}

#[tokio::test]
async fn kicked_consumer_learns_the_reason() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();

    let mut consumer = Consumer::connect(host.local_addr()).await.unwrap();
    wait_connections(&host, 1).await;

    consumer.message("NoSuchService", json!({})).unwrap();

    for _ in 0..400 {
        host.poll();
        consumer.poll();
        if !consumer.connected() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert!(!consumer.connected());
    assert_eq!(
        consumer.status().disconnect_reason().as_deref(),
        Some("Service not found")
    );

    // The host sweeps the dead link on its next polls.
    for _ in 0..400 {
        host.poll();
        if host.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(host.connection_count(), 0);
}

#[tokio::test]
async fn stopped_host_keeps_serving_existing_consumers() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();
    host.bind_request("Echo", Visibility::Public, |v| v.clone())
        .unwrap();

    let mut consumer = Consumer::connect(host.local_addr()).await.unwrap();
    wait_connections(&host, 1).await;

    host.stop();

    // A newcomer may complete the TCP handshake against the dead listener's
    // backlog, but no link appears for it.
    let _late = tokio::net::TcpStream::connect(host.local_addr()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(host.connection_count(), 1);

    let reply = Arc::new(Mutex::new(None));
    let reply_in = reply.clone();
    consumer
        .request("Echo", json!("still here"), move |v| {
            *reply_in.lock().unwrap() = Some(v.clone());
        })
        .unwrap();

    assert_eq!(pump(&mut host, &mut [&mut consumer], 1).await, 1);
    assert_eq!(reply.lock().unwrap().take(), Some(json!("still here")));
}

#[tokio::test]
async fn host_push_and_consumer_reply_services() {
    let mut host = Host::bind("127.0.0.1:0", HostConfig::default())
        .await
        .unwrap();

    let mut consumer = Consumer::connect(host.local_addr()).await.unwrap();
    let pushed = Arc::new(AtomicU32::new(0));
    let pushed_in = pushed.clone();
    consumer
        .bind_message("Notify", Visibility::Public, move |v| {
            assert_eq!(v["event"], "restart");
            pushed_in.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    wait_connections(&host, 1).await;
    assert_eq!(host.broadcast("Notify", json!({"event": "restart"})).unwrap(), 1);

    assert_eq!(pump(&mut host, &mut [&mut consumer], 1).await, 1);
    assert_eq!(pushed.load(Ordering::SeqCst), 1);
    assert!(consumer.connected());
}
