// Copyright 2020 Joyent, Inc.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::json;
use slog::info;
use tokio_test::block_on;

use fast_remoting::config::keys;
use fast_remoting::{AsyncClient, Client, Config, Locator, Payload, RemotingError};

use common::{context, free_port, logger, start_server};

fn remote() -> Config {
    Config::new().with(keys::FORCE_REMOTE, true)
}

#[test]
fn socket_echo() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());

    let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
    client.connect().unwrap();
    assert!(!client.is_local());

    for i in 1..50 {
        let data = "a".repeat(i * 1000);
        let reply = client.invoke(data.as_str()).unwrap();
        assert_eq!(reply.as_str(), Some(data.as_str()));
    }

    match client.invoke_method("nope", vec![]) {
        Err(RemotingError::Application(e)) => assert_eq!(e.message, "Unsupported function: nope"),
        other => panic!("unexpected {:?}", other),
    }

    client.disconnect();
    assert!(!client.is_connected());
    server.destroy().unwrap();
}

#[test]
fn application_errors_propagate_unchanged() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());
    let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
    client.connect().unwrap();

    match client.invoke_method("fail", vec![]) {
        Err(RemotingError::Application(e)) => {
            assert_eq!(e.message, "bad request");
            assert_eq!(e.detail, Some(Payload::from(json!({ "code": 42 }))));
        }
        other => panic!("unexpected {:?}", other),
    }
    // The connection survives an application error.
    assert_eq!(client.invoke("still here").unwrap().as_str(), Some("still here"));
}

#[test]
fn pools_are_isolated_by_configuration() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());

    let first = Client::new(&ctx, server.locator(), &remote().with(keys::TIMEOUT, 3000)).unwrap();
    let second = Client::new(&ctx, server.locator(), &remote().with(keys::TIMEOUT, 7000)).unwrap();
    first.connect().unwrap();
    second.connect().unwrap();
    first.invoke("one").unwrap();
    second.invoke("two").unwrap();
    assert_eq!(ctx.socket_pools().pool_count(), 2);

    second.disconnect();
    let keys = ctx.socket_pools().keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].to_string().contains("timeout=3000"));

    let pool = ctx.socket_pools().pool(&keys[0]).unwrap();
    first.invoke("three").unwrap();
    assert!(pool.live_count() >= 1);
    assert_eq!(pool.idle_count(), pool.live_count());

    first.disconnect();
    assert_eq!(ctx.socket_pools().pool_count(), 0);
}

#[test]
fn concurrent_invocations_do_not_cross() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());
    let threads = 8;
    let calls = 25;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let ctx = Arc::clone(&ctx);
            let locator = server.locator();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let client = Client::new(&ctx, locator, &remote()).unwrap();
                client.connect().unwrap();
                barrier.wait();
                for i in 0..calls {
                    let sent = format!("{}-{}", t, i);
                    let reply = client.invoke(sent.as_str()).unwrap();
                    assert_eq!(reply.as_str(), Some(sent.as_str()));
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn shared_client_across_threads() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());
    let client = Arc::new(Client::new(&ctx, server.locator(), &remote()).unwrap());
    client.connect().unwrap();

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let client = Arc::clone(&client);
            thread::spawn(move || {
                for i in 0..25 {
                    let sent = format!("{}-{}", t, i);
                    assert_eq!(client.invoke(sent.as_str()).unwrap().as_str(), Some(sent.as_str()));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn client_recovers_after_server_restart() {
    let ctx = context();
    let locator = Locator::new("socket", "127.0.0.1", free_port());
    let server = start_server(&ctx, &locator, &Config::new());

    let client = Client::new(&ctx, locator.clone(), &remote()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.invoke("before").unwrap().as_str(), Some("before"));

    server.stop();
    assert!(client.invoke("while stopped").is_err());
    server.start().unwrap();
    assert_eq!(server.locator(), locator);

    assert_eq!(client.invoke("after").unwrap().as_str(), Some("after"));
}

#[test]
fn second_server_cannot_take_a_bound_address() {
    let ctx = context();
    let locator = Locator::new("socket", "127.0.0.1", free_port());
    let first = start_server(&ctx, &locator, &Config::new());

    let second = ctx.create_server_invoker(&locator, &Config::new()).unwrap();
    match second.start() {
        Err(RemotingError::InvalidConfiguration(_)) => (),
        other => panic!("unexpected {:?}", other),
    }

    first.stop();
    second.start().unwrap();
    match first.start() {
        Err(RemotingError::InvalidConfiguration(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    second.stop();
}

#[test]
fn busy_server_refuses_work() {
    let ctx = context();
    let config = Config::new().with(keys::MAX_POOL_SIZE, 1).with(keys::BACKLOG_SIZE, 0);
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &config);

    let slow = Client::new(&ctx, server.locator(), &remote()).unwrap();
    slow.connect().unwrap();
    let handle = thread::spawn(move || slow.invoke_method("sleep", vec![json!(600)]));

    thread::sleep(Duration::from_millis(200));
    let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
    client.connect().unwrap();
    match client.invoke("hello") {
        Err(RemotingError::ServerBusy(_)) => (),
        other => panic!("unexpected {:?}", other),
    }

    assert!(handle.join().unwrap().is_ok());
    assert_eq!(client.invoke("hello").unwrap().as_str(), Some("hello"));
}

#[test]
fn socket_timeout_discards_the_connection() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());
    let client = Client::new(&ctx, server.locator(), &remote().with(keys::TIMEOUT, 200)).unwrap();
    client.connect().unwrap();

    match client.invoke_method("sleep", vec![json!(600)]) {
        Err(RemotingError::Timeout(t)) => assert_eq!(t, Duration::from_millis(200)),
        other => panic!("unexpected {:?}", other),
    }
    let keys = ctx.socket_pools().keys();
    assert_eq!(keys.len(), 1);
    let pool = ctx.socket_pools().pool(&keys[0]).unwrap();
    assert_eq!(pool.live_count(), 0);
    assert_eq!(pool.idle_count(), 0);

    // The late response must not be read as the answer to this one.
    assert_eq!(client.invoke("fresh").unwrap().as_str(), Some("fresh"));
}

#[test]
fn busy_http_server_answers_busy() {
    let ctx = context();
    let config = Config::new().with(keys::MAX_POOL_SIZE, 1).with(keys::BACKLOG_SIZE, 0);
    let server = start_server(&ctx, &Locator::new("http", "127.0.0.1", 0), &config);

    let slow = Client::new(&ctx, server.locator(), &remote()).unwrap();
    slow.connect().unwrap();
    let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
    client.connect().unwrap();

    let handle = thread::spawn(move || slow.invoke_method("sleep", vec![json!(600)]));
    thread::sleep(Duration::from_millis(200));
    match client.invoke("hello") {
        Err(RemotingError::ServerBusy(_)) => (),
        other => panic!("unexpected {:?}", other),
    }

    assert!(handle.join().unwrap().is_ok());
    assert_eq!(client.invoke("hello").unwrap().as_str(), Some("hello"));
    server.stop();
}

#[test]
fn backlog_queues_then_refuses() {
    let ctx = context();
    let config = Config::new().with(keys::MAX_POOL_SIZE, 1).with(keys::BACKLOG_SIZE, 1);
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &config);

    let clients: Vec<_> = (0..3)
        .map(|_| {
            let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
            client.connect().unwrap();
            client
        })
        .collect();
    let mut clients = clients.into_iter();
    let (slow, queued, refused) = (
        clients.next().unwrap(),
        clients.next().unwrap(),
        clients.next().unwrap(),
    );

    let running = thread::spawn(move || slow.invoke_method("sleep", vec![json!(400)]));
    thread::sleep(Duration::from_millis(150));
    let waiting = thread::spawn(move || queued.invoke("queued"));
    thread::sleep(Duration::from_millis(100));

    match refused.invoke("refused") {
        Err(RemotingError::ServerBusy(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(running.join().unwrap().is_ok());
    assert_eq!(waiting.join().unwrap().unwrap().as_str(), Some("queued"));
}

#[test]
fn http_connect_errors() {
    let ctx = context();
    let nowhere = Locator::new("http", "127.0.0.1", free_port());
    let client = Client::new(&ctx, nowhere, &remote().with(keys::CONNECT_TIMEOUT, 500)).unwrap();
    match client.connect() {
        Err(RemotingError::ConnectionFailed(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(!client.is_connected());
}

#[test]
fn http_transport() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("http", "127.0.0.1", 0), &Config::new());

    let client = Client::new(&ctx, server.locator(), &remote()).unwrap();
    client.connect().unwrap();
    assert_eq!(client.invoke("over http").unwrap().as_str(), Some("over http"));
    match client.invoke_method("fail", vec![]) {
        Err(RemotingError::Application(e)) => assert_eq!(e.message, "bad request"),
        other => panic!("unexpected {:?}", other),
    }
    client.disconnect();
    server.stop();
}

#[test]
fn local_invocation_by_reference_and_by_value() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());

    let by_ref = Client::new(&ctx, server.locator(), &Config::new()).unwrap();
    by_ref.connect().unwrap();
    assert!(by_ref.is_local());
    let reply = by_ref.invoke(Payload::opaque(7u32)).unwrap();
    assert_eq!(reply.downcast_ref::<u32>(), Some(&7));

    let by_value = Client::new(&ctx, server.locator(), &Config::new().with(keys::BY_VALUE, true)).unwrap();
    by_value.connect().unwrap();
    assert!(by_value.is_local());
    assert_eq!(by_value.invoke(json!([1, 2])).unwrap(), Payload::from(json!([1, 2])));
    match by_value.invoke(Payload::opaque(7u32)) {
        Err(RemotingError::Serialization(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn local_invoker_follows_a_restarted_server() {
    let ctx = context();
    let locator = Locator::new("socket", "127.0.0.1", free_port());
    let first = start_server(&ctx, &locator, &Config::new());

    let client = Client::new(&ctx, locator.clone(), &Config::new()).unwrap();
    client.connect().unwrap();
    assert!(client.is_local());
    client.invoke("one").unwrap();

    first.destroy().unwrap();
    assert!(client.invoke("two").is_err());

    let _second = start_server(&ctx, &locator, &Config::new());
    assert_eq!(client.invoke("three").unwrap().as_str(), Some("three"));
}

#[test]
fn connect_errors() {
    let ctx = context();
    let nowhere = Locator::new("socket", "127.0.0.1", free_port());
    let client = Client::new(&ctx, nowhere, &Config::new().with(keys::CONNECT_TIMEOUT, 500)).unwrap();
    match client.connect() {
        Err(RemotingError::ConnectionFailed(_)) => (),
        other => panic!("unexpected {:?}", other),
    }
    assert!(matches!(client.invoke("x"), Err(RemotingError::InvalidState(_))));

    match Client::from_uri(&ctx, "carrier://127.0.0.1:1/", &Config::new()) {
        Err(RemotingError::UnknownTransport(_)) => (),
        Err(e) => panic!("unexpected {:?}", e),
        Ok(_) => panic!("unknown transport accepted"),
    }
    assert!(Client::from_uri(&ctx, "socket://", &Config::new()).is_err());
    assert!(Client::from_uri(&ctx, "https://127.0.0.1:1/", &Config::new())
        .unwrap()
        .connect()
        .is_err());
}

#[test]
fn async_client() {
    let ctx = context();
    let server = start_server(&ctx, &Locator::new("socket", "127.0.0.1", 0), &Config::new());
    let log = logger();
    let client = AsyncClient::new(Client::new(&ctx, server.locator(), &remote()).unwrap());

    let result = block_on(async {
        client.connect().await?;
        let reply = client.invoke("async").await?;
        let method = client.invoke_method("broadcast", vec![json!(1)]).await?;
        client.disconnect().await;
        Ok::<_, RemotingError>((reply, method))
    });
    let (reply, method) = result.unwrap();
    info!(log, "async client done"; "reply" => ?reply);
    assert_eq!(reply.as_str(), Some("async"));
    assert_eq!(method, Payload::from(json!(0)));
}
