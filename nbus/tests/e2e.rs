//! End-to-end tests over a Unix socketpair: one side runs the server
//! handshake and exports objects, the other connects as a peer-to-peer
//! client.

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::{net::UnixStream, sync::mpsc};

use nbus::{
    connection::Builder as ConnectionBuilder,
    fdo,
    handshake::Guid,
    interface::{method_handler, Access, EmitsChanged, Interface, PropertyGetter, PropertySetter},
    message::{Builder as MessageBuilder, Flags, Type as MessageType},
    nvariant::Value,
    CallOptions, Connection, MatchRule, Object, Proxy,
};

async fn pair() -> (Connection, Connection) {
    let (client, server) = UnixStream::pair().expect("socketpair");
    let server = ConnectionBuilder::server(server, Guid::generate()).build();
    let client = ConnectionBuilder::unix_stream(client).p2p().build();
    let (server, client) = tokio::join!(server, client);
    (server.expect("server handshake"), client.expect("client handshake"))
}

fn echo_interface() -> Interface {
    Interface::builder("org.example.Echo")
        .unwrap()
        .method(
            "Echo",
            "s",
            "s",
            Some(method_handler(|call| async move { Ok(call.args) })),
        )
        .unwrap()
        .method(
            "SlowOp",
            "",
            "s",
            Some(method_handler(|_call| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                Ok(vec![Value::from("slow")])
            })),
        )
        .unwrap()
        .method(
            "Fail",
            "",
            "",
            Some(method_handler(|_call| async move {
                Err(fdo::Error::Failed("boom".to_string()))
            })),
        )
        .unwrap()
        .signal("Pinged", "u")
        .unwrap()
        .build()
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

#[test_log::test(tokio::test)]
async fn method_call_round_trip() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let reply = client
        .call_method(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "Echo",
            vec![Value::from("hello")],
        )
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("hello")]);
    assert_eq!(reply.message_type(), MessageType::MethodReturn);
}

#[test_log::test(tokio::test)]
async fn concurrent_calls_share_the_connection() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let slow = client.call_method(
        None::<&str>,
        "/org/example/test",
        Some("org.example.Echo"),
        "SlowOp",
        vec![],
    );
    let quick = client.call_method(
        None::<&str>,
        "/org/example/test",
        Some("org.example.Echo"),
        "Echo",
        vec![Value::from("quick")],
    );

    let (slow, quick) = tokio::join!(slow, quick);
    assert_eq!(slow.unwrap().body(), &[Value::from("slow")]);
    assert_eq!(quick.unwrap().body(), &[Value::from("quick")]);
}

#[test_log::test(tokio::test)]
async fn handler_errors_become_error_replies() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let err = client
        .call_method(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "Fail",
            vec![],
        )
        .await
        .unwrap_err();
    match fdo::Error::from(err) {
        fdo::Error::Failed(message) => assert_eq!(message, "boom"),
        other => panic!("expected Failed, got {other:?}"),
    }

    let err = client
        .call_method(
            None::<&str>,
            "/absent",
            None::<&str>,
            "Anything",
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        fdo::Error::from(err),
        fdo::Error::UnknownObject(_)
    ));

    let err = client
        .call_method(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "Absent",
            vec![],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        fdo::Error::from(err),
        fdo::Error::UnknownMethod(_)
    ));
}

#[test_log::test(tokio::test)]
async fn ambiguous_member_resolution() {
    let common = |reply: &'static str| {
        method_handler(move |_call| async move { Ok(vec![Value::from(reply)]) })
    };
    let iface_a = Interface::builder("org.example.A")
        .unwrap()
        .method("Common", "", "s", Some(common("from A")))
        .unwrap()
        .build();
    let iface_b = Interface::builder("org.example.B")
        .unwrap()
        .method("Common", "", "s", Some(common("from B")))
        .unwrap()
        .build();

    let (server, client) = pair().await;
    server
        .object_server()
        .at("/obj", Object::new(vec![iface_a, iface_b]))
        .unwrap();

    // Without an INTERFACE header, declaration order decides.
    let reply = client
        .call_method(None::<&str>, "/obj", None::<&str>, "Common", vec![])
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("from A")]);

    // The header picks the exact interface.
    let reply = client
        .call_method(None::<&str>, "/obj", Some("org.example.B"), "Common", vec![])
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("from B")]);
}

#[test_log::test(tokio::test)]
async fn explicit_binding_redirects_bare_member() {
    let common = |reply: &'static str| {
        method_handler(move |_call| async move { Ok(vec![Value::from(reply)]) })
    };
    let iface_a = Interface::builder("org.example.A")
        .unwrap()
        .method("Common", "", "s", Some(common("from A")))
        .unwrap()
        .build();
    let iface_b = Interface::builder("org.example.B")
        .unwrap()
        .method("Common", "", "s", Some(common("from B")))
        .unwrap()
        .build();

    let (server, client) = pair().await;
    let object = Object::new(vec![iface_a, iface_b])
        .bind("Common", "org.example.B")
        .unwrap();
    server.object_server().at("/obj", object).unwrap();

    let reply = client
        .call_method(None::<&str>, "/obj", None::<&str>, "Common", vec![])
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("from B")]);
}

#[test_log::test(tokio::test)]
async fn property_get_set_and_change_notification() {
    let state = Arc::new(Mutex::new(String::from("bar")));
    let getter: PropertyGetter = {
        let state = state.clone();
        Arc::new(move || Ok(Value::from(state.lock().unwrap().clone())))
    };
    let setter: PropertySetter = {
        let state = state.clone();
        Arc::new(move |value: Value| {
            *state.lock().unwrap() = String::try_from(value)
                .map_err(|e| fdo::Error::InvalidArgs(e.to_string()))?;
            Ok(())
        })
    };
    let iface = Interface::builder("org.example.Props")
        .unwrap()
        .property(
            "foo",
            "s",
            Access::ReadWrite,
            EmitsChanged::True,
            Some(getter),
            Some(setter),
        )
        .unwrap()
        .build();

    let (server, client) = pair().await;
    server.object_server().at("/obj", Object::new(vec![iface])).unwrap();

    // Watch for PropertiesChanged on the client.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .member("PropertiesChanged")
        .unwrap()
        .build();
    let _subscription = client
        .add_match(
            rule,
            Box::new(move |msg| {
                tx.send(msg.body().to_vec()).ok();
                Ok(())
            }),
        )
        .await
        .unwrap();

    let properties = "org.freedesktop.DBus.Properties";

    // Get with an empty interface searches every interface.
    let reply = client
        .call_method(
            None::<&str>,
            "/obj",
            Some(properties),
            "Get",
            vec![Value::from(""), Value::from("foo")],
        )
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("bar").into_variant()]);

    client
        .call_method(
            None::<&str>,
            "/obj",
            Some(properties),
            "Set",
            vec![
                Value::from(""),
                Value::from("foo"),
                Value::from("baz").into_variant(),
            ],
        )
        .await
        .unwrap();

    let body = recv(&mut rx).await;
    assert_eq!(body[0], Value::from("org.example.Props"));
    match &body[1] {
        Value::Dict(changed) => {
            assert_eq!(changed.len(), 1);
            assert_eq!(
                changed.get_str("foo"),
                Some(&Value::from("baz").into_variant())
            );
        }
        other => panic!("expected a dict of changes, got {other:?}"),
    }
    match &body[2] {
        Value::Array(invalidated) => assert!(invalidated.is_empty()),
        other => panic!("expected an array, got {other:?}"),
    }

    let reply = client
        .call_method(
            None::<&str>,
            "/obj",
            Some(properties),
            "Get",
            vec![Value::from("org.example.Props"), Value::from("foo")],
        )
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("baz").into_variant()]);

    // Writing a value of the wrong type is rejected before the setter runs.
    let err = client
        .call_method(
            None::<&str>,
            "/obj",
            Some(properties),
            "Set",
            vec![
                Value::from(""),
                Value::from("foo"),
                Value::from(5u32).into_variant(),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(fdo::Error::from(err), fdo::Error::InvalidArgs(_)));
}

#[test_log::test(tokio::test)]
async fn call_timeout_drops_late_reply() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let err = client
        .call_with(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "SlowOp",
            vec![],
            CallOptions {
                timeout: Some(Duration::from_millis(20)),
                ..CallOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, nbus::Error::Timeout));

    // Let the late reply arrive; it must be discarded without disturbing
    // anything.
    tokio::time::sleep(Duration::from_millis(400)).await;

    let reply = client
        .call_method(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "Echo",
            vec![Value::from("still alive")],
        )
        .await
        .unwrap();
    assert_eq!(reply.body(), &[Value::from("still alive")]);
}

#[test_log::test(tokio::test)]
async fn no_reply_expected_resolves_immediately() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let reply = client
        .call_with(
            None::<&str>,
            "/org/example/test",
            Some("org.example.Echo"),
            "Echo",
            vec![Value::from("fire and forget")],
            CallOptions {
                expect_reply: false,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap();
    assert!(reply.is_none());
}

#[test_log::test(tokio::test)]
async fn signals_reach_matching_handlers_in_order() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .interface("org.example.Echo")
        .unwrap()
        .member("Pinged")
        .unwrap()
        .build();
    let _subscription = client
        .add_match(
            rule,
            Box::new(move |msg| {
                tx.send(msg.body().to_vec()).ok();
                Ok(())
            }),
        )
        .await
        .unwrap();

    // A second handler whose rule does not match must stay silent.
    let (other_tx, mut other_rx) = mpsc::unbounded_channel();
    let other_rule = MatchRule::builder()
        .msg_type(MessageType::Signal)
        .member("SomethingElse")
        .unwrap()
        .build();
    let _other = client
        .add_match(
            other_rule,
            Box::new(move |msg| {
                other_tx.send(msg.serial()).ok();
                Ok(())
            }),
        )
        .await
        .unwrap();

    for n in 0u32..3 {
        server
            .object_server()
            .emit_signal("/org/example/test", "org.example.Echo", "Pinged", vec![
                Value::from(n),
            ])
            .unwrap();
    }

    for n in 0u32..3 {
        assert_eq!(recv(&mut rx).await, vec![Value::from(n)]);
    }
    assert!(other_rx.try_recv().is_err());

    // Emitting an undeclared signal or a mismatched body is refused.
    assert!(server
        .object_server()
        .emit_signal("/org/example/test", "org.example.Echo", "Undeclared", vec![])
        .is_err());
    assert!(server
        .object_server()
        .emit_signal("/org/example/test", "org.example.Echo", "Pinged", vec![
            Value::from("wrong type"),
        ])
        .is_err());
}

#[test_log::test(tokio::test)]
async fn proxy_introspects_and_calls() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let proxy = Proxy::builder(&client)
        .destination("org.example.Peer")
        .unwrap()
        .path("/org/example/test")
        .unwrap()
        .build()
        .await
        .unwrap();

    // Introspection picked up the exported interface plus the standard
    // three.
    assert!(proxy
        .interfaces()
        .iter()
        .any(|i| i.name().as_str() == "org.example.Echo"));
    assert!(proxy
        .interfaces()
        .iter()
        .any(|i| i.name().as_str() == "org.freedesktop.DBus.Peer"));

    let reply = proxy
        .call("Echo", vec![Value::from("via proxy")])
        .await
        .unwrap();
    assert_eq!(reply.into_value(), Some(Value::from("via proxy")));

    // Declared signatures are checked locally before anything hits the
    // wire.
    let err = proxy.call("Echo", vec![Value::from(1u32)]).await.unwrap_err();
    assert!(matches!(err, nbus::Error::Variant(_)));

    // Ping resolves through the introspected standard interface.
    let reply = proxy.call("Ping", vec![]).await.unwrap();
    assert_eq!(reply.into_value(), None);
}

#[test_log::test(tokio::test)]
async fn proxy_signal_subscription() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let proxy = Proxy::builder(&client)
        .destination("org.example.Peer")
        .unwrap()
        .path("/org/example/test")
        .unwrap()
        .with_interfaces(vec![echo_interface()])
        .build()
        .await
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let subscription = proxy
        .receive_signal(
            "Pinged",
            Box::new(move |msg| {
                tx.send(msg.body().to_vec()).ok();
                Ok(())
            }),
        )
        .await
        .unwrap();
    // On a p2p link the rule stays local; its serialized form is still the
    // broker format.
    assert!(subscription.rule().contains("member='Pinged'"));

    server
        .object_server()
        .emit_signal("/org/example/test", "org.example.Echo", "Pinged", vec![
            Value::from(9u32),
        ])
        .unwrap();
    assert_eq!(recv(&mut rx).await, vec![Value::from(9u32)]);

    subscription.release().await.unwrap();
    server
        .object_server()
        .emit_signal("/org/example/test", "org.example.Echo", "Pinged", vec![
            Value::from(10u32),
        ])
        .unwrap();
    // The handler is gone; nothing more arrives.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(rx.try_recv().is_err());
}

#[cfg(unix)]
#[test_log::test(tokio::test)]
async fn file_descriptors_travel_with_the_message() {
    let (server, client) = pair().await;
    assert!(client.supports_unix_fd());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let rule = MatchRule::builder().msg_type(MessageType::MethodCall).build();
    let _subscription = server
        .add_match(
            rule,
            Box::new(move |msg| {
                tx.send((msg.unix_fds(), msg.fds().len())).ok();
                Ok(())
            }),
        )
        .await
        .unwrap();

    let (read_end, _write_end) = nix::unistd::pipe().expect("pipe");
    let msg = MessageBuilder::method_call("/sink", "Consume")
        .unwrap()
        .with_flags(Flags::NoReplyExpected)
        .unwrap()
        .body(vec![Value::Fd(0)])
        .unwrap()
        .attach_fds(vec![read_end])
        .build()
        .unwrap();
    client.send(msg).unwrap();

    let (declared, received) = recv(&mut rx).await;
    assert_eq!(declared, 1);
    assert_eq!(received, 1);
}

#[test_log::test(tokio::test)]
async fn disconnect_fails_outstanding_calls() {
    let (server, client) = pair().await;
    server
        .object_server()
        .at("/org/example/test", Object::new(vec![echo_interface()]))
        .unwrap();

    let pending = client.call_method(
        None::<&str>,
        "/org/example/test",
        Some("org.example.Echo"),
        "SlowOp",
        vec![],
    );
    let teardown = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        server.close();
    };
    let (pending, ()) = tokio::join!(pending, teardown);
    assert!(matches!(pending.unwrap_err(), nbus::Error::Disconnected));

    // Every further call fails immediately.
    let err = client
        .call_method(None::<&str>, "/x", None::<&str>, "Y", vec![])
        .await
        .unwrap_err();
    assert!(matches!(err, nbus::Error::Disconnected));
}

#[test_log::test(tokio::test)]
async fn queue_limit_closes_the_connection() {
    let (client_stream, server_stream) = UnixStream::pair().expect("socketpair");
    let server = ConnectionBuilder::server(server_stream, Guid::generate()).build();
    let client = ConnectionBuilder::unix_stream(client_stream)
        .p2p()
        .max_queued_bytes(256)
        .build();
    let (_server, client) = tokio::join!(server, client);
    let client = client.expect("client handshake");

    let big = "x".repeat(1024);
    let err = client
        .call_with(
            None::<&str>,
            "/sink",
            None::<&str>,
            "Flood",
            vec![Value::from(big)],
            CallOptions {
                expect_reply: false,
                ..CallOptions::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, nbus::Error::QueueFull));
    assert!(client.is_closed());
}
