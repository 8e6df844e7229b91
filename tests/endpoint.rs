use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use codec::{Codec, Value, binary::BinaryCodec};
use potp::{Error, config::Config, endpoint::Endpoint, sap::Sap, transport::TcpTransport};
use tokio::time::sleep;

fn init() {
    let _ = simple_logger::init_with_level(log::Level::Debug);
}

/// Runs the endpoint's server loop in the background and waits until it
/// accepts connections.
async fn serve(endpoint: &Endpoint) {
    let serving = endpoint.clone();
    tokio::spawn(async move { serving.server_loop(Some(Sap::tcp("127.0.0.1", 0))).await });

    while !endpoint.server_enabled() {
        sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn echo_request() -> Result<()> {
    init();

    let server = Endpoint::new(Config::default());
    server.register(Ok, None);
    serve(&server).await;

    let client = Endpoint::new(Config::default());
    client.connect(&server.uri()).await?;

    let payload = Value::record([("x", Value::Int(1))]);
    assert_eq!(client.request(payload.clone()).await?, payload);

    client.disconnect().await;
    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn first_registered_handler_stays_default() {
    init();

    let endpoint = Endpoint::new(Config::default());
    let first = endpoint.register(Ok, Some("first"));
    endpoint.register(Ok, Some("second"));
    endpoint.register(Ok, Some("third"));

    endpoint.unregister("second").unwrap();
    assert_eq!(endpoint.default_handler().as_deref(), Some(first.as_str()));

    // the default cannot be removed...
    assert!(matches!(
        endpoint.unregister("first"),
        Err(Error::CannotUnregisterDefault)
    ));

    // ...until another handler takes its place
    endpoint.set_default("third").unwrap();
    endpoint.unregister("first").unwrap();

    assert!(matches!(
        endpoint.set_default("unknown"),
        Err(Error::HandlerNotFound(_))
    ));
    assert!(matches!(
        endpoint.unregister("unknown"),
        Err(Error::HandlerNotFound(_))
    ));
}

#[tokio::test]
async fn requests_are_routed_by_destination() -> Result<()> {
    init();

    let server = Endpoint::new(Config::default());
    server.register(|_| Ok(Value::from("default handler")), Some("a"));
    server.register(|_| Ok(Value::from("named handler")), Some("b"));
    serve(&server).await;

    // no handler segment selects the default
    let client = Endpoint::new(Config::default());
    client.connect(&server.uri()).await?;
    assert_eq!(
        client.request(Value::Null).await?,
        Value::from("default handler")
    );
    client.disconnect().await;

    // an explicit segment selects the named handler
    client.connect(&format!("{}/b", server.uri())).await?;
    assert_eq!(
        client.request(Value::Null).await?,
        Value::from("named handler")
    );
    client.disconnect().await;

    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn unknown_destination_is_reported() -> Result<()> {
    init();

    let server = Endpoint::new(Config::default());
    server.register(Ok, None);
    serve(&server).await;

    let client = Endpoint::new(Config::default());
    client
        .connect(&format!("{}/does-not-exist", server.uri()))
        .await?;

    match client.request(Value::from("hi")).await {
        Err(Error::HandlerNotFound(id)) => assert_eq!(id, "does-not-exist"),
        other => panic!("expected HandlerNotFound, got {:?}", other),
    }

    client.disconnect().await;
    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn anonymous_requests_can_be_refused() -> Result<()> {
    init();

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();

    let server = Endpoint::new(Config {
        allow_anonymous: false,
        ..Config::default()
    });
    server.register(
        move |req| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(req)
        },
        None,
    );
    serve(&server).await;

    let client = Endpoint::new(Config::default());
    client.set_anonymous(true);
    client.connect(&server.uri()).await?;

    assert!(matches!(
        client.request(Value::Null).await,
        Err(Error::AnonymousMessage)
    ));
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    // the same endpoint with its identity exposed is served
    client.set_anonymous(false);
    assert!(client.request(Value::Null).await.is_ok());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    client.disconnect().await;
    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn handler_failures_reach_the_caller() -> Result<()> {
    init();

    let server = Endpoint::new(Config::default());
    server.register(
        |_| Err(potp::RemoteError::new("DivisionByZero", "division by zero")),
        None,
    );
    serve(&server).await;

    let client = Endpoint::new(Config::default());
    client.connect(&server.uri()).await?;

    match client.request(Value::Null).await {
        Err(Error::Handler(remote)) => {
            assert_eq!(remote.kind, "DivisionByZero");
            assert_eq!(remote.message, "division by zero");
        }
        other => panic!("expected a handler exception, got {:?}", other),
    }

    // a failed handler never kills the server
    assert!(matches!(
        client.request(Value::Null).await,
        Err(Error::Handler(_))
    ));

    client.disconnect().await;
    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn connections_are_isolated() -> Result<()> {
    init();

    let server = Endpoint::new(Config::default());
    server.register(Ok, None);
    serve(&server).await;

    let client = Endpoint::new(Config::default());
    client.connect(&server.uri()).await?;
    assert!(client.request(Value::Int(1)).await.is_ok());

    // corrupt framing on a second connection
    let Some(Sap::Tcp { host, port }) = server.transport().sap() else {
        panic!("serving endpoint reports no sap!");
    };
    {
        use tokio::io::AsyncWriteExt;

        let mut rogue = tokio::net::TcpStream::connect((host.as_str(), port)).await?;
        rogue.write_all(&100i32.to_le_bytes()).await?;
        rogue.write_all(b"short").await?;
        rogue.shutdown().await?;
    }
    sleep(Duration::from_millis(50)).await;

    // the first connection keeps working
    assert!(client.request(Value::Int(2)).await.is_ok());

    client.disconnect().await;
    server.stop_serving();
    Ok(())
}

#[tokio::test]
async fn request_requires_a_connection() {
    init();

    let client = Endpoint::new(Config::default());
    assert!(matches!(
        client.request(Value::Null).await,
        Err(Error::EndpointNotConnected)
    ));
}

#[tokio::test]
async fn serving_requires_a_handler() {
    init();

    let server = Endpoint::new(Config::default());
    assert!(matches!(
        server.server_loop(None).await,
        Err(Error::NoDefaultHandler)
    ));
}

#[tokio::test]
async fn connect_rejects_bad_uris() {
    init();

    let client = Endpoint::new(Config::default());
    for uri in ["tcp@127.0.0.1:1", "potp://udp@host:1", "potp://tcp@:1"] {
        assert!(matches!(
            client.connect(uri).await,
            Err(Error::InvalidUri(_))
        ));
    }
}

/// A bare transport answering every request with a fixed, pre-encoded reply.
async fn create_scripted_server(reply: Value) -> (Arc<TcpTransport>, String) {
    let transport = Arc::new(TcpTransport::default());
    let frame = BinaryCodec.encode(&reply).unwrap();
    transport.bind(move |_| Some(frame.clone()));
    transport.open(Sap::tcp("127.0.0.1", 0)).await.unwrap();

    let sap = transport.sap().unwrap();
    (transport, format!("potp://{}", sap))
}

#[tokio::test]
async fn replies_for_other_endpoints_are_refused() -> Result<()> {
    init();

    let reply = Value::record([
        ("src", Value::from("scripted")),
        ("dest", Value::from("somebody else")),
        ("error", Value::Bool(false)),
        ("ret", Value::Int(1)),
    ]);
    let (server, uri) = create_scripted_server(reply).await;

    let client = Endpoint::new(Config::default());
    client.connect(&uri).await?;

    assert!(matches!(
        client.request(Value::Null).await,
        Err(Error::MismatchedReply)
    ));

    client.disconnect().await;
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn replies_must_carry_an_outcome() -> Result<()> {
    init();

    // `error` missing entirely
    let (server, uri) = create_scripted_server(Value::record([("ret", Value::Int(1))])).await;
    let client = Endpoint::new(Config::default());
    client.connect(&uri).await?;

    match client.request(Value::Null).await {
        Err(Error::MissingMessageKey(key)) => assert_eq!(key, "error"),
        other => panic!("expected MissingMessageKey, got {:?}", other),
    }

    client.disconnect().await;
    server.close().await;

    // `error = false` without a return value
    let reply = Value::record([("src", Value::from("scripted")), ("error", Value::Bool(false))]);
    let (server, uri) = create_scripted_server(reply).await;
    let client = Endpoint::new(Config::default());
    client.connect(&uri).await?;

    match client.request(Value::Null).await {
        Err(Error::MissingMessageKey(key)) => assert_eq!(key, "ret"),
        other => panic!("expected MissingMessageKey, got {:?}", other),
    }

    client.disconnect().await;
    server.close().await;
    Ok(())
}

#[tokio::test]
async fn anonymous_replies_can_be_refused() -> Result<()> {
    init();

    let reply = Value::record([("error", Value::Bool(false)), ("ret", Value::Int(1))]);
    let (server, uri) = create_scripted_server(reply).await;

    let client = Endpoint::new(Config {
        allow_anonymous: false,
        ..Config::default()
    });
    client.connect(&uri).await?;

    assert!(matches!(
        client.request(Value::Null).await,
        Err(Error::AnonymousReply)
    ));

    client.disconnect().await;
    server.close().await;
    Ok(())
}
