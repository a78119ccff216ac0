//! `SocketIoClient` against a scripted Engine.IO 4 server on a local socket.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{WebSocketStream, tungstenite::Message};

use shared_socket::{ClientProxy, SharedHubContext, SocketIoClient, SocketOptions};

type Ws = WebSocketStream<TcpStream>;
type Seen = Arc<Mutex<Vec<Value>>>;

const OPEN: &str =
    r#"0{"sid":"eio-1","upgrades":[],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#;

/// Accept websocket sessions on a fresh port, running `session` for each
/// with its 0-based index. Returns the http url clients should use.
async fn serve<F, Fut>(session: F) -> String
where
    F: Fn(usize, Ws) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut index = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            tokio::spawn(session(index, ws));
            index += 1;
        }
    });
    format!("http://{addr}")
}

async fn recv(ws: &mut Ws) -> String {
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => return text.as_str().to_owned(),
            Some(Ok(_)) => {}
            other => panic!("client went away: {other:?}"),
        }
    }
}

async fn send(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Engine.IO open, then accept the client's namespace connect.
async fn accept(ws: &mut Ws) {
    send(ws, OPEN).await;
    assert_eq!(recv(ws).await, "40");
    send(ws, r#"40{"sid":"sio-1"}"#).await;
}

fn recorder() -> (Seen, impl Fn(&Value) + Send + Sync + 'static) {
    let seen: Seen = Arc::default();
    let sink = seen.clone();
    (seen, move |payload: &Value| {
        sink.lock().unwrap().push(payload.clone())
    })
}

fn count(seen: &Seen) -> usize {
    seen.lock().unwrap().len()
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..400 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

fn fast_reconnect() -> SocketOptions {
    SocketOptions {
        reconnection_delay: 10,
        reconnection_delay_max: 20,
        ..SocketOptions::default()
    }
}

#[tokio::test]
async fn events_and_acks_flow_through_the_hub() {
    let url = serve(|_, mut ws| async move {
        accept(&mut ws).await;
        // the emit arrives after the subscribe, so the listener is in place
        let emit = recv(&mut ws).await;
        let body = emit.strip_prefix("420").expect("event with ack id 0");
        let args: Value = serde_json::from_str(body).unwrap();
        assert_eq!(args, json!(["save", {"x": 1}]));

        send(&mut ws, r#"430[{"ok":true}]"#).await;
        send(&mut ws, "2").await;
        assert_eq!(recv(&mut ws).await, "3");
        send(&mut ws, r#"42["news",{"n":1}]"#).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let factory = Arc::new(SocketIoClient::new());
    let context = Arc::new(SharedHubContext::new(factory.clone()));
    let a = ClientProxy::builder(url.clone(), factory.clone())
        .context(context.clone())
        .build();
    let b = ClientProxy::builder(url, factory).context(context).build();

    let (a_news, cb) = recorder();
    a.on("news", cb);
    let (b_news, cb) = recorder();
    b.on("news", cb);

    let reply = tokio::time::timeout(Duration::from_secs(5), a.request("save", &json!({"x": 1})))
        .await
        .expect("ack timed out")
        .unwrap();
    assert_eq!(reply, json!({"ok": true}));

    eventually("news on both proxies", || count(&a_news) == 1 && count(&b_news) == 1).await;
    assert_eq!(a_news.lock().unwrap()[0], json!({"n": 1}));
}

#[tokio::test]
async fn refused_namespace_connect_is_a_connect_error() {
    let url = serve(|_, mut ws| async move {
        send(&mut ws, OPEN).await;
        assert_eq!(recv(&mut ws).await, "40");
        send(&mut ws, r#"44{"message":"unauthorized"}"#).await;
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let proxy = ClientProxy::builder(url, Arc::new(SocketIoClient::new())).build();
    let (errors, cb) = recorder();
    proxy.on("connect_error", cb);
    let (connects, cb) = recorder();
    proxy.on("connect", cb);

    eventually("connect_error", || count(&errors) == 1).await;
    assert_eq!(errors.lock().unwrap()[0], json!({"message": "unauthorized"}));
    assert_eq!(count(&connects), 0);
}

#[tokio::test]
async fn server_disconnect_is_not_retried() {
    let sessions = Arc::new(Mutex::new(0usize));
    let opened = sessions.clone();
    let url = serve(move |_, mut ws| {
        *opened.lock().unwrap() += 1;
        async move {
            accept(&mut ws).await;
            send(&mut ws, "41").await;
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    })
    .await;

    let proxy = ClientProxy::builder(url, Arc::new(SocketIoClient::new()))
        .options(fast_reconnect())
        .build();
    let (down, cb) = recorder();
    proxy.on("disconnect", cb);

    eventually("disconnect", || count(&down) == 1).await;
    assert_eq!(down.lock().unwrap()[0], json!("io server disconnect"));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(*sessions.lock().unwrap(), 1);
}

#[tokio::test]
async fn transport_close_reconnects_on_backoff() {
    let url = serve(|index, mut ws| async move {
        accept(&mut ws).await;
        if index == 0 {
            let _ = ws.close(None).await;
            return;
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    })
    .await;

    let proxy = ClientProxy::builder(url, Arc::new(SocketIoClient::new()))
        .options(fast_reconnect())
        .build();
    let (connects, cb) = recorder();
    proxy.on("connect", cb);
    let (down, cb) = recorder();
    proxy.on("disconnect", cb);

    eventually("reconnect", || count(&connects) == 2).await;
    assert_eq!(*down.lock().unwrap(), vec![json!("transport close")]);
}

#[tokio::test]
async fn unreachable_server_reports_connect_error() {
    // bind then drop to get a port nobody listens on
    let addr = TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap()
        .local_addr()
        .unwrap();
    let options = SocketOptions {
        reconnection: false,
        ..SocketOptions::default()
    };
    let proxy = ClientProxy::builder(format!("http://{addr}"), Arc::new(SocketIoClient::new()))
        .options(options)
        .build();
    let (errors, cb) = recorder();
    proxy.on("connect_error", cb);

    eventually("connect_error", || count(&errors) == 1).await;
    assert!(errors.lock().unwrap()[0]["message"].is_string());
}
