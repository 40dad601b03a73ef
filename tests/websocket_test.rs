mod common;

use std::net::SocketAddr;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{speech_wav, Harness};
use whisper_stt_service::handlers::build_router;

/// 実ソケットでサーバーを起動し、アドレスを返す
async fn serve(harness: &Harness) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(harness.app_state());

    tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });
    addr
}

async fn next_text<S>(ws: &mut S) -> serde_json::Value
where
    S: Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(txt))) => return serde_json::from_str(&txt).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("expected text message, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn websocket_session_transcribes_chunks() {
    let harness = Harness::new();
    let addr = serve(&harness).await;

    let (mut ws, _resp) = connect_async(format!("ws://{}/ws/transcribe", addr))
        .await
        .expect("connect ok");

    ws.send(Message::Text(r#"{"language": "ja"}"#.to_string())).await.unwrap();
    ws.send(Message::Binary(speech_wav(1.0))).await.unwrap();

    let reply = next_text(&mut ws).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["language"], "ja");
    assert_eq!(reply["transcript"], "hello world");
    assert_eq!(reply["segments"].as_array().unwrap().len(), 1);

    ws.send(Message::Text(r#"{"initial_prompt": "konnichiwa"}"#.to_string()))
        .await
        .unwrap();
    assert_eq!(next_text(&mut ws).await["msg"], "config updated");

    ws.send(Message::Binary(speech_wav(0.5))).await.unwrap();
    let reply = next_text(&mut ws).await;
    assert_eq!(reply["language"], "ja");
    assert_eq!(reply["transcript"], "konnichiwa");

    ws.close(None).await.unwrap();
}

#[tokio::test]
async fn websocket_without_engine_is_closed_with_1013() {
    let harness = Harness::without_engine();
    let addr = serve(&harness).await;

    let (mut ws, _resp) = connect_async(format!("ws://{}/ws/transcribe", addr))
        .await
        .expect("connect ok");

    let reply = next_text(&mut ws).await;
    assert_eq!(reply, serde_json::json!({"ok": false, "error": "Model not ready"}));

    match ws.next().await {
        Some(Ok(Message::Close(Some(frame)))) => assert_eq!(u16::from(frame.code), 1013),
        other => panic!("expected close frame, got {other:?}"),
    }
}
