//! Minimal echo server: every inbound message on any topic is sent back to
//! the same client. Run with `cargo run --example echo_server`.

use topicsocket::{start_server, Message, ServerEvent};

#[tokio::main]
async fn main() {
    env_logger::init();

    let (facade, mut events) = start_server("127.0.0.1:9000")
        .await
        .expect("failed to bind 127.0.0.1:9000");

    println!("listening on 127.0.0.1:9000");

    while let Some(event) = events.recv().await {
        match event {
            ServerEvent::Open { id } => println!("open {id}"),
            ServerEvent::Close { id, reason } => println!("close {id}: {} {}", reason.code, reason.message),
            ServerEvent::Error { id, message } => println!("error {id}: {message}"),
            ServerEvent::Message { id, topic, message } => {
                let echoed = match message {
                    Message::Text(text) => Message::Text(text),
                    Message::Binary(data) => Message::Binary(data),
                };
                println!("message on {topic} from {id}");
                let _ = facade.send(id, echoed).await;
            }
        }
    }
}
