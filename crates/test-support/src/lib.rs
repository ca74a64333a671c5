//! A minimal JSON-RPC line-protocol test client, the role
//! `MockWsClient`/`MockWsServer` play for the websocket-based services --
//! just enough plumbing to drive end-to-end session tests over a real
//! `TcpStream` pair without pulling in the full server binary.

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use wire_protocol::{JsonLineCodec, JsonRpcMessage};

pub struct TestClient {
    framed: Framed<TcpStream, JsonLineCodec>,
}

impl TestClient {
    pub async fn connect(addr: std::net::SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self { framed: Framed::new(stream, JsonLineCodec::new()) })
    }

    pub async fn request(&mut self, id: Value, method: &str, params: Vec<Value>) -> Result<(), Box<dyn std::error::Error>> {
        self.framed.send(JsonRpcMessage::request(id, method, params)).await?;
        Ok(())
    }

    pub async fn notify(&mut self, method: &str, params: Vec<Value>) -> Result<(), Box<dyn std::error::Error>> {
        self.framed.send(JsonRpcMessage::notify(method, params)).await?;
        Ok(())
    }

    pub async fn recv(&mut self) -> Result<JsonRpcMessage, Box<dyn std::error::Error>> {
        match self.framed.next().await {
            Some(Ok(msg)) => Ok(msg),
            Some(Err(e)) => Err(Box::new(e)),
            None => Err("connection closed by server".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn client_roundtrips_against_a_trivial_echo_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(stream, JsonLineCodec::new());
            if let Some(Ok(msg)) = framed.next().await {
                let reply = JsonRpcMessage::reply(msg.id.unwrap(), json!("ok"));
                framed.send(reply).await.unwrap();
            }
        });

        let mut client = TestClient::connect(addr).await.unwrap();
        client.request(json!(1), "echo", vec![json!("hi")]).await.unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(reply.result, Some(json!("ok")));
    }
}
