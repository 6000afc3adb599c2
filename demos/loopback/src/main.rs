use std::time::Duration;

use authgate::prelude::*;

// ---------------------------------------------------------------------------
// Application logic
// ---------------------------------------------------------------------------

const HELLO: &[u8] = b"HELLO_SERVER";
const HI: &[u8] = b"SERVER_SAYS_HI_CLIENT";

/// Answers every HELLO_SERVER with SERVER_SAYS_HI_CLIENT.
struct Greeter;

impl SessionHandler for Greeter {
    fn on_authenticated(&mut self, session: &SessionInfo) {
        tracing::info!(identity = %session.identity, "player joined");
    }

    fn on_message(&mut self, session: &SessionInfo, data: &[u8]) -> Vec<(Recipient, Vec<u8>)> {
        if data == HELLO {
            tracing::info!(identity = %session.identity, "received hello");
            vec![(Recipient::Sender, HI.to_vec())]
        } else {
            tracing::info!(identity = %session.identity, len = data.len(), "unrecognized message");
            Vec::new()
        }
    }

    fn on_disconnected(&mut self, session: &SessionInfo) {
        tracing::info!(identity = %session.identity, "player left");
    }
}

// ---------------------------------------------------------------------------
// Bootstrap
// ---------------------------------------------------------------------------

const SERVER_IDENTITY: PeerIdentity = PeerIdentity(1);
const PLAYER_IDENTITY: PeerIdentity = PeerIdentity(76561198000000001);

/// Connects one client, authenticates, says hello and waits for the reply.
async fn say_hello(
    addr: &str,
    authority: &LocalAuthority,
    identity: PeerIdentity,
) -> Result<Vec<u8>, AuthgateError> {
    let transport = WebSocketTransport::client(identity)?;
    let mut client = Client::new(transport, authority.issuer(identity), ClientConfig::default())?;

    client.connect(addr)?;
    client.authenticate().await?;
    client.send(HELLO)?;

    let reply = loop {
        match client.next_event().await {
            Some(ClientEvent::Message(data)) => break data,
            Some(_) => {}
            None => return Err(SessionError::NotConnected.into()),
        }
    };
    client.disconnect();
    Ok(reply)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing("info");
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:1234".to_string());

    let authority = LocalAuthority::with_latency(Duration::from_millis(20));
    let server = ServerBuilder::new()
        .bind(&addr)
        .build_websocket(Some(SERVER_IDENTITY), authority.clone(), Greeter)
        .await?;
    let connect_to = server
        .local_addr()
        .map_or_else(|| addr.clone(), |a| a.to_string());
    let handle = server.handle();
    let server_task = tokio::spawn(server.run());

    let reply = say_hello(&connect_to, &authority, PLAYER_IDENTITY).await?;
    tracing::info!(reply = %String::from_utf8_lossy(&reply), "server replied");

    handle.shutdown();
    server_task.await?;
    Ok(())
}
