//! LAN rendezvous: pub/sub over UDP multicast datagrams `{topic, payload}`.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use localdrop_core::{PubSub, RendezvousError, RendezvousMessage};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const MAX_DATAGRAM: usize = 65507;

#[derive(Debug, Serialize, Deserialize)]
struct Datagram {
    topic: String,
    payload: String,
}

pub struct MulticastPubSub {
    socket: Arc<UdpSocket>,
    dest: SocketAddr,
    topics: Arc<Mutex<HashSet<String>>>,
}

impl MulticastPubSub {
    /// Bind the group and start the receive loop. Messages on subscribed
    /// topics arrive on the returned receiver.
    pub fn bind(
        group: &str,
        port: u16,
    ) -> std::io::Result<(Arc<Self>, mpsc::UnboundedReceiver<RendezvousMessage>)> {
        let multicast: Ipv4Addr = group.parse().map_err(|e: std::net::AddrParseError| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
        })?;
        let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        std_sock.join_multicast_v4(&multicast, &Ipv4Addr::UNSPECIFIED)?;
        std_sock.set_multicast_ttl_v4(1)?;
        std_sock.set_multicast_loop_v4(true)?;
        std_sock.set_nonblocking(true)?;
        let socket = Arc::new(UdpSocket::from_std(std_sock)?);

        let (tx, rx) = mpsc::unbounded_channel();
        let topics = Arc::new(Mutex::new(HashSet::new()));
        tokio::spawn(recv_loop(socket.clone(), topics.clone(), tx));
        let this = Arc::new(Self {
            socket,
            dest: SocketAddr::V4(SocketAddrV4::new(multicast, port)),
            topics,
        });
        Ok((this, rx))
    }
}

#[async_trait]
impl PubSub for MulticastPubSub {
    async fn subscribe(&self, topic: &str) -> Result<(), RendezvousError> {
        self.topics
            .lock()
            .map_err(|_| RendezvousError::Closed)?
            .insert(topic.to_string());
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), RendezvousError> {
        let datagram = encode(topic, payload)?;
        if datagram.len() > MAX_DATAGRAM {
            return Err(RendezvousError::Transport(format!(
                "datagram of {} bytes too large",
                datagram.len()
            )));
        }
        self.socket
            .send_to(&datagram, self.dest)
            .await
            .map_err(|e| RendezvousError::Transport(e.to_string()))?;
        Ok(())
    }
}

fn encode(topic: &str, payload: Vec<u8>) -> Result<Vec<u8>, RendezvousError> {
    let payload =
        String::from_utf8(payload).map_err(|e| RendezvousError::Transport(e.to_string()))?;
    serde_json::to_vec(&Datagram {
        topic: topic.to_string(),
        payload,
    })
    .map_err(|e| RendezvousError::Transport(e.to_string()))
}

/// Decode one datagram, keeping it only if its topic is subscribed.
fn accept(buf: &[u8], topics: &Mutex<HashSet<String>>) -> Option<RendezvousMessage> {
    let datagram: Datagram = match serde_json::from_slice(buf) {
        Ok(d) => d,
        Err(e) => {
            debug!(error = %e, "ignoring malformed datagram");
            return None;
        }
    };
    let subscribed = topics.lock().ok()?.contains(&datagram.topic);
    subscribed.then(|| RendezvousMessage {
        topic: datagram.topic,
        payload: datagram.payload.into_bytes(),
    })
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    topics: Arc<Mutex<HashSet<String>>>,
    tx: mpsc::UnboundedSender<RendezvousMessage>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _from)) => {
                if let Some(msg) = accept(&buf[..n], &topics) {
                    if tx.send(msg).is_err() {
                        break;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "multicast receive failed");
                break;
            }
        }
    }
}
