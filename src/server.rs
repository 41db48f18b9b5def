//! UDP DNS responder
//!
//! Receives queries on one UDP socket and answers each datagram from its
//! own task, so a poll waiting on the backend never delays other agents.

use crate::dns::DnsQuery;
use crate::router::Router;
use crate::BridgeError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest datagram read from the socket
pub const MAX_DNS_PACKET_SIZE: usize = 4096;

pub struct DnsBridgeServer {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
}

impl DnsBridgeServer {
    pub async fn bind(listen_addr: SocketAddr, router: Arc<Router>) -> Result<Self, BridgeError> {
        let socket = UdpSocket::bind(listen_addr).await?;
        log::info!("DNS bridge listening on {}", socket.local_addr()?);
        Ok(Self {
            socket: Arc::new(socket),
            router,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, BridgeError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), BridgeError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then close every backend connection
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), BridgeError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut buf = vec![0u8; MAX_DNS_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    log::info!("Shutting down DNS bridge");
                    break;
                }
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        let packet = buf[..len].to_vec();
                        let socket = self.socket.clone();
                        let router = self.router.clone();

                        tokio::spawn(async move {
                            let Some(response) = handle_datagram(&router, &packet).await else {
                                return;
                            };
                            if let Err(e) = socket.send_to(&response, peer).await {
                                log::warn!("Failed to answer {}: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("UDP recv_from error: {}", e);
                    }
                },
            }
        }

        self.router.registry().close_all().await;
        Ok(())
    }
}

/// Parse one datagram and build the response; `None` drops it silently
pub async fn handle_datagram(router: &Router, datagram: &[u8]) -> Option<Vec<u8>> {
    let query = match DnsQuery::parse(datagram) {
        Ok(query) => query,
        Err(e) => {
            log::debug!("Dropping datagram of {} bytes: {}", datagram.len(), e);
            return None;
        }
    };
    log::debug!("[Incoming DNS Query] {}", query.name);

    let answers = router.answer(&query).await;
    log::debug!("[Response] {} answers for {}", answers.len(), query.name);

    match query.respond(&answers) {
        Ok(response) => Some(response),
        Err(e) => {
            log::error!("Failed to encode response for {}: {}", query.name, e);
            None
        }
    }
}
