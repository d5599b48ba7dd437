// Copyright (C) 2024 Michael Wilson <mike@mdwn.dev>
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! The OSC UDP listener. Mirrors the select-loop shape of
//! `controller::osc::Driver::handle_udp_comms`: one task owns the socket,
//! reading inbound datagrams into a channel for the dispatcher and draining
//! an outbound channel for anything that needs to reach upstream clients
//! (feedback, status, hub replies).

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::clients::UpstreamClients;
use super::OscMessage;

const MTU: usize = 65_507;
const CHANNEL_CAPACITY: usize = 256;

pub struct Listener {
    addr: SocketAddr,
    reply_port: Option<u16>,
    clients: Arc<UpstreamClients>,
}

impl Listener {
    pub fn new(addr: SocketAddr, reply_port: Option<u16>) -> Self {
        Self {
            addr,
            reply_port,
            clients: Arc::new(UpstreamClients::new()),
        }
    }

    pub fn clients(&self) -> Arc<UpstreamClients> {
        self.clients.clone()
    }

    /// Binds the listen socket and starts the receive/send loop. Returns the
    /// task handle, a receiver of `(message, sender)` for the dispatcher, and
    /// a sender any component can use to push a message out to all currently
    /// active upstream clients.
    pub async fn start(
        &self,
    ) -> io::Result<(
        JoinHandle<()>,
        mpsc::Receiver<(OscMessage, SocketAddr)>,
        mpsc::Sender<OscMessage>,
    )> {
        let socket = UdpSocket::bind(self.addr).await?;
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let clients = self.clients.clone();
        let reply_port = self.reply_port;
        let handle = tokio::spawn(async move {
            Self::run(socket, reply_port, clients, in_tx, out_rx).await;
        });
        Ok((handle, in_rx, out_tx))
    }

    async fn run(
        socket: UdpSocket,
        reply_port: Option<u16>,
        clients: Arc<UpstreamClients>,
        in_tx: mpsc::Sender<(OscMessage, SocketAddr)>,
        mut out_rx: mpsc::Receiver<OscMessage>,
    ) {
        let mut buf = vec![0u8; MTU];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    match result {
                        Ok((size, sender)) => {
                            clients.touch(sender);
                            match OscMessage::decode(&buf[..size]) {
                                Ok(messages) => {
                                    for message in messages {
                                        if in_tx.send((message, sender)).await.is_err() {
                                            return;
                                        }
                                    }
                                }
                                Err(e) => warn!(err = %e, %sender, "malformed OSC datagram, dropping"),
                            }
                        }
                        Err(e) => error!(err = %e, "UDP receive error"),
                    }
                }
                message = out_rx.recv() => {
                    match message {
                        Some(message) => Self::send_to_clients(&socket, &clients, reply_port, &message).await,
                        None => {
                            debug!("outbound channel closed, listener shutting down");
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn send_to_clients(
        socket: &UdpSocket,
        clients: &UpstreamClients,
        reply_port: Option<u16>,
        message: &OscMessage,
    ) {
        let bytes = match message.encode() {
            Ok(b) => b,
            Err(e) => {
                error!(err = %e, addr = %message.addr, "failed to encode outbound OSC message");
                return;
            }
        };
        for mut target in clients.active() {
            if let Some(port) = reply_port {
                target.set_port(port);
            }
            if let Err(e) = socket.send_to(&bytes, target).await {
                error!(err = %e, %target, "failed to send OSC to upstream client");
            }
        }
    }
}
