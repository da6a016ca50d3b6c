//! Statsd UDP sink.
//!
//! The flush loop pushes counter deltas (`name:delta|c`) and gauge values
//! (`name:value|g`) as individual datagrams. Sends are non-blocking and
//! fire-and-forget: a full socket buffer or an unreachable collector
//! drops the datagram and counts it, never stalling the main loop.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;

use gantry_core::stats::{Counter, Sink, Store};

pub struct StatsdSink {
    socket: UdpSocket,
    collector: SocketAddr,
    send_fail: Arc<Counter>,
}

impl StatsdSink {
    pub fn new(collector: SocketAddr, store: &Store) -> std::io::Result<Self> {
        let bind: SocketAddr = if collector.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = UdpSocket::bind(bind)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket,
            collector,
            send_fail: store.counter("stats.statsd_send_fail"),
        })
    }

    fn send(&self, datagram: &str) {
        if self.socket.send_to(datagram.as_bytes(), self.collector).is_err() {
            self.send_fail.inc();
        }
    }
}

impl Sink for StatsdSink {
    fn flush_counter(&self, name: &str, delta: u64) {
        self.send(&format!("{name}:{delta}|c"));
    }

    fn flush_gauge(&self, name: &str, value: u64) {
        self.send(&format!("{name}:{value}|g"));
    }
}
