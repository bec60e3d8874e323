//! UDP discovery broadcast parsing and the passive broadcast listener.
//!
//! Discovery frames are never encrypted with a negotiated session key: `Udp`
//! payloads are plain JSON, `UdpNew`/`BroadcastLpv34` payloads go through the
//! normal frame pipeline under a well-known default key.

use crate::crypto::Cipher;
use crate::error::{Result, TuyaError};
use crate::protocol::{self, DecodeResult, PREFIX_6699, Version};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default key for v3.4/v3.5 discovery broadcasts: MD5 of a fixed app secret,
/// baked into every device firmware.
pub const UDP_KEY_DEFAULT: &[u8; 16] = &[
    0x6c, 0x1e, 0xc8, 0xe2, 0xbb, 0x9b, 0xb5, 0x9a, 0xb5, 0x0b, 0x0d, 0xaf, 0x64, 0x9b, 0x41, 0x0a,
];
/// v3.3 discovery broadcast key.
pub const UDP_KEY_33: &[u8; 16] = b"yG9shRKIBrIBUjc3";

/// Ports devices broadcast on: 6666 (v3.1 plain), 6667 (encrypted), 7000 (v3.5).
pub const DISCOVERY_PORTS: &[u16] = &[6666, 6667, 7000];

/// One device announcement extracted from a UDP broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryRecord {
    pub id: String,
    pub ip: String,
    pub version: Option<Version>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_key: Option<String>,
}

/// Parse a single UDP datagram into a discovery record.
///
/// Tries, in order: raw JSON, the framed formats under the default keys, a
/// whole-packet ECB decrypt, and finally an embedded-JSON scan. Returns
/// `None` for packets that are not discovery announcements.
pub fn parse_packet(data: &[u8]) -> Option<DiscoveryRecord> {
    if let Ok(val) = serde_json::from_slice::<Value>(data) {
        return record_from_json(&val);
    }

    if data.len() >= 4 {
        let framed_version = if data[..4] == PREFIX_6699.to_be_bytes() {
            Version::V3_5
        } else {
            Version::V3_3
        };
        for key in [UDP_KEY_DEFAULT, UDP_KEY_33] {
            if let DecodeResult::Frame { frame, .. } = protocol::decode(data, framed_version, key)
                && let Ok(val) = serde_json::from_slice::<Value>(&frame.payload)
            {
                return record_from_json(&val);
            }
        }
    }

    // Some v3.3 firmwares broadcast a bare ECB blob without framing.
    for key in [UDP_KEY_33, UDP_KEY_DEFAULT] {
        if let Ok(cipher) = Cipher::new(key)
            && let Ok(plain) = cipher.ecb_decrypt(data, true)
            && let Ok(val) = serde_json::from_slice::<Value>(&plain)
        {
            return record_from_json(&val);
        }
    }

    let pos = data.iter().position(|&b| b == b'{')?;
    let val = serde_json::from_slice::<Value>(&data[pos..]).ok()?;
    record_from_json(&val)
}

fn record_from_json(val: &Value) -> Option<DiscoveryRecord> {
    let id = val
        .get("gwId")
        .or_else(|| val.get("devId"))
        .or_else(|| val.get("id"))
        .and_then(|v| v.as_str())?;
    let ip = val.get("ip").and_then(|v| v.as_str())?;
    let version = val
        .get("version")
        .and_then(|v| v.as_str())
        .and_then(|s| Version::from_str(s).ok());
    let product_key = val
        .get("productKey")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    Some(DiscoveryRecord {
        id: id.to_string(),
        ip: ip.to_string(),
        version,
        product_key,
    })
}

/// Change-detection cache over discovery records. A record is a change iff
/// its `(ip, version)` pair differs from the previously observed pair for
/// the same device id.
#[derive(Default)]
pub struct DiscoveryCache {
    seen: HashMap<String, (String, Option<Version>)>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an announcement. Returns true when the device is new or its
    /// address/version changed.
    pub fn observe(&mut self, record: &DiscoveryRecord) -> bool {
        let entry = (record.ip.clone(), record.version);
        match self.seen.insert(record.id.clone(), entry.clone()) {
            Some(previous) => previous != entry,
            None => true,
        }
    }

    pub fn get(&self, id: &str) -> Option<(&str, Option<Version>)> {
        self.seen.get(id).map(|(ip, v)| (ip.as_str(), *v))
    }

    pub fn invalidate(&mut self, id: &str) -> bool {
        self.seen.remove(id).is_some()
    }
}

/// Passive UDP listener feeding parsed, deduplicated announcements to a
/// channel. Binds the standard discovery ports with address reuse so it can
/// coexist with other local listeners.
pub struct DiscoveryListener {
    bind_addr: String,
    ports: Vec<u16>,
}

impl Default for DiscoveryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl DiscoveryListener {
    pub fn new() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            ports: DISCOVERY_PORTS.to_vec(),
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    fn bind_socket(&self, port: u16) -> Result<UdpSocket> {
        let addr: SocketAddr = format!("{}:{}", self.bind_addr, port)
            .parse()
            .map_err(|e| TuyaError::Io(format!("bad bind address: {}", e)))?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        socket.set_broadcast(true)?;
        socket.bind(&SockAddr::from(addr))?;
        socket.set_nonblocking(true)?;

        let std_socket: std::net::UdpSocket = socket.into();
        Ok(UdpSocket::from_std(std_socket)?)
    }

    /// Start listening. Only records whose `(ip, version)` changed since the
    /// last sighting of the same device id are delivered. The listener stops
    /// when `cancel` fires or the receiver is dropped.
    pub fn listen(&self, cancel: CancellationToken) -> Result<mpsc::Receiver<DiscoveryRecord>> {
        let mut sockets = Vec::new();
        for &port in &self.ports {
            match self.bind_socket(port) {
                Ok(s) => sockets.push(s),
                Err(e) => warn!("discovery: failed to bind port {}: {}", port, e),
            }
        }
        if sockets.is_empty() {
            return Err(TuyaError::Io("no discovery ports available".into()));
        }

        let (raw_tx, mut raw_rx) = mpsc::channel::<Vec<u8>>(100);
        for socket in sockets {
            let tx = raw_tx.clone();
            let ct = cancel.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    tokio::select! {
                        _ = ct.cancelled() => break,
                        res = socket.recv_from(&mut buf) => match res {
                            Ok((len, addr)) => {
                                debug!("discovery: {} bytes from {}", len, addr);
                                if tx.send(buf[..len].to_vec()).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("discovery: recv error: {}", e);
                                break;
                            }
                        }
                    }
                }
            });
        }

        let (out_tx, out_rx) = mpsc::channel(32);
        tokio::spawn(async move {
            let mut cache = DiscoveryCache::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    packet = raw_rx.recv() => {
                        let Some(packet) = packet else { break };
                        if let Some(record) = parse_packet(&packet) {
                            if cache.observe(&record) {
                                debug!("discovery: {} at {} (v{:?})", record.id, record.ip, record.version);
                                if out_tx.send(record).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                }
            }
            debug!("discovery listener stopped");
        });

        Ok(out_rx)
    }
}
