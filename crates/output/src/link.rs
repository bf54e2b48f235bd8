// Copyright 2025-2026 CEMAXECUTER LLC

//! Peer set, spectrum framing and calibration control.
//!
//! The link is shared between the network thread's connection tasks. Each
//! peer is represented by an unbounded outbound queue; the socket side of
//! the queue lives in [`crate::server`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rad_arena::Buffer;
use rad_protocol::{decode_frame, encode_spectrum, Command, FrameError, FrameKind};
use serde_json::json;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::calibration::{Calibration, CalibrationError};

pub type PeerId = u64;

/// One message queued for a peer's socket.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Binary(Vec<u8>),
    Text(String),
    Close,
}

struct Peer {
    name: String,
    tx: UnboundedSender<Outbound>,
}

pub struct ProtocolLink {
    calibration: Mutex<Calibration>,
    peers: Mutex<HashMap<PeerId, Peer>>,
    next_peer: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ProtocolLink {
    pub fn new(calibration: Calibration) -> Self {
        Self {
            calibration: Mutex::new(calibration),
            peers: Mutex::new(HashMap::new()),
            next_peer: AtomicU64::new(1),
        }
    }

    /// Register a connection. Frames for it arrive on the returned queue.
    pub fn add_peer(&self, name: &str) -> (PeerId, UnboundedReceiver<Outbound>) {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut peers = lock(&self.peers);
        peers.insert(
            id,
            Peer {
                name: name.to_string(),
                tx,
            },
        );
        log::info!("peer {} connected from {} ({} total)", id, name, peers.len());
        (id, rx)
    }

    pub fn remove_peer(&self, id: PeerId) {
        let mut peers = lock(&self.peers);
        if let Some(peer) = peers.remove(&id) {
            log::info!("peer {} ({}) disconnected ({} left)", id, peer.name, peers.len());
        }
    }

    pub fn peer_count(&self) -> usize {
        lock(&self.peers).len()
    }

    pub fn is_calibrating(&self) -> bool {
        lock(&self.calibration).is_active()
    }

    /// Load the persisted profile. Failure only disables bias subtraction.
    pub fn load_calibration(&self) -> Result<usize, CalibrationError> {
        lock(&self.calibration).load()
    }

    /// Frame one aggregated spectrum and send it to every peer. Update
    /// frames are folded into an active calibration first, then have the
    /// bias subtracted. The spectrum is released before the broadcast.
    /// Returns the number of peers reached.
    pub fn publish(&self, kind: FrameKind, spectrum: Buffer) -> usize {
        if kind == FrameKind::Update {
            let mut cal = lock(&self.calibration);
            if cal.is_active() {
                if let Err(e) = cal.fold(&spectrum) {
                    log::error!("calibration pass skipped: {}", e);
                }
            }
            match cal.apply_bias(&spectrum) {
                Ok(_) => {}
                Err(e) => log::error!("bias not applied: {}", e),
            }
        }

        let frame = spectrum.read(|values: &[f32]| encode_spectrum(kind, values));
        drop(spectrum);
        match frame {
            Ok(frame) => self.broadcast(Outbound::Binary(frame)),
            Err(e) => {
                log::error!("dropping {} frame: {}", kind, e);
                0
            }
        }
    }

    /// Queue `msg` for every peer, pruning peers whose queue has closed.
    pub fn broadcast(&self, msg: Outbound) -> usize {
        let mut peers = lock(&self.peers);
        let mut sent = 0;
        peers.retain(|id, peer| {
            if peer.tx.send(msg.clone()).is_ok() {
                sent += 1;
                true
            } else {
                log::debug!("pruning closed peer {}", id);
                false
            }
        });
        sent
    }

    pub fn send_to(&self, id: PeerId, msg: Outbound) -> bool {
        lock(&self.peers)
            .get(&id)
            .is_some_and(|peer| peer.tx.send(msg).is_ok())
    }

    /// Ask every connection to close and forget the peer set.
    pub fn close_all(&self) {
        let mut peers = lock(&self.peers);
        for (_, peer) in peers.drain() {
            let _ = peer.tx.send(Outbound::Close);
        }
    }

    fn send_response(&self, peer: PeerId, command: Command, status: &str, message: &str) {
        let resp = json!({
            "command": command.as_str(),
            "status": status,
            "message": message,
        });
        self.send_to(peer, Outbound::Text(resp.to_string()));
    }

    /// Handle a text message from `peer`. Returns the command it carried.
    pub fn handle_text(&self, peer: PeerId, text: &str) -> Option<Command> {
        let Some(command) = Command::parse(text) else {
            log::debug!("ignoring text from peer {}: {:?}", peer, text.trim());
            return None;
        };

        let result = {
            let mut cal = lock(&self.calibration);
            match command {
                Command::CalibrationBegin => {
                    cal.begin();
                    Ok("calibration started".to_string())
                }
                Command::CalibrationEnd => cal
                    .end()
                    .map(|bins| format!("saved {} bins to {}", bins, cal.path().display())),
                Command::CalibrationLoad => cal
                    .load()
                    .map(|bins| format!("loaded {} bins", bins)),
            }
        };

        match result {
            Ok(message) => self.send_response(peer, command, "ok", &message),
            Err(e) => {
                log::error!("{} failed: {}", command, e);
                self.send_response(peer, command, "error", &e.to_string());
            }
        }
        Some(command)
    }

    /// Peers have no binary commands; valid frames are only logged.
    pub fn handle_binary(&self, peer: PeerId, data: &[u8]) {
        log::debug!("received {} bytes from peer {}", data.len(), peer);
        match decode_frame(data) {
            Ok(frame) => log::debug!(
                "peer {} sent {} frame with {} bins",
                peer,
                frame.kind,
                frame.payload.len() / 4
            ),
            Err(FrameError::ByteSwapped(order)) => {
                log::error!("peer {} sent byte-swapped frame (order 0x{:04x})", peer, order)
            }
            Err(e) => log::debug!("peer {} sent unframed data: {}", peer, e),
        }
    }
}
