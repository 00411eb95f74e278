//! WebRTC peer transport.
//!
//! Wraps an `RTCPeerConnection` whose data channel is detached into a plain
//! tokio byte stream once it opens. Signaling (SDPs and ICE candidates) goes
//! through the [`Mailbox`](crate::signal::Mailbox); the mailbox's poll loop
//! feeds remote postings back in via [`Peer::serve`].
//!
//! Local candidates that appear before the remote description is known are
//! held in an ordered buffer and flushed once, when the description arrives.
//! Candidates emitted afterwards are published directly. Terminal connection
//! states (`disconnected`, `failed`, `closed`) collapse into a single
//! `done()` notification no matter how many of them fire.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::APIBuilder;
use webrtc::data::data_channel::PollDataChannel;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use crate::signal::{Mailbox, SignalError, SignalEvent};
use crate::{BoxError, ICE_DISCONNECTED_TIMEOUT, ICE_FAILED_TIMEOUT, ICE_KEEPALIVE_INTERVAL};

/// Byte stream handed to the transfer engine once the data channel opens.
pub type PeerStream = PollDataChannel;

type EstablishSlot = Arc<Mutex<Option<oneshot::Sender<PeerStream>>>>;

#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub stun: Vec<String>,
}

pub struct Peer {
    mailbox: Arc<Mailbox>,
    conn: Arc<RTCPeerConnection>,
    candidates: Arc<Mutex<CandidateBuffer>>,
    established: EstablishSlot,
    done: CancellationToken,
}

/// Ordered buffer for candidates emitted before the remote description is
/// installed. `drain` flips the buffer into pass-through mode; it only does
/// so once.
#[derive(Default)]
struct CandidateBuffer {
    pending: Vec<Vec<u8>>,
    drained: bool,
}

impl CandidateBuffer {
    /// Stores the candidate if the buffer is still collecting; returns it
    /// back if the buffer has already been drained and the candidate should
    /// be published directly.
    fn hold(&mut self, payload: Vec<u8>) -> Option<Vec<u8>> {
        if self.drained {
            return Some(payload);
        }

        self.pending.push(payload);
        None
    }

    fn drain(&mut self) -> Vec<Vec<u8>> {
        self.drained = true;
        std::mem::take(&mut self.pending)
    }
}

impl Peer {
    /// Builds the peer connection and returns it together with the receiver
    /// that fires once the data channel is open, carrying the byte stream.
    pub async fn new(
        cfg: PeerConfig,
        mailbox: Arc<Mailbox>,
    ) -> Result<(Self, oneshot::Receiver<PeerStream>), BoxError> {
        let ice_servers = cfg
            .stun
            .iter()
            .map(|stun| RTCIceServer {
                urls: vec![format!("stun:{}", stun)],
                ..Default::default()
            })
            .collect();

        let mut settings = SettingEngine::default();
        settings.detach_data_channels();
        settings.set_ice_timeouts(
            Some(ICE_DISCONNECTED_TIMEOUT),
            Some(ICE_FAILED_TIMEOUT),
            Some(ICE_KEEPALIVE_INTERVAL),
        );

        let api = APIBuilder::new().with_setting_engine(settings).build();

        let conn = Arc::new(
            api.new_peer_connection(RTCConfiguration {
                ice_servers,
                ..Default::default()
            })
            .await?,
        );

        let candidates = Arc::new(Mutex::new(CandidateBuffer::default()));
        let (established_tx, established_rx) = oneshot::channel();
        let established: EstablishSlot = Arc::new(Mutex::new(Some(established_tx)));
        let done = CancellationToken::new();

        {
            let mailbox = Arc::clone(&mailbox);
            let candidates = Arc::clone(&candidates);
            let conn_ref = Arc::downgrade(&conn);

            conn.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let mailbox = Arc::clone(&mailbox);
                let candidates = Arc::clone(&candidates);
                let conn_ref = conn_ref.clone();

                Box::pin(async move {
                    let Some(candidate) = candidate else { return };

                    let payload = match candidate.to_json() {
                        Ok(init) => init.candidate.into_bytes(),
                        Err(e) => {
                            error!("serialize ice candidate: {}", e);
                            return;
                        }
                    };

                    // Hold the buffer lock across the publish so flushed and
                    // direct candidates cannot interleave out of order.
                    let mut buffer = candidates.lock().await;

                    let Some(payload) = buffer.hold(payload) else { return };

                    let Some(conn) = conn_ref.upgrade() else { return };

                    if let Err(e) = publish_candidate(&mailbox, &conn, payload).await {
                        error!("publish ice candidate: {}", e);
                    }
                })
            }));
        }

        {
            let done = done.clone();

            conn.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                info!("connection state changed: {}", state);

                if matches!(
                    state,
                    RTCPeerConnectionState::Disconnected
                        | RTCPeerConnectionState::Failed
                        | RTCPeerConnectionState::Closed
                ) {
                    // Idempotent, so back-to-back terminal transitions
                    // deliver a single done() event.
                    done.cancel();
                }

                Box::pin(async {})
            }));
        }

        let peer = Self { mailbox, conn, candidates, established, done };

        Ok((peer, established_rx))
    }

    /// Performs role election and either sends an offer or registers as the
    /// answerer, waiting for the remote side's data channel.
    pub async fn dial(&self) -> Result<(), BoxError> {
        match self.mailbox.ping().await {
            Ok(()) => {
                info!("candidate found, start connecting...");
                self.offer().await
            }
            Err(SignalError::NoCandidatesFound) => {
                info!("no signaling candidate found, waiting...");
                self.wait_offer();
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Fires once, on the first terminal connection state.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    pub async fn close(&self) {
        if let Err(e) = self.conn.close().await {
            error!("close peer connection: {}", e);
        }
    }

    /// Dispatches remote signaling events until the channel closes. Handler
    /// errors are logged and the pump keeps running.
    pub async fn serve(&self, mut events: mpsc::Receiver<SignalEvent>) {
        while let Some(event) = events.recv().await {
            let result = match event {
                SignalEvent::Sdp(payload) => self.handle_remote_sdp(&payload).await,
                SignalEvent::Candidate(payload) => self.handle_remote_candidate(payload).await,
            };

            if let Err(e) = result {
                error!("signal event: {}", e);
            }
        }
    }

    async fn handle_remote_sdp(&self, payload: &[u8]) -> Result<(), BoxError> {
        let sdp: RTCSessionDescription = serde_json::from_slice(payload)?;
        let is_offer = sdp.sdp_type == RTCSdpType::Offer;

        self.conn.set_remote_description(sdp).await?;

        if is_offer {
            self.answer().await?;
        }

        // The remote description is in place: flush buffered candidates in
        // emission order, then let new ones pass straight through.
        let mut buffer = self.candidates.lock().await;

        for payload in buffer.drain() {
            publish_candidate(&self.mailbox, &self.conn, payload).await?;
        }

        Ok(())
    }

    async fn handle_remote_candidate(&self, payload: Vec<u8>) -> Result<(), BoxError> {
        let candidate = String::from_utf8(payload)?;

        self.conn
            .add_ice_candidate(RTCIceCandidateInit { candidate, ..Default::default() })
            .await?;

        Ok(())
    }

    async fn offer(&self) -> Result<(), BoxError> {
        let channel = self.conn.create_data_channel("data", None).await?;
        register_open_hook(&channel, Arc::clone(&self.established));

        let offer = self.conn.create_offer(None).await?;
        self.conn.set_local_description(offer.clone()).await?;

        self.mailbox.send_sdp(serde_json::to_vec(&offer)?).await?;

        Ok(())
    }

    /// Answer path: the answer must be published before it becomes the local
    /// description, so candidates generated while it is being created are
    /// flushed after the answer and arrive at the remote in a usable order.
    async fn answer(&self) -> Result<(), BoxError> {
        let answer = self.conn.create_answer(None).await?;

        self.mailbox.send_sdp(serde_json::to_vec(&answer)?).await?;
        self.conn.set_local_description(answer).await?;

        Ok(())
    }

    fn wait_offer(&self) {
        let established = Arc::clone(&self.established);

        self.conn.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let established = Arc::clone(&established);

            Box::pin(async move {
                register_open_hook(&channel, established);
            })
        }));
    }
}

/// Publishes one local candidate unless the connection is already closed.
async fn publish_candidate(
    mailbox: &Mailbox,
    conn: &RTCPeerConnection,
    payload: Vec<u8>,
) -> Result<(), SignalError> {
    if conn.connection_state() == RTCPeerConnectionState::Closed {
        return Ok(());
    }

    mailbox.send_candidate(payload).await
}

/// Detaches the channel on open and delivers the resulting byte stream
/// through the single-shot establish slot.
fn register_open_hook(channel: &Arc<RTCDataChannel>, established: EstablishSlot) {
    let hooked = Arc::clone(channel);

    channel.on_open(Box::new(move || {
        let hooked = Arc::clone(&hooked);
        let established = Arc::clone(&established);

        Box::pin(async move {
            let raw = match hooked.detach().await {
                Ok(raw) => raw,
                Err(e) => {
                    error!("detach data channel: {}", e);
                    return;
                }
            };

            if let Some(tx) = established.lock().await.take() {
                // The receiver only disappears when the run is already
                // being torn down.
                let _ = tx.send(PollDataChannel::new(raw));
            }
        })
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_buffer_holds_until_drained() {
        let mut buffer = CandidateBuffer::default();

        assert!(buffer.hold(b"a".to_vec()).is_none());
        assert!(buffer.hold(b"b".to_vec()).is_none());

        let drained = buffer.drain();
        assert_eq!(drained, vec![b"a".to_vec(), b"b".to_vec()]);
    }

    #[test]
    fn test_candidate_buffer_passes_through_after_drain() {
        let mut buffer = CandidateBuffer::default();

        buffer.hold(b"early".to_vec());
        buffer.drain();

        // Later candidates are returned for direct publication, not stored.
        assert_eq!(buffer.hold(b"late".to_vec()), Some(b"late".to_vec()));
        assert!(buffer.pending.is_empty());
    }

    #[test]
    fn test_candidate_buffer_drains_once() {
        let mut buffer = CandidateBuffer::default();

        buffer.hold(b"a".to_vec());
        assert_eq!(buffer.drain().len(), 1);
        assert!(buffer.drain().is_empty());
    }
}
