//! Session pool: at most one outbound session per remote nickname.
//!
//! The pool dials and performs the Challenge/Hello handshake on first
//! use, reuses live sessions afterwards, and layers the envelope on top
//! to expose request/response messaging, broadcast fan-out, presence
//! announcement and orderly shutdown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::future::join_all;
use iroh::Endpoint;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::data::peer_table::PeerTable;
use crate::network::discovery::protocol::PeerInfo;
use crate::network::session::incoming::ReplyProvider;
use crate::network::session::protocol::{
    encode_hello, Hello, Request, CHALLENGE_LEN, BROADCAST_TAG, MSG_ALPN, MSG_CHALLENGE, MSG_HELLO,
    REQUEST_MEDIA_TYPE,
};
use crate::network::session::session::PeerSession;
use crate::network::session::SessionError;
use crate::network::wire::{read_frame, write_frame};
use crate::protocol::events::MessengerEvent;
use crate::security::envelope::RequestSealer;
use crate::security::identity::DerivedKeys;

/// Timeout for dialing a peer and opening the session stream.
const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Pool of outbound peer sessions plus the responder-side state.
pub struct SessionPool {
    pub(crate) endpoint: Endpoint,
    pub(crate) table: PeerTable,
    pub(crate) identity: Arc<DerivedKeys>,
    pub(crate) nickname: String,
    sessions: StdMutex<HashMap<String, Arc<PeerSession>>>,
    pub(crate) events: mpsc::UnboundedSender<MessengerEvent>,
    pub(crate) reply: Arc<dyn ReplyProvider>,
}

impl SessionPool {
    pub fn new(
        endpoint: Endpoint,
        table: PeerTable,
        identity: Arc<DerivedKeys>,
        nickname: String,
        events: mpsc::UnboundedSender<MessengerEvent>,
        reply: Arc<dyn ReplyProvider>,
    ) -> Arc<Self> {
        Arc::new(Self {
            endpoint,
            table,
            identity,
            nickname,
            sessions: StdMutex::new(HashMap::new()),
            events,
            reply,
        })
    }

    /// Reuse the live session to `to`, or dial and handshake a new one.
    pub async fn session(&self, to: &PeerInfo) -> Result<Arc<PeerSession>, SessionError> {
        if let Some(existing) = self.get_live(&to.nickname) {
            return Ok(existing);
        }

        let fresh = self.dial_and_handshake(to).await?;

        // A concurrent dial may have won; keep the existing session so
        // there is never more than one per nickname.
        let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
        if let Some(existing) = sessions.get(&to.nickname) {
            if existing.is_alive() {
                let existing = existing.clone();
                drop(sessions);
                fresh.fail_all();
                return Ok(existing);
            }
        }
        sessions.insert(to.nickname.clone(), fresh.clone());
        Ok(fresh)
    }

    fn get_live(&self, nickname: &str) -> Option<Arc<PeerSession>> {
        let sessions = self.sessions.lock().expect("sessions lock poisoned");
        sessions.get(nickname).filter(|s| s.is_alive()).cloned()
    }

    /// Drop the session to `nickname`, aborting all of its waiters.
    pub fn remove_session(&self, nickname: &str) {
        let removed = {
            let mut sessions = self.sessions.lock().expect("sessions lock poisoned");
            sessions.remove(nickname)
        };
        if let Some(session) = removed {
            session.fail_all();
            info!(peer = %nickname, "disconnected from peer");
        }
    }

    /// Nicknames with a live outbound session.
    pub fn active_sessions(&self) -> Vec<String> {
        let sessions = self.sessions.lock().expect("sessions lock poisoned");
        sessions
            .iter()
            .filter(|(_, s)| s.is_alive())
            .map(|(nick, _)| nick.clone())
            .collect()
    }

    /// Send one sealed request to `to` and return the opened reply.
    pub async fn send_request(&self, to: &PeerInfo, msg: &str) -> Result<String, SessionError> {
        let session = self.session(to).await?;

        let sealer = RequestSealer::new(msg.as_bytes(), REQUEST_MEDIA_TYPE)?;
        let ciphertext = sealer.ciphertext().to_vec();
        let (encap_key, response_opener) = sealer.encapsulate(&to.key_id, &to.kem_public)?;

        let request = Request {
            request_id: 0, // assigned inside do_request
            recipient_key_id: to.key_id,
            encap_key,
            media_type: REQUEST_MEDIA_TYPE.to_vec(),
            ciphertext,
        };

        let response = session.do_request(request).await?;
        let plaintext = response_opener.open(&response.ciphertext, &response.media_type)?;
        Ok(String::from_utf8_lossy(&plaintext).into_owned())
    }

    /// Fan a message out to every known peer except ourselves.
    ///
    /// Waits for all deliveries; returns the first failure, if any.
    pub async fn broadcast(&self, msg: &str) -> Result<(), SessionError> {
        let tagged = format!("{}{}", BROADCAST_TAG, msg);

        let targets: Vec<PeerInfo> = self
            .table
            .all()
            .into_iter()
            .filter(|p| p.nickname != self.nickname)
            .collect();

        let sends = targets.iter().map(|to| {
            let tagged = tagged.clone();
            async move {
                match self.send_request(to, &tagged).await {
                    Ok(reply) => {
                        trace!(peer = %to.nickname, reply = %reply, "broadcast delivered");
                        Ok(())
                    }
                    Err(e) => Err(format!("to {}: {}", to.nickname, e)),
                }
            }
        });

        let results = join_all(sends).await;
        let delivered = results.iter().filter(|r| r.is_ok()).count();
        let failed = results.len() - delivered;
        info!(delivered, failed, "broadcast complete");

        match results.into_iter().find_map(|r| r.err()) {
            Some(first) => Err(SessionError::Broadcast(first)),
            None => Ok(()),
        }
    }

    /// Dial every known peer once so they see us online. Failures are
    /// ignored; the peer may simply not be up yet.
    pub async fn announce_presence(&self) {
        for peer in self.table.all() {
            if peer.nickname == self.nickname {
                continue;
            }
            if let Err(e) = self.session(&peer).await {
                debug!(peer = %peer.nickname, error = %e, "presence dial failed");
            }
        }
    }

    /// Send Goodbye on every live session, then tear them all down.
    pub async fn announce_disconnection(&self) {
        let snapshot: Vec<(String, Arc<PeerSession>)> = {
            let sessions = self.sessions.lock().expect("sessions lock poisoned");
            sessions
                .iter()
                .map(|(nick, s)| (nick.clone(), s.clone()))
                .collect()
        };

        for (nickname, session) in snapshot {
            if session.is_alive() {
                session.send_goodbye(&self.nickname).await;
            }
            self.remove_session(&nickname);
        }
    }

    /// Open a stream to `to`, complete the Challenge/Hello handshake, and
    /// start the session reader.
    async fn dial_and_handshake(&self, to: &PeerInfo) -> Result<Arc<PeerSession>, SessionError> {
        let node_addr = to.node_addr();
        // Teach the endpoint the peer's addresses before dialing.
        let _ = self.endpoint.add_node_addr(node_addr.clone());

        let conn = tokio::time::timeout(DIAL_TIMEOUT, self.endpoint.connect(node_addr, MSG_ALPN))
            .await
            .map_err(|_| SessionError::Transport("connect timeout".to_string()))?
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        // The responder opens the stream: it writes first (the
        // challenge), and a stream only becomes visible to its peer once
        // data is sent on it.
        let (mut send, mut recv) = tokio::time::timeout(DIAL_TIMEOUT, conn.accept_bi())
            .await
            .map_err(|_| SessionError::Transport("handshake timeout".to_string()))?
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        // 1) Read the responder's challenge.
        let (tag, challenge) = read_frame(&mut recv).await?;
        if tag != MSG_CHALLENGE {
            return Err(SessionError::Handshake(format!(
                "expected Challenge, got {}",
                tag
            )));
        }
        if challenge.len() != CHALLENGE_LEN {
            return Err(SessionError::Handshake(format!(
                "bad challenge length: {}",
                challenge.len()
            )));
        }

        // 2) Answer with a signed Hello.
        let hello = Hello::signed(
            &self.identity.signing,
            &self.nickname,
            self.identity.key_id,
            self.identity.kem_public,
            &challenge,
        );
        write_frame(&mut send, MSG_HELLO, &encode_hello(&hello)).await?;

        let session = PeerSession::new(to.nickname.clone(), conn, send);
        session.spawn_reader(recv);

        info!(peer = %to.nickname, remote = %to.node_id.fmt_short(), "connected to peer");
        Ok(session)
    }
}
