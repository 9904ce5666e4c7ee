//! One outbound session to a peer.
//!
//! A session owns the write half of the stream behind a mutex (the
//! write-exclusion token), a monotonically increasing correlation
//! counter, and the map of rendezvous slots for requests in flight. A
//! single background reader routes each incoming Response to its slot;
//! when the stream dies every waiter is released with a
//! connection-closed error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use iroh::endpoint::{Connection, RecvStream, SendStream};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, trace};

use crate::network::session::protocol::{
    decode_response, encode_goodbye, encode_request, Goodbye, Request, Response, MSG_GOODBYE,
    MSG_REQUEST, MSG_RESPONSE,
};
use crate::network::session::SessionError;
use crate::network::wire::{read_frame, write_frame};

/// A live outbound session to one remote nickname.
pub struct PeerSession {
    nickname: String,
    conn: Connection,
    /// Write-exclusion token: all writes on the stream go through here.
    send: Mutex<SendStream>,
    next_request_id: AtomicU64,
    /// Rendezvous slots for requests awaiting their Response.
    pending: StdMutex<HashMap<u64, oneshot::Sender<Response>>>,
    /// Flips false -> true exactly once.
    dead: AtomicBool,
}

impl PeerSession {
    pub(crate) fn new(nickname: String, conn: Connection, send: SendStream) -> Arc<Self> {
        Arc::new(Self {
            nickname,
            conn,
            send: Mutex::new(send),
            next_request_id: AtomicU64::new(0),
            pending: StdMutex::new(HashMap::new()),
            dead: AtomicBool::new(false),
        })
    }

    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::Acquire)
    }

    /// Mark the session dead, close the connection, and abort every
    /// waiter. Dropping the slot senders wakes each waiter with a
    /// connection-closed error.
    pub(crate) fn fail_all(&self) {
        if !self.dead.swap(true, Ordering::AcqRel) {
            self.conn.close(0u32.into(), b"session closed");
        }

        let mut pending = self.pending.lock().expect("pending lock poisoned");
        pending.clear();
    }

    /// Run the background reader until the stream dies.
    pub(crate) fn spawn_reader(self: &Arc<Self>, mut recv: RecvStream) {
        let session = self.clone();
        tokio::spawn(async move {
            loop {
                match read_frame(&mut recv).await {
                    Ok((MSG_RESPONSE, payload)) => {
                        let response = match decode_response(&payload) {
                            Ok(r) => r,
                            Err(e) => {
                                debug!(peer = %session.nickname, error = %e, "bad response frame");
                                continue;
                            }
                        };
                        session.deliver(response);
                    }
                    // Outbound streams only expect Responses.
                    Ok((tag, _)) => {
                        trace!(peer = %session.nickname, tag, "ignoring unexpected frame");
                    }
                    Err(e) => {
                        debug!(peer = %session.nickname, error = %e, "session read ended");
                        break;
                    }
                }
            }
            session.fail_all();
        });
    }

    /// Hand a Response to its rendezvous slot; unmatched responses are
    /// dropped.
    fn deliver(&self, response: Response) {
        let slot = {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(&response.request_id)
        };
        match slot {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => {
                trace!(peer = %self.nickname, request_id = response.request_id, "dropping unmatched response");
            }
        }
    }

    /// Send one request and wait for its correlated Response.
    ///
    /// `request.request_id` is assigned here; each id is unique for the
    /// lifetime of the session.
    pub async fn do_request(&self, mut request: Request) -> Result<Response, SessionError> {
        if !self.is_alive() {
            return Err(SessionError::ConnectionClosed);
        }

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        request.request_id = id;

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.insert(id, tx);
        }

        let encoded = encode_request(&request);
        let write_result = {
            let mut send = self.send.lock().await;
            write_frame(&mut *send, MSG_REQUEST, &encoded).await
        };
        if let Err(e) = write_result {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            pending.remove(&id);
            return Err(SessionError::Transport(e.to_string()));
        }

        rx.await.map_err(|_| SessionError::ConnectionClosed)
    }

    /// Best-effort Goodbye frame; failures are ignored, teardown follows
    /// regardless.
    ///
    /// The stream is finished and its delivery awaited so the frame is
    /// not discarded when the connection closes right after.
    pub(crate) async fn send_goodbye(&self, sender: &str) {
        let goodbye = Goodbye {
            sender: sender.to_string(),
        };
        let mut send = self.send.lock().await;
        if let Err(e) = write_frame(&mut *send, MSG_GOODBYE, &encode_goodbye(&goodbye)).await {
            debug!(peer = %self.nickname, error = %e, "goodbye write failed");
            return;
        }
        if send.finish().is_ok() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(2), send.stopped()).await;
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("pending lock poisoned").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::session::protocol::{decode_request, MSG_ALPN};
    use crate::security::identity::KeyId;
    use crate::testing;
    use std::time::Duration;

    fn request(payload: &[u8]) -> Request {
        Request {
            request_id: 0,
            recipient_key_id: KeyId::from_bytes([1u8; 8]),
            encap_key: vec![0u8; 80],
            media_type: b"mt".to_vec(),
            ciphertext: payload.to_vec(),
        }
    }

    /// Spawn a raw responder that reads `count` requests off one inbound
    /// stream and answers them in the order given by `reply_order`
    /// (indices into arrival order).
    async fn scripted_responder(
        seed: u8,
        count: usize,
        reply_order: Vec<usize>,
    ) -> iroh::NodeAddr {
        let identity = testing::test_identity(seed);
        let endpoint = testing::test_endpoint(&identity, vec![MSG_ALPN.to_vec()]).await;
        let addr = endpoint.node_addr().await.unwrap();

        tokio::spawn(async move {
            let incoming = endpoint.accept().await.unwrap();
            let conn = incoming.await.unwrap();
            // Responder-opened stream carrying a challenge, as in the
            // real handshake.
            let (mut send, mut recv) = conn.open_bi().await.unwrap();
            write_frame(&mut send, 1, &[0u8; 32]).await.unwrap();

            let mut requests = Vec::new();
            for _ in 0..count {
                let (tag, payload) = read_frame(&mut recv).await.unwrap();
                assert_eq!(tag, MSG_REQUEST);
                requests.push(decode_request(&payload).unwrap());
            }

            for index in reply_order {
                let req = &requests[index];
                let response = Response {
                    request_id: req.request_id,
                    media_type: b"mt".to_vec(),
                    // Echo the request ciphertext so the test can match
                    // responses to requests.
                    ciphertext: req.ciphertext.clone(),
                };
                write_frame(
                    &mut send,
                    MSG_RESPONSE,
                    &crate::network::session::protocol::encode_response(&response),
                )
                .await
                .unwrap();
            }

            // Hold the stream open until the initiator goes away.
            let mut buf = [0u8; 1];
            loop {
                match recv.read(&mut buf).await {
                    Ok(Some(_)) => continue,
                    Ok(None) | Err(_) => break,
                }
            }
        });

        addr
    }

    async fn dial(seed: u8, addr: iroh::NodeAddr) -> Arc<PeerSession> {
        let identity = testing::test_identity(seed);
        let endpoint = testing::test_endpoint(&identity, vec![]).await;
        let conn = endpoint.connect(addr, MSG_ALPN).await.unwrap();
        let (send, mut recv) = conn.accept_bi().await.unwrap();
        // Consume the scripted responder's challenge frame.
        let (tag, challenge) = read_frame(&mut recv).await.unwrap();
        assert_eq!(tag, 1);
        assert_eq!(challenge.len(), 32);
        let session = PeerSession::new("remote".to_string(), conn, send);
        session.spawn_reader(recv);
        session
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_out_of_order_responses_are_correlated() {
        // Responder answers in order R2, R1, R3.
        let addr = scripted_responder(50, 3, vec![1, 0, 2]).await;
        let session = dial(51, addr).await;

        let (r1, r2, r3) = tokio::join!(
            session.do_request(request(b"one")),
            session.do_request(request(b"two")),
            session.do_request(request(b"three")),
        );

        assert_eq!(r1.unwrap().ciphertext, b"one");
        assert_eq!(r2.unwrap().ciphertext, b"two");
        assert_eq!(r3.unwrap().ciphertext, b"three");
        assert_eq!(session.pending_count(), 0, "no rendezvous slots remain");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_ids_are_unique_and_monotonic() {
        let addr = scripted_responder(52, 3, vec![0, 1, 2]).await;
        let session = dial(53, addr).await;

        for payload in [b"a".as_slice(), b"b", b"c"] {
            session.do_request(request(payload)).await.unwrap();
        }
        assert_eq!(session.next_request_id.load(Ordering::Relaxed), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_death_aborts_waiters() {
        // Responder never answers; it reads one request then drops the
        // connection.
        let identity = testing::test_identity(54);
        let endpoint = testing::test_endpoint(&identity, vec![MSG_ALPN.to_vec()]).await;
        let addr = endpoint.node_addr().await.unwrap();

        tokio::spawn(async move {
            let incoming = endpoint.accept().await.unwrap();
            let conn = incoming.await.unwrap();
            let (mut send, mut recv) = conn.open_bi().await.unwrap();
            write_frame(&mut send, 1, &[0u8; 32]).await.unwrap();
            let _ = read_frame(&mut recv).await;
            conn.close(0u32.into(), b"dropping you");
        });

        let session = dial(55, addr).await;
        match session.do_request(request(b"doomed")).await {
            Err(SessionError::ConnectionClosed) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        assert!(!session.is_alive());
        assert_eq!(session.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_dead_session_rejects_new_requests() {
        let addr = scripted_responder(56, 1, vec![0]).await;
        let session = dial(57, addr).await;

        session.do_request(request(b"ok")).await.unwrap();
        session.fail_all();

        match session.do_request(request(b"late")).await {
            Err(SessionError::ConnectionClosed) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_all_flips_dead_once() {
        let addr = scripted_responder(58, 1, vec![0]).await;
        let session = dial(59, addr).await;

        assert!(session.is_alive());
        session.fail_all();
        assert!(!session.is_alive());
        // Second call is a no-op.
        session.fail_all();
        assert!(!session.is_alive());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unmatched_response_is_dropped() {
        // Responder sends a response for an id nobody asked for, then a
        // real one.
        let identity = testing::test_identity(60);
        let endpoint = testing::test_endpoint(&identity, vec![MSG_ALPN.to_vec()]).await;
        let addr = endpoint.node_addr().await.unwrap();

        tokio::spawn(async move {
            let incoming = endpoint.accept().await.unwrap();
            let conn = incoming.await.unwrap();
            let (mut send, mut recv) = conn.open_bi().await.unwrap();
            write_frame(&mut send, 1, &[0u8; 32]).await.unwrap();

            let (_, payload) = read_frame(&mut recv).await.unwrap();
            let req = decode_request(&payload).unwrap();

            for id in [9999, req.request_id] {
                let response = Response {
                    request_id: id,
                    media_type: b"mt".to_vec(),
                    ciphertext: b"reply".to_vec(),
                };
                write_frame(
                    &mut send,
                    MSG_RESPONSE,
                    &crate::network::session::protocol::encode_response(&response),
                )
                .await
                .unwrap();
            }

            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let session = dial(61, addr).await;
        let response = session.do_request(request(b"q")).await.unwrap();
        assert_eq!(response.ciphertext, b"reply");
        assert_eq!(session.pending_count(), 0);
    }
}
