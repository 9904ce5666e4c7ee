//! Responder side of peer sessions.
//!
//! Accepts inbound session connections, runs the Challenge/Hello
//! handshake, then serves sealed requests on the stream until Goodbye or
//! stream death. A received Goodbye also tears down our own outbound
//! session to that peer.

use std::sync::Arc;

use iroh::endpoint::Connection;
use iroh::Endpoint;
use rand::RngCore;
use tracing::{debug, info, trace, warn};

use crate::network::session::pool::SessionPool;
use crate::network::session::protocol::{
    decode_goodbye, decode_hello, decode_request, encode_response, verify_hello, Response,
    BROADCAST_TAG, CHALLENGE_LEN, MSG_ALPN, MSG_CHALLENGE, MSG_GOODBYE, MSG_HELLO, MSG_REQUEST,
    MSG_RESPONSE, RESPONSE_MEDIA_TYPE,
};
use crate::network::session::SessionError;
use crate::network::wire::{read_frame, write_frame};
use crate::protocol::events::MessengerEvent;
use crate::security::envelope::MultiRequestReceiver;

/// Supplies the application reply to an opened request.
///
/// The default implementation answers every request with a fixed
/// acknowledgement; embedders may plug in a real reply source.
pub trait ReplyProvider: Send + Sync {
    fn reply(&self, sender: &str, plaintext: &[u8]) -> Vec<u8>;
}

/// Replies `"message received"` to everything.
pub struct FixedReply;

impl ReplyProvider for FixedReply {
    fn reply(&self, _sender: &str, _plaintext: &[u8]) -> Vec<u8> {
        b"message received".to_vec()
    }
}

/// Accept inbound connections and serve each session on its own task.
pub async fn run_inbound(pool: Arc<SessionPool>, endpoint: Endpoint) {
    while let Some(incoming) = endpoint.accept().await {
        let mut connecting = match incoming.accept() {
            Ok(connecting) => connecting,
            Err(e) => {
                debug!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let alpn = connecting.alpn().await.ok();
        if alpn.as_deref() != Some(MSG_ALPN) {
            debug!(?alpn, "ignoring unknown ALPN");
            continue;
        }

        let conn = match connecting.await {
            Ok(conn) => conn,
            Err(e) => {
                debug!(error = %e, "failed to accept connection");
                continue;
            }
        };

        let pool = pool.clone();
        tokio::spawn(async move {
            if let Err(e) = pool.serve_session(conn).await {
                debug!(error = %e, "session handler ended");
            }
        });
    }

    info!("inbound session handler stopped");
}

impl SessionPool {
    /// Serve one inbound session stream for its lifetime.
    ///
    /// The responder opens the stream because it speaks first: the
    /// initiator cannot see the stream until challenge bytes flow.
    pub(crate) async fn serve_session(&self, conn: Connection) -> Result<(), SessionError> {
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;

        // Fresh challenge so a recorded Hello cannot be replayed.
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut challenge);
        write_frame(&mut send, MSG_CHALLENGE, &challenge).await?;

        let (tag, payload) = read_frame(&mut recv).await?;
        if tag != MSG_HELLO {
            return Err(SessionError::Handshake(format!(
                "expected Hello, got {}",
                tag
            )));
        }
        let hello = decode_hello(&payload)?;
        verify_hello(&challenge, &hello, Some(&self.table))?;

        info!(peer = %hello.sender, "inbound session established");

        let receiver =
            MultiRequestReceiver::new(self.identity.key_id, self.identity.kem_secret.clone());

        loop {
            let (tag, payload) = match read_frame(&mut recv).await {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(peer = %hello.sender, error = %e, "inbound session read ended");
                    return Ok(());
                }
            };

            match tag {
                MSG_GOODBYE => {
                    let goodbye = decode_goodbye(&payload)?;
                    info!(peer = %goodbye.sender, "peer said goodbye");
                    self.remove_session(&goodbye.sender);
                    return Ok(());
                }
                MSG_REQUEST => {
                    let request = decode_request(&payload)?;

                    if request.recipient_key_id != self.identity.key_id {
                        warn!(
                            peer = %hello.sender,
                            got = %request.recipient_key_id,
                            want = %self.identity.key_id,
                            "request for a different recipient"
                        );
                        return Err(SessionError::WrongRecipient);
                    }

                    let opener = receiver.new_request_opener(
                        &request.encap_key,
                        &request.ciphertext,
                        &request.media_type,
                    )?;
                    let plaintext = opener.plaintext().to_vec();

                    let text = String::from_utf8_lossy(&plaintext).into_owned();
                    let event = match text.strip_prefix(BROADCAST_TAG) {
                        Some(rest) => MessengerEvent::Broadcast {
                            from: hello.sender.clone(),
                            text: rest.to_string(),
                        },
                        None => MessengerEvent::DirectMessage {
                            from: hello.sender.clone(),
                            text,
                        },
                    };
                    if self.events.send(event).is_err() {
                        trace!("event channel closed, dropping message event");
                    }

                    let reply = self.reply.reply(&hello.sender, &plaintext);
                    let ciphertext = opener.seal_response(&reply, RESPONSE_MEDIA_TYPE)?;
                    let response = Response {
                        request_id: request.request_id,
                        media_type: RESPONSE_MEDIA_TYPE.to_vec(),
                        ciphertext,
                    };
                    write_frame(&mut send, MSG_RESPONSE, &encode_response(&response)).await?;
                }
                other => {
                    trace!(peer = %hello.sender, tag = other, "ignoring unexpected frame");
                }
            }
        }
    }
}
