//! Turns unauthenticated, plain-text connections into authenticated, plain-text
//! connections.
//!
//! Noticeably, this does not guarantee confidentiality: nothing is encrypted.
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use smol::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::{InitiatorAct1, ResponderAct2};
use crate::{
    config::HandshakeConfig,
    error::{BoxError, HandshakeError},
    identity::{Identity, PeerId, PublicIdentity},
    serde::{decode, encode},
};

/// Decides whether an authenticated remote peer may stay connected.
///
/// Typically this checks that the operator behind the key has enough stake.
pub trait Firewall: Send + Sync {
    fn validate(&self, remote: &PublicIdentity) -> Result<(), BoxError>;
}

/// A firewall letting every authenticated peer through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Firewall for AllowAll {
    fn validate(&self, _remote: &PublicIdentity) -> Result<(), BoxError> {
        Ok(())
    }
}

/// A signed act message, as it goes over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct HandshakeEnvelope {
    message: Vec<u8>,
    peer_id: Vec<u8>,
    signature: Vec<u8>,
}

/// Length prefixed frames over a raw stream.
struct Pipe<S> {
    stream: S,
    max_frame_size: usize,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Pipe<S> {
    async fn send(&mut self, envelope: &HandshakeEnvelope) -> Result<(), HandshakeError> {
        let bytes = encode(envelope).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        if bytes.len() > self.max_frame_size {
            return Err(HandshakeError::FrameTooLarge {
                size: bytes.len(),
                max: self.max_frame_size,
            });
        }
        let len = u32::try_from(bytes.len()).map_err(|_| HandshakeError::FrameTooLarge {
            size: bytes.len(),
            max: self.max_frame_size,
        })?;

        self.stream.write_all(&len.to_be_bytes()).await?;
        self.stream.write_all(&bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<HandshakeEnvelope, HandshakeError> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;
        if len > self.max_frame_size {
            return Err(HandshakeError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }

        let mut bytes = vec![0u8; len];
        self.stream.read_exact(&mut bytes).await?;
        decode(&bytes).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }
}

/// A connection whose remote party proved ownership of its static key.
pub struct AuthenticatedConnection<S> {
    stream: S,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_public_key: PublicIdentity,
}

impl<S: AsyncRead + AsyncWrite + Unpin> AuthenticatedConnection<S> {
    /// Authenticate a connection we dialed, acting as the initiator.
    ///
    /// The dialing side knows who it expects on the other end, so the remote
    /// identity is pinned from the start.
    pub async fn outbound(
        stream: S,
        identity: &Identity,
        remote_peer: PeerId,
        firewall: &dyn Firewall,
        config: &HandshakeConfig,
    ) -> Result<Self, HandshakeError> {
        let remote_public_key = remote_peer
            .public_key()
            .map_err(HandshakeError::InvalidIdentity)?;

        let mut session = Session {
            pipe: Pipe {
                stream,
                max_frame_size: config.max_frame_size,
            },
            identity,
            remote: Some((remote_peer, remote_public_key)),
        };

        let result = session.run_as_initiator(&config.protocol_id).await;
        session.finish(result, firewall).await
    }

    /// Authenticate a connection somebody dialed to us, acting as the responder.
    ///
    /// The remote identity is only learned from the first act.
    pub async fn inbound(
        stream: S,
        identity: &Identity,
        firewall: &dyn Firewall,
        config: &HandshakeConfig,
    ) -> Result<Self, HandshakeError> {
        let mut session = Session {
            pipe: Pipe {
                stream,
                max_frame_size: config.max_frame_size,
            },
            identity,
            remote: None,
        };

        let result = session.run_as_responder(&config.protocol_id).await;
        session.finish(result, firewall).await
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.local_peer
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.remote_peer
    }

    pub fn remote_public_key(&self) -> &PublicIdentity {
        &self.remote_public_key
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    /// Give back the underlying stream, now known to be authenticated.
    pub fn into_inner(self) -> S {
        self.stream
    }
}

struct Session<'a, S> {
    pipe: Pipe<S>,
    identity: &'a Identity,
    remote: Option<(PeerId, PublicIdentity)>,
}

impl<'a, S: AsyncRead + AsyncWrite + Unpin> Session<'a, S> {
    async fn run_as_initiator(&mut self, protocol: &str) -> Result<(), HandshakeError> {
        // Act 1
        let initiator_act1 = InitiatorAct1::new(protocol)?;
        self.send_act(&initiator_act1.message()).await?;
        let initiator_act2 = initiator_act1.next();

        // Act 2
        let act2 = self.receive_act().await?;
        let initiator_act3 = initiator_act2.next(&act2)?;

        // Act 3
        self.send_act(&initiator_act3.message()).await
    }

    async fn run_as_responder(&mut self, protocol: &str) -> Result<(), HandshakeError> {
        // Act 1
        let act1 = self.receive_act().await?;
        let responder_act2 = ResponderAct2::answer(&act1, protocol)?;

        // Act 2
        self.send_act(&responder_act2.message()).await?;
        let responder_act3 = responder_act2.next();

        // Act 3
        let act3 = self.receive_act().await?;
        responder_act3.finalize(&act3)
    }

    async fn send_act<T: Serialize>(&mut self, act: &T) -> Result<(), HandshakeError> {
        let message = encode(act).map_err(|e| HandshakeError::Malformed(e.to_string()))?;
        let envelope = HandshakeEnvelope {
            signature: self.identity.sign(&message),
            peer_id: self.identity.peer_id().as_bytes().to_vec(),
            message,
        };
        self.pipe.send(&envelope).await
    }

    /// Receive the next act, checking that the pinned identity signed it.
    async fn receive_act<T: DeserializeOwned>(&mut self) -> Result<T, HandshakeError> {
        let envelope = self.pipe.receive().await?;
        let actual_sender =
            PeerId::from_bytes(&envelope.peer_id).map_err(HandshakeError::InvalidIdentity)?;

        // The responder doesn't know the initiator before the first act; the
        // identity claimed in that act gets pinned for the rest of the handshake.
        let (pinned, public_key) = match &self.remote {
            Some(remote) => remote.clone(),
            None => {
                let public_key = actual_sender
                    .public_key()
                    .map_err(HandshakeError::InvalidIdentity)?;
                self.remote = Some((actual_sender.clone(), public_key.clone()));
                (actual_sender.clone(), public_key)
            }
        };

        if pinned != actual_sender {
            return Err(HandshakeError::IdentityMismatch {
                pinned: pinned.to_string(),
                actual: actual_sender.to_string(),
            });
        }
        if !public_key.verify(&envelope.message, &envelope.signature) {
            return Err(HandshakeError::InvalidSignature {
                signature: hex::encode(&envelope.signature),
                sender: actual_sender.to_string(),
            });
        }
        trace!(peer = %actual_sender, "received handshake act");

        decode(&envelope.message).map_err(|e| HandshakeError::Malformed(e.to_string()))
    }

    async fn finish(
        mut self,
        result: Result<(), HandshakeError>,
        firewall: &dyn Firewall,
    ) -> Result<AuthenticatedConnection<S>, HandshakeError> {
        let checked = result.and_then(|()| {
            let (_, public_key) = self
                .remote
                .as_ref()
                .ok_or_else(|| HandshakeError::Malformed("no remote identity".to_string()))?;
            firewall
                .validate(public_key)
                .map_err(HandshakeError::Firewall)
        });

        match (checked, self.remote) {
            (Ok(()), Some((remote_peer, remote_public_key))) => {
                debug!(peer = %remote_peer, "connection authenticated");
                Ok(AuthenticatedConnection {
                    stream: self.pipe.stream,
                    local_peer: self.identity.peer_id(),
                    remote_peer,
                    remote_public_key,
                })
            }
            (result, _) => {
                // Close the stream before returning, otherwise it leaks.
                if let Err(e) = self.pipe.stream.close().await {
                    debug!("could not close the connection: [{}]", e);
                }
                Err(result.err().unwrap_or_else(|| {
                    HandshakeError::Malformed("no remote identity".to_string())
                }))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use smol::net::{TcpListener, TcpStream};

    struct DenyAll;

    impl Firewall for DenyAll {
        fn validate(&self, _remote: &PublicIdentity) -> Result<(), BoxError> {
            Err("no stake".into())
        }
    }

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (dialed, accepted) = smol::future::zip(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        })
        .await;
        (dialed.unwrap(), accepted.unwrap())
    }

    #[test]
    fn test_handshake_authenticates_both_sides() {
        smol::block_on(async {
            let config = HandshakeConfig::default();
            let initiator = Identity::generate();
            let responder = Identity::generate();
            let (dialed, accepted) = connected_pair().await;

            let (outbound, inbound) = smol::future::zip(
                AuthenticatedConnection::outbound(
                    dialed,
                    &initiator,
                    responder.peer_id(),
                    &AllowAll,
                    &config,
                ),
                AuthenticatedConnection::inbound(accepted, &responder, &AllowAll, &config),
            )
            .await;

            let outbound = outbound.unwrap();
            let inbound = inbound.unwrap();
            assert_eq!(outbound.remote_peer(), &responder.peer_id());
            assert_eq!(inbound.remote_peer(), &initiator.peer_id());
            assert_eq!(inbound.local_peer(), &responder.peer_id());
            assert_eq!(inbound.remote_public_key(), initiator.public());
        });
    }

    #[test]
    fn test_pinned_identity_mismatch_fails() {
        smol::block_on(async {
            let config = HandshakeConfig::default();
            let initiator = Identity::generate();
            let responder = Identity::generate();
            let impostor_target = Identity::generate();
            let (dialed, accepted) = connected_pair().await;

            let (outbound, _) = smol::future::zip(
                AuthenticatedConnection::outbound(
                    dialed,
                    &initiator,
                    impostor_target.peer_id(),
                    &AllowAll,
                    &config,
                ),
                AuthenticatedConnection::inbound(accepted, &responder, &AllowAll, &config),
            )
            .await;

            match outbound {
                Err(HandshakeError::IdentityMismatch { pinned, actual }) => {
                    assert_eq!(pinned, impostor_target.peer_id().to_string());
                    assert_eq!(actual, responder.peer_id().to_string());
                }
                other => panic!("unexpected result: {:?}", other.err()),
            }
        });
    }

    #[test]
    fn test_forged_signature_fails() {
        smol::block_on(async {
            let config = HandshakeConfig::default();
            let responder = Identity::generate();
            let victim = Identity::generate();
            let forger = Identity::generate();
            let (mut dialed, accepted) = connected_pair().await;

            // Claim the victim's identity, but sign with another key.
            let message = encode(&InitiatorAct1::new(&config.protocol_id).unwrap().message())
                .unwrap();
            let envelope = HandshakeEnvelope {
                signature: forger.sign(&message),
                peer_id: victim.peer_id().as_bytes().to_vec(),
                message,
            };
            let bytes = encode(&envelope).unwrap();
            dialed
                .write_all(&(bytes.len() as u32).to_be_bytes())
                .await
                .unwrap();
            dialed.write_all(&bytes).await.unwrap();

            let inbound =
                AuthenticatedConnection::inbound(accepted, &responder, &AllowAll, &config).await;
            assert!(matches!(
                inbound,
                Err(HandshakeError::InvalidSignature { .. })
            ));
        });
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        smol::block_on(async {
            let config = HandshakeConfig::default();
            let responder = Identity::generate();
            let (mut dialed, accepted) = connected_pair().await;

            dialed.write_all(&(1u32 << 20).to_be_bytes()).await.unwrap();

            let inbound =
                AuthenticatedConnection::inbound(accepted, &responder, &AllowAll, &config).await;
            assert!(matches!(inbound, Err(HandshakeError::FrameTooLarge { .. })));
        });
    }

    #[test]
    fn test_firewall_blocks_initiator_and_responder() {
        smol::block_on(async {
            let config = HandshakeConfig::default();
            let initiator = Identity::generate();
            let responder = Identity::generate();

            let (dialed, accepted) = connected_pair().await;
            let (outbound, _) = smol::future::zip(
                AuthenticatedConnection::outbound(
                    dialed,
                    &initiator,
                    responder.peer_id(),
                    &DenyAll,
                    &config,
                ),
                AuthenticatedConnection::inbound(accepted, &responder, &AllowAll, &config),
            )
            .await;
            assert!(matches!(outbound, Err(HandshakeError::Firewall(_))));

            let (dialed, accepted) = connected_pair().await;
            let (_, inbound) = smol::future::zip(
                AuthenticatedConnection::outbound(
                    dialed,
                    &initiator,
                    responder.peer_id(),
                    &AllowAll,
                    &config,
                ),
                AuthenticatedConnection::inbound(accepted, &responder, &DenyAll, &config),
            )
            .await;
            assert!(matches!(inbound, Err(HandshakeError::Firewall(_))));
        });
    }
}
