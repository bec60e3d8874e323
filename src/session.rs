//! Session-key negotiation handshake (protocol v3.4/v3.5).
//!
//! Three-message exchange over the frame codec: we send a 16-byte random,
//! the device answers with its own random plus an HMAC proving it holds the
//! shared local key, and we close with an HMAC over the device's random.
//! Both sides then derive the same fresh session key from the two randoms.

use crate::crypto;
use crate::error::{Result, TuyaError};
use crate::protocol::{CommandType, Frame, Version};
use log::debug;

const NONCE_LEN: usize = 16;
const RESPONSE_LEN: usize = NONCE_LEN + 32;

/// Handshake lifecycle. Terminal states are `KeyConfirmed` and `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    RandomSent,
    KeyConfirmed,
    Failed,
}

/// A frame the caller must encode and write to the transport.
#[derive(Debug, Clone)]
pub struct HandshakeMessage {
    pub cmd: CommandType,
    pub payload: Vec<u8>,
}

/// Result of a successful exchange: the closing frame to send and the key to
/// install. Installation must be atomic with respect to queued encodes.
#[derive(Debug)]
pub struct NegotiationOutcome {
    pub finish: HandshakeMessage,
    pub session_key: Vec<u8>,
}

/// Drives one key-exchange attempt. Create a fresh negotiator per attempt;
/// a failed one stays in `Failed` and must be discarded.
pub struct SessionNegotiator {
    version: Version,
    base_key: Vec<u8>,
    local_nonce: [u8; NONCE_LEN],
    state: NegotiationState,
}

impl SessionNegotiator {
    pub fn new(version: Version, base_key: &[u8]) -> Self {
        Self {
            version,
            base_key: base_key.to_vec(),
            local_nonce: [0u8; NONCE_LEN],
            state: NegotiationState::Idle,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Start the handshake: generate a fresh local random and produce the
    /// `SessKeyNegStart` message carrying it.
    pub fn begin(&mut self) -> Result<HandshakeMessage> {
        self.begin_with_nonce(crypto::random_nonce::<NONCE_LEN>())
    }

    fn begin_with_nonce(&mut self, nonce: [u8; NONCE_LEN]) -> Result<HandshakeMessage> {
        if self.state != NegotiationState::Idle {
            return Err(TuyaError::NegotiationFailed(format!(
                "begin() in state {:?}",
                self.state
            )));
        }
        if !self.version.negotiates_session_key() {
            return Err(TuyaError::NegotiationFailed(format!(
                "version {} has no session-key handshake",
                self.version
            )));
        }
        self.local_nonce = nonce;
        self.state = NegotiationState::RandomSent;
        debug!("session negotiation started (v{})", self.version);
        Ok(HandshakeMessage {
            cmd: CommandType::SessKeyNegStart,
            payload: self.local_nonce.to_vec(),
        })
    }

    /// Consume the device's `SessKeyNegResp`. The payload is
    /// `remote_nonce(16) ‖ hmac(32)` where the HMAC covers our local nonce
    /// under the pre-negotiation key. Verification is constant-time; any
    /// mismatch moves the negotiator to `Failed`.
    pub fn on_response(&mut self, frame: &Frame) -> Result<NegotiationOutcome> {
        if self.state != NegotiationState::RandomSent {
            return Err(TuyaError::NegotiationFailed(format!(
                "response in state {:?}",
                self.state
            )));
        }
        if frame.cmd != CommandType::SessKeyNegResp as u32 {
            self.state = NegotiationState::Failed;
            return Err(TuyaError::NegotiationFailed(format!(
                "expected SessKeyNegResp, got cmd 0x{:02x}",
                frame.cmd
            )));
        }
        if frame.payload.len() < RESPONSE_LEN {
            self.state = NegotiationState::Failed;
            return Err(TuyaError::NegotiationFailed(format!(
                "response payload too short ({} bytes)",
                frame.payload.len()
            )));
        }

        let remote_nonce = &frame.payload[..NONCE_LEN];
        let remote_hmac = &frame.payload[NONCE_LEN..RESPONSE_LEN];

        if crypto::hmac_sha256_verify(&self.base_key, &self.local_nonce, remote_hmac).is_err() {
            self.state = NegotiationState::Failed;
            return Err(TuyaError::NegotiationMismatch);
        }

        let finish_hmac = crypto::hmac_sha256(&self.base_key, remote_nonce)?;
        let session_key = crypto::derive_session_key(
            &self.local_nonce,
            remote_nonce,
            &self.base_key,
            self.version,
        )?;

        self.state = NegotiationState::KeyConfirmed;
        debug!("session key confirmed");
        Ok(NegotiationOutcome {
            finish: HandshakeMessage {
                cmd: CommandType::SessKeyNegFinish,
                payload: finish_hmac.to_vec(),
            },
            session_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PREFIX_55AA;

    const BASE_KEY: &[u8; 16] = b"base-local-key!!";

    fn response_frame(payload: Vec<u8>) -> Frame {
        Frame {
            seqno: 2,
            cmd: CommandType::SessKeyNegResp as u32,
            retcode: None,
            payload,
            prefix: PREFIX_55AA,
        }
    }

    fn device_response(local_nonce: &[u8], remote_nonce: &[u8]) -> Vec<u8> {
        let mut payload = remote_nonce.to_vec();
        payload.extend_from_slice(&crypto::hmac_sha256(BASE_KEY, local_nonce).unwrap());
        payload
    }

    #[test]
    fn deterministic_handshake_v34() {
        let local = [0x5Au8; 16];
        let remote = [0xC3u8; 16];

        let mut neg = SessionNegotiator::new(Version::V3_4, BASE_KEY);
        let start = neg.begin_with_nonce(local).unwrap();
        assert_eq!(start.cmd, CommandType::SessKeyNegStart);
        assert_eq!(start.payload, local);
        assert_eq!(neg.state(), NegotiationState::RandomSent);

        let outcome = neg
            .on_response(&response_frame(device_response(&local, &remote)))
            .unwrap();
        assert_eq!(neg.state(), NegotiationState::KeyConfirmed);
        assert_eq!(outcome.finish.cmd, CommandType::SessKeyNegFinish);
        assert_eq!(
            outcome.finish.payload,
            crypto::hmac_sha256(BASE_KEY, &remote).unwrap().to_vec()
        );
        assert_eq!(
            outcome.session_key,
            crypto::derive_session_key(&local, &remote, BASE_KEY, Version::V3_4).unwrap()
        );
    }

    #[test]
    fn deterministic_handshake_v35_uses_gcm_kdf() {
        let local = [0x10u8; 16];
        let remote = [0x99u8; 16];

        let mut neg = SessionNegotiator::new(Version::V3_5, BASE_KEY);
        neg.begin_with_nonce(local).unwrap();
        let outcome = neg
            .on_response(&response_frame(device_response(&local, &remote)))
            .unwrap();
        assert_eq!(
            outcome.session_key,
            crypto::derive_session_key(&local, &remote, BASE_KEY, Version::V3_5).unwrap()
        );
        assert_eq!(outcome.session_key.len(), 16);
    }

    #[test]
    fn hmac_mismatch_fails_the_attempt() {
        let local = [0x01u8; 16];
        let mut neg = SessionNegotiator::new(Version::V3_4, BASE_KEY);
        neg.begin_with_nonce(local).unwrap();

        let mut payload = device_response(&local, &[0x02u8; 16]);
        payload[20] ^= 0xff; // corrupt the proof
        let err = neg.on_response(&response_frame(payload)).unwrap_err();
        assert!(matches!(err, TuyaError::NegotiationMismatch));
        assert_eq!(neg.state(), NegotiationState::Failed);

        // A failed negotiator rejects further traffic.
        assert!(
            neg.on_response(&response_frame(device_response(&local, &[0u8; 16])))
                .is_err()
        );
    }

    #[test]
    fn wrong_command_or_short_payload_rejected() {
        let mut neg = SessionNegotiator::new(Version::V3_4, BASE_KEY);
        neg.begin().unwrap();
        let mut bad_cmd = response_frame(vec![0u8; 48]);
        bad_cmd.cmd = CommandType::Status as u32;
        assert!(neg.on_response(&bad_cmd).is_err());

        let mut neg = SessionNegotiator::new(Version::V3_4, BASE_KEY);
        neg.begin().unwrap();
        assert!(neg.on_response(&response_frame(vec![0u8; 20])).is_err());
    }

    #[test]
    fn legacy_versions_cannot_negotiate() {
        let mut neg = SessionNegotiator::new(Version::V3_3, BASE_KEY);
        assert!(neg.begin().is_err());
    }

    #[test]
    fn response_before_begin_is_rejected() {
        let mut neg = SessionNegotiator::new(Version::V3_4, BASE_KEY);
        assert!(
            neg.on_response(&response_frame(vec![0u8; 48]))
                .is_err()
        );
        // State must not advance.
        assert_eq!(neg.state(), NegotiationState::Idle);
    }
}
