use crate::error::CoreError;
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use mailswarm_api::{
    MessageContent, Namespace, PollTarget, ProcessedMessage, ReceivedVia, ServiceNode, ThreadId,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const NONCE_LEN: usize = 24;
const CONTEXT: &[u8] = b"mailswarm:envelope:v1";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OriginContext {
    pub target: PollTarget,
    pub namespace: Namespace,
    pub server_hash: String,
    pub server_timestamp_ms: u64,
    pub expiration_ms: u64,
    pub node: Option<ServiceNode>,
    pub received_via: ReceivedVia,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReceiveError {
    #[error("decryption failed")]
    Decryption,
    #[error("invalid message {0}")]
    InvalidMessage(String),
    #[error("unknown envelope")]
    UnknownEnvelope,
    #[error("message sent by this account")]
    SelfSend,
    #[error("duplicate control message")]
    DuplicateControlMessage,
    #[error("outdated message")]
    Outdated,
    #[error("no thread for message")]
    NoThread,
    #[error("content does not belong in {0}")]
    NamespaceMismatch(Namespace),
}

impl ReceiveError {
    /// Failures that still move the cursor past the message.
    pub fn should_update_last_hash(&self) -> bool {
        matches!(
            self,
            ReceiveError::SelfSend | ReceiveError::DuplicateControlMessage | ReceiveError::Outdated
        )
    }
}

pub trait MessageDecoder: Send + Sync {
    fn parse(&self, data: &[u8], origin: &OriginContext) -> Result<ProcessedMessage, ReceiveError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub enum WireMessage {
    Config {
        data: Vec<u8>,
    },
    Standard {
        thread_id: String,
        sender: String,
        kind: String,
        body: Vec<u8>,
    },
    Control {
        id: String,
    },
}

pub struct AeadDecoder {
    key: [u8; 32],
    self_id: Option<String>,
}

impl AeadDecoder {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key, self_id: None }
    }

    pub fn from_hex(key_hex: &str) -> Result<Self, CoreError> {
        let bytes = hex::decode(key_hex.trim()).map_err(|_| CoreError::Crypto)?;
        let key: [u8; 32] = bytes.try_into().map_err(|_| CoreError::Crypto)?;
        Ok(Self::new(key))
    }

    pub fn with_self_id(mut self, self_id: impl Into<String>) -> Self {
        self.self_id = Some(self_id.into());
        self
    }

    pub fn seal(&self, namespace: Namespace, message: &WireMessage) -> Result<Vec<u8>, CoreError> {
        let plaintext = serde_json::to_vec(message)?;
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce);
        let cipher = XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| CoreError::Crypto)?;
        let aad = associated_data(namespace);
        let ciphertext = cipher
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: &plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| CoreError::Crypto)?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn open(&self, namespace: Namespace, data: &[u8]) -> Result<Vec<u8>, ReceiveError> {
        if data.len() <= NONCE_LEN {
            return Err(ReceiveError::Decryption);
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        let cipher =
            XChaCha20Poly1305::new_from_slice(&self.key).map_err(|_| ReceiveError::Decryption)?;
        let aad = associated_data(namespace);
        cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| ReceiveError::Decryption)
    }
}

fn associated_data(namespace: Namespace) -> Vec<u8> {
    let mut aad = CONTEXT.to_vec();
    aad.extend_from_slice(&namespace.tag().to_be_bytes());
    aad
}

impl MessageDecoder for AeadDecoder {
    fn parse(&self, data: &[u8], origin: &OriginContext) -> Result<ProcessedMessage, ReceiveError> {
        if origin.expiration_ms != 0 && origin.expiration_ms < origin.server_timestamp_ms {
            return Err(ReceiveError::Outdated);
        }
        let plaintext = self.open(origin.namespace, data)?;
        let wire: WireMessage = serde_json::from_slice(&plaintext)
            .map_err(|e| ReceiveError::InvalidMessage(e.to_string()))?;
        let content = match wire {
            WireMessage::Config { data } => {
                if !origin.namespace.is_config_namespace() {
                    return Err(ReceiveError::NamespaceMismatch(origin.namespace));
                }
                MessageContent::Config { data }
            }
            WireMessage::Standard {
                thread_id,
                sender,
                kind,
                body,
            } => {
                if origin.namespace.is_config_namespace() {
                    return Err(ReceiveError::NamespaceMismatch(origin.namespace));
                }
                if thread_id.trim().is_empty() {
                    return Err(ReceiveError::NoThread);
                }
                if self.self_id.as_deref() == Some(sender.as_str()) {
                    return Err(ReceiveError::SelfSend);
                }
                MessageContent::Standard {
                    thread_id: ThreadId::new(thread_id),
                    sender: Some(sender),
                    kind,
                    body,
                }
            }
            WireMessage::Control { .. } => return Err(ReceiveError::DuplicateControlMessage),
        };
        Ok(ProcessedMessage {
            hash: origin.server_hash.clone(),
            target: origin.target.clone(),
            namespace: origin.namespace,
            node: origin.node.clone(),
            received_via: origin.received_via,
            timestamp_ms: origin.server_timestamp_ms,
            expiration_ms: origin.expiration_ms,
            content,
        })
    }
}
