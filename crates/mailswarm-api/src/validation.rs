use crate::namespace::Namespace;
use crate::types::*;
use thiserror::Error;

pub const SWARM_ID_HEX_LEN: usize = 66;
pub const MAX_HASH_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("empty field {0}")]
    Empty(&'static str),
    #[error("too long {0}")]
    TooLong(&'static str),
    #[error("invalid {0}")]
    Invalid(&'static str),
    #[error("bad encoding {0}")]
    Encoding(&'static str),
    #[error("namespace {0} not polled for target")]
    NamespaceNotPolled(Namespace),
}

pub fn validate_swarm_id(id: &SwarmId) -> Result<(), ValidationError> {
    if id.value.trim().is_empty() {
        return Err(ValidationError::Empty("swarm_id"));
    }
    if id.value.len() != SWARM_ID_HEX_LEN {
        return Err(ValidationError::Invalid("swarm_id_len"));
    }
    let bytes = hex::decode(&id.value).map_err(|_| ValidationError::Encoding("swarm_id"))?;
    match bytes.first() {
        Some(0x03) | Some(0x05) => Ok(()),
        _ => Err(ValidationError::Invalid("swarm_id_prefix")),
    }
}

pub fn validate_server_url(url: &str) -> Result<(), ValidationError> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty("server_url"));
    }
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ValidationError::Invalid("server_url_scheme"));
    }
    Ok(())
}

pub fn validate_target(target: &PollTarget) -> Result<(), ValidationError> {
    match target {
        PollTarget::Swarm(id) => validate_swarm_id(id),
        PollTarget::Server(url) => validate_server_url(url),
    }
}

pub fn validate_message_hash(hash: &str) -> Result<(), ValidationError> {
    if hash.trim().is_empty() {
        return Err(ValidationError::Empty("hash"));
    }
    if hash.len() > MAX_HASH_LEN {
        return Err(ValidationError::TooLong("hash"));
    }
    Ok(())
}

pub fn validate_push_payload(
    payload: &PushPayload,
    polled: &[Namespace],
) -> Result<RawMessage, ValidationError> {
    validate_target(&payload.target)?;
    validate_message_hash(&payload.hash)?;
    if !polled.contains(&payload.namespace) {
        return Err(ValidationError::NamespaceNotPolled(payload.namespace));
    }
    let raw = payload.to_raw()?;
    if raw.data.is_empty() {
        return Err(ValidationError::Empty("data_b64"));
    }
    Ok(raw)
}
