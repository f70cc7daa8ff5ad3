use thiserror::Error;

#[derive(Error, Debug)]
pub enum ScuttleError {
    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Reference error: {0}")]
    Ref(#[from] RefError),

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Feed error: {0}")]
    Feed(#[from] FeedError),

    #[error("Invite error: {0}")]
    Invite(#[from] InviteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("Invalid key bytes")]
    InvalidKeyBytes,

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Key file error: {0}")]
    KeyFile(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefError {
    #[error("Missing sigil, expected '{expected}'")]
    MissingSigil { expected: char },

    #[error("Missing suffix, expected '.{expected}'")]
    MissingSuffix { expected: &'static str },

    #[error("Invalid base64 payload")]
    InvalidBase64,

    #[error("Invalid length: expected 32 bytes, got {0}")]
    InvalidLength(usize),

    #[error("Invalid public key")]
    InvalidKey,
}

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Malformed message JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message shape: {0}")]
    Shape(String),

    #[error("Invalid reference in field '{field}': {source}")]
    Ref {
        field: &'static str,
        #[source]
        source: RefError,
    },

    #[error("Signature verification failed")]
    InvalidSignature,

    #[error("Sequence {sequence} is inconsistent with previous (present: {has_previous})")]
    InconsistentPrevious { sequence: u64, has_previous: bool },

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("Message author {author} does not match feed {feed}")]
    WrongAuthor { feed: String, author: String },

    #[error("Expected sequence {expected}, got {got}")]
    WrongSequence { expected: u64, got: u64 },

    #[error("Previous message does not match the feed tip")]
    WrongPrevious,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InviteError {
    #[error("Malformed invite: {0}")]
    Malformed(String),

    #[error("Invalid invite key: {0}")]
    Ref(#[from] RefError),
}
