pub(crate) type Result<T> = std::result::Result<T, MagnetError>;

#[derive(Debug, thiserror::Error)]
pub enum MagnetError {
    #[error("not a magnet uri")]
    /// The input does not start with the `magnet:` scheme.
    NotMagnet,

    #[error("magnet uri has no usable `xt` topic")]
    /// No `xt=urn:btih:`/`urn:btmh:` parameter was present.
    MissingTopic,

    #[error("invalid info hash in `xt`: {0}")]
    /// The `xt` value is present but its digest is malformed: wrong length,
    /// bad hex/base32, or an unknown multihash prefix.
    InvalidTopic(String),

    #[error("invalid `{param}` parameter")]
    /// A recognized parameter failed to parse (e.g. a non-numeric `xl`).
    InvalidParam { param: &'static str },
}
