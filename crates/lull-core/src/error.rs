#[derive(thiserror::Error, Debug)]
pub enum LullError {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("stream closed")]
    StreamClosed,
    #[error("scheduler failure: {0}")]
    SchedulerFailure(String),
    #[error("operator re-entered from its own downstream callback")]
    ReentrantCall,
    #[error("unable to resolve XDG base directories")]
    NoBaseDirs,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("toml serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
    #[error("toml deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),
}

pub type Result<T> = std::result::Result<T, LullError>;
