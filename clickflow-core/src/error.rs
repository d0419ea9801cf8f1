use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Metrics Error - {0}")]
    Metrics(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Source Error - {0}")]
    Source(String),

    #[error("Watermark Error - {0}")]
    Watermark(String),

    #[error("Enricher Error - {0}")]
    Enricher(String),

    #[error("Sink Error - {0}")]
    Sink(String),

    #[error("Checkpoint Error - {0}")]
    Checkpoint(String),

    #[error("Connection Error - {0}")]
    Connection(String),

    #[error("Forwarder Error - {0}")]
    Forwarder(String),

    #[error("Barrier {id} was not acknowledged within {timeout_ms}ms")]
    BarrierTimeout { id: u64, timeout_ms: u128 },

    #[error("OneShot Receiver Error - {0}")]
    ActorPatternRecv(String),

    #[error("Restarts exhausted after {0} attempts - {1}")]
    RestartsExhausted(u32, Box<Error>),
}

impl From<clickflow_kafka::Error> for Error {
    fn from(value: clickflow_kafka::Error) -> Self {
        match value {
            clickflow_kafka::Error::Connection { server, error } => {
                Error::Connection(format!("kafka {server}: {error}"))
            }
            other => Error::Source(other.to_string()),
        }
    }
}

impl From<tokio_postgres::Error> for Error {
    fn from(value: tokio_postgres::Error) -> Self {
        Error::Sink(format!("postgres: {value}"))
    }
}

impl From<deadpool_postgres::PoolError> for Error {
    fn from(value: deadpool_postgres::PoolError) -> Self {
        Error::Connection(format!("postgres pool: {value}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Checkpoint(value.to_string())
    }
}
