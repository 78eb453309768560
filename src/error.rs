use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("not the leader, known leader is {0:?}")]
    NotLeader(Option<u32>),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("gRPC error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RaftError>;
