use hostwatch_kernel::ProtocolError;
use hostwatch_runtime::{ConfigError, SupervisorError};

#[derive(thiserror::Error, Debug)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error("Worker error: {0}")]
    Worker(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
