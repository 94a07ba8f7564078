use thiserror::Error;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("error during load balancer setup: {0}")]
    Init(String),

    #[error("error during load balancer startup: {0}")]
    Start(String),

    #[error("error during load balancer shutdown: {0}")]
    Stop(String),

    #[error("error during load balancer reconfiguration: {0}")]
    Reconfig(String),

    #[error("error during upstream update: {0}")]
    UpstreamUpdate(String),
}
