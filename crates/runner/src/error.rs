#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("project error: {0}")]
    Project(String),

    #[error("workbench error: {0}")]
    Workbench(#[from] workbench::WorkbenchError),

    #[error("store error: {0}")]
    Store(#[from] project_store::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type RunnerResult<T> = Result<T, RunnerError>;
