use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Wait(Duration),
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StreamError(String),
}

/// What a mock process does once spawned.
///
/// Steps run in order. Afterwards the process exits with the configured code,
/// or keeps running until killed when no exit code is set.
#[derive(Debug, Clone)]
pub struct ProcessScript {
    pub(crate) steps: Vec<Step>,
    pub(crate) exit: Option<i32>,
}

impl Default for ProcessScript {
    fn default() -> Self {
        Self {
            steps: Vec::new(),
            exit: Some(0),
        }
    }
}

impl ProcessScript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit a chunk on the output stream.
    pub fn stdout(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Stdout(chunk.as_ref().to_vec()));
        self
    }

    /// Emit a chunk on the separate error stream.
    pub fn stderr(mut self, chunk: impl AsRef<[u8]>) -> Self {
        self.steps.push(Step::Stderr(chunk.as_ref().to_vec()));
        self
    }

    pub fn wait(mut self, delay: Duration) -> Self {
        self.steps.push(Step::Wait(delay));
        self
    }

    /// Fail the output stream with an I/O error.
    pub fn stream_error(mut self, message: &str) -> Self {
        self.steps.push(Step::StreamError(message.to_owned()));
        self
    }

    pub fn exit(mut self, code: i32) -> Self {
        self.exit = Some(code);
        self
    }

    /// Keep running after the last step until killed.
    pub fn run_forever(mut self) -> Self {
        self.exit = None;
        self
    }
}
