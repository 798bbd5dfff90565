use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;

use crate::error::Result;

/// Raw output of a spawned process, in arbitrary-sized chunks.
pub type OutputStream = BoxStream<'static, std::io::Result<Bytes>>;

/// Resolves with the exit code once the process exits or is killed.
pub type ExitFuture = BoxFuture<'static, Result<i32>>;

pub struct SpawnRequest<'a> {
    pub program: &'a str,
    pub args: &'a [&'a str],
}

impl SpawnRequest<'_> {
    /// `program arg1 arg2`, for logs and process listings.
    pub fn command_line(&self) -> String {
        let mut line = self.program.to_owned();
        for arg in self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub command: String,
}

pub struct SpawnedProcess {
    pub pid: u32,
    pub output: OutputStream,
    /// Separate error stream, when the runtime keeps stderr apart.
    pub errors: Option<OutputStream>,
    pub exit: ExitFuture,
}
