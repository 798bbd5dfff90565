pub struct SandboxConfig {
    pub id: uuid::Uuid,
    /// Extra environment passed to every process spawned in the sandbox.
    pub env: Vec<(String, String)>,
}

impl SandboxConfig {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            env: Vec::new(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new()
    }
}
