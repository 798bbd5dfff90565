mod run;
mod store;

use std::path::PathBuf;

use clap::Args;

pub use run::{RunArgs, run_session};
pub use store::{DeleteArgs, ListArgs, PullArgs, run_delete, run_list, run_pull};

use crate::config::{self, RunnerConfig, StoreConfig};
use crate::error::RunnerResult;

#[derive(Args)]
pub struct ConfigArgs {
    /// Path to runner.yaml config file
    #[arg(long, short)]
    config: PathBuf,
    /// Supabase API key (overrides config)
    #[arg(long, env = "SUPABASE_API_KEY", hide_env_values = true)]
    supabase_key: Option<String>,
}

impl ConfigArgs {
    async fn load(self) -> RunnerResult<RunnerConfig> {
        let mut config = config::load(&self.config).await?;
        if let (StoreConfig::Supabase(supabase), Some(key)) = (&mut config.store, self.supabase_key)
        {
            supabase.api_key = key;
        }
        Ok(config)
    }
}
