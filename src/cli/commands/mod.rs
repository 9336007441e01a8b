use anyhow::Result;
use mission_relay::{MissionCoordinator, MissionRelayConfig};

pub mod config;
pub mod documents;
pub mod status;
pub mod watch;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

/// Settings every command shares.
#[derive(Debug, Clone)]
pub struct Context {
    pub config: MissionRelayConfig,
    pub holder: String,
    pub json: bool,
}

impl Context {
    pub async fn coordinator(&self) -> Result<MissionCoordinator> {
        Ok(MissionCoordinator::open(self.config.clone()).await?)
    }
}

/// Identity used when `--holder` is not given: `<host>-<pid>`.
pub fn default_holder() -> String {
    let host = hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "agent".to_string());
    format!("{}-{}", host, std::process::id())
}

pub fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
