use super::{Command, Context};
use anyhow::{bail, Result};
use mission_relay::config::CONFIG_FILE;

pub struct ConfigShowCommand {
    pub ctx: Context,
}

impl Command for ConfigShowCommand {
    async fn execute(&self) -> Result<()> {
        if self.ctx.json {
            return super::print_json(&self.ctx.config);
        }
        print!("{}", toml::to_string_pretty(&self.ctx.config)?);
        Ok(())
    }
}

pub struct ConfigInitCommand {
    pub ctx: Context,
    pub force: bool,
}

impl Command for ConfigInitCommand {
    async fn execute(&self) -> Result<()> {
        let path = self.ctx.config.mission.root.join(CONFIG_FILE);
        if path.exists() && !self.force {
            bail!("{} already exists, pass --force to overwrite", path.display());
        }
        std::fs::create_dir_all(&self.ctx.config.mission.root)?;
        self.ctx.config.save_to_file(&path)?;
        println!("✅ Wrote {}", path.display());
        Ok(())
    }
}
