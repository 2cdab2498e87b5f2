use anyhow::Result;
use reelflow::ReelflowConfig;
use std::path::PathBuf;

use super::Command;

pub struct ConfigCommand {
    config: ReelflowConfig,
    save: Option<PathBuf>,
}

impl ConfigCommand {
    pub fn new(config: ReelflowConfig, save: Option<PathBuf>) -> Self {
        Self { config, save }
    }
}

impl Command for ConfigCommand {
    async fn execute(&self) -> Result<()> {
        if let Some(path) = &self.save {
            self.config.save_to_file(path)?;
            println!("✅ Configuration saved to {}", path.display());
            return Ok(());
        }

        println!("⚙️  EFFECTIVE CONFIGURATION");
        println!("==========================");
        println!();
        print!("{}", toml::to_string_pretty(&self.config)?);
        Ok(())
    }
}
