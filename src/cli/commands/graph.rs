use anyhow::Result;
use reelflow::pipeline::{Pipeline, TaskStateMachine, TaskStatus};
use reelflow::ReelflowConfig;

use super::Command;

pub struct GraphCommand {
    pipeline: Pipeline,
}

impl GraphCommand {
    pub fn new(config: &ReelflowConfig) -> Result<Self> {
        Ok(Self {
            pipeline: config.to_pipeline()?,
        })
    }

    fn describe(&self, status: &TaskStatus) -> String {
        match status.running_stage().and_then(|ordinal| self.pipeline.stage(ordinal)) {
            Some(stage) => format!("{} ({})", status, stage.name),
            None => status.to_string(),
        }
    }
}

impl Command for GraphCommand {
    async fn execute(&self) -> Result<()> {
        let machine = TaskStateMachine::for_pipeline(&self.pipeline);

        println!("🗺️  TASK STATUS GRAPH - {} stages", machine.stage_count());
        println!("==================================");
        println!();

        for status in machine.states() {
            let successors = machine.successors(&status);
            if successors.is_empty() {
                println!("  🏁 {} (terminal)", self.describe(&status));
                continue;
            }
            println!("  {}", self.describe(&status));
            for next in successors {
                println!("     → {}", self.describe(&next));
            }
        }

        println!();
        println!("💡 failed → retrying is only taken while retry_count < max_retries");
        Ok(())
    }
}
