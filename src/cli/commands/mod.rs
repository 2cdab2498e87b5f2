use anyhow::Result;

pub mod config;
pub mod demo;
pub mod graph;

#[allow(async_fn_in_trait)]
pub trait Command {
    async fn execute(&self) -> Result<()>;
}

pub async fn show_how_to_get_started() -> Result<()> {
    println!("🎬 Reelflow - Staged Task Pipeline Orchestration");
    println!();
    println!("To get started:");
    println!("  🚀 reelflow demo      # Run the pipeline with simulated agents");
    println!("  🗺️  reelflow graph     # Show the status transition table");
    println!("  ⚙️  reelflow config    # Show the effective configuration");
    println!();
    println!("💡 Start with 'reelflow demo --fast' for a quick run!");
    Ok(())
}
