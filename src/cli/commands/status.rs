use super::{print_json, Command, Context};
use anyhow::Result;
use mission_relay::Phase;

pub struct StatusCommand {
    pub ctx: Context,
}

impl Command for StatusCommand {
    async fn execute(&self) -> Result<()> {
        let coordinator = self.ctx.coordinator().await?;
        let status = coordinator.status();
        if self.ctx.json {
            return print_json(&status);
        }

        let phase = &status.phase;
        let marker = match phase.phase {
            Phase::Expansion => "🟢",
            Phase::Convergence => "🟠",
        };
        println!("📡 MISSION STATUS");
        println!("=================");
        println!("{} Phase: {}", marker, phase.phase);
        println!(
            "   Usage: {} / {} tokens ({:.1}%), headroom {}",
            phase.usage,
            phase.capacity,
            phase.usage_fraction * 100.0,
            phase.headroom
        );
        println!(
            "   Band: converge at {:.0}%, expand below {:.0}%",
            phase.upper_threshold * 100.0,
            phase.lower_threshold * 100.0
        );
        println!();
        println!("📄 DOCUMENTS ({}):", status.documents.len());
        for document in &status.documents {
            println!("   {:<40} {:>8} bytes {:>7} tokens", document.name, document.bytes, document.tokens);
        }
        Ok(())
    }
}
