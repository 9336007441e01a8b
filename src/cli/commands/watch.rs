use super::{Command, Context};
use anyhow::Result;
use mission_relay::{EventPayload, MissionGuard, NotificationEvent, ShutdownCoordinator};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const DRAIN_BATCH: usize = 64;
const DRAIN_WAIT: Duration = Duration::from_millis(500);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

pub struct WatchCommand {
    pub ctx: Context,
    pub consumer: String,
    pub duration: Option<u64>,
}

impl Command for WatchCommand {
    async fn execute(&self) -> Result<()> {
        let _guard = MissionGuard::acquire(&self.ctx.config.lock_dir())?;
        let coordinator = Arc::new(self.ctx.coordinator().await?);
        coordinator.subscribe(&self.consumer);

        let shutdown = ShutdownCoordinator::new();
        shutdown.install_signal_handlers();
        let background = coordinator.clone().spawn_background(shutdown.child_token());

        if let Some(seconds) = self.duration {
            let timer = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(seconds)).await;
                timer.trigger();
            });
        }

        if !self.ctx.json {
            println!("👀 Watching {} as '{}' (Ctrl-C to stop)", self.ctx.config.mission.root.display(), self.consumer);
        }
        info!(consumer = %self.consumer, "Watch started");

        while !shutdown.is_shutting_down() {
            let events = tokio::select! {
                events = coordinator.wait_and_drain(&self.consumer, DRAIN_BATCH, DRAIN_WAIT) => events,
                _ = shutdown.wait_for_shutdown() => break,
            };
            for event in &events {
                self.print_event(event)?;
            }
        }

        shutdown
            .shutdown_with(SHUTDOWN_GRACE, async {
                let _ = background.await;
            })
            .await
    }
}

impl WatchCommand {
    fn print_event(&self, event: &NotificationEvent) -> Result<()> {
        if self.ctx.json {
            println!("{}", serde_json::to_string(event)?);
            return Ok(());
        }

        let detail = match &event.payload {
            EventPayload::Change { regions } => {
                let holders: Vec<&str> = regions.iter().map(|region| region.holder.as_str()).collect();
                format!("changed by {}", holders.join(", "))
            }
            EventPayload::Message { from, text } => format!("from {from}: {text}"),
            EventPayload::Phase { from, to, usage, capacity } => {
                format!("{from} -> {to} at {usage}/{capacity} tokens")
            }
            EventPayload::Rejection { holder, reason, .. } => format!("edit by {holder} rejected ({reason})"),
            EventPayload::Reclamation {
                previous_holder,
                reclaimed_by,
            } => format!("lock of {previous_holder} reclaimed by {reclaimed_by}"),
            EventPayload::Overflow { dropped } => format!("{dropped} events dropped"),
        };
        println!(
            "#{:<6} {:<7} {:?} {} {}",
            event.sequence,
            event.priority.to_string(),
            event.kind,
            event.target,
            detail
        );
        Ok(())
    }
}
