use super::{print_json, Command, Context};
use anyhow::{Context as _, Result};
use mission_relay::{EditOutcome, SignalDirection};
use serde_json::json;
use std::path::PathBuf;

pub struct ReadCommand {
    pub ctx: Context,
    pub document: String,
}

impl Command for ReadCommand {
    async fn execute(&self) -> Result<()> {
        let coordinator = self.ctx.coordinator().await?;
        let document = coordinator.read_fresh(&self.document).await?;
        if self.ctx.json {
            print_json(&json!({
                "document": document.name.as_str(),
                "bytes": document.stamp.len,
                "content": document.content,
            }))
        } else {
            print!("{}", document.content);
            Ok(())
        }
    }
}

pub struct ApplyCommand {
    pub ctx: Context,
    pub document: String,
    pub search: String,
    pub replace: String,
}

impl Command for ApplyCommand {
    async fn execute(&self) -> Result<()> {
        let coordinator = self.ctx.coordinator().await?;
        let outcome = coordinator
            .apply(&self.document, &self.search, &self.replace, &self.ctx.holder)
            .await?;
        report_edit(&self.ctx, "applied", &outcome)
    }
}

pub struct InsertCommand {
    pub ctx: Context,
    pub document: String,
    pub marker: String,
    pub text: String,
}

impl Command for InsertCommand {
    async fn execute(&self) -> Result<()> {
        let coordinator = self.ctx.coordinator().await?;
        let outcome = coordinator
            .insert_after(&self.document, &self.marker, &self.text, &self.ctx.holder)
            .await?;
        report_edit(&self.ctx, "inserted", &outcome)
    }
}

pub struct SignalCommand {
    pub ctx: Context,
    pub document: String,
    pub agent: String,
    pub message: String,
    pub direction: SignalDirection,
}

impl Command for SignalCommand {
    async fn execute(&self) -> Result<()> {
        let coordinator = self.ctx.coordinator().await?;
        let outcome = coordinator
            .signal(&self.document, &self.ctx.holder, self.direction, &self.agent, &self.message)
            .await?;
        report_edit(&self.ctx, "signalled", &outcome)
    }
}

pub struct CreateCommand {
    pub ctx: Context,
    pub document: String,
    pub template: Option<String>,
    pub template_file: Option<PathBuf>,
}

impl Command for CreateCommand {
    async fn execute(&self) -> Result<()> {
        let template = match (&self.template, &self.template_file) {
            (Some(text), _) => text.clone(),
            (None, Some(path)) => std::fs::read_to_string(path)
                .with_context(|| format!("failed to read template {}", path.display()))?,
            (None, None) => String::new(),
        };

        let coordinator = self.ctx.coordinator().await?;
        let outcome = coordinator.create(&self.document, &template, &self.ctx.holder).await?;
        if self.ctx.json {
            return print_json(&json!({
                "document": outcome.document.as_str(),
                "created": outcome.created,
                "bytes": outcome.content.len(),
            }));
        }
        if outcome.created {
            println!("✅ Created {}", outcome.document);
        } else {
            println!("ℹ️  {} already exists, left untouched", outcome.document);
        }
        Ok(())
    }
}

fn report_edit(ctx: &Context, verb: &str, outcome: &EditOutcome) -> Result<()> {
    if ctx.json {
        return print_json(&json!({
            "document": outcome.document.as_str(),
            "result": verb,
            "sequence": outcome.event_sequence,
            "bytes": outcome.stamp.len,
            "reclaimed_from": outcome.reclaimed.as_ref().map(|r| r.previous_holder.clone()),
        }));
    }

    println!("✅ Edit {} to {} (event #{})", verb, outcome.document, outcome.event_sequence);
    if let Some(reclamation) = &outcome.reclaimed {
        println!("⚠️  Took over an abandoned lock held by {}", reclamation.previous_holder);
    }
    Ok(())
}
