//! Append-only journal of run transitions.
//!
//! Events are stored as newline-delimited JSON (JSONL), one file per
//! environment next to its checkpoint, for easy inspection with standard
//! tools. The journal is never consulted to decide what to skip.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use uuid::Uuid;

use crate::domain::{Environment, Event, EventType, Run};

/// File-based journal using JSONL format
#[derive(Debug, Clone)]
pub struct Journal {
    /// Path to the `<env>.events.jsonl` file
    events_path: PathBuf,
}

impl Journal {
    /// Journal for an environment inside the deployments directory
    pub fn open(dir: &Path, env: &Environment) -> Self {
        Self {
            events_path: dir.join(format!("{}.events.jsonl", env)),
        }
    }

    /// Get the path to the events file
    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log
    pub async fn append(&self, event: &Event) -> Result<()> {
        if let Some(parent) = self.events_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open journal: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write event")?;
        file.flush().await.context("Failed to flush event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<Event>> {
        let file = match File::open(&self.events_path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Failed to open journal: {}", self.events_path.display())
                })
            }
        };

        let reader = BufReader::new(file);
        let mut lines = reader.lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: Event = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Events of a single run
    pub async fn events_for_run(&self, run_id: Uuid) -> Result<Vec<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().filter(|e| e.run_id == run_id).collect())
    }

    /// Get the last event of a specific type
    pub async fn last_event_of_type(&self, event_type: EventType) -> Result<Option<Event>> {
        let events = self.replay().await?;
        Ok(events.into_iter().rev().find(|e| e.event_type == event_type))
    }

    /// Most recent run, rebuilt from its events
    pub async fn latest_run(&self, env: &Environment) -> Result<Option<Run>> {
        let events = self.replay().await?;
        Ok(Run::latest_from_events(env, &events))
    }

    /// Every run in the journal, oldest first
    pub async fn runs(&self, env: &Environment) -> Result<Vec<Run>> {
        let events = self.replay().await?;

        let mut order: Vec<Uuid> = Vec::new();
        for event in &events {
            if event.event_type == EventType::RunStarted && !order.contains(&event.run_id) {
                order.push(event.run_id);
            }
        }

        Ok(order
            .into_iter()
            .map(|id| {
                let mut run = Run::new(id, env.clone(), String::new());
                for event in events.iter().filter(|e| e.run_id == id) {
                    run.apply_event(event);
                }
                run
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RunState;
    use tempfile::TempDir;

    fn env() -> Environment {
        Environment::new("testnet").unwrap()
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), &env());
        let run_id = Uuid::new_v4();

        journal
            .append(&Event::new(run_id, None, EventType::RunStarted, "started"))
            .await
            .unwrap();
        journal
            .append(&Event::new(
                run_id,
                Some("Timelock".into()),
                EventType::StepCommitted,
                "Timelock committed",
            ))
            .await
            .unwrap();

        let events = journal.replay().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, EventType::RunStarted);
        assert_eq!(events[1].step.as_deref(), Some("Timelock"));
        assert!(journal.events_path().ends_with("testnet.events.jsonl"));
    }

    #[tokio::test]
    async fn test_replay_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(&dir.path().join("absent"), &env());
        assert!(journal.replay().await.unwrap().is_empty());
        assert!(journal.latest_run(&env()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_runs_in_order() {
        let dir = TempDir::new().unwrap();
        let journal = Journal::open(dir.path(), &env());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        for event in [
            Event::new(first, None, EventType::RunStarted, "started").with_detail("core"),
            Event::new(first, None, EventType::RunAborted, "aborted").with_error("503"),
            Event::new(second, None, EventType::RunStarted, "started").with_detail("core"),
            Event::new(second, None, EventType::RunCompleted, "done"),
        ] {
            journal.append(&event).await.unwrap();
        }

        let runs = journal.runs(&env()).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].id, first);
        assert!(matches!(runs[0].state, RunState::Aborted { .. }));
        assert_eq!(runs[1].state, RunState::Completed);

        let last = journal
            .last_event_of_type(EventType::RunAborted)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(last.run_id, first);
        assert_eq!(journal.events_for_run(second).await.unwrap().len(), 2);
    }
}
