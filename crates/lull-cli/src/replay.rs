use std::sync::{mpsc, Arc};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use lull_core::{Scheduler, Source, VirtualScheduler};
use serde::Deserialize;
use tracing::debug;

use crate::emission::{Emission, EmissionSender};
use crate::pipeline::Pipeline;

/// One line of a replay script, e.g. `{"at_ms": 150, "value": "b"}` or
/// `{"at_ms": 400, "complete": true}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptLine {
    pub at_ms: u64,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub complete: bool,
}

/// Blank lines and `#` comments are skipped.
pub fn parse_script(text: &str) -> Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    let mut last_at = 0;
    let mut completed = false;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line: ScriptLine = serde_json::from_str(trimmed)
            .with_context(|| format!("parse script line {lineno}"))?;
        if completed {
            return Err(anyhow!("line {lineno}: input after completion"));
        }
        if line.at_ms < last_at {
            return Err(anyhow!(
                "line {lineno}: at_ms {} goes back in time (previous {last_at})",
                line.at_ms
            ));
        }
        match (&line.value, line.complete) {
            (Some(_), true) => {
                return Err(anyhow!("line {lineno}: value and complete are exclusive"))
            }
            (None, false) => return Err(anyhow!("line {lineno}: expected value or complete")),
            _ => {}
        }
        last_at = line.at_ms;
        completed = line.complete;
        lines.push(line);
    }
    Ok(lines)
}

/// Without a completion line every timer is allowed to fire before the
/// source completes.
pub fn run_replay(pipeline: Pipeline, script: &[ScriptLine]) -> Result<Vec<Emission>> {
    let scheduler = Arc::new(VirtualScheduler::new());
    let source = Source::new();
    let (tx, rx) = mpsc::channel();
    let observer = EmissionSender::new(tx, scheduler.clone(), false, |e| e);
    let _subscription = pipeline.attach(&source, scheduler.clone(), observer);
    debug!(%pipeline, lines = script.len(), "starting replay");

    for line in script {
        scheduler.advance_to(Duration::from_millis(line.at_ms));
        match &line.value {
            Some(value) => source
                .push(value.clone())
                .with_context(|| format!("push value at {}ms", line.at_ms))?,
            None => source.complete(),
        }
    }
    if !source.is_completed() {
        scheduler.run_until_idle();
        source.complete();
    }
    debug!(end_ms = scheduler.now().as_millis() as u64, "replay finished");
    Ok(rx.try_iter().collect())
}
