use std::io::{BufRead, Write};
use std::sync::{mpsc, Arc};

use anyhow::{Context, Result};
use lull_core::{LullError, Source, ThreadScheduler};
use tracing::{debug, info, warn};

use crate::emission::{Emission, EmissionSender};
use crate::pipeline::Pipeline;

pub enum LiveEvent {
    Line(String),
    Eof,
    Signal(i32),
    ReadFailed(std::io::Error),
    Emitted(Emission),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LiveSummary {
    pub received: usize,
    pub emitted: usize,
}

/// Wall-clock session: input lines in, operator output out.
///
/// Every producer (stdin reader, signal handler, the operator itself)
/// posts into one channel; the session thread is the only one that
/// touches the source and the output.
pub struct LiveSession {
    tx: mpsc::Sender<LiveEvent>,
    rx: mpsc::Receiver<LiveEvent>,
}

impl Default for LiveSession {
    fn default() -> Self {
        let (tx, rx) = mpsc::channel();
        Self { tx, rx }
    }
}

impl LiveSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for posting events from other threads.
    pub fn sender(&self) -> mpsc::Sender<LiveEvent> {
        self.tx.clone()
    }

    pub fn run<R>(
        self,
        pipeline: Pipeline,
        input: R,
        out: &mut impl Write,
        json: bool,
    ) -> Result<LiveSummary>
    where
        R: BufRead + Send + 'static,
    {
        let scheduler = Arc::new(ThreadScheduler::new().context("start timer thread")?);
        let source = Source::new();
        let observer = EmissionSender::new(
            self.tx.clone(),
            scheduler.clone(),
            json,
            LiveEvent::Emitted,
        );
        let _subscription = pipeline.attach(&source, scheduler.clone(), observer);
        spawn_reader(input, self.tx.clone())?;
        info!(%pipeline, "live session started");

        let mut summary = LiveSummary::default();
        while let Ok(event) = self.rx.recv() {
            match event {
                LiveEvent::Line(line) => {
                    if source.is_completed() {
                        continue;
                    }
                    summary.received += 1;
                    match source.push(line) {
                        Ok(()) | Err(LullError::StreamClosed) => {}
                        Err(err) => return Err(err).context("push input line"),
                    }
                }
                LiveEvent::Eof => {
                    debug!("input closed");
                    source.complete();
                }
                LiveEvent::Signal(signal) => {
                    info!(signal, "signal received; completing stream");
                    source.complete();
                }
                LiveEvent::ReadFailed(err) => {
                    warn!("failed to read input: {err}");
                    source.complete();
                }
                LiveEvent::Emitted(emission) => {
                    let done = emission.complete;
                    if !done {
                        summary.emitted += 1;
                    }
                    emission.write_to(out, json)?;
                    out.flush()?;
                    if done {
                        break;
                    }
                }
            }
        }
        scheduler.shutdown();
        info!(
            received = summary.received,
            emitted = summary.emitted,
            "live session finished"
        );
        Ok(summary)
    }
}

fn spawn_reader<R>(input: R, tx: mpsc::Sender<LiveEvent>) -> Result<()>
where
    R: BufRead + Send + 'static,
{
    std::thread::Builder::new()
        .name("lull-input".to_string())
        .spawn(move || {
            for line in input.lines() {
                let event = match line {
                    Ok(line) => LiveEvent::Line(line),
                    Err(err) => {
                        let _ = tx.send(LiveEvent::ReadFailed(err));
                        return;
                    }
                };
                if tx.send(event).is_err() {
                    return;
                }
            }
            let _ = tx.send(LiveEvent::Eof);
        })
        .context("spawn input reader")?;
    Ok(())
}
