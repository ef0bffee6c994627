use std::io::Write;
use std::sync::mpsc;
use std::sync::Arc;

use anyhow::Result;
use lull_core::{Observer, Scheduler};
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// One line of output: an emitted value or the completion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Emission {
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<String>,
}

impl Emission {
    pub fn value(at_ms: u64, value: impl Into<String>) -> Self {
        Self {
            at_ms,
            value: Some(value.into()),
            complete: false,
            wall_time: None,
        }
    }

    pub fn complete(at_ms: u64) -> Self {
        Self {
            at_ms,
            value: None,
            complete: true,
            wall_time: None,
        }
    }

    pub fn write_to(&self, out: &mut impl Write, json: bool) -> Result<()> {
        if json {
            serde_json::to_writer(&mut *out, self)?;
            writeln!(out)?;
            return Ok(());
        }
        match &self.value {
            Some(value) => writeln!(out, "{}ms {}", self.at_ms, value)?,
            None => writeln!(out, "{}ms (complete)", self.at_ms)?,
        }
        Ok(())
    }
}

/// Observer that forwards emissions, stamped with scheduler time, into a
/// channel so the receiving thread does the printing.
pub struct EmissionSender<E> {
    tx: mpsc::Sender<E>,
    scheduler: Arc<dyn Scheduler>,
    wall_clock: bool,
    wrap: fn(Emission) -> E,
}

impl<E: Send> EmissionSender<E> {
    pub fn new(
        tx: mpsc::Sender<E>,
        scheduler: Arc<dyn Scheduler>,
        wall_clock: bool,
        wrap: fn(Emission) -> E,
    ) -> Self {
        Self {
            tx,
            scheduler,
            wall_clock,
            wrap,
        }
    }

    fn send(&self, mut emission: Emission) {
        if self.wall_clock {
            emission.wall_time = OffsetDateTime::now_utc().format(&Rfc3339).ok();
        }
        let _ = self.tx.send((self.wrap)(emission));
    }

    fn now_ms(&self) -> u64 {
        self.scheduler.now().as_millis() as u64
    }
}

impl<E: Send> Observer<String> for EmissionSender<E> {
    fn on_value(&self, value: String) -> lull_core::Result<()> {
        self.send(Emission::value(self.now_ms(), value));
        Ok(())
    }

    fn on_complete(&self) {
        self.send(Emission::complete(self.now_ms()));
    }
}
