//! Chrome trace output.
//!
//! Spans can be recorded from any thread; each carries the id of the track
//! it is drawn on, so concurrent node executions show up side by side.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Event<'a> {
    name: &'a str,
    tid: usize,
    timestamp: Instant,
    end: Instant,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{\"pid\": 0, \"tid\": {}, \"name\": {}, \"ts\": {}, \"ph\": \"X\", \"dur\": {}}}",
            event.tid,
            serde_json::to_string(event.name).unwrap_or_else(|_| "\"?\"".into()),
            event.timestamp.saturating_duration_since(self.start).as_micros(),
            event.end.saturating_duration_since(event.timestamp).as_micros(),
        )
    }

    fn write(&mut self, event: Event) -> std::io::Result<()> {
        self.write_event(event)?;
        writeln!(self.w, ",")
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.write_event(Event {
            name: "main",
            tid: 0,
            timestamp: self.start,
            end: Instant::now(),
        })?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

fn with_trace<T>(f: impl FnOnce(&mut Option<Trace>) -> T) -> T {
    let mut guard = TRACE.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    with_trace(|t| *t = Some(trace));
    Ok(())
}

pub fn enabled() -> bool {
    with_trace(|t| t.is_some())
}

/// Track id for the current thread: 0 for the main thread, 1.. for pool
/// workers.
pub fn current_tid() -> usize {
    rayon::current_thread_index().map_or(0, |i| i + 1)
}

/// Record a completed span.
pub fn span(name: &str, tid: usize, start: Instant, end: Instant) {
    with_trace(|t| {
        if let Some(t) = t {
            let event = Event {
                name,
                tid,
                timestamp: start,
                end,
            };
            if let Err(err) = t.write(event) {
                tracing::warn!("trace write failed: {}", err);
            }
        }
    })
}

#[inline]
pub fn scope<T>(name: &str, f: impl FnOnce() -> T) -> T {
    if !enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    span(name, current_tid(), start, Instant::now());
    result
}

pub fn close() -> std::io::Result<()> {
    with_trace(|t| match t.take() {
        Some(mut t) => t.close(),
        None => Ok(()),
    })
}
