//! Run status reporting
//!
//! This module provides functionality for:
//! 1. Counting per-post outcomes across the producer and the coordinator
//! 2. Showing the current section and counts on a console spinner
//! 3. Printing a summary at the end of a run

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use console::{style, Term};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Discovered,
    Filtered,
    Downloaded,
    Duplicate,
    AlreadyPresent,
    NotFound,
    Failed,
}

impl Counter {
    pub const ALL: [Counter; 7] = [
        Counter::Discovered,
        Counter::Filtered,
        Counter::Downloaded,
        Counter::Duplicate,
        Counter::AlreadyPresent,
        Counter::NotFound,
        Counter::Failed,
    ];

    fn index(self) -> usize {
        self as usize
    }

    pub fn label(self) -> &'static str {
        match self {
            Counter::Discovered => "discovered",
            Counter::Filtered => "filtered",
            Counter::Downloaded => "downloaded",
            Counter::Duplicate => "duplicate",
            Counter::AlreadyPresent => "already present",
            Counter::NotFound => "not found",
            Counter::Failed => "failed",
        }
    }
}

/// Receives progress from the pipeline. Purely observational.
pub trait StatusSink: Send + Sync {
    fn increment(&self, counter: Counter, by: u64);

    /// Starts a new phase of the run.
    fn section(&self, name: &str);

    /// Free-form detail within the current section.
    fn status(&self, text: &str);
}

#[derive(Debug, Default)]
pub struct StatusCounters {
    counts: [AtomicU64; 7],
}

impl StatusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            counts: Counter::ALL.map(|c| (c, self.get(c))),
        }
    }
}

impl StatusSink for StatusCounters {
    fn increment(&self, counter: Counter, by: u64) {
        self.counts[counter.index()].fetch_add(by, Ordering::Relaxed);
    }

    fn section(&self, _name: &str) {}

    fn status(&self, _text: &str) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub counts: [(Counter, u64); 7],
}

impl RunSummary {
    pub fn get(&self, counter: Counter) -> u64 {
        self.counts
            .iter()
            .find(|(c, _)| *c == counter)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .counts
            .iter()
            .map(|(counter, n)| format!("{} {}", n, counter.label()))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}

/// Counters plus a spinner on stderr.
pub struct ConsoleStatus {
    counters: StatusCounters,
    spinner: ProgressBar,
}

impl ConsoleStatus {
    pub fn new() -> Self {
        Term::stdout().set_title("e621dl");

        let spinner = ProgressBar::new_spinner();
        spinner.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner} {prefix:.bold} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        spinner.set_draw_target(ProgressDrawTarget::stderr_with_hz(5));
        spinner.enable_steady_tick(Duration::from_millis(200));

        Self {
            counters: StatusCounters::new(),
            spinner,
        }
    }

    pub fn counters(&self) -> &StatusCounters {
        &self.counters
    }

    pub fn finish(&self) -> RunSummary {
        let summary = self.counters.summary();
        self.spinner
            .finish_with_message(format!("{}", style(&summary).cyan().italic()));
        summary
    }

    fn refresh(&self) {
        self.spinner.set_message(format!(
            "{} downloaded, {} duplicate, {} present, {} not found",
            self.counters.get(Counter::Downloaded),
            self.counters.get(Counter::Duplicate),
            self.counters.get(Counter::AlreadyPresent),
            self.counters.get(Counter::NotFound),
        ));
    }
}

impl Default for ConsoleStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusSink for ConsoleStatus {
    fn increment(&self, counter: Counter, by: u64) {
        self.counters.increment(counter, by);
        self.refresh();
    }

    fn section(&self, name: &str) {
        self.spinner.set_prefix(name.to_string());
        Term::stdout().set_title(format!("e621dl - {}", name));
    }

    fn status(&self, text: &str) {
        self.spinner.set_message(text.to_string());
    }
}
