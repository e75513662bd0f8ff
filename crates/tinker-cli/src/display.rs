//! Console rendering of loop events.
//!
//! A broadcast subscriber that turns the event stream into readable
//! terminal output: a spinner while the LLM is thinking, streamed reply
//! text line by line, and colored status lines for executions and task
//! transitions.

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tinker_proto::{Event, EventBus};

/// Assembles streamed chunks into whole lines.
///
/// Chunks arrive at arbitrary boundaries; printing partial lines interacts
/// badly with the spinner, so output is held until a newline lands.
#[derive(Default)]
pub struct LineAssembler {
    buffer: String,
}

impl LineAssembler {
    /// Feeds a chunk, returning any lines completed by it.
    pub fn feed(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            lines.push(line.trim_end_matches('\n').to_string());
        }
        lines
    }

    /// Flushes whatever partial line remains.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.buffer))
        }
    }
}

struct DisplayState {
    spinner: Option<ProgressBar>,
    assembler: LineAssembler,
}

impl DisplayState {
    fn stop_spinner(&mut self) {
        if let Some(spinner) = self.spinner.take() {
            spinner.finish_and_clear();
        }
    }

    fn print_line(&mut self, line: &str) {
        // Suspend the spinner around output so lines stay intact.
        if let Some(spinner) = &self.spinner {
            spinner.suspend(|| println!("{line}"));
        } else {
            println!("{line}");
        }
    }
}

/// Console display subscriber.
pub struct ConsoleDisplay {
    state: Arc<Mutex<DisplayState>>,
}

impl ConsoleDisplay {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DisplayState {
                spinner: None,
                assembler: LineAssembler::default(),
            })),
        }
    }

    /// Registers this display on the bus.
    pub fn attach(&self, bus: &EventBus) {
        let state = self.state.clone();
        bus.subscribe("console-display", move |event| {
            let mut state = state.lock().expect("display state poisoned");
            render(&mut state, event);
        });
    }
}

impl Default for ConsoleDisplay {
    fn default() -> Self {
        Self::new()
    }
}

fn render(state: &mut DisplayState, event: &Event) {
    match event {
        Event::TaskStart { instruction, .. } => {
            state.print_line(&format!("{} {}", "task".bold().cyan(), instruction));
        }
        Event::RoundStart { round, .. } => {
            state.print_line(&format!("{}", format!("-- round {round} --").dimmed()));
        }
        Event::QueryStart { llm, .. } => {
            let spinner = ProgressBar::new_spinner();
            spinner.set_style(
                ProgressStyle::with_template("{spinner} {msg}")
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            spinner.set_message(format!("querying {llm}"));
            spinner.enable_steady_tick(Duration::from_millis(120));
            state.spinner = Some(spinner);
        }
        Event::Stream { chunk, .. } => {
            let lines = state.assembler.feed(chunk);
            for line in lines {
                state.print_line(&line);
            }
        }
        Event::QueryEnd { .. } => {
            if let Some(rest) = state.assembler.finish() {
                state.print_line(&rest);
            }
            state.stop_spinner();
        }
        Event::ExecStart { block, lang, .. } => {
            state.print_line(&format!("{} {block} ({lang})", "exec".bold().blue()));
        }
        Event::ExecResult {
            block,
            success,
            duration_ms,
            ..
        } => {
            let mark = if *success {
                "ok".green().to_string()
            } else {
                "failed".red().to_string()
            };
            state.print_line(&format!("     {block}: {mark} in {duration_ms}ms"));
        }
        Event::ToolCall { tool, .. } => {
            state.print_line(&format!("{} {tool}", "tool".bold().magenta()));
        }
        Event::ToolResult { tool, success, .. } => {
            let mark = if *success {
                "ok".green().to_string()
            } else {
                "failed".red().to_string()
            };
            state.print_line(&format!("     {tool}: {mark}"));
        }
        Event::RoundEnd { .. } => {}
        Event::TaskEnd {
            status,
            rounds,
            truncated,
            ..
        } => {
            state.stop_spinner();
            let status = match status.as_str() {
                "done" if *truncated => "done (truncated)".yellow().to_string(),
                "done" => "done".green().to_string(),
                "cancelled" => "cancelled".yellow().to_string(),
                other => other.red().to_string(),
            };
            state.print_line(&format!(
                "{} {status} after {rounds} round(s)",
                "task".bold().cyan()
            ));
        }
        Event::Exception {
            context, message, ..
        } => {
            state.print_line(&format!("{} [{context}] {message}", "error".bold().red()));
        }
    }
}
