use std::io::{self, IsTerminal, Write};
use std::thread::{self, JoinHandle};

use crossbeam_channel::Receiver;
use crossterm::{
    cursor::MoveToColumn,
    execute,
    style::Print,
    terminal::{Clear, ClearType},
};

use crate::report::SiNumber;
use crate::sampler::Progress;

const BAR_LEN: usize = 20;
const SPINNER: [char; 4] = ['/', '-', '\\', '|'];

/// Whether a live progress line makes sense on this terminal.
pub fn enabled() -> bool {
    io::stderr().is_terminal()
}

/// Bar that fills as `confidence` (smoothed elapsed / target) nears 1.0,
/// on a log scale so the last stretch is visible.
pub fn confidence_bar(confidence: f64, len: usize) -> String {
    let closeness = 1.0 - (confidence - 1.0).abs();
    let scaled = 1.0 - (((1.0 - closeness) * 25.0) + 1.0).ln() / 26f64.ln();
    let filled = (scaled * len as f64).clamp(0.0, len as f64) as usize;
    format!("{}{}", "!".repeat(filled), ".".repeat(len - filled))
}

pub fn render_line(event: &Progress) -> Option<String> {
    let (bar, rate, requests) = match *event {
        Progress::RampUp { rate_bps, requests, .. } => ("?".repeat(BAR_LEN), rate_bps, requests),
        Progress::Steady {
            ewma_rate_bps,
            confidence,
            requests,
            ..
        } => (confidence_bar(confidence, BAR_LEN), ewma_rate_bps, requests),
        Progress::Finished { .. } => return None,
    };
    let spinner = SPINNER[(requests as usize).saturating_sub(1) % SPINNER.len()];
    Some(format!("{bar} {spinner} {:.2}b/s ({requests})", SiNumber::decimal(rate)))
}

/// Draws each event over the current line. The line is cleared once the
/// channel closes, whether or not a `Finished` event arrived.
pub fn render_events<W: Write>(out: &mut W, events: &Receiver<Progress>) -> io::Result<()> {
    for event in events.iter() {
        match render_line(&event) {
            Some(line) => execute!(out, MoveToColumn(0), Clear(ClearType::CurrentLine), Print(line))?,
            None => execute!(out, MoveToColumn(0), Clear(ClearType::CurrentLine))?,
        }
    }
    execute!(out, MoveToColumn(0), Clear(ClearType::CurrentLine))
}

/// Draws progress events on stderr until the sender side is dropped.
pub fn spawn_renderer(events: Receiver<Progress>) -> JoinHandle<()> {
    thread::spawn(move || {
        let _ = render_events(&mut io::stderr(), &events);
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::Mode;

    #[test]
    fn bar_full_on_target() {
        assert_eq!(confidence_bar(1.0, 20), "!".repeat(20));
    }

    #[test]
    fn bar_empty_far_from_target() {
        assert_eq!(confidence_bar(0.0, 20), ".".repeat(20));
        assert_eq!(confidence_bar(3.0, 20), ".".repeat(20));
    }

    #[test]
    fn bar_partial_near_target() {
        let bar = confidence_bar(0.9, 20);
        let filled = bar.chars().filter(|c| *c == '!').count();
        assert_eq!(bar.len(), 20);
        assert!(filled > 0 && filled < 20, "{bar}");
    }

    #[test]
    fn ramp_up_line() {
        let line = render_line(&Progress::RampUp {
            mode: Mode::Download,
            rate_bps: 12_000_000.0,
            requests: 2,
        })
        .unwrap();
        assert_eq!(line, format!("{} - 12.00 Mb/s (2)", "?".repeat(20)));
    }

    #[test]
    fn closed_channel_leaves_a_clean_line() {
        let (tx, rx) = crossbeam_channel::unbounded();
        tx.send(Progress::RampUp {
            mode: Mode::Download,
            rate_bps: 1_000.0,
            requests: 1,
        })
        .unwrap();
        drop(tx);

        let mut out = Vec::new();
        render_events(&mut out, &rx).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("1.00 kb/s (1)"), "{text:?}");
        assert!(text.ends_with("\x1b[2K"), "{text:?}");
    }

    #[test]
    fn finished_clears() {
        assert_eq!(render_line(&Progress::Finished { mode: Mode::Upload }), None);
    }
}
