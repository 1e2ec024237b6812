use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::io::IsTerminal;
use std::time::Duration;

/// Observer for reporting chunk completion while a run is in flight.
///
/// All callbacks are made from the thread that started the run.
pub trait RunProgressObserver {
    fn on_start(&mut self, total_chunks: usize, total_rows: usize) {
        let _ = (total_chunks, total_rows);
    }
    fn on_chunk_complete(&mut self, chunk_index: usize, rows: usize) {
        let _ = (chunk_index, rows);
    }
    fn on_finish(&mut self) {}
}

#[derive(Default)]
pub struct NoopProgress;

impl RunProgressObserver for NoopProgress {}

/// Terminal progress bar advanced once per completed chunk.
pub struct ProgressBarObserver {
    bar: ProgressBar,
    message: String,
}

impl ProgressBarObserver {
    /// Draws on stderr, unless `quiet` or stderr is not a terminal.
    pub fn new(message: &str, quiet: bool) -> Self {
        let draw_target = if !quiet && std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(20)
        } else {
            ProgressDrawTarget::hidden()
        };
        let bar = ProgressBar::with_draw_target(None, draw_target);
        if let Ok(style) = ProgressStyle::with_template(
            "\n> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} chunks ({eta}) {msg}",
        ) {
            bar.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
        }
        Self {
            bar,
            message: message.to_string(),
        }
    }
}

impl RunProgressObserver for ProgressBarObserver {
    fn on_start(&mut self, total_chunks: usize, total_rows: usize) {
        self.bar.set_length(total_chunks as u64);
        self.bar.set_position(0);
        self.bar.set_message(format!("{} ({total_rows} rows)", self.message));
    }

    fn on_chunk_complete(&mut self, chunk_index: usize, rows: usize) {
        let _ = (chunk_index, rows);
        self.bar.inc(1);
    }

    fn on_finish(&mut self) {
        self.bar.finish_and_clear();
    }
}

/// Projected wall time of a run, extrapolated from the first row's fit.
///
/// Informational only; nothing in the engine adapts to it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CostProjection {
    pub first_row: Duration,
    pub rows: usize,
    pub threads: usize,
}

impl CostProjection {
    pub fn projected_total(&self) -> Duration {
        let per_thread_rows = self.rows as f64 / self.threads.max(1) as f64;
        self.first_row.mul_f64(per_thread_rows)
    }

    pub fn log(&self) {
        log::info!(
            "First row fitted in {:.3?}; projected run time for {} rows on {} threads: {}.",
            self.first_row,
            self.rows,
            self.threads,
            format_duration(self.projected_total())
        );
    }
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h {:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m {:02}s", secs / 60, secs % 60)
    } else {
        format!("{:.1}s", duration.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn projection_scales_by_rows_per_thread() {
        let projection = CostProjection {
            first_row: Duration::from_millis(20),
            rows: 1000,
            threads: 4,
        };
        assert_abs_diff_eq!(projection.projected_total().as_secs_f64(), 5.0, epsilon = 1e-6);
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 02m");
        assert_eq!(format_duration(Duration::from_secs(75)), "1m 15s");
    }

    #[test]
    fn hidden_bar_tracks_chunks() {
        let mut observer = ProgressBarObserver::new("Fitting", true);
        observer.on_start(3, 30);
        observer.on_chunk_complete(2, 10);
        observer.on_chunk_complete(0, 10);
        assert_eq!(observer.bar.position(), 2);
        assert_eq!(observer.bar.length(), Some(3));
        observer.on_finish();
    }
}
