//! Spinner shown while a simulated node waits for its rendezvous.

use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Waiting spinner
pub struct WaitSpinner {
    bar: ProgressBar,
}

impl WaitSpinner {
    /// Start a spinner with `message`
    #[must_use]
    pub fn new(message: &str) -> Self {
        let bar = ProgressBar::new_spinner();

        bar.set_style(
            ProgressStyle::default_spinner()
                .template("{spinner:.green} [{elapsed_precise}] {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(message.to_string());
        bar.enable_steady_tick(Duration::from_millis(100));

        Self { bar }
    }

    /// Finish with success message
    pub fn finish_with_message(&self, msg: String) {
        self.bar.finish_with_message(msg);
    }

    /// Abandon the spinner, leaving `msg` on screen
    pub fn abandon_with_message(&self, msg: String) {
        self.bar.abandon_with_message(msg);
    }
}

/// Format a duration in milliseconds or seconds
///
/// # Example
///
/// ```ignore
/// assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
/// assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50s");
/// ```
#[must_use]
pub fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(Duration::ZERO), "0ms");
        assert_eq!(format_elapsed(Duration::from_millis(250)), "250ms");
        assert_eq!(format_elapsed(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format_elapsed(Duration::from_secs(12)), "12.00s");
    }
}
