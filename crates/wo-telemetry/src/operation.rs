use std::time::{Duration, Instant};

use tracing::Span;

/// Times a named unit of work and logs how it ended.
///
/// Creating the timer enters nothing by itself; callers that want nested log
/// lines tagged with the operation should `span().in_scope(..)` or
/// `.instrument(timer.span().clone())`.
pub struct OperationTimer {
    operation: &'static str,
    span: Span,
    started: Instant,
    finished: bool,
}

impl OperationTimer {
    /// Open an `operation` span and log that the operation started.
    pub fn start(operation: &'static str) -> Self {
        let span = tracing::info_span!("operation", operation = %operation);
        span.in_scope(|| tracing::debug!(operation, "operation started"));
        Self {
            operation,
            span,
            started: Instant::now(),
            finished: false,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Log the outcome and consume the timer.
    pub fn finish(mut self, success: bool) -> Duration {
        self.finished = true;
        let elapsed = self.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;
        self.span.in_scope(|| {
            if success {
                tracing::info!(operation = self.operation, elapsed_ms, "operation finished");
            } else {
                tracing::warn!(operation = self.operation, elapsed_ms, "operation failed");
            }
        });
        elapsed
    }
}

impl Drop for OperationTimer {
    fn drop(&mut self) {
        if !self.finished {
            let elapsed_ms = self.elapsed().as_millis() as u64;
            self.span.in_scope(|| {
                tracing::warn!(operation = self.operation, elapsed_ms, "operation dropped");
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finish_reports_elapsed_time() {
        let timer = OperationTimer::start("unit-test");
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = timer.finish(true);
        assert!(elapsed >= Duration::from_millis(5));
    }

    #[test]
    fn dropping_unfinished_timer_does_not_panic() {
        let timer = OperationTimer::start("dropped");
        drop(timer);
    }
}
