//! Webhook request counters. Every inbound request is timed once and
//! tagged with exactly one outcome, whichever branch it took.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use salvo::prelude::*;

static WEBHOOK_SUCCESS: AtomicU64 = AtomicU64::new(0);
static WEBHOOK_FAIL: AtomicU64 = AtomicU64::new(0);
static WEBHOOK_DROPPED: AtomicU64 = AtomicU64::new(0);
static WEBHOOK_DURATION_MS_TOTAL: AtomicU64 = AtomicU64::new(0);
static WEBHOOK_REQUESTS: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    Success,
    Fail,
    Dropped,
}

impl RequestOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestOutcome::Success => "success",
            RequestOutcome::Fail => "fail",
            RequestOutcome::Dropped => "dropped",
        }
    }
}

pub struct WebhookTimer {
    started: Instant,
}

impl WebhookTimer {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn finish(self, outcome: RequestOutcome) {
        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        WEBHOOK_DURATION_MS_TOTAL.fetch_add(elapsed_ms, Ordering::Relaxed);
        WEBHOOK_REQUESTS.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            RequestOutcome::Success => &WEBHOOK_SUCCESS,
            RequestOutcome::Fail => &WEBHOOK_FAIL,
            RequestOutcome::Dropped => &WEBHOOK_DROPPED,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(outcome = outcome.as_str(), elapsed_ms, "webhook request finished");
    }
}

pub fn format_prometheus() -> String {
    let success = WEBHOOK_SUCCESS.load(Ordering::Relaxed);
    let fail = WEBHOOK_FAIL.load(Ordering::Relaxed);
    let dropped = WEBHOOK_DROPPED.load(Ordering::Relaxed);
    let duration_total = WEBHOOK_DURATION_MS_TOTAL.load(Ordering::Relaxed);
    let requests = WEBHOOK_REQUESTS.load(Ordering::Relaxed);

    let avg_duration = if requests > 0 {
        duration_total as f64 / requests as f64
    } else {
        0.0
    };

    format!(
        r#"# HELP webhook_requests_total Total number of inbound webhook requests
# TYPE webhook_requests_total counter
webhook_requests_total {requests}

# HELP webhook_requests_success Requests that were relayed successfully
# TYPE webhook_requests_success counter
webhook_requests_success {success}

# HELP webhook_requests_fail Requests that failed during processing
# TYPE webhook_requests_fail counter
webhook_requests_fail {fail}

# HELP webhook_requests_dropped Requests acknowledged but not processed
# TYPE webhook_requests_dropped counter
webhook_requests_dropped {dropped}

# HELP webhook_request_duration_avg_ms Average end-to-end request duration
# TYPE webhook_request_duration_avg_ms gauge
webhook_request_duration_avg_ms {avg_duration}
"#
    )
}

#[handler]
pub async fn metrics_endpoint(res: &mut Response) {
    res.render(Text::Plain(format_prometheus()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_records_exactly_one_outcome() {
        let before_requests = WEBHOOK_REQUESTS.load(Ordering::Relaxed);
        let before_dropped = WEBHOOK_DROPPED.load(Ordering::Relaxed);

        WebhookTimer::start().finish(RequestOutcome::Dropped);

        assert_eq!(WEBHOOK_REQUESTS.load(Ordering::Relaxed), before_requests + 1);
        assert_eq!(WEBHOOK_DROPPED.load(Ordering::Relaxed), before_dropped + 1);
    }

    #[test]
    fn format_prometheus_includes_all_series() {
        let output = format_prometheus();
        assert!(output.contains("webhook_requests_total"));
        assert!(output.contains("webhook_requests_success"));
        assert!(output.contains("webhook_requests_fail"));
        assert!(output.contains("webhook_requests_dropped"));
        assert!(output.contains("webhook_request_duration_avg_ms"));
    }
}
