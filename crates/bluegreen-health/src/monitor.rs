//! Post-switch regression monitor.
//!
//! After traffic moves, the newly active target group is sampled every
//! `interval` for the length of the window. A sample is bad if the error
//! rate, p99 latency, or healthy-target ratio breaches the policy; the
//! configured number of consecutive bad samples is a regression.

use tokio::time::Instant;
use tracing::{debug, info, warn};

use bluegreen_core::{MetricsSource, MonitorPolicy, TargetGroupRef};

use crate::tracker::{RegressionTracker, SampleVerdict};

/// Outcome of a monitoring window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorVerdict {
    /// The window elapsed without a regression.
    Stable { samples: u32 },
    /// Consecutive bad samples crossed the threshold.
    Regressed { reason: String, samples: u32 },
}

pub struct RegressionMonitor<'a> {
    metrics: &'a dyn MetricsSource,
    policy: &'a MonitorPolicy,
}

impl<'a> RegressionMonitor<'a> {
    pub fn new(metrics: &'a dyn MetricsSource, policy: &'a MonitorPolicy) -> Self {
        Self { metrics, policy }
    }

    /// Watch `target_group` for one window.
    pub async fn watch(&self, target_group: &TargetGroupRef) -> MonitorVerdict {
        let policy = self.policy;
        if policy.window.is_zero() {
            debug!(%target_group, "monitoring disabled");
            return MonitorVerdict::Stable { samples: 0 };
        }

        let deadline = Instant::now() + policy.window;
        let mut tracker = RegressionTracker::new(policy.unhealthy_threshold);
        info!(
            %target_group,
            window_secs = policy.window.as_secs(),
            interval_secs = policy.interval.as_secs(),
            "post-switch monitoring started"
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(policy.interval.min(deadline - now)).await;

            let verdict = self.sample(target_group).await;
            if tracker.record(verdict) {
                let reason = tracker
                    .last_reason()
                    .unwrap_or("regression threshold reached")
                    .to_string();
                warn!(%target_group, %reason, samples = tracker.samples(), "regression detected");
                return MonitorVerdict::Regressed {
                    reason,
                    samples: tracker.samples(),
                };
            }
        }

        info!(%target_group, samples = tracker.samples(), "monitoring window passed");
        MonitorVerdict::Stable {
            samples: tracker.samples(),
        }
    }

    async fn sample(&self, target_group: &TargetGroupRef) -> SampleVerdict {
        let health = match self.metrics.target_health(target_group).await {
            Ok(h) => h,
            Err(e) => {
                debug!(%target_group, error = %e, "target health unavailable");
                return SampleVerdict::Inconclusive;
            }
        };
        let traffic = match self.metrics.traffic(target_group).await {
            Ok(t) => t,
            Err(e) => {
                debug!(%target_group, error = %e, "traffic metrics unavailable");
                return SampleVerdict::Inconclusive;
            }
        };

        let policy = self.policy;
        let ratio = health.healthy_ratio();
        if ratio < policy.min_healthy_ratio {
            return SampleVerdict::Bad(format!(
                "healthy ratio {ratio:.2} < {:.2} ({}/{} targets)",
                policy.min_healthy_ratio,
                health.healthy,
                health.total()
            ));
        }
        // Rates and percentiles mean nothing without requests.
        if traffic.request_count > 0 {
            if traffic.error_rate > policy.max_error_rate {
                return SampleVerdict::Bad(format!(
                    "error rate {:.1}% > {:.1}%",
                    traffic.error_rate, policy.max_error_rate
                ));
            }
            if traffic.p99_latency_ms > policy.max_p99_latency_ms {
                return SampleVerdict::Bad(format!(
                    "p99 latency {}ms > {}ms",
                    traffic.p99_latency_ms, policy.max_p99_latency_ms
                ));
            }
        }
        SampleVerdict::Good
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use bluegreen_core::{BoxFuture, ScalingPolicy, SignalError, TargetHealth, TrafficSample};

    /// Serves whatever the test last set.
    struct Signals {
        health: Mutex<Result<TargetHealth, SignalError>>,
        traffic: Mutex<TrafficSample>,
        polls: Mutex<u32>,
    }

    impl Signals {
        fn healthy() -> Self {
            Self {
                health: Mutex::new(Ok(TargetHealth {
                    healthy: 4,
                    ..Default::default()
                })),
                traffic: Mutex::new(TrafficSample {
                    request_count: 1000,
                    error_rate: 0.2,
                    p99_latency_ms: 180,
                }),
                polls: Mutex::new(0),
            }
        }
    }

    impl MetricsSource for Signals {
        fn target_health<'a>(
            &'a self,
            _tg: &'a TargetGroupRef,
        ) -> BoxFuture<'a, Result<TargetHealth, SignalError>> {
            *self.polls.lock().unwrap() += 1;
            let h = self.health.lock().unwrap().clone();
            Box::pin(async move { h })
        }

        fn traffic<'a>(
            &'a self,
            _tg: &'a TargetGroupRef,
        ) -> BoxFuture<'a, Result<TrafficSample, SignalError>> {
            let t = *self.traffic.lock().unwrap();
            Box::pin(async move { Ok(t) })
        }

        fn fleet_metric<'a>(
            &'a self,
            _fleet: &'a str,
            _policy: &'a ScalingPolicy,
        ) -> BoxFuture<'a, Result<Option<f64>, SignalError>> {
            Box::pin(async { Ok(None) })
        }
    }

    fn policy() -> MonitorPolicy {
        MonitorPolicy {
            window: Duration::from_secs(60),
            interval: Duration::from_secs(10),
            ..Default::default()
        }
    }

    fn tg() -> TargetGroupRef {
        TargetGroupRef::new("tg-prod-green")
    }

    #[tokio::test(start_paused = true)]
    async fn stable_window_samples_every_interval() {
        let signals = Signals::healthy();
        let policy = policy();
        let monitor = RegressionMonitor::new(&signals, &policy);

        let started = Instant::now();
        let verdict = monitor.watch(&tg()).await;
        assert_eq!(verdict, MonitorVerdict::Stable { samples: 6 });
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn error_rate_regression() {
        let signals = Signals::healthy();
        signals.traffic.lock().unwrap().error_rate = 25.0;
        let policy = policy();
        let monitor = RegressionMonitor::new(&signals, &policy);

        let started = Instant::now();
        match monitor.watch(&tg()).await {
            MonitorVerdict::Regressed { reason, samples } => {
                assert!(reason.contains("error rate"));
                assert_eq!(samples, 3);
            }
            other => panic!("expected regression, got {other:?}"),
        }
        // Three bad samples at 10s intervals.
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn latency_and_health_ratio_count_as_bad() {
        let signals = Signals::healthy();
        signals.traffic.lock().unwrap().p99_latency_ms = 5000;
        let policy = MonitorPolicy {
            unhealthy_threshold: 1,
            ..policy()
        };
        let verdict = RegressionMonitor::new(&signals, &policy).watch(&tg()).await;
        assert!(matches!(
            verdict,
            MonitorVerdict::Regressed { ref reason, .. } if reason.contains("p99")
        ));

        let signals = Signals::healthy();
        *signals.health.lock().unwrap() = Ok(TargetHealth {
            healthy: 1,
            unhealthy: 3,
            initial: 0,
        });
        let verdict = RegressionMonitor::new(&signals, &policy).watch(&tg()).await;
        assert!(matches!(
            verdict,
            MonitorVerdict::Regressed { ref reason, .. } if reason.contains("healthy ratio")
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_target_group_ignores_rate_thresholds() {
        let signals = Signals::healthy();
        *signals.traffic.lock().unwrap() = TrafficSample {
            request_count: 0,
            error_rate: 100.0,
            p99_latency_ms: 0,
        };
        let policy = policy();
        let verdict = RegressionMonitor::new(&signals, &policy).watch(&tg()).await;
        assert!(matches!(verdict, MonitorVerdict::Stable { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn unavailable_signals_are_not_a_regression() {
        let signals = Signals::healthy();
        *signals.health.lock().unwrap() = Err(SignalError::Unavailable("metrics outage".into()));
        let policy = policy();
        let verdict = RegressionMonitor::new(&signals, &policy).watch(&tg()).await;
        assert_eq!(verdict, MonitorVerdict::Stable { samples: 6 });
    }

    #[tokio::test(start_paused = true)]
    async fn zero_window_disables_monitoring() {
        let signals = Signals::healthy();
        let policy = MonitorPolicy {
            window: Duration::ZERO,
            ..policy()
        };
        let verdict = RegressionMonitor::new(&signals, &policy).watch(&tg()).await;
        assert_eq!(verdict, MonitorVerdict::Stable { samples: 0 });
        assert_eq!(*signals.polls.lock().unwrap(), 0);
    }
}
