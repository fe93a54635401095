//! Timed delay steps

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{HandlerError, StepContext, StepHandler, StepResult};
use crate::dsl::{StepKind, StepSpec};

/// Delay used when a step sets neither `delaySeconds` nor `untilUtc`
pub const DEFAULT_DELAY_SECONDS: u64 = 5;

/// Parks the instance until an absolute or relative resume time
///
/// The first visit returns `Waiting`. When the instance comes back parked on
/// this same step and its resume time has passed, the delay is over and the
/// step succeeds without output.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayHandler;

#[async_trait]
impl StepHandler for DelayHandler {
    fn kind(&self) -> StepKind {
        StepKind::Delay
    }

    async fn handle(
        &self,
        ctx: StepContext<'_>,
        _cancel: CancellationToken,
    ) -> Result<StepResult, HandlerError> {
        let StepSpec::Delay(spec) = &ctx.step.spec else {
            return Err(HandlerError::kind_mismatch(ctx.step, StepKind::Delay));
        };

        let now = ctx.clock.now();
        let parked_here = ctx.instance.current_step_id.as_deref() == Some(ctx.step.id.as_str());
        if parked_here && ctx.instance.next_run_at.is_some_and(|at| at <= now) {
            return Ok(StepResult::succeeded(None));
        }

        let resume_at = match spec.until_utc {
            Some(at) => at,
            None => {
                let secs = spec.delay_seconds.unwrap_or(DEFAULT_DELAY_SECONDS);
                i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .ok_or_else(|| {
                        HandlerError::InvalidRequest(format!("delay of {secs}s is out of range"))
                    })?
            }
        };
        Ok(StepResult::waiting(resume_at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::handlers::test_support::Fixture;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;

    fn fixture(step: serde_json::Value) -> Fixture {
        Fixture::new(
            json!({"name": "t", "trigger": {"type": "manual"}, "steps": [step]}),
            json!({}),
        )
    }

    #[tokio::test]
    async fn test_relative_delay() {
        let fx = fixture(json!({"id": "d1", "type": "delay", "delaySeconds": 10}));
        let now = fx.clock.now();

        let result = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, StepResult::waiting(now + Duration::seconds(10)));
    }

    #[tokio::test]
    async fn test_default_and_absolute_delay() {
        let fx = fixture(json!({"id": "d1", "type": "delay"}));
        let now = fx.clock.now();
        let result = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            StepResult::waiting(now + Duration::seconds(DEFAULT_DELAY_SECONDS as i64))
        );

        let fx = fixture(json!({"id": "d1", "type": "delay", "untilUtc": "2030-01-01T00:00:00Z"}));
        let result = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            result,
            StepResult::waiting(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap())
        );
    }

    #[tokio::test]
    async fn test_resume_time_past_calendar_end_is_rejected() {
        let fx = fixture(json!({"id": "d1", "type": "delay", "delaySeconds": 10}));
        fx.clock.set(DateTime::<Utc>::MAX_UTC - Duration::seconds(5));

        let err = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidRequest(_)));
        assert_eq!(err.to_string(), "invalid request: delay of 10s is out of range");
    }

    #[tokio::test]
    async fn test_resume_after_parked_time_succeeds() {
        let mut fx = fixture(json!({"id": "d1", "type": "delay", "delaySeconds": 10}));
        let parked_until = fx.clock.now() + Duration::seconds(10);
        fx.instance.advance_to(Some("d1".into()));
        fx.instance.mark_waiting(parked_until);

        fx.clock.advance(Duration::seconds(5));
        let early = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(early, StepResult::Waiting { .. }));

        fx.clock.advance(Duration::seconds(5));
        let resumed = DelayHandler
            .handle(fx.ctx("d1"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed, StepResult::succeeded(None));
    }
}
