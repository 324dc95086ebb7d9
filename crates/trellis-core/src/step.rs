//! Step trait and the railway harness around it
//!
//! A step is a single typed transformation. User code implements [`Step::run`]
//! and may fail with any error; the harness decides what a failure means for
//! the rest of the chain:
//!
//! 1. a previous failure skips the step and propagates unchanged,
//! 2. cancellation is checked before user code runs and always re-propagates
//!    as [`CoreError::Cancelled`], never as fault data,
//! 3. any other error is captured into [`FaultData`] and returned as a value
//!    on the failure rail,
//! 4. success wraps the output.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::memory::{FromMemory, IntoMemory};
use crate::track::{FaultData, Track};

/// A single typed transformation inside a workflow
///
/// # Example
///
/// ```
/// use trellis_core::{memory_value, Step};
///
/// #[derive(Clone, serde::Serialize)]
/// struct Order { total: u64 }
///
/// #[derive(Clone, serde::Serialize)]
/// struct Receipt { charged: u64 }
///
/// memory_value!(Order, Receipt);
///
/// #[derive(Default)]
/// struct ChargeCard;
///
/// #[async_trait::async_trait]
/// impl Step for ChargeCard {
///     type Input = Order;
///     type Output = Receipt;
///
///     async fn run(&self, order: Order) -> anyhow::Result<Receipt> {
///         Ok(Receipt { charged: order.total })
///     }
/// }
/// ```
#[async_trait]
pub trait Step: Send + Sync + 'static {
    /// Pulled from run memory by type; tuples synthesize element-wise
    type Input: FromMemory + serde::Serialize;

    /// Stored into run memory on success; tuples flatten element-wise
    type Output: IntoMemory + serde::Serialize;

    /// Display name used in step records and failure fields.
    fn name(&self) -> &'static str {
        crate::short_type_name::<Self>()
    }

    /// User-implemented transformation; may fail with any error.
    async fn run(&self, input: Self::Input) -> anyhow::Result<Self::Output>;
}

/// Identity of the workflow a step runs inside, for fault capture.
#[derive(Debug, Clone)]
pub struct StepHost {
    pub workflow_name: String,
    pub workflow_external_id: String,
}

/// Drive one step down the two-track pipeline.
///
/// `Err` is reserved for cancellation; every other outcome is a [`Track`].
pub async fn run_railway<S: Step>(
    step: &S,
    previous: Track<S::Input>,
    cancellation: &CancellationToken,
    host: &StepHost,
) -> Result<Track<S::Output>, CoreError> {
    let input = match previous {
        Track::Ok(input) => input,
        Track::Fault(fault) => return Ok(Track::Fault(fault)),
        Track::Skipped => return Ok(Track::Skipped),
    };

    if cancellation.is_cancelled() {
        return Err(CoreError::Cancelled);
    }

    match step.run(input).await {
        Ok(output) => Ok(Track::Ok(output)),
        Err(err) => {
            if matches!(err.downcast_ref::<CoreError>(), Some(core) if core.is_cancelled()) {
                return Err(CoreError::Cancelled);
            }
            Ok(Track::Fault(FaultData::capture(
                &err,
                step.name(),
                &host.workflow_name,
                &host.workflow_external_id,
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_value;
    use anyhow::{anyhow, bail};

    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    struct Doubled(i64);

    #[derive(Debug, Clone, PartialEq, serde::Serialize)]
    struct Seed(i64);

    memory_value!(Doubled, Seed);

    #[derive(Default)]
    struct DoubleIt;

    #[async_trait]
    impl Step for DoubleIt {
        type Input = Seed;
        type Output = Doubled;

        async fn run(&self, seed: Seed) -> anyhow::Result<Doubled> {
            Ok(Doubled(seed.0 * 2))
        }
    }

    #[derive(Default)]
    struct AlwaysFails;

    #[async_trait]
    impl Step for AlwaysFails {
        type Input = Seed;
        type Output = Doubled;

        async fn run(&self, _seed: Seed) -> anyhow::Result<Doubled> {
            bail!("nope")
        }
    }

    #[derive(Default)]
    struct RaisesCancellation;

    #[async_trait]
    impl Step for RaisesCancellation {
        type Input = Seed;
        type Output = Doubled;

        async fn run(&self, _seed: Seed) -> anyhow::Result<Doubled> {
            Err(anyhow!(CoreError::Cancelled))
        }
    }

    fn host() -> StepHost {
        StepHost {
            workflow_name: "TestWorkflow".into(),
            workflow_external_id: "ff00".into(),
        }
    }

    #[tokio::test]
    async fn success_wraps_the_output() {
        let token = CancellationToken::new();
        let track = run_railway(&DoubleIt, Track::Ok(Seed(21)), &token, &host())
            .await
            .unwrap();
        assert_eq!(track, Track::Ok(Doubled(42)));
    }

    #[tokio::test]
    async fn previous_fault_propagates_unchanged() {
        let token = CancellationToken::new();
        let fault = FaultData::capture(&anyhow!("upstream"), "Earlier", "TestWorkflow", "ff00");
        let track = run_railway(&DoubleIt, Track::Fault(fault.clone()), &token, &host())
            .await
            .unwrap();
        assert_eq!(track, Track::Fault(fault));
    }

    #[tokio::test]
    async fn user_errors_become_fault_data() {
        let token = CancellationToken::new();
        let track = run_railway(&AlwaysFails, Track::Ok(Seed(1)), &token, &host())
            .await
            .unwrap();
        let fault = track.fault().expect("fault rail");
        assert_eq!(fault.step, "AlwaysFails");
        assert_eq!(fault.error_type, "unhandled");
        assert_eq!(fault.workflow_name, "TestWorkflow");
    }

    #[tokio::test]
    async fn cancellation_is_checked_before_user_code() {
        let token = CancellationToken::new();
        token.cancel();
        let result = run_railway(&DoubleIt, Track::Ok(Seed(1)), &token, &host()).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }

    #[tokio::test]
    async fn cancellation_raised_inside_run_is_never_wrapped() {
        let token = CancellationToken::new();
        let result = run_railway(&RaisesCancellation, Track::Ok(Seed(1)), &token, &host()).await;
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
