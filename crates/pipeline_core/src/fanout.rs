use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, warn};

use crate::component_id::ComponentId;
use crate::consumer::{Consumer, ConsumerError};
use crate::error::panic_message;
use crate::pdata::Traces;

/// Delivers each batch to every exporter of a pipeline concurrently.
///
/// Every downstream receives its own copy. The call returns once all branches
/// finished; the error of the lowest-indexed failing branch is returned and the
/// rest are logged. A panicking branch is logged and does not fail the call.
pub struct FanOut {
    downstreams: Vec<(ComponentId, Arc<dyn Consumer>)>,
}

impl FanOut {
    pub fn new(downstreams: Vec<(ComponentId, Arc<dyn Consumer>)>) -> Self {
        Self { downstreams }
    }

    pub fn len(&self) -> usize {
        self.downstreams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.downstreams.is_empty()
    }
}

#[async_trait]
impl Consumer for FanOut {
    async fn consume_traces(&self, traces: Traces) -> Result<(), ConsumerError> {
        let mut branches = JoinSet::new();
        for (index, (_, consumer)) in self.downstreams.iter().enumerate() {
            let consumer = Arc::clone(consumer);
            let traces = traces.clone();
            branches.spawn(async move {
                let outcome = AssertUnwindSafe(consumer.consume_traces(traces))
                    .catch_unwind()
                    .await;
                (index, outcome)
            });
        }

        let mut failures: Vec<(usize, ConsumerError)> = Vec::new();
        while let Some(joined) = branches.join_next().await {
            match joined {
                Ok((_, Ok(Ok(())))) => {}
                Ok((index, Ok(Err(err)))) => failures.push((index, err)),
                Ok((index, Err(payload))) => {
                    error!(
                        downstream = %self.downstreams[index].0,
                        panic = %panic_message(&*payload),
                        "recovered panic in fan-out branch"
                    );
                }
                Err(join_err) => {
                    error!(error = %join_err, "fan-out branch did not complete");
                }
            }
        }

        failures.sort_by_key(|(index, _)| *index);
        let mut failures = failures.into_iter();
        let Some((index, first)) = failures.next() else {
            return Ok(());
        };
        for (other, err) in failures {
            warn!(downstream = %self.downstreams[other].0, error = %err, "fan-out branch failed");
        }
        Err(ConsumerError::Downstream {
            id: self.downstreams[index].0.clone(),
            source: Box::new(first),
        })
    }
}
