/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */

use crate::{bench::RunStatistic, sampler::Sampler};
use anyhow::Context;
use chrono::Utc;
use tokio::{
    task::JoinHandle,
    time::{interval_at, Duration, Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace, warn};

pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

pub struct StopHandle {
    token: CancellationToken,
    handle: JoinHandle<Vec<RunStatistic>>,
}
impl StopHandle {
    /// Stops the sampling task and waits for it to exit. Once this returns no further samples
    /// can be produced.
    ///
    /// # Returns
    ///
    /// Every sample collected while the task was running, in collection order.
    pub async fn stop(self) -> anyhow::Result<Vec<RunStatistic>> {
        self.token.cancel();
        self.handle.await.context("Sampling task failed to exit cleanly")
    }
}

/// Starts sampling in a background task. This function returns immediately.
///
/// # Arguments
///
/// * `sampler` - The sampler to query on every tick.
/// * `interval` - Time between two samples. The first sample is taken one interval after start.
///   A zero interval falls back to `DEFAULT_SAMPLE_INTERVAL`.
///
/// # Returns
///
/// A `StopHandle` which must be used to stop the task and collect its samples.
pub fn start_logging(sampler: Box<dyn Sampler>, interval: Duration) -> StopHandle {
    let interval = if interval.is_zero() {
        warn!("Zero sample interval, using {DEFAULT_SAMPLE_INTERVAL:?}");
        DEFAULT_SAMPLE_INTERVAL
    } else {
        interval
    };
    let token = CancellationToken::new();
    let handle = tokio::spawn(keep_logging(sampler, interval, token.clone()));
    StopHandle { token, handle }
}

/// Queries the sampler on a fixed cadence until cancelled. Failed queries are logged and the tick
/// skipped. The sample buffer is owned by this task and handed back when it exits.
async fn keep_logging(
    mut sampler: Box<dyn Sampler>,
    interval: Duration,
    token: CancellationToken,
) -> Vec<RunStatistic> {
    let mut samples = vec![];
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => match sampler.query() {
                Ok(metrics) => {
                    trace!("sampled {:?}", metrics);
                    samples.push(RunStatistic::Sample {
                        timestamp: Utc::now(),
                        metrics,
                    });
                }
                Err(err) => error!("Error querying daemon metrics: {err:#}"),
            },
        }
    }

    samples
}
