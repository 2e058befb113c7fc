use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Recurring session work driven by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Pull,
    Render,
}

#[derive(Debug, Clone)]
pub struct JobSpec {
    pub name: &'static str,
    pub interval: Duration,
    pub tick: Tick,
    pub tx: mpsc::Sender<Tick>,
}

/// Spawn one interval task per job. The first tick fires one interval after
/// start; missed ticks are skipped. Tasks end on cancellation or when the
/// receiver is gone.
pub fn start(jobs: Vec<JobSpec>, cancel: &CancellationToken) -> Vec<JoinHandle<()>> {
    jobs.into_iter()
        .map(|job| {
            let cancel = cancel.child_token();
            tokio::spawn(async move {
                let start_at = Instant::now() + job.interval;
                let mut interval = tokio::time::interval_at(start_at, job.interval);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        _ = interval.tick() => {
                            tracing::trace!(job = job.name, "scheduler tick");
                            if job.tx.send(job.tick).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect()
}
