use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::driver::DriverError;
use crate::interrupt::StageToken;
use crate::pipeline::PipelineError;
use crate::retry::{RetryOutcome, RetryPolicy};

/// Something the pool can process, identified in the completed-item index by its key.
pub trait WorkItem: Clone + Send + Sync + 'static {
    fn key(&self) -> String;
}

/// A finished item, handed to the single writer.
#[derive(Debug)]
pub enum Completion<I, O> {
    Done { item: I, value: O, attempts: u32 },
    Exhausted { item: I, attempts: u32, error: DriverError },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    /// Items never started because a stop was requested.
    pub skipped: usize,
}

enum Message<I, O> {
    Finished(Completion<I, O>),
    Fatal { key: String, error: DriverError },
    Skipped,
}

/// Run `work` over `items` with at most `concurrency` in flight.
///
/// Each attempt gets a fresh call to `work`. Results go through `sink` one at
/// a time, on the caller's task, so the sink may hold the database handle.
/// Once `token` reports a stop, queued items are skipped while in-flight ones
/// finish. An abort drops in-flight work and returns [`PipelineError::Aborted`].
pub async fn process_all<I, O, F, Fut, S>(
    label: &str,
    items: Vec<I>,
    concurrency: usize,
    policy: &RetryPolicy,
    token: &StageToken,
    work: F,
    mut sink: S,
) -> Result<PoolReport, PipelineError>
where
    I: WorkItem,
    O: Send + 'static,
    F: Fn(I, u32) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, DriverError>> + Send + 'static,
    S: FnMut(Completion<I, O>) -> anyhow::Result<()>,
{
    let total = items.len();
    let concurrency = concurrency.max(1);
    let work = Arc::new(work);
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let halted = Arc::new(AtomicBool::new(false));

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] {bar:40} {pos}/{len} ({per_sec}, eta {eta})")
            .map_err(anyhow::Error::from)?
            .progress_chars("=> "),
    );
    pb.set_message(label.to_string());

    // Workers send results, this task writes them
    let (tx, mut rx) = mpsc::channel::<Message<I, O>>(concurrency * 2);
    let mut tasks = JoinSet::new();

    for item in items {
        let work = Arc::clone(&work);
        let sem = Arc::clone(&semaphore);
        let halted = Arc::clone(&halted);
        let token = token.clone();
        let policy = policy.clone();
        let tx = tx.clone();
        let label = format!("{} {}", label, item.key());

        tasks.spawn(async move {
            let Ok(_permit) = sem.acquire_owned().await else {
                return;
            };
            if token.is_stopping() || halted.load(Ordering::SeqCst) {
                let _ = tx.send(Message::Skipped).await;
                return;
            }
            let key = item.key();
            let outcome = policy
                .attempt(&label, |attempt| (*work)(item.clone(), attempt))
                .await;
            let msg = match outcome {
                Ok(RetryOutcome::Succeeded { value, attempts }) => {
                    Message::Finished(Completion::Done { item, value, attempts })
                }
                Ok(RetryOutcome::Exhausted { attempts, last_error }) => {
                    Message::Finished(Completion::Exhausted {
                        item,
                        attempts,
                        error: last_error,
                    })
                }
                Err(error) => {
                    halted.store(true, Ordering::SeqCst);
                    Message::Fatal { key, error }
                }
            };
            let _ = tx.send(msg).await;
        });
    }

    // Drop our sender so rx closes when every task is done
    drop(tx);

    let mut report = PoolReport::default();
    let mut fatal: Option<PipelineError> = None;
    let mut announced_stop = false;

    loop {
        let msg = tokio::select! {
            msg = rx.recv() => msg,
            _ = token.aborted() => {
                tasks.abort_all();
                pb.abandon();
                warn!("{}: aborted with {} item(s) in flight", label, tasks.len());
                return Err(PipelineError::Aborted);
            }
            _ = token.stopping(), if !announced_stop => {
                announced_stop = true;
                info!("{}: stop requested, letting in-flight items finish", label);
                continue;
            }
        };
        let Some(msg) = msg else { break };
        pb.inc(1);

        match msg {
            Message::Skipped => report.skipped += 1,
            Message::Fatal { key, error } => {
                report.attempted += 1;
                warn!("{}: fatal error on {}: {}", label, key, error);
                if fatal.is_none() {
                    fatal = Some(PipelineError::Fatal { key, source: error });
                }
            }
            Message::Finished(completion) => {
                report.attempted += 1;
                match &completion {
                    Completion::Done { .. } => report.succeeded += 1,
                    Completion::Exhausted { item, attempts, error } => {
                        report.exhausted += 1;
                        warn!(
                            "{}: giving up on {} after {} attempt(s): {}",
                            label,
                            item.key(),
                            attempts,
                            error
                        );
                    }
                }
                if let Err(e) = sink(completion) {
                    tasks.abort_all();
                    pb.abandon();
                    return Err(PipelineError::Store(e));
                }
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    pb.finish_and_clear();

    if let Some(err) = fatal {
        return Err(err);
    }
    info!(
        "{}: {} attempted ({} ok, {} exhausted, {} not started)",
        label, report.attempted, report.succeeded, report.exhausted, report.skipped
    );
    Ok(report)
}
