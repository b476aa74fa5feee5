//! Orders reconciliation passes.
//!
//! Every trigger, whether pushed by an operator or observed by a watch, is
//! sent on one bounded channel. A single consumer plans each submission and
//! dispatches it by pod: at most one pass runs per pod, and later passes for
//! the same pod wait their turn in arrival order.

use crate::reconcile::{Completion, Key, Outcome, Plan, Reconciler, Trigger};
use parking_lot::Mutex;
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};
use tokio::{
    sync::{mpsc, oneshot},
    time,
};
use tracing::{debug, info, warn, Instrument};

/// Submits triggers to the queue.
#[derive(Clone, Debug)]
pub struct Submitter {
    tx: mpsc::Sender<Submission>,
}

/// Consumes submissions until shutdown.
pub struct Queue {
    rx: mpsc::Receiver<Submission>,
    dispatcher: Dispatcher,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("the reconciliation queue is closed")]
    Closed,

    #[error("the reconciliation queue is full")]
    Full,
}

#[derive(Debug)]
struct Submission {
    trigger: Trigger,
    reply: Option<oneshot::Sender<Outcome>>,
}

#[derive(Clone)]
struct Dispatcher {
    reconciler: Reconciler,
    /// Jobs waiting behind the pass running for each active key.
    active: Arc<Mutex<HashMap<Key, VecDeque<Job>>>>,
    tx: mpsc::WeakSender<Submission>,
    requeue_delay: time::Duration,
}

struct Job {
    plan: Plan,
    reply: Option<oneshot::Sender<Outcome>>,
    start: time::Instant,
}

pub fn channel(
    reconciler: Reconciler,
    capacity: usize,
    requeue_delay: time::Duration,
) -> (Submitter, Queue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let dispatcher = Dispatcher {
        reconciler,
        active: Default::default(),
        tx: tx.downgrade(),
        requeue_delay,
    };
    (Submitter { tx }, Queue { rx, dispatcher })
}

// === impl Submitter ===

impl Submitter {
    /// Submits a trigger and waits for its pass to finish.
    pub async fn submit(&self, trigger: Trigger) -> Result<Outcome, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Submission {
                trigger,
                reply: Some(reply),
            })
            .await
            .map_err(|_| QueueError::Closed)?;
        rx.await.map_err(|_| QueueError::Closed)
    }

    /// Enqueues a trigger without waiting. Passes that hit transient errors
    /// are requeued after a delay.
    pub fn enqueue(&self, trigger: Trigger) -> Result<(), QueueError> {
        self.tx
            .try_send(Submission {
                trigger,
                reply: None,
            })
            .map_err(|error| match error {
                mpsc::error::TrySendError::Full(_) => QueueError::Full,
                mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
            })
    }
}

// === impl Queue ===

impl Queue {
    pub async fn run(mut self, drain: drain::Watch) {
        let shutdown = drain.signaled();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => {
                    info!("Reconciliation queue shutting down");
                    return;
                }
                submission = self.rx.recv() => match submission {
                    Some(submission) => self.dispatcher.submit(submission),
                    None => return,
                },
            }
        }
    }
}

#[cfg(test)]
impl Queue {
    /// Takes the triggers waiting in the channel without running them.
    pub(crate) fn drain_pending(&mut self) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        while let Ok(Submission { trigger, .. }) = self.rx.try_recv() {
            triggers.push(trigger);
        }
        triggers
    }
}

// === impl Dispatcher ===

impl Dispatcher {
    fn submit(&self, Submission { trigger, reply }: Submission) {
        let start = time::Instant::now();
        match trigger {
            // Configuration passes are keyed by the pod that triggered them,
            // so they are dispatched in arrival order.
            Trigger::Config { namespace, name } => {
                let plan = Plan::config(namespace, name);
                self.dispatch(Job { plan, reply, start });
            }
            // Intents must be classified before their pod is known.
            trigger @ Trigger::Intent(_) => {
                let this = self.clone();
                tokio::spawn(
                    async move {
                        match this.reconciler.plan(trigger.clone()).await {
                            Ok(plan) => this.dispatch(Job { plan, reply, start }),
                            Err(error) => {
                                let outcome = Outcome::from(Err::<Completion, _>(error));
                                this.finish(trigger, reply, outcome, start);
                            }
                        }
                    }
                    .in_current_span(),
                );
            }
        }
    }

    fn dispatch(&self, job: Job) {
        let key = job.plan.key().clone();
        {
            let mut active = self.active.lock();
            if let Some(pending) = active.get_mut(&key) {
                debug!(%key, waiting = pending.len() + 1, "Pass queued behind active pass");
                pending.push_back(job);
                return;
            }
            active.insert(key.clone(), VecDeque::new());
        }

        let this = self.clone();
        tokio::spawn(
            async move {
                let mut next = Some(job);
                while let Some(Job { plan, reply, start }) = next.take() {
                    let trigger = plan.trigger().clone();
                    let outcome = this.reconciler.run(plan).await;
                    this.finish(trigger, reply, outcome, start);

                    let mut active = this.active.lock();
                    next = active.get_mut(&key).and_then(VecDeque::pop_front);
                    if next.is_none() {
                        active.remove(&key);
                    }
                }
            }
            .in_current_span(),
        );
    }

    fn finish(
        &self,
        trigger: Trigger,
        reply: Option<oneshot::Sender<Outcome>>,
        outcome: Outcome,
        start: time::Instant,
    ) {
        self.reconciler.record(&trigger, &outcome, start);
        if let Some(reply) = reply {
            if reply.send(outcome).is_err() {
                debug!("Submitter went away before the pass finished");
            }
            return;
        }

        if let Outcome::Requeue(error) = outcome {
            let Some(tx) = self.tx.upgrade() else {
                return;
            };
            let delay = self.requeue_delay;
            info!(%error, ?delay, "Requeueing pass");
            tokio::spawn(async move {
                time::sleep(delay).await;
                if tx.send(Submission { trigger, reply: None }).await.is_err() {
                    warn!("Queue closed before a pass could be requeued");
                }
            });
        }
    }
}
