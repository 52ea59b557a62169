// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Registration lifecycle.
//!
//! A single background worker drives every master registration and
//! unregistration for the node. Failed calls are retried with exponential
//! backoff (base 1 s, doubling, capped at 30 s) until shutdown; every attempt
//! additionally signals the registrant's listeners, one scheduling unit per
//! (listener, event).
//!
//! Shutdown drops the submission channel: the worker drains jobs already
//! queued (the final unregisters), abandons pending retries, and exits.

use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::config::retry_delay;
use crate::master::MasterResult;
use crate::sched::ListenerSet;
use std::sync::Arc;

/// Receives master registration lifecycle events for one registrant.
///
/// Callbacks run on the node's worker pool; per-listener order is FIFO.
pub trait RegistrationListener: Send + Sync {
    /// The master acknowledged the registration.
    fn on_registration_success(&self) {}
    /// A registration attempt failed; a retry is scheduled.
    fn on_registration_failure(&self) {}
    /// The master acknowledged the unregistration.
    fn on_unregistration_success(&self) {}
    /// An unregistration attempt failed; a retry is scheduled.
    fn on_unregistration_failure(&self) {}
}

/// Whether a job adds or removes a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RegistrationAction {
    Register,
    Unregister,
}

/// One unit of registration work.
pub(crate) struct RegistrationJob {
    /// Human-readable description for logs.
    pub label: String,
    pub action: RegistrationAction,
    /// Listeners of the registrant this job belongs to.
    pub listeners: Arc<ListenerSet<dyn RegistrationListener>>,
    /// The master call. Captures its own client handle and parameters;
    /// invoked once per attempt.
    pub call: Box<dyn Fn() -> MasterResult<()> + Send>,
}

struct PendingRetry {
    due: Instant,
    attempt: u32,
    job: RegistrationJob,
}

/// Handle to the registration worker.
pub(crate) struct Registrar {
    sender: Mutex<Option<Sender<RegistrationJob>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Registrar {
    /// Start the worker thread.
    pub fn start() -> std::io::Result<Self> {
        let (sender, receiver) = unbounded::<RegistrationJob>();

        let worker = thread::Builder::new()
            .name("registrar".to_string())
            .spawn(move || {
                let mut retries: Vec<PendingRetry> = Vec::new();
                loop {
                    let now = Instant::now();
                    if let Some(index) = retries.iter().position(|p| p.due <= now) {
                        let pending = retries.swap_remove(index);
                        execute(pending.job, pending.attempt, &mut retries);
                        continue;
                    }

                    let next_due = retries.iter().map(|p| p.due).min();
                    let received = match next_due {
                        Some(due) => receiver.recv_timeout(due.saturating_duration_since(now)),
                        None => receiver.recv().map_err(|_| RecvTimeoutError::Disconnected),
                    };
                    match received {
                        Ok(job) => execute(job, 1, &mut retries),
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => {
                            // Shutdown: queued jobs were drained by recv
                            // above; anything still awaiting retry is
                            // abandoned.
                            if !retries.is_empty() {
                                debug!("registrar exiting with {} retries pending", retries.len());
                            }
                            return;
                        }
                    }
                }
            })?;

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Queue a job. Silently dropped after shutdown.
    pub fn submit(&self, job: RegistrationJob) {
        if let Some(sender) = self.sender.lock().as_ref() {
            let _ = sender.send(job);
        }
    }

    /// Close the submission channel, let queued jobs finish, and join.
    pub fn shutdown(&self) {
        let sender = self.sender.lock().take();
        drop(sender);
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

fn execute(job: RegistrationJob, attempt: u32, retries: &mut Vec<PendingRetry>) {
    match (job.call)() {
        Ok(()) => {
            debug!("{} succeeded (attempt {})", job.label, attempt);
            match job.action {
                RegistrationAction::Register => {
                    job.listeners.signal(|l| l.on_registration_success());
                }
                RegistrationAction::Unregister => {
                    job.listeners.signal(|l| l.on_unregistration_success());
                }
            }
        }
        Err(e) => {
            let delay = retry_delay(attempt);
            warn!(
                "{} failed (attempt {}): {}; retrying in {:?}",
                job.label, attempt, e, delay
            );
            match job.action {
                RegistrationAction::Register => {
                    job.listeners.signal(|l| l.on_registration_failure());
                }
                RegistrationAction::Unregister => {
                    job.listeners.signal(|l| l.on_unregistration_failure());
                }
            }
            retries.push(PendingRetry {
                due: Instant::now() + delay,
                attempt: attempt + 1,
                job,
            });
        }
    }
}
