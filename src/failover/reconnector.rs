//! Reconnect worker.
//!
//! Connection attempts run on their own task so dialing latency never holds
//! up the primary queue. The worker asks the primary queue for each
//! candidate, creates and connects a provider through the
//! [`ProviderFactory`](crate::ProviderFactory), and hands the connected
//! provider back. Between failed attempts it sleeps for the backoff delay.
//!
//! The worker owns the attempt counter and the current delay; the primary
//! queue resets them once a new connection has been fully recovered.

use tokio::sync::{mpsc, oneshot};

use crate::reconnect::Backoff;
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_trace,
    log_warn,
    ProviderError,
    ProviderFactoryPtr,
    ProviderPtr,
    ReconnectConfig,
    RemoteUri,
    Result,
};

use super::actor::Cmd;

pub(super) enum ReconnectCmd {
    /// Run one attempt cycle.
    Attempt { first_connection: bool },
    /// Recovery finished: back to zero attempts and the base delay.
    Reset,
}

pub(super) struct Reconnector {
    config: ReconnectConfig,
    factory: ProviderFactoryPtr,
    backoff: Backoff,
    cmd_rx: mpsc::UnboundedReceiver<ReconnectCmd>,
    primary: mpsc::UnboundedSender<Cmd>,
}

impl Reconnector {
    // ---

    pub fn new(
        config: ReconnectConfig,
        factory: ProviderFactoryPtr,
        cmd_rx: mpsc::UnboundedReceiver<ReconnectCmd>,
        primary: mpsc::UnboundedSender<Cmd>,
    ) -> Self {
        Self {
            config,
            factory,
            backoff: Backoff::default(),
            cmd_rx,
            primary,
        }
    }

    pub async fn run(mut self) {
        // ---
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                ReconnectCmd::Reset => self.backoff.reset(&self.config),
                ReconnectCmd::Attempt { first_connection } => {
                    self.attempt_cycle(first_connection).await
                }
            }
        }
    }

    /// Try candidates until one connects or the attempt limit is reached.
    async fn attempt_cycle(&mut self, first_connection: bool) {
        // ---
        let limit = self.config.attempt_limit(first_connection);

        if !self.config.initial_delay.is_zero() && self.backoff.attempts() == 0 {
            log_trace!(
                "delaying initial reconnect attempt by {:?}",
                self.config.initial_delay
            );
            tokio::time::sleep(self.config.initial_delay).await;
        }

        let mut failure = ProviderError::connection("reconnect attempt limit reached");

        loop {
            if self.backoff.limit_reached(limit) {
                self.exhausted(failure);
                return;
            }

            let attempt = self.backoff.record_attempt();

            let Some(target) = self.next_candidate().await else {
                // Primary queue is gone.
                return;
            };

            match target {
                Some(target) => {
                    log_debug!("connection attempt:[{attempt}] to: {target} in-progress");
                    match self.try_connect(&target).await {
                        Ok(provider) => {
                            let _ = self.primary.send(Cmd::Connected { provider });
                            return;
                        }
                        Err(error) => {
                            log_info!("connection attempt:[{attempt}] to: {target} failed");
                            failure = error;
                        }
                    }
                }
                None => {
                    log_debug!("connection attempt:[{attempt}] skipped: no remote endpoints");
                    failure = ProviderError::connection("no remote endpoints available");
                }
            }

            if self.backoff.limit_reached(limit) {
                self.exhausted(failure);
                return;
            }

            if self.backoff.should_warn(&self.config) {
                log_warn!("failed to connect after: {attempt} attempt(s) continuing to retry");
            }

            let delay = self.backoff.next_delay(&self.config);
            log_trace!("next reconnect attempt in {delay:?}");
            tokio::time::sleep(delay).await;
        }
    }

    fn exhausted(&self, failure: ProviderError) {
        // ---
        let attempts = self.backoff.attempts();
        log_error!("failed to connect after: {attempts} attempt(s)");

        let error = ProviderError::ReconnectExhausted {
            attempts,
            cause: failure.to_string(),
        };
        let _ = self.primary.send(Cmd::ReconnectExhausted { error });
    }

    /// Ask the primary queue for the next candidate. The outer `None` means
    /// the primary queue has stopped.
    async fn next_candidate(&self) -> Option<Option<RemoteUri>> {
        // ---
        let (reply, rx) = oneshot::channel();
        self.primary.send(Cmd::NextCandidate { reply }).ok()?;
        rx.await.ok()
    }

    async fn try_connect(&self, target: &RemoteUri) -> Result<ProviderPtr> {
        // ---
        let provider = self.factory.create(target)?;
        if let Err(error) = provider.connect().await {
            provider.close().await;
            return Err(error);
        }
        Ok(provider)
    }
}
