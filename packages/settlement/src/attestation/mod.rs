//! Attestation proof lifecycle
//!
//! A proof is requested at most once per record: the ticket (voting round +
//! request bytes) is handed to the caller for persistence before any
//! polling, and a stored proof is always reused instead of re-attesting.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::{ClientError, Result, SettlementError};
use crate::metrics;

pub mod fdc;
pub mod types;

pub use fdc::{FdcOracle, FdcSubmitter};
pub use types::{check_attestation, AttestationProof, AttestationTicket, ProofExpectation};

#[async_trait]
pub trait AttestationOracle: Send + Sync {
    /// Ask the oracle to attest the payment `tx_hash`. Safe to repeat.
    async fn request(&self, tx_hash: &str) -> Result<AttestationTicket, ClientError>;

    /// The proof for `ticket`, or `None` while its round is not finalized.
    async fn fetch(&self, ticket: &AttestationTicket)
        -> Result<Option<AttestationProof>, ClientError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofOutcome {
    /// `fresh` is false when a stored proof was reused
    Ready { proof: AttestationProof, fresh: bool },
    /// The round did not finalize within the polling budget
    NotFinalized(AttestationTicket),
}

pub struct ProofService {
    oracle: Arc<dyn AttestationOracle>,
    poll_interval: Duration,
    max_polls: u32,
}

impl ProofService {
    pub fn new(oracle: Arc<dyn AttestationOracle>, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            oracle,
            poll_interval,
            max_polls,
        }
    }

    /// Reuse a stored proof, else poll a stored ticket, else request a new
    /// attestation. A new ticket is passed to `persist_ticket` and only
    /// polled once that succeeds.
    pub async fn obtain<F, Fut>(
        &self,
        existing_ticket: Option<AttestationTicket>,
        existing_proof: Option<AttestationProof>,
        tx_hash: &str,
        entity: &str,
        persist_ticket: F,
    ) -> Result<ProofOutcome>
    where
        F: FnOnce(AttestationTicket) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if let Some(proof) = existing_proof {
            debug!(tx_hash = %tx_hash, "Reusing stored attestation proof");
            return Ok(ProofOutcome::Ready { proof, fresh: false });
        }

        let started = Instant::now();
        let ticket = match existing_ticket {
            Some(ticket) => {
                debug!(tx_hash = %tx_hash, voting_round = ticket.voting_round, "Resuming attestation ticket");
                ticket
            }
            None => {
                let ticket = self.oracle.request(tx_hash).await.map_err(|e| {
                    metrics::record_proof_request(false);
                    metrics::record_external_error("fdc");
                    SettlementError::external("fdc", e)
                })?;
                metrics::record_proof_request(true);
                info!(
                    tx_hash = %tx_hash,
                    voting_round = ticket.voting_round,
                    "Attestation requested"
                );
                persist_ticket(ticket.clone()).await?;
                ticket
            }
        };

        match self.poll(&ticket).await? {
            Some(proof) => {
                metrics::record_proof_latency(entity, started.elapsed().as_secs_f64());
                Ok(ProofOutcome::Ready { proof, fresh: true })
            }
            None => Ok(ProofOutcome::NotFinalized(ticket)),
        }
    }

    async fn poll(&self, ticket: &AttestationTicket) -> Result<Option<AttestationProof>> {
        for attempt in 1..=self.max_polls {
            match self.oracle.fetch(ticket).await {
                Ok(Some(proof)) => {
                    info!(voting_round = ticket.voting_round, attempt, "Attestation proof available");
                    return Ok(Some(proof));
                }
                Ok(None) => {
                    debug!(voting_round = ticket.voting_round, attempt, "Voting round not finalized yet");
                }
                Err(e) => {
                    metrics::record_external_error("da_layer");
                    warn!(voting_round = ticket.voting_round, attempt, error = %e, "Proof fetch failed");
                }
            }
            if attempt < self.max_polls {
                tokio::time::sleep(self.poll_interval).await;
            }
        }
        Ok(None)
    }
}
