//! Batch dispatch with rate-limit resilience.
//!
//! [`BatchDispatcher`] turns an ordered list of mapped payloads into
//! destination entities: it partitions the input into fixed-size chunks,
//! issues one create call per chunk (users go through the destination's
//! batch endpoint; roles and tenants are created per record within the
//! chunk), retries rate-limited chunks with escalating backoff, books every
//! record's outcome exactly once, and appends confirmed IDs to the
//! [`IdMap`].
//!
//! Chunks are processed sequentially. Migrations are one-shot, bounded-size
//! operations; sequential dispatch keeps rate-limit accounting and
//! input-order-to-IdMap determinism simple. Cancellation is honored between
//! chunks, never mid-call, so an ambiguous create (request sent, response
//! lost) cannot be blindly retried on the next run.

use tracing::{debug, info, warn};

use crate::destination::{
    BatchCreateResponse, CreateOutcome, Destination, RolePayload, TenantPayload, UserPayload,
};
use crate::engine::CancelToken;
use crate::errors::{DestinationError, MigrationError};
use crate::models::{BatchResult, EntityKind, IdMap, RecordOutcome, RecordStatus};
use crate::report::MigrationReport;
use crate::retry::{with_retry, RetryPolicy, Sleeper};

// ---------------------------------------------------------------------------
// Chunk state machine
// ---------------------------------------------------------------------------

/// States a chunk moves through while being dispatched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    Pending,
    InFlight,
    BackoffWait,
    Succeeded,
    Exhausted,
}

impl std::fmt::Display for ChunkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::InFlight => write!(f, "in_flight"),
            Self::BackoffWait => write!(f, "backoff_wait"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Why a whole chunk produced no per-record response.
enum ChunkFailure {
    /// Rate-limit retries ran out; every record fails with a rate-limit
    /// reason and the run continues with the next chunk.
    Exhausted { attempts: u32 },
    /// A non-retryable whole-call error (outage, auth, transport).
    Fatal(DestinationError),
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// Dispatches mapped payloads to the destination in resilient batches.
pub struct BatchDispatcher<'a, D, S> {
    dest: &'a D,
    batch_size: usize,
    policy: RetryPolicy,
    sleeper: S,
}

impl<'a, D: Destination, S: Sleeper> BatchDispatcher<'a, D, S> {
    pub fn new(dest: &'a D, batch_size: usize, policy: RetryPolicy, sleeper: S) -> Self {
        Self {
            dest,
            // Guarded by config validation too; a zero here would loop forever.
            batch_size: batch_size.max(1),
            policy,
            sleeper,
        }
    }

    /// Number of chunks a given input length produces.
    pub fn chunk_count(&self, records: usize) -> usize {
        records.div_ceil(self.batch_size)
    }

    // -----------------------------------------------------------------------
    // Users
    // -----------------------------------------------------------------------

    /// Dispatch user payloads through the destination's batch endpoint.
    ///
    /// After this returns, the IdMap has an entry for every record that
    /// ended created-or-merged, and the report accounts for every input
    /// record exactly once.
    pub async fn dispatch_users(
        &self,
        payloads: &[UserPayload],
        id_map: &mut IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<BatchResult, MigrationError> {
        let total_chunks = self.chunk_count(payloads.len());
        info!(
            records = payloads.len(),
            batch_size = self.batch_size,
            chunks = total_chunks,
            "dispatching users"
        );

        let mut result = BatchResult::default();
        for (chunk_no, chunk) in payloads.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                warn!(chunk = chunk_no, "cancelled before chunk dispatch");
                return Err(MigrationError::Cancelled);
            }
            for _ in chunk {
                report.record_attempt(EntityKind::User);
            }

            let outcomes = match self.send_chunk(chunk_no, total_chunks, chunk).await {
                Ok(response) => self.resolve_user_outcomes(chunk, response).await,
                Err(ChunkFailure::Exhausted { attempts }) => chunk
                    .iter()
                    .map(|p| RecordOutcome {
                        source_id: p.source_user_id.clone(),
                        status: RecordStatus::Failed {
                            reason: format!("rate limit exceeded after {} attempts", attempts),
                        },
                    })
                    .collect(),
                Err(ChunkFailure::Fatal(err)) => {
                    warn!(chunk = chunk_no, %err, "chunk failed, continuing with next");
                    chunk
                        .iter()
                        .map(|p| RecordOutcome {
                            source_id: p.source_user_id.clone(),
                            status: RecordStatus::Failed {
                                reason: err.to_string(),
                            },
                        })
                        .collect()
                }
            };

            for outcome in outcomes {
                if let Some(id) = outcome.status.destination_id() {
                    id_map.insert(EntityKind::User, &outcome.source_id, id);
                }
                report.record_outcome(EntityKind::User, &outcome);
                result.outcomes.push(outcome);
            }
        }

        Ok(result)
    }

    /// One batch-create call with the per-chunk retry state machine.
    async fn send_chunk(
        &self,
        chunk_no: usize,
        total_chunks: usize,
        chunk: &[UserPayload],
    ) -> Result<BatchCreateResponse, ChunkFailure> {
        let mut state = ChunkState::Pending;
        debug!(chunk = chunk_no, total_chunks, size = chunk.len(), state = %state, "chunk queued");

        let mut attempts = 0u32;
        loop {
            state = ChunkState::InFlight;
            attempts += 1;
            debug!(chunk = chunk_no, attempt = attempts, state = %state, "sending chunk");

            match self.dest.create_users_batch(chunk).await {
                Ok(response) => {
                    state = ChunkState::Succeeded;
                    debug!(chunk = chunk_no, attempt = attempts, state = %state, "chunk accepted");
                    return Ok(response);
                }
                Err(DestinationError::RateLimited { retry_after })
                    if attempts < self.policy.max_attempts =>
                {
                    state = ChunkState::BackoffWait;
                    let delay = self.policy.delay_for(attempts - 1, retry_after);
                    warn!(
                        chunk = chunk_no,
                        attempt = attempts,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        state = %state,
                        "chunk rate limited, backing off"
                    );
                    self.sleeper.sleep(delay).await;
                }
                Err(DestinationError::RateLimited { .. }) => {
                    state = ChunkState::Exhausted;
                    warn!(chunk = chunk_no, attempts, state = %state, "retry ceiling exhausted");
                    return Err(ChunkFailure::Exhausted { attempts });
                }
                Err(other) => return Err(ChunkFailure::Fatal(other)),
            }
        }
    }

    /// Turn per-record create outcomes into final record statuses,
    /// resolving user conflicts into merges by email lookup.
    async fn resolve_user_outcomes(
        &self,
        chunk: &[UserPayload],
        response: BatchCreateResponse,
    ) -> Vec<RecordOutcome> {
        let mut outcomes = Vec::with_capacity(chunk.len());
        for (payload, create) in chunk.iter().zip(response.outcomes) {
            let status = match create {
                CreateOutcome::Created { id } => RecordStatus::Created { destination_id: id },
                CreateOutcome::AlreadyExists { id: Some(id) } => {
                    RecordStatus::Merged { destination_id: id }
                }
                CreateOutcome::AlreadyExists { id: None } => {
                    self.merge_by_email(payload).await
                }
                CreateOutcome::Rejected { reason } => RecordStatus::Failed { reason },
            };
            if let RecordStatus::Merged { destination_id } = &status {
                info!(
                    source_id = %payload.source_user_id,
                    destination_id = %destination_id,
                    "merged with existing destination user"
                );
            }
            outcomes.push(RecordOutcome {
                source_id: payload.source_user_id.clone(),
                status,
            });
        }
        outcomes
    }

    /// Resolve a duplicate-email conflict into a merge: adopt the existing
    /// destination user's ID so IdMap coverage stays complete on re-runs.
    async fn merge_by_email(&self, payload: &UserPayload) -> RecordStatus {
        let lookup = with_retry(&self.policy, &self.sleeper, "find user by email", || {
            self.dest.find_user_by_email(&payload.email)
        })
        .await;
        match lookup {
            Ok(Some(id)) => RecordStatus::Merged { destination_id: id },
            Ok(None) => RecordStatus::Failed {
                reason: "conflicting user not found by email".into(),
            },
            Err(err) => RecordStatus::Failed {
                reason: format!("merge lookup failed: {}", err),
            },
        }
    }

    // -----------------------------------------------------------------------
    // Roles and tenants
    // -----------------------------------------------------------------------

    /// Dispatch role payloads. The destination creates roles one at a time,
    /// so records are created individually within each chunk; chunking still
    /// bounds progress reporting and cancellation granularity.
    pub async fn dispatch_roles(
        &self,
        payloads: &'a [RolePayload],
        id_map: &mut IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<BatchResult, MigrationError> {
        info!(records = payloads.len(), "dispatching roles");
        self.dispatch_singles(
            EntityKind::Role,
            payloads,
            |p| p.source_id.clone(),
            |p| p.name.clone(),
            |p| self.dest.create_role(p),
            id_map,
            report,
            cancel,
        )
        .await
    }

    /// Dispatch tenant payloads; same per-record shape as roles.
    pub async fn dispatch_tenants(
        &self,
        payloads: &'a [TenantPayload],
        id_map: &mut IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<BatchResult, MigrationError> {
        info!(records = payloads.len(), "dispatching tenants");
        self.dispatch_singles(
            EntityKind::Tenant,
            payloads,
            |p| p.source_id.clone(),
            |p| p.tenant_id.clone(),
            |p| self.dest.create_tenant(p),
            id_map,
            report,
            cancel,
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_singles<P, F, Fut>(
        &self,
        kind: EntityKind,
        payloads: &'a [P],
        source_id: impl Fn(&P) -> String,
        natural_id: impl Fn(&P) -> String,
        create: F,
        id_map: &mut IdMap,
        report: &mut MigrationReport,
        cancel: &CancelToken,
    ) -> Result<BatchResult, MigrationError>
    where
        F: Fn(&'a P) -> Fut,
        Fut: std::future::Future<Output = Result<String, DestinationError>>,
    {
        let mut result = BatchResult::default();
        for (chunk_no, chunk) in payloads.chunks(self.batch_size).enumerate() {
            if cancel.is_cancelled() {
                warn!(%kind, chunk = chunk_no, "cancelled before chunk dispatch");
                return Err(MigrationError::Cancelled);
            }

            for payload in chunk {
                report.record_attempt(kind);
                let created = with_retry(&self.policy, &self.sleeper, "create record", || {
                    create(payload)
                })
                .await;

                let status = match created {
                    Ok(id) => RecordStatus::Created { destination_id: id },
                    Err(DestinationError::Conflict { existing_id }) => {
                        // The natural key doubles as the destination ID for
                        // name-addressed kinds, so a bare conflict still merges.
                        let destination_id = existing_id.unwrap_or_else(|| natural_id(payload));
                        info!(%kind, destination_id = %destination_id, "merged with existing entity");
                        RecordStatus::Merged { destination_id }
                    }
                    Err(DestinationError::RateLimited { .. }) => RecordStatus::Failed {
                        reason: format!(
                            "rate limit exceeded after {} attempts",
                            self.policy.max_attempts
                        ),
                    },
                    Err(err) => RecordStatus::Failed {
                        reason: err.to_string(),
                    },
                };

                let outcome = RecordOutcome {
                    source_id: source_id(payload),
                    status,
                };
                if let Some(id) = outcome.status.destination_id() {
                    id_map.insert(kind, &outcome.source_id, id);
                }
                report.record_outcome(kind, &outcome);
                result.outcomes.push(outcome);
            }
        }
        Ok(result)
    }
}
