//! The round state machine that runs inside the trusted boundary.
//!
//! A round goes `Idle -> RoundStarted -> Sleeping -> Idle`. `mine` refuses to
//! draw luck until a full round time has passed since `start_round`, and the
//! report only comes out of `resume_from_sleep` once the luck-dependent wait is
//! over and the monotonic counter is unchanged. The enclave never blocks; the
//! host does the waiting.

use std::fmt;
use std::time::Duration;

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};

use crate::attestation::{self, Report, SignedReport};
use crate::chain;
use crate::crypto;
use crate::error::LuckError;
use crate::nonce::{self, NONCE_SIZE, NONCE_VERSION};
use crate::platform::Platform;
use crate::types::{ObjectRef, Payload, PriorBlock, PriorPayload};

pub mod boundary;

pub use boundary::{Boundary, BoundaryClient, EnclaveCall, EnclaveReply};

/// Minimum round duration when none is configured.
pub const DEFAULT_ROUND_TIME: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundPhase {
    Idle,
    RoundStarted,
    Sleeping,
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::RoundStarted => "in a round",
            Self::Sleeping => "sleeping",
        })
    }
}

/// Opaque handle binding a `resume_from_sleep` call to the `mine` that issued it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResumeToken(u64);

/// How long the host must wait before resuming, and the token to resume with.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sleep {
    pub duration: Duration,
    pub token: ResumeToken,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoundStatus {
    Idle,
    /// `lineage` is the parent of the head payload the round was started on.
    RoundStarted { lineage: Option<ObjectRef> },
    Sleeping,
}

impl RoundStatus {
    #[must_use]
    pub const fn phase(&self) -> RoundPhase {
        match self {
            Self::Idle => RoundPhase::Idle,
            Self::RoundStarted { .. } => RoundPhase::RoundStarted,
            Self::Sleeping => RoundPhase::Sleeping,
        }
    }
}

/// The trusted entry points, callable directly or across the serialized boundary.
pub trait RoundStateMachine: Send {
    fn start_round(&mut self, head: &PriorPayload) -> Result<(), LuckError>;

    fn mine(
        &mut self,
        payload: &Payload,
        previous_block: &PriorBlock,
        previous_payload: &PriorPayload,
    ) -> Result<Sleep, LuckError>;

    fn resume_from_sleep(&mut self, token: ResumeToken) -> Result<SignedReport, LuckError>;

    fn status(&mut self) -> Result<RoundStatus, LuckError>;

    /// Drop a started round so another lineage can be raced. Never clears a sleep.
    fn abandon_round(&mut self) -> Result<(), LuckError>;

    /// Operator reset: return to `Idle` from any phase.
    fn reset(&mut self) -> Result<(), LuckError>;
}

struct Round {
    payload: PriorPayload,
    started_at: Duration,
    counter: u64,
}

struct Continuation {
    token: ResumeToken,
    nonce: [u8; NONCE_SIZE],
    luck: f64,
    expected_counter: u64,
    wake_at: Duration,
}

enum RoundState {
    Idle,
    RoundStarted(Round),
    Sleeping(Continuation),
}

impl RoundState {
    const fn phase(&self) -> RoundPhase {
        match self {
            Self::Idle => RoundPhase::Idle,
            Self::RoundStarted(_) => RoundPhase::RoundStarted,
            Self::Sleeping(_) => RoundPhase::Sleeping,
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

pub struct Enclave<P: Platform> {
    platform: P,
    state: RoundState,
    report_key: SigningKey,
    round_time: Duration,
    rng: Box<dyn RngCore + Send>,
    next_token: u64,
}

impl<P: Platform> Enclave<P> {
    #[must_use]
    pub fn new(platform: P, round_time: Duration) -> Self {
        Self {
            platform,
            state: RoundState::Idle,
            report_key: crypto::random_signing_key(),
            round_time,
            rng: Box::new(OsRng),
            next_token: 0,
        }
    }

    /// Replace the luck source. Production enclaves keep the OS CSPRNG.
    #[must_use]
    pub fn with_rng(mut self, rng: impl RngCore + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    #[must_use]
    pub fn report_key(&self) -> VerifyingKey {
        self.report_key.verifying_key()
    }

    #[must_use]
    pub const fn round_time(&self) -> Duration {
        self.round_time
    }

    #[must_use]
    pub const fn phase(&self) -> RoundPhase {
        self.state.phase()
    }
}

impl<P: Platform> RoundStateMachine for Enclave<P> {
    fn start_round(&mut self, head: &PriorPayload) -> Result<(), LuckError> {
        if !matches!(self.state, RoundState::Idle) {
            return Err(LuckError::invalid_state("start_round", self.state.phase()));
        }

        let started_at = self.platform.trusted_time();
        let counter = self.platform.increment_counter();
        tracing::debug!(lineage = ?head.lineage(), counter, "round started");

        self.state = RoundState::RoundStarted(Round {
            payload: head.clone(),
            started_at,
            counter,
        });
        Ok(())
    }

    fn mine(
        &mut self,
        payload: &Payload,
        previous_block: &PriorBlock,
        previous_payload: &PriorPayload,
    ) -> Result<Sleep, LuckError> {
        let RoundState::RoundStarted(round) = &self.state else {
            return Err(LuckError::invalid_state("mine", self.state.phase()));
        };

        if let PriorBlock::Block(block) = previous_block {
            chain::valid_block(block)?;
        }

        let previous_ref = previous_block.object_ref()?;
        if payload.parent() != previous_ref {
            return Err(LuckError::InvalidPayload(format!(
                "payload extends {}, not the previous block {previous_ref}",
                payload.parent()
            )));
        }

        let previous_payload_ref = previous_payload.object_ref()?;
        if previous_block.payload_ref() != previous_payload_ref {
            return Err(LuckError::InvalidBlock(format!(
                "previous block links payload {}, not {previous_payload_ref}",
                previous_block.payload_ref()
            )));
        }

        if previous_payload.lineage() != round.payload.lineage() {
            return Err(LuckError::InvalidPayload(
                "previous block does not share the round's parent".into(),
            ));
        }

        let now = self.platform.trusted_time();
        let due = round.started_at + self.round_time;
        if now < due {
            return Err(LuckError::RoundNotElapsed {
                remaining_ms: millis(due - now),
            });
        }
        let expected_counter = round.counter;

        let luck: f64 = self.rng.r#gen();
        let payload_hash = crypto::content_hash(payload)?;
        let nonce = nonce::encode(
            NONCE_VERSION,
            luck,
            &ObjectRef::Content(payload_hash).to_nonce_bytes(),
        )?;
        let duration = self.round_time.mul_f64(1.0 - luck);

        self.next_token += 1;
        let token = ResumeToken(self.next_token);
        self.state = RoundState::Sleeping(Continuation {
            token,
            nonce,
            luck,
            expected_counter,
            wake_at: now + duration,
        });

        tracing::debug!(luck, sleep_ms = millis(duration), "mined, sleeping");
        Ok(Sleep { duration, token })
    }

    fn resume_from_sleep(&mut self, token: ResumeToken) -> Result<SignedReport, LuckError> {
        let RoundState::Sleeping(continuation) = &self.state else {
            return Err(LuckError::invalid_state(
                "resume_from_sleep",
                self.state.phase(),
            ));
        };
        if continuation.token != token {
            return Err(LuckError::invalid_state(
                "resume_from_sleep with a stale token",
                RoundPhase::Sleeping,
            ));
        }

        let now = self.platform.trusted_time();
        if now < continuation.wake_at {
            return Err(LuckError::RoundNotElapsed {
                remaining_ms: millis(continuation.wake_at - now),
            });
        }

        let got = self.platform.read_counter();
        if got != continuation.expected_counter {
            tracing::error!(
                expected = continuation.expected_counter,
                got,
                "monotonic counter changed during sleep"
            );
            return Err(LuckError::CounterMismatch {
                expected: continuation.expected_counter,
                got,
            });
        }

        let report = Report {
            nonce: continuation.nonce.to_vec(),
            luck: continuation.luck,
        };
        let signed = attestation::sign_report(report, &self.report_key)?;
        self.state = RoundState::Idle;
        Ok(signed)
    }

    fn status(&mut self) -> Result<RoundStatus, LuckError> {
        Ok(match &self.state {
            RoundState::Idle => RoundStatus::Idle,
            RoundState::RoundStarted(round) => RoundStatus::RoundStarted {
                lineage: round.payload.lineage(),
            },
            RoundState::Sleeping(_) => RoundStatus::Sleeping,
        })
    }

    fn abandon_round(&mut self) -> Result<(), LuckError> {
        match self.state {
            RoundState::Sleeping(_) => Err(LuckError::invalid_state(
                "abandon_round",
                RoundPhase::Sleeping,
            )),
            _ => {
                self.state = RoundState::Idle;
                Ok(())
            }
        }
    }

    fn reset(&mut self) -> Result<(), LuckError> {
        if !matches!(self.state, RoundState::Idle) {
            tracing::warn!(phase = %self.state.phase(), "enclave reset by operator");
        }
        self.state = RoundState::Idle;
        Ok(())
    }
}
