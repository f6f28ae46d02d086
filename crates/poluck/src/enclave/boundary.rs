use serde::{Deserialize, Serialize};

use crate::attestation::SignedReport;
use crate::crypto;
use crate::error::LuckError;
use crate::types::{Payload, PriorBlock, PriorPayload};

use super::{ResumeToken, RoundStateMachine, RoundStatus, Sleep};

/// A request crossing into the enclave.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnclaveCall {
    StartRound {
        head: PriorPayload,
    },
    Mine {
        payload: Payload,
        previous_block: PriorBlock,
        previous_payload: PriorPayload,
    },
    ResumeFromSleep {
        token: ResumeToken,
    },
    Status,
    AbandonRound,
    Reset,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EnclaveReply {
    Done,
    Sleep(Sleep),
    Report(SignedReport),
    Status(RoundStatus),
}

/// Byte-level entry point into an enclave. Requests are bincode-encoded
/// [`EnclaveCall`]s; replies are bincode-encoded `Result<EnclaveReply, LuckError>`.
pub struct Boundary<M: RoundStateMachine> {
    enclave: M,
}

impl<M: RoundStateMachine> Boundary<M> {
    pub const fn new(enclave: M) -> Self {
        Self { enclave }
    }

    /// Handle one serialized call. The outer error is only returned when the
    /// reply itself cannot be encoded.
    pub fn call(&mut self, request: &[u8]) -> Result<Vec<u8>, LuckError> {
        let result = self.dispatch(request);
        crypto::encode(&result)
    }

    fn dispatch(&mut self, request: &[u8]) -> Result<EnclaveReply, LuckError> {
        let call: EnclaveCall = crypto::decode(request)
            .map_err(|e| LuckError::InvalidPayload(format!("undecodable enclave call: {e}")))?;

        match call {
            EnclaveCall::StartRound { head } => {
                self.enclave.start_round(&head).map(|()| EnclaveReply::Done)
            }
            EnclaveCall::Mine {
                payload,
                previous_block,
                previous_payload,
            } => self
                .enclave
                .mine(&payload, &previous_block, &previous_payload)
                .map(EnclaveReply::Sleep),
            EnclaveCall::ResumeFromSleep { token } => self
                .enclave
                .resume_from_sleep(token)
                .map(EnclaveReply::Report),
            EnclaveCall::Status => self.enclave.status().map(EnclaveReply::Status),
            EnclaveCall::AbandonRound => self.enclave.abandon_round().map(|()| EnclaveReply::Done),
            EnclaveCall::Reset => self.enclave.reset().map(|()| EnclaveReply::Done),
        }
    }
}

/// Host-side proxy that speaks to an enclave only through serialized calls.
pub struct BoundaryClient<M: RoundStateMachine> {
    boundary: Boundary<M>,
}

impl<M: RoundStateMachine> BoundaryClient<M> {
    pub const fn new(enclave: M) -> Self {
        Self {
            boundary: Boundary::new(enclave),
        }
    }

    fn roundtrip(&mut self, call: &EnclaveCall) -> Result<EnclaveReply, LuckError> {
        let request = crypto::encode(call)?;
        let reply = self.boundary.call(&request)?;
        crypto::decode::<Result<EnclaveReply, LuckError>>(&reply)?
    }
}

fn unexpected(reply: &EnclaveReply) -> LuckError {
    LuckError::Serialization(format!("unexpected enclave reply {reply:?}"))
}

impl<M: RoundStateMachine> RoundStateMachine for BoundaryClient<M> {
    fn start_round(&mut self, head: &PriorPayload) -> Result<(), LuckError> {
        match self.roundtrip(&EnclaveCall::StartRound { head: head.clone() })? {
            EnclaveReply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn mine(
        &mut self,
        payload: &Payload,
        previous_block: &PriorBlock,
        previous_payload: &PriorPayload,
    ) -> Result<Sleep, LuckError> {
        let call = EnclaveCall::Mine {
            payload: payload.clone(),
            previous_block: previous_block.clone(),
            previous_payload: previous_payload.clone(),
        };
        match self.roundtrip(&call)? {
            EnclaveReply::Sleep(sleep) => Ok(sleep),
            other => Err(unexpected(&other)),
        }
    }

    fn resume_from_sleep(&mut self, token: ResumeToken) -> Result<SignedReport, LuckError> {
        match self.roundtrip(&EnclaveCall::ResumeFromSleep { token })? {
            EnclaveReply::Report(report) => Ok(report),
            other => Err(unexpected(&other)),
        }
    }

    fn status(&mut self) -> Result<RoundStatus, LuckError> {
        match self.roundtrip(&EnclaveCall::Status)? {
            EnclaveReply::Status(status) => Ok(status),
            other => Err(unexpected(&other)),
        }
    }

    fn abandon_round(&mut self) -> Result<(), LuckError> {
        match self.roundtrip(&EnclaveCall::AbandonRound)? {
            EnclaveReply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    fn reset(&mut self) -> Result<(), LuckError> {
        match self.roundtrip(&EnclaveCall::Reset)? {
            EnclaveReply::Done => Ok(()),
            other => Err(unexpected(&other)),
        }
    }
}
