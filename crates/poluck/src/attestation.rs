//! Software stand-in for TEE reports and remote attestation.
//!
//! The enclave signs a [`Report`] with its report key. The host attestation
//! service checks that signature and wraps the report in an [`Attestation`],
//! signing the report together with a [`Quote`] naming the enclave key and
//! measurement. Verifiers trust a set of service keys and one measurement.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::crypto;
use crate::error::LuckError;
use crate::nonce::{self, Nonce};

/// What the enclave vouches for: the mined nonce and the luck drawn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub nonce: Vec<u8>,
    pub luck: f64,
}

impl Report {
    pub fn decode_nonce(&self) -> Result<Nonce, LuckError> {
        nonce::decode(&self.nonce)
    }
}

/// A report signed by the enclave's report key.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SignedReport {
    pub report: Report,
    pub enclave_key: [u8; 32],
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    pub enclave_key: [u8; 32],
    pub measurement: [u8; 32],
    pub service_key: [u8; 32],
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub report: Report,
    pub quote: Quote,
    /// Service signature over `bincode("poluck/attestation", report, quote)`.
    pub signature: Signature,
}

fn report_signing_message(report: &Report) -> Result<Vec<u8>, LuckError> {
    crypto::encode(&("poluck/report", report))
}

fn attestation_signing_message(report: &Report, quote: &Quote) -> Result<Vec<u8>, LuckError> {
    crypto::encode(&("poluck/attestation", report, quote))
}

pub fn sign_report(report: Report, key: &SigningKey) -> Result<SignedReport, LuckError> {
    let msg = report_signing_message(&report)?;
    Ok(SignedReport {
        signature: key.sign(&msg),
        enclave_key: key.verifying_key().to_bytes(),
        report,
    })
}

pub fn verify_report(signed: &SignedReport) -> Result<(), LuckError> {
    let key = VerifyingKey::from_bytes(&signed.enclave_key)
        .map_err(|e| LuckError::InvalidKey(e.to_string()))?;
    let msg = report_signing_message(&signed.report)?;
    key.verify(&msg, &signed.signature)
        .map_err(|_| LuckError::InvalidAttestation("report signature invalid".into()))
}

/// Host-side attestation service.
pub struct Attestor {
    key: SigningKey,
    measurement: [u8; 32],
}

impl Attestor {
    #[must_use]
    pub fn new(key: SigningKey) -> Self {
        Self {
            key,
            measurement: crypto::enclave_measurement(),
        }
    }

    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    #[must_use]
    pub const fn measurement(&self) -> [u8; 32] {
        self.measurement
    }

    /// Wrap an enclave report into a quote-backed attestation.
    pub fn attest(&self, signed: &SignedReport) -> Result<Attestation, LuckError> {
        verify_report(signed)?;

        let quote = Quote {
            enclave_key: signed.enclave_key,
            measurement: self.measurement,
            service_key: self.key.verifying_key().to_bytes(),
        };
        let msg = attestation_signing_message(&signed.report, &quote)?;

        Ok(Attestation {
            report: signed.report.clone(),
            signature: self.key.sign(&msg),
            quote,
        })
    }
}

/// The opaque attestation-validity check used by chain validation.
pub trait AttestationVerifier: Send + Sync {
    fn verify(&self, attestation: &Attestation) -> Result<(), LuckError>;
}

/// Accepts attestations issued by any of a fixed set of services for one measurement.
pub struct TrustedServices {
    services: Vec<VerifyingKey>,
    measurement: [u8; 32],
}

impl TrustedServices {
    #[must_use]
    pub fn new(services: Vec<VerifyingKey>) -> Self {
        Self {
            services,
            measurement: crypto::enclave_measurement(),
        }
    }

    #[must_use]
    pub fn for_attestor(attestor: &Attestor) -> Self {
        Self {
            services: vec![attestor.verifying_key()],
            measurement: attestor.measurement(),
        }
    }
}

impl AttestationVerifier for TrustedServices {
    fn verify(&self, attestation: &Attestation) -> Result<(), LuckError> {
        let quote = &attestation.quote;
        if quote.measurement != self.measurement {
            return Err(LuckError::InvalidAttestation(
                "enclave measurement mismatch".into(),
            ));
        }
        let service = self
            .services
            .iter()
            .find(|k| k.to_bytes() == quote.service_key)
            .ok_or_else(|| LuckError::InvalidAttestation("untrusted attestation service".into()))?;

        let msg = attestation_signing_message(&attestation.report, quote)?;
        service
            .verify(&msg, &attestation.signature)
            .map_err(|_| LuckError::InvalidAttestation("signature invalid".into()))
    }
}
