//! Trust negotiation (agreement protocol).
//!
//! A standing host accepts unsolicited requests to create brand-new
//! rooms. The remote drives two exchanges: an expectations query (which
//! may challenge the host's identity and receives a fresh challenge for
//! the remote in return) and a room request carrying the acceptance. A
//! rejected negotiation is a structured `{ ok: false, reason }`, never an
//! error, and never creates a room; only malformed integrations are
//! reported as errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use ed25519_dalek::Signature;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use parley_shared::{verify_signature, Identity, WriterKey};

use crate::error::RoomError;
use crate::registry::{RoomOptions, RoomRegistry};

/// Per-exchange transport context: who is talking to us.
#[derive(Debug, Clone)]
pub struct NegotiationContext {
    pub remote_key: WriterKey,
}

/// The remote's opening query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExpectationsQuery {
    /// Challenge the remote wants the host to sign, proving the host's
    /// claimed identity.
    #[serde(default)]
    pub challenge_text: Option<String>,
}

/// What the host expects before it will create a room.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Expectations {
    /// Whether the acceptance must carry a `whoami` claim.
    pub requires_whoami: bool,
    /// Fresh single-use challenge issued to the remote's key.
    pub challenge_text: Option<String>,
    /// The host's signed answer to the remote's challenge.
    pub host_claim: Option<IdentityClaim>,
}

/// How an identity claim is backed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClaimKind {
    /// Backed by an external identity provider: challenge-response signed
    /// with the provider credential, verified through the identity seam.
    Provider,
    /// Asserted by the claimant alone; always treated as unverified.
    SelfAsserted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub kind: ClaimKind,
    /// The claimed identity, e.g. a provider handle.
    pub identity: String,
    /// The claimed signing key.
    pub public_key: WriterKey,
    pub challenge_response: Option<ChallengeResponse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub text: String,
    pub signature: Vec<u8>,
}

/// The remote's acceptance of the expectations.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Acceptance {
    #[serde(default)]
    pub whoami: Option<IdentityClaim>,
    /// Opaque caller-level details, passed to the validation hook.
    #[serde(default)]
    pub details: serde_json::Value,
}

/// The verified (or unverified) identity handed to the validation hook.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantDetails {
    pub identity: String,
    pub public_key: WriterKey,
    pub verified: bool,
}

/// Decision returned by the caller-supplied validation hook.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accept,
    Reject(String),
}

/// Result of a room request: `{ ok: true, invite }` or
/// `{ ok: false, reason }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NegotiationOutcome {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub invite: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl NegotiationOutcome {
    fn accepted(invite: String) -> Self {
        Self {
            ok: true,
            invite: Some(invite),
            reason: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            invite: None,
            reason: Some(reason.into()),
        }
    }
}

/// External collaborator verifying provider claims (signature and proof
/// chain). Failures resolve to `false` (unverified), never to an error;
/// policy consequences belong to the validation hook.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, claim: &IdentityClaim) -> bool;
}

/// Default verifier: checks the challenge-response signature against the
/// claimed key.
pub struct Ed25519Verifier;

#[async_trait]
impl IdentityVerifier for Ed25519Verifier {
    async fn verify(&self, claim: &IdentityClaim) -> bool {
        let Some(response) = claim.challenge_response.as_ref() else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&response.signature) else {
            return false;
        };
        verify_signature(&claim.public_key, response.text.as_bytes(), &signature).is_ok()
    }
}

/// The host's provider credential for answering remote challenges.
pub struct HostCredential {
    /// The identity the host claims, e.g. a provider handle.
    pub name: String,
    pub identity: Identity,
}

pub struct NegotiatorConfig {
    /// Require an identity claim in every acceptance.
    pub require_whoami: bool,
    pub host_credential: Option<HostCredential>,
}

pub type ValidationHook = Box<dyn Fn(&ParticipantDetails, &Acceptance) -> Verdict + Send + Sync>;

/// Host-side negotiator for unsolicited room requests.
pub struct Negotiator {
    registry: Arc<RoomRegistry>,
    config: NegotiatorConfig,
    verifier: Arc<dyn IdentityVerifier>,
    validate: ValidationHook,
    /// Pending challenge per remote key; single-use, last-write-wins.
    challenges: Mutex<HashMap<WriterKey, String>>,
}

impl Negotiator {
    pub fn new(registry: Arc<RoomRegistry>, config: NegotiatorConfig) -> Self {
        Self::with_verifier(registry, config, Arc::new(Ed25519Verifier))
    }

    pub fn with_verifier(
        registry: Arc<RoomRegistry>,
        config: NegotiatorConfig,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        Self {
            registry,
            config,
            verifier,
            validate: Box::new(|_, _| Verdict::Accept),
            challenges: Mutex::new(HashMap::new()),
        }
    }

    /// Install the caller's validation hook, consulted with the verified
    /// participant details and the raw acceptance.
    pub fn set_validation(&mut self, hook: ValidationHook) {
        self.validate = hook;
    }

    /// Handle an expectations query. Signs the remote's challenge with the
    /// host credential when present, and issues a fresh challenge to the
    /// remote's key when identity proof is required. Reissuing overwrites
    /// any pending challenge for the same key.
    pub fn room_expectations(
        &self,
        query: &ExpectationsQuery,
        context: &NegotiationContext,
    ) -> Expectations {
        let host_claim = match (&query.challenge_text, &self.config.host_credential) {
            (Some(text), Some(credential)) => {
                let signature = credential.identity.sign(text.as_bytes());
                Some(IdentityClaim {
                    kind: ClaimKind::Provider,
                    identity: credential.name.clone(),
                    public_key: credential.identity.writer_key(),
                    challenge_response: Some(ChallengeResponse {
                        text: text.clone(),
                        signature: signature.to_bytes().to_vec(),
                    }),
                })
            }
            _ => None,
        };

        let challenge_text = if self.config.require_whoami {
            let text = Uuid::new_v4().to_string();
            self.lock_challenges()
                .insert(context.remote_key, text.clone());
            debug!(remote = %context.remote_key, "Issued identity challenge");
            Some(text)
        } else {
            None
        };

        Expectations {
            requires_whoami: self.config.require_whoami,
            challenge_text,
            host_claim,
        }
    }

    /// Handle a room request. On acceptance, creates a brand-new ready
    /// room through the registry and returns its invite.
    pub async fn new_room(
        &self,
        acceptance: &Acceptance,
        context: &NegotiationContext,
    ) -> Result<NegotiationOutcome, RoomError> {
        let details = match &acceptance.whoami {
            None if self.config.require_whoami => {
                return Ok(NegotiationOutcome::rejected("identity claim required"));
            }
            None => ParticipantDetails {
                identity: String::new(),
                public_key: context.remote_key,
                verified: false,
            },
            Some(claim) => match self.inspect_claim(claim, context).await? {
                Ok(details) => details,
                Err(outcome) => return Ok(outcome),
            },
        };

        match (self.validate)(&details, acceptance) {
            Verdict::Reject(reason) => {
                debug!(remote = %context.remote_key, reason, "Negotiation rejected by policy");
                Ok(NegotiationOutcome::rejected(reason))
            }
            Verdict::Accept => {
                let session = self.registry.create_room(RoomOptions::default()).await?;
                let invite = session
                    .ready()
                    .await?
                    .ok_or(RoomError::MissingInvite)?;
                info!(
                    room = %session.id(),
                    remote = %context.remote_key,
                    "Negotiation accepted, room created"
                );
                Ok(NegotiationOutcome::accepted(invite))
            }
        }
    }

    /// Check a claim against the pending challenge and the identity seam.
    /// Returns the participant details, or the structured rejection.
    async fn inspect_claim(
        &self,
        claim: &IdentityClaim,
        context: &NegotiationContext,
    ) -> Result<Result<ParticipantDetails, NegotiationOutcome>, RoomError> {
        match claim.kind {
            ClaimKind::SelfAsserted => Ok(Ok(ParticipantDetails {
                identity: claim.identity.clone(),
                public_key: claim.public_key,
                verified: false,
            })),
            ClaimKind::Provider => {
                let response = claim.challenge_response.as_ref().ok_or(
                    RoomError::MalformedClaim("provider claim is missing a challenge response"),
                )?;
                // Checked and consumed under one guard: concurrent
                // acceptances for the same key race for a single nonce.
                let rejection = {
                    let mut challenges = self.lock_challenges();
                    match challenges.get(&context.remote_key) {
                        None => Some("no challenge issued for this key"),
                        Some(text) if *text != response.text => {
                            Some("challenge text does not match the one issued")
                        }
                        Some(_) => {
                            challenges.remove(&context.remote_key);
                            None
                        }
                    }
                };
                if let Some(reason) = rejection {
                    return Ok(Err(NegotiationOutcome::rejected(reason)));
                }
                let verified = self.verifier.verify(claim).await;
                Ok(Ok(ParticipantDetails {
                    identity: claim.identity.clone(),
                    public_key: claim.public_key,
                    verified,
                }))
            }
        }
    }

    fn lock_challenges(&self) -> MutexGuard<'_, HashMap<WriterKey, String>> {
        self.challenges
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
