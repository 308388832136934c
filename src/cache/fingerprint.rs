//! Request fingerprinting.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;

use crate::registry::Capability;
use crate::router::{GenerationRequest, Role, SamplingParams};

/// Stable digest of everything that determines a request's answer.
///
/// Two requests share a fingerprint exactly when their normalized messages,
/// required capability, and sampling parameters match. Normalization trims
/// each message and folds CRLF line endings to LF. Routing hints
/// (`model_override`, caps, TTL, budget mode) are not part of identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

#[derive(Serialize)]
struct Canonical<'a> {
    messages: Vec<(Role, String)>,
    capability: Capability,
    sampling: &'a SamplingParams,
}

impl Fingerprint {
    pub fn of(request: &GenerationRequest) -> Self {
        let canonical = Canonical {
            messages: request
                .messages
                .iter()
                .map(|m| (m.role, normalize(&m.content)))
                .collect(),
            capability: request.required_capability,
            sampling: &request.sampling,
        };
        // Serializing plain structs, strings and numbers cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Leading digest bits, used to spread keys across cache segments.
    pub(crate) fn shard_hint(&self) -> usize {
        self.0
            .get(..8)
            .and_then(|prefix| u32::from_str_radix(prefix, 16).ok())
            .unwrap_or(0) as usize
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix is enough to correlate log lines.
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n").trim().to_string()
}
