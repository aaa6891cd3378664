//! Classified UDS responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{service_id, NegativeResponseCode, NrcClass, UdsRequest};

const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Positive response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositiveResponse {
    /// Request service ID (not the +0x40 response ID)
    pub service: u8,
    /// Everything after the response service ID, echo included
    #[serde(with = "crate::serde_hex")]
    pub data: Vec<u8>,
    /// Length of the sub-function / identifier echo at the start of `data`
    pub echo_len: usize,
}

impl PositiveResponse {
    /// The data record after the echo
    pub fn record(&self) -> &[u8] {
        self.data.get(self.echo_len..).unwrap_or_default()
    }
}

/// Exactly one of the four ways a request can end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UdsOutcome {
    Positive(PositiveResponse),
    Negative {
        service: u8,
        nrc: NegativeResponseCode,
    },
    NoResponse,
    MalformedFrame {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdsResponse {
    pub outcome: UdsOutcome,
    #[serde(with = "crate::serde_hex")]
    pub raw: Vec<u8>,
    pub received_at: DateTime<Utc>,
}

impl UdsResponse {
    /// Classify the bytes received for `request`
    pub fn classify(request: &UdsRequest, bytes: &[u8]) -> Self {
        let outcome = classify_outcome(request, bytes);
        Self {
            outcome,
            raw: bytes.to_vec(),
            received_at: Utc::now(),
        }
    }

    pub fn no_response() -> Self {
        Self {
            outcome: UdsOutcome::NoResponse,
            raw: Vec::new(),
            received_at: Utc::now(),
        }
    }

    pub fn malformed(reason: impl Into<String>, raw: Vec<u8>) -> Self {
        Self {
            outcome: UdsOutcome::MalformedFrame {
                reason: reason.into(),
            },
            raw,
            received_at: Utc::now(),
        }
    }

    pub fn positive(&self) -> Option<&PositiveResponse> {
        match &self.outcome {
            UdsOutcome::Positive(positive) => Some(positive),
            _ => None,
        }
    }

    pub fn nrc(&self) -> Option<NegativeResponseCode> {
        match self.outcome {
            UdsOutcome::Negative { nrc, .. } => Some(nrc),
            _ => None,
        }
    }

    pub fn nrc_class(&self) -> Option<NrcClass> {
        self.nrc().map(|nrc| nrc.class())
    }

    pub fn is_positive(&self) -> bool {
        matches!(self.outcome, UdsOutcome::Positive(_))
    }

    pub fn is_no_response(&self) -> bool {
        matches!(self.outcome, UdsOutcome::NoResponse)
    }

    /// Any well-formed answer, positive or negative, proves the module is there
    pub fn confirms_presence(&self) -> bool {
        matches!(
            self.outcome,
            UdsOutcome::Positive(_) | UdsOutcome::Negative { .. }
        )
    }

    pub fn is_response_pending(&self) -> bool {
        self.nrc() == Some(NegativeResponseCode::ResponsePending)
    }
}

fn classify_outcome(request: &UdsRequest, bytes: &[u8]) -> UdsOutcome {
    let malformed = |reason: String| UdsOutcome::MalformedFrame { reason };

    match bytes {
        [] => malformed("empty response".to_string()),
        [service_id::NEGATIVE_RESPONSE, service, nrc, ..] => {
            if *service == request.service() {
                UdsOutcome::Negative {
                    service: *service,
                    nrc: NegativeResponseCode::from(*nrc),
                }
            } else {
                malformed(format!(
                    "negative response for service 0x{:02X}, expected 0x{:02X}",
                    service,
                    request.service()
                ))
            }
        }
        [service_id::NEGATIVE_RESPONSE, ..] => malformed("truncated negative response".to_string()),
        [sid, data @ ..] if *sid == request.service().wrapping_add(POSITIVE_RESPONSE_OFFSET) => {
            let echo = request.expected_echo();
            if data.starts_with(&echo) {
                UdsOutcome::Positive(PositiveResponse {
                    service: request.service(),
                    data: data.to_vec(),
                    echo_len: echo.len(),
                })
            } else {
                malformed(format!(
                    "echo mismatch: expected {}, got {}",
                    hex::encode_upper(&echo),
                    hex::encode_upper(&data[..echo.len().min(data.len())])
                ))
            }
        }
        [sid, ..] => malformed(format!(
            "unexpected response service 0x{:02X} to request 0x{:02X}",
            sid,
            request.service()
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_positive_with_echo() {
        let request = UdsRequest::read_data_by_identifier(0x0100);
        let response = UdsResponse::classify(&request, &[0x62, 0x01, 0x00, 0x0C]);
        let positive = response.positive().unwrap();
        assert_eq!(positive.service, 0x22);
        assert_eq!(positive.record(), &[0x0C]);
        assert!(response.confirms_presence());
    }

    #[test]
    fn test_negative() {
        let request = UdsRequest::read_data_by_identifier(0x0101);
        let response = UdsResponse::classify(&request, &[0x7F, 0x22, 0x31]);
        assert_eq!(
            response.outcome,
            UdsOutcome::Negative {
                service: 0x22,
                nrc: NegativeResponseCode::RequestOutOfRange
            }
        );
        assert_eq!(response.nrc_class(), Some(NrcClass::NotSupported));
        assert!(response.confirms_presence());
    }

    #[test]
    fn test_wrong_identifier_echo_is_malformed() {
        let request = UdsRequest::read_data_by_identifier(0x0100);
        let response = UdsResponse::classify(&request, &[0x62, 0x01, 0x01, 0x0C]);
        assert!(matches!(response.outcome, UdsOutcome::MalformedFrame { .. }));
        assert!(!response.confirms_presence());
    }

    #[test]
    fn test_negative_for_other_service_is_malformed() {
        let request = UdsRequest::read_data_by_identifier(0x0100);
        let response = UdsResponse::classify(&request, &[0x7F, 0x19, 0x11]);
        assert!(matches!(response.outcome, UdsOutcome::MalformedFrame { .. }));
    }

    #[test]
    fn test_garbage_is_malformed() {
        let request = UdsRequest::read_data_by_identifier(0x0100);
        for bytes in [&[][..], &[0x7F, 0x22][..], &[0x50, 0x03][..]] {
            let response = UdsResponse::classify(&request, bytes);
            assert!(matches!(response.outcome, UdsOutcome::MalformedFrame { .. }));
        }
    }

    #[test]
    fn test_serialized_shape() {
        let request = UdsRequest::read_data_by_identifier(0x0100);
        let response = UdsResponse::classify(&request, &[0x62, 0x01, 0x00, 0x0C]);
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["raw"], "6201000C");
        assert_eq!(json["outcome"]["kind"], "positive");
        assert_eq!(json["outcome"]["data"], "01000C");
    }
}
