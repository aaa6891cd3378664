//! Typed UDS requests

use std::fmt;

use super::{io_control_option, routine_sub_function, service_id};

const SUPPRESS_POSITIVE_RESPONSE: u8 = 0x80;

/// One UDS request, encoded once when it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdsRequest {
    service: u8,
    sub_function: Option<u8>,
    identifier: Option<u16>,
    payload: Vec<u8>,
}

impl UdsRequest {
    /// Any service, for requests without a dedicated constructor
    pub fn custom(
        service: u8,
        sub_function: Option<u8>,
        identifier: Option<u16>,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            service,
            sub_function,
            identifier,
            payload,
        }
    }

    pub fn read_data_by_identifier(did: u16) -> Self {
        Self::custom(service_id::READ_DATA_BY_ID, None, Some(did), Vec::new())
    }

    pub fn write_data_by_identifier(did: u16, data: &[u8]) -> Self {
        Self::custom(service_id::WRITE_DATA_BY_ID, None, Some(did), data.to_vec())
    }

    pub fn routine_control(sub_function: u8, routine_id: u16, options: &[u8]) -> Self {
        Self::custom(
            service_id::ROUTINE_CONTROL,
            Some(sub_function),
            Some(routine_id),
            options.to_vec(),
        )
    }

    /// RoutineControl requestRoutineResults; probes a routine without starting it
    pub fn routine_results(routine_id: u16) -> Self {
        Self::routine_control(
            routine_sub_function::REQUEST_ROUTINE_RESULTS,
            routine_id,
            &[],
        )
    }

    pub fn io_control(did: u16, option: u8, state: &[u8]) -> Self {
        let mut payload = vec![option];
        payload.extend_from_slice(state);
        Self::custom(service_id::IO_CONTROL_BY_ID, None, Some(did), payload)
    }

    /// InputOutputControl returnControlToECU; probes an output without driving it
    pub fn io_return_control(did: u16) -> Self {
        Self::io_control(did, io_control_option::RETURN_CONTROL_TO_ECU, &[])
    }

    pub fn diagnostic_session_control(session: u8) -> Self {
        Self::custom(
            service_id::DIAGNOSTIC_SESSION_CONTROL,
            Some(session),
            None,
            Vec::new(),
        )
    }

    pub fn tester_present(suppress_response: bool) -> Self {
        let sub_function = if suppress_response {
            SUPPRESS_POSITIVE_RESPONSE
        } else {
            0x00
        };
        Self::custom(service_id::TESTER_PRESENT, Some(sub_function), None, Vec::new())
    }

    /// requestSeed uses the odd sub-function of a security level
    pub fn security_access_seed(level: u8) -> Self {
        Self::custom(
            service_id::SECURITY_ACCESS,
            Some(level.wrapping_mul(2).wrapping_sub(1)),
            None,
            Vec::new(),
        )
    }

    /// sendKey uses the even sub-function of a security level
    pub fn security_access_key(level: u8, key: &[u8]) -> Self {
        Self::custom(
            service_id::SECURITY_ACCESS,
            Some(level.wrapping_mul(2)),
            None,
            key.to_vec(),
        )
    }

    pub fn ecu_reset(reset_type: u8) -> Self {
        Self::custom(service_id::ECU_RESET, Some(reset_type), None, Vec::new())
    }

    pub fn read_dtc_by_status_mask(status_mask: u8) -> Self {
        Self::custom(
            service_id::READ_DTC_INFO,
            Some(super::dtc::sub_function::REPORT_DTC_BY_STATUS_MASK),
            None,
            vec![status_mask],
        )
    }

    pub fn service(&self) -> u8 {
        self.service
    }

    pub fn sub_function(&self) -> Option<u8> {
        self.sub_function
    }

    pub fn identifier(&self) -> Option<u16> {
        self.identifier
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(4 + self.payload.len());
        bytes.push(self.service);
        bytes.extend(self.sub_function);
        if let Some(identifier) = self.identifier {
            bytes.extend_from_slice(&identifier.to_be_bytes());
        }
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// True when the suppressPosRspMsgIndicationBit is set
    pub fn suppresses_response(&self) -> bool {
        matches!(
            self.service,
            service_id::DIAGNOSTIC_SESSION_CONTROL
                | service_id::ECU_RESET
                | service_id::TESTER_PRESENT
                | service_id::CONTROL_DTC_SETTING
        ) && self
            .sub_function
            .is_some_and(|sub| sub & SUPPRESS_POSITIVE_RESPONSE != 0)
    }

    /// Whether sending this request twice has the same effect as sending it once.
    ///
    /// Only these may be sent again when a ResponsePending never resolves.
    pub fn is_idempotent(&self) -> bool {
        match self.service {
            service_id::READ_DATA_BY_ID
            | service_id::READ_DTC_INFO
            | service_id::TESTER_PRESENT
            | service_id::DIAGNOSTIC_SESSION_CONTROL => true,
            service_id::ROUTINE_CONTROL => {
                self.sub_function == Some(routine_sub_function::REQUEST_ROUTINE_RESULTS)
            }
            service_id::IO_CONTROL_BY_ID => {
                self.payload.first() == Some(&io_control_option::RETURN_CONTROL_TO_ECU)
            }
            _ => false,
        }
    }

    /// Bytes a positive response repeats right after its service ID
    pub fn expected_echo(&self) -> Vec<u8> {
        let mut echo = Vec::new();
        if let Some(sub) = self.sub_function {
            echo.push(sub & !SUPPRESS_POSITIVE_RESPONSE);
        }
        if let Some(identifier) = self.identifier {
            echo.extend_from_slice(&identifier.to_be_bytes());
        }
        echo
    }
}

impl fmt::Display for UdsRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encode();
        for (index, byte) in encoded.iter().enumerate() {
            if index > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_encoding() {
        assert_eq!(
            UdsRequest::read_data_by_identifier(0xF190).encode(),
            vec![0x22, 0xF1, 0x90]
        );
        assert_eq!(
            UdsRequest::routine_results(0x0203).encode(),
            vec![0x31, 0x03, 0x02, 0x03]
        );
        assert_eq!(
            UdsRequest::io_return_control(0x4001).encode(),
            vec![0x2F, 0x40, 0x01, 0x00]
        );
        assert_eq!(
            UdsRequest::security_access_seed(1).encode(),
            vec![0x27, 0x01]
        );
        assert_eq!(
            UdsRequest::security_access_key(1, &[0xAB, 0xCD]).encode(),
            vec![0x27, 0x02, 0xAB, 0xCD]
        );
        assert_eq!(
            UdsRequest::read_dtc_by_status_mask(0xFF).encode(),
            vec![0x19, 0x02, 0xFF]
        );
    }

    #[test]
    fn test_suppressed_response() {
        assert!(UdsRequest::tester_present(true).suppresses_response());
        assert!(!UdsRequest::tester_present(false).suppresses_response());
        // 0x80 is a plain DID byte for ReadDataByIdentifier
        assert!(!UdsRequest::read_data_by_identifier(0x8080).suppresses_response());
    }

    #[test]
    fn test_idempotent_requests() {
        assert!(UdsRequest::read_data_by_identifier(0xF190).is_idempotent());
        assert!(UdsRequest::routine_results(0x0203).is_idempotent());
        assert!(UdsRequest::io_return_control(0x4001).is_idempotent());
        assert!(UdsRequest::read_dtc_by_status_mask(0xFF).is_idempotent());

        assert!(!UdsRequest::routine_control(0x01, 0x0203, &[]).is_idempotent());
        assert!(!UdsRequest::io_control(0x4001, 0x03, &[0x01]).is_idempotent());
        assert!(!UdsRequest::security_access_key(1, &[0xAB]).is_idempotent());
        assert!(!UdsRequest::write_data_by_identifier(0xF190, &[0x00]).is_idempotent());
        assert!(!UdsRequest::ecu_reset(0x01).is_idempotent());
    }

    #[test]
    fn test_expected_echo() {
        assert_eq!(
            UdsRequest::read_data_by_identifier(0x0100).expected_echo(),
            vec![0x01, 0x00]
        );
        assert_eq!(
            UdsRequest::routine_results(0x0203).expected_echo(),
            vec![0x03, 0x02, 0x03]
        );
        assert_eq!(UdsRequest::tester_present(true).expected_echo(), vec![0x00]);
    }

    #[test]
    fn test_display() {
        assert_eq!(
            UdsRequest::diagnostic_session_control(0x03).to_string(),
            "10 03"
        );
    }
}
