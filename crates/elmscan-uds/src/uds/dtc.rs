//! ReadDTCInformation (0x19) decoding
//!
//! Decoders take a [`PositiveResponse`], never raw bytes: a negative
//! response such as `7F 19 11` is classified before it gets here and can
//! never be mistaken for a DTC record.

use serde::Serialize;

use super::{service_id, PositiveResponse, UdsError};

/// Sub-function codes for ReadDTCInformation (0x19)
pub mod sub_function {
    pub const REPORT_NUMBER_OF_DTC_BY_STATUS_MASK: u8 = 0x01;
    pub const REPORT_DTC_BY_STATUS_MASK: u8 = 0x02;
}

/// DTC status byte bits per ISO 14229-1
pub mod status_bit {
    pub const TEST_FAILED: u8 = 0x01;
    pub const TEST_FAILED_THIS_OPERATION_CYCLE: u8 = 0x02;
    pub const PENDING_DTC: u8 = 0x04;
    pub const CONFIRMED_DTC: u8 = 0x08;
    pub const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR: u8 = 0x10;
    pub const TEST_FAILED_SINCE_LAST_CLEAR: u8 = 0x20;
    pub const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE: u8 = 0x40;
    pub const WARNING_INDICATOR_REQUESTED: u8 = 0x80;

    pub const ALL: u8 = 0xFF;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtcCategory {
    Powertrain,
    Chassis,
    Body,
    Network,
}

impl DtcCategory {
    fn from_high_byte(high: u8) -> Self {
        match high >> 6 {
            0 => Self::Powertrain,
            1 => Self::Chassis,
            2 => Self::Body,
            _ => Self::Network,
        }
    }

    pub fn prefix(&self) -> char {
        match self {
            Self::Powertrain => 'P',
            Self::Chassis => 'C',
            Self::Body => 'B',
            Self::Network => 'U',
        }
    }
}

/// One DTC record: 3-byte number plus status byte
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Dtc {
    pub code: String,
    pub category: DtcCategory,
    /// Failure type byte (the third DTC byte)
    pub failure_type: u8,
    pub status: u8,
}

impl Dtc {
    pub fn from_record(record: [u8; 4]) -> Self {
        let [high, mid, low, status] = record;
        let category = DtcCategory::from_high_byte(high);
        // second digit from bits 5-4, third from bits 3-0, last two from the middle byte
        let code = format!("{}{:01X}{:01X}{:02X}", category.prefix(), (high >> 4) & 0x03, high & 0x0F, mid);
        Self {
            code,
            category,
            failure_type: low,
            status,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status & status_bit::TEST_FAILED != 0 && self.status & status_bit::CONFIRMED_DTC != 0
    }

    pub fn is_pending(&self) -> bool {
        self.status & status_bit::PENDING_DTC != 0
    }

    pub fn is_confirmed(&self) -> bool {
        self.status & status_bit::CONFIRMED_DTC != 0
    }

    /// Code with failure type, e.g. `P0123-45`
    pub fn display_code(&self) -> String {
        format!("{}-{:02X}", self.code, self.failure_type)
    }
}

/// Answer to reportDTCByStatusMask
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcReport {
    pub status_availability_mask: u8,
    pub dtcs: Vec<Dtc>,
}

/// Answer to reportNumberOfDTCByStatusMask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DtcCount {
    pub status_availability_mask: u8,
    pub format_identifier: u8,
    pub count: u16,
}

fn expect_sub_function(response: &PositiveResponse, sub_function: u8) -> Result<&[u8], UdsError> {
    if response.service != service_id::READ_DTC_INFO {
        return Err(UdsError::UnexpectedService {
            expected: service_id::READ_DTC_INFO,
            got: response.service,
        });
    }
    match response.data.split_first() {
        Some((sub, rest)) if *sub == sub_function => Ok(rest),
        Some((sub, _)) => Err(UdsError::InvalidResponse(format!(
            "sub-function 0x{:02X}, expected 0x{:02X}",
            sub, sub_function
        ))),
        None => Err(UdsError::InvalidResponse("missing sub-function".to_string())),
    }
}

pub fn parse_dtc_by_status_mask(response: &PositiveResponse) -> Result<DtcReport, UdsError> {
    let body = expect_sub_function(response, sub_function::REPORT_DTC_BY_STATUS_MASK)?;
    let Some((mask, records)) = body.split_first() else {
        return Err(UdsError::InvalidResponse(
            "missing status availability mask".to_string(),
        ));
    };
    if records.len() % 4 != 0 {
        return Err(UdsError::InvalidResponse(format!(
            "{} DTC record bytes is not a multiple of 4",
            records.len()
        )));
    }

    let dtcs = records
        .chunks_exact(4)
        .map(|chunk| Dtc::from_record([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(DtcReport {
        status_availability_mask: *mask,
        dtcs,
    })
}

pub fn parse_dtc_count(response: &PositiveResponse) -> Result<DtcCount, UdsError> {
    match expect_sub_function(response, sub_function::REPORT_NUMBER_OF_DTC_BY_STATUS_MASK)? {
        [mask, format, hi, lo] => Ok(DtcCount {
            status_availability_mask: *mask,
            format_identifier: *format,
            count: u16::from_be_bytes([*hi, *lo]),
        }),
        other => Err(UdsError::InvalidResponse(format!(
            "DTC count body of {} bytes",
            other.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uds::{UdsOutcome, UdsRequest, UdsResponse};
    use pretty_assertions::assert_eq;

    fn positive(bytes: &[u8]) -> PositiveResponse {
        let request = UdsRequest::read_dtc_by_status_mask(0xFF);
        UdsResponse::classify(&request, bytes)
            .positive()
            .cloned()
            .unwrap()
    }

    #[test]
    fn test_codes() {
        assert_eq!(Dtc::from_record([0x01, 0x01, 0x00, 0x00]).code, "P0101");
        assert_eq!(Dtc::from_record([0x44, 0x20, 0x00, 0x00]).code, "C0420");
        assert_eq!(Dtc::from_record([0x92, 0x34, 0x00, 0x00]).code, "B1234");
        let network = Dtc::from_record([0xC1, 0x00, 0x01, 0x28]);
        assert_eq!(network.code, "U0100");
        assert_eq!(network.category, DtcCategory::Network);
        assert_eq!(network.display_code(), "U0100-01");
    }

    #[test]
    fn test_report_by_status_mask() {
        let report = parse_dtc_by_status_mask(&positive(&[
            0x59, 0x02, 0xFF, //
            0x01, 0x23, 0x45, 0x09, //
            0x44, 0x20, 0x00, 0x04,
        ]))
        .unwrap();
        assert_eq!(report.status_availability_mask, 0xFF);
        assert_eq!(report.dtcs.len(), 2);
        assert_eq!(report.dtcs[0].display_code(), "P0123-45");
        assert!(report.dtcs[0].is_active());
        assert!(report.dtcs[1].is_pending());
        assert!(!report.dtcs[1].is_confirmed());
    }

    #[test]
    fn test_empty_report() {
        let report = parse_dtc_by_status_mask(&positive(&[0x59, 0x02, 0x08])).unwrap();
        assert!(report.dtcs.is_empty());
    }

    #[test]
    fn test_negative_response_never_reaches_decoder() {
        let request = UdsRequest::read_dtc_by_status_mask(0xFF);
        let response = UdsResponse::classify(&request, &[0x7F, 0x19, 0x11]);
        assert!(matches!(response.outcome, UdsOutcome::Negative { .. }));
        assert!(response.positive().is_none());
    }

    #[test]
    fn test_other_service_rejected() {
        let rdbi = UdsResponse::classify(
            &UdsRequest::read_data_by_identifier(0x0200),
            &[0x62, 0x02, 0x00, 0x01, 0x02, 0x03],
        );
        let err = parse_dtc_by_status_mask(rdbi.positive().unwrap()).unwrap_err();
        assert!(matches!(err, UdsError::UnexpectedService { .. }));
    }

    #[test]
    fn test_truncated_record() {
        let err = parse_dtc_by_status_mask(&positive(&[0x59, 0x02, 0xFF, 0x01, 0x23])).unwrap_err();
        assert!(matches!(err, UdsError::InvalidResponse(_)));
    }

    #[test]
    fn test_count() {
        let request = UdsRequest::custom(0x19, Some(0x01), None, vec![0xFF]);
        let response = UdsResponse::classify(&request, &[0x59, 0x01, 0xFF, 0x01, 0x00, 0x05]);
        let count = parse_dtc_count(response.positive().unwrap()).unwrap();
        assert_eq!(count.count, 5);
        assert_eq!(count.format_identifier, 0x01);
    }
}
