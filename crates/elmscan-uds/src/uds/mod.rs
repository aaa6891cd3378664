//! UDS (ISO 14229) requests, response classification and NRC taxonomy

pub mod dtc;
mod error;
mod nrc;
mod request;
mod response;

pub use dtc::{parse_dtc_by_status_mask, parse_dtc_count, Dtc, DtcCategory, DtcCount, DtcReport};
pub use error::UdsError;
pub use nrc::{classify as classify_nrc, NegativeResponseCode, NrcClass};
pub use request::UdsRequest;
pub use response::{PositiveResponse, UdsOutcome, UdsResponse};

/// Standard UDS service ID constants
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DTC_INFO: u8 = 0x19;
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const IO_CONTROL_BY_ID: u8 = 0x2F;
    pub const ROUTINE_CONTROL: u8 = 0x31;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const CONTROL_DTC_SETTING: u8 = 0x85;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// RoutineControl (0x31) sub-functions
pub mod routine_sub_function {
    pub const START_ROUTINE: u8 = 0x01;
    pub const STOP_ROUTINE: u8 = 0x02;
    pub const REQUEST_ROUTINE_RESULTS: u8 = 0x03;
}

/// InputOutputControlByIdentifier (0x2F) control options
pub mod io_control_option {
    /// Release tester control
    pub const RETURN_CONTROL_TO_ECU: u8 = 0x00;
    pub const RESET_TO_DEFAULT: u8 = 0x01;
    pub const FREEZE_CURRENT_STATE: u8 = 0x02;
    pub const SHORT_TERM_ADJUSTMENT: u8 = 0x03;
}

/// ECUReset (0x11) sub-functions
pub mod reset_type {
    pub const HARD_RESET: u8 = 0x01;
    pub const KEY_OFF_ON_RESET: u8 = 0x02;
    pub const SOFT_RESET: u8 = 0x03;
}

/// Identification DIDs (ISO 14229-1 Annex C)
pub mod standard_did {
    pub const SPARE_PART_NUMBER: u16 = 0xF187;
    pub const ECU_SERIAL_NUMBER: u16 = 0xF18C;
    pub const VIN: u16 = 0xF190;
    pub const SUPPLIER_SW_VERSION: u16 = 0xF195;

    /// Read from every module a sweep finds: (did, key)
    pub const IDENTIFICATION_DIDS: &[(u16, &str)] = &[
        (VIN, "vin"),
        (SPARE_PART_NUMBER, "part_number"),
        (ECU_SERIAL_NUMBER, "serial_number"),
        (SUPPLIER_SW_VERSION, "software_version"),
    ];
}
