//! UDS Negative Response Codes (NRC) and how the client reacts to them

use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! nrc_table {
    ($($variant:ident = $code:literal => $name:literal,)*) => {
        /// UDS Negative Response Codes (NRC)
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(from = "u8", into = "u8")]
        pub enum NegativeResponseCode {
            $($variant,)*
            /// Reserved or manufacturer-specific NRC
            Unknown(u8),
        }

        impl From<u8> for NegativeResponseCode {
            fn from(value: u8) -> Self {
                match value {
                    $($code => Self::$variant,)*
                    other => Self::Unknown(other),
                }
            }
        }

        impl From<NegativeResponseCode> for u8 {
            fn from(nrc: NegativeResponseCode) -> Self {
                match nrc {
                    $(NegativeResponseCode::$variant => $code,)*
                    NegativeResponseCode::Unknown(value) => value,
                }
            }
        }

        impl NegativeResponseCode {
            /// ISO 14229-1 mnemonic
            pub fn name(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::Unknown(_) => "unknown",
                }
            }
        }
    };
}

nrc_table! {
    GeneralReject = 0x10 => "generalReject",
    ServiceNotSupported = 0x11 => "serviceNotSupported",
    SubFunctionNotSupported = 0x12 => "subFunctionNotSupported",
    IncorrectMessageLengthOrFormat = 0x13 => "incorrectMessageLengthOrInvalidFormat",
    ResponseTooLong = 0x14 => "responseTooLong",
    BusyRepeatRequest = 0x21 => "busyRepeatRequest",
    ConditionsNotCorrect = 0x22 => "conditionsNotCorrect",
    RequestSequenceError = 0x24 => "requestSequenceError",
    NoResponseFromSubnet = 0x25 => "noResponseFromSubnetComponent",
    FailurePreventsExecution = 0x26 => "failurePreventsExecutionOfRequestedAction",
    RequestOutOfRange = 0x31 => "requestOutOfRange",
    SecurityAccessDenied = 0x33 => "securityAccessDenied",
    InvalidKey = 0x35 => "invalidKey",
    ExceededNumberOfAttempts = 0x36 => "exceededNumberOfAttempts",
    RequiredTimeDelayNotExpired = 0x37 => "requiredTimeDelayNotExpired",
    UploadDownloadNotAccepted = 0x70 => "uploadDownloadNotAccepted",
    TransferDataSuspended = 0x71 => "transferDataSuspended",
    GeneralProgrammingFailure = 0x72 => "generalProgrammingFailure",
    WrongBlockSequenceCounter = 0x73 => "wrongBlockSequenceCounter",
    ResponsePending = 0x78 => "requestCorrectlyReceived-ResponsePending",
    SubFunctionNotSupportedInActiveSession = 0x7E => "subFunctionNotSupportedInActiveSession",
    ServiceNotSupportedInActiveSession = 0x7F => "serviceNotSupportedInActiveSession",
    RpmTooHigh = 0x81 => "rpmTooHigh",
    RpmTooLow = 0x82 => "rpmTooLow",
    EngineRunning = 0x83 => "engineIsRunning",
    EngineNotRunning = 0x84 => "engineIsNotRunning",
    EngineRunTimeTooLow = 0x85 => "engineRunTimeTooLow",
    TemperatureTooHigh = 0x86 => "temperatureTooHigh",
    TemperatureTooLow = 0x87 => "temperatureTooLow",
    VehicleSpeedTooHigh = 0x88 => "vehicleSpeedTooHigh",
    VehicleSpeedTooLow = 0x89 => "vehicleSpeedTooLow",
    ThrottleTooHigh = 0x8A => "throttle/PedalTooHigh",
    ThrottleTooLow = 0x8B => "throttle/PedalTooLow",
    TransmissionNotInNeutral = 0x8C => "transmissionRangeNotInNeutral",
    TransmissionNotInGear = 0x8D => "transmissionRangeNotInGear",
    BrakeSwitchNotClosed = 0x8F => "brakeSwitch(es)NotClosed",
    ShifterNotInPark = 0x90 => "shifterLeverNotInPark",
    TorqueConverterClutchLocked = 0x91 => "torqueConverterClutchLocked",
    VoltageTooHigh = 0x92 => "voltageTooHigh",
    VoltageTooLow = 0x93 => "voltageTooLow",
}

/// What a negative response tells the client to do next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NrcClass {
    /// The identifier or service does not exist on this module
    NotSupported,
    /// The request itself was badly formed
    MalformedRequest,
    /// The module may accept the request later, or in another vehicle state
    RetryableConditional,
    /// Another request has to come first
    NeedsPriorStep,
    /// Security access is required or was refused
    SecurityLocked,
    /// The module is still working; wait longer for the real answer
    ExtendTimeoutAndRetryWait,
    /// Not available in the active diagnostic session
    WrongSession,
    /// General refusal without a more specific reason
    Rejected,
    Unknown(u8),
}

impl NegativeResponseCode {
    pub fn class(&self) -> NrcClass {
        use NegativeResponseCode::*;

        match self {
            ServiceNotSupported | SubFunctionNotSupported | RequestOutOfRange => {
                NrcClass::NotSupported
            }
            IncorrectMessageLengthOrFormat => NrcClass::MalformedRequest,
            BusyRepeatRequest | ConditionsNotCorrect => NrcClass::RetryableConditional,
            RpmTooHigh | RpmTooLow | EngineRunning | EngineNotRunning | EngineRunTimeTooLow
            | TemperatureTooHigh | TemperatureTooLow | VehicleSpeedTooHigh
            | VehicleSpeedTooLow | ThrottleTooHigh | ThrottleTooLow
            | TransmissionNotInNeutral | TransmissionNotInGear | BrakeSwitchNotClosed
            | ShifterNotInPark | TorqueConverterClutchLocked | VoltageTooHigh | VoltageTooLow => {
                NrcClass::RetryableConditional
            }
            RequestSequenceError => NrcClass::NeedsPriorStep,
            SecurityAccessDenied | InvalidKey | ExceededNumberOfAttempts
            | RequiredTimeDelayNotExpired => NrcClass::SecurityLocked,
            ResponsePending => NrcClass::ExtendTimeoutAndRetryWait,
            SubFunctionNotSupportedInActiveSession | ServiceNotSupportedInActiveSession => {
                NrcClass::WrongSession
            }
            GeneralReject | ResponseTooLong | NoResponseFromSubnet | FailurePreventsExecution
            | UploadDownloadNotAccepted | TransferDataSuspended | GeneralProgrammingFailure
            | WrongBlockSequenceCounter => NrcClass::Rejected,
            Unknown(code) => NrcClass::Unknown(*code),
        }
    }
}

/// Classify a raw NRC byte; total over every value
pub fn classify(nrc: u8) -> NrcClass {
    NegativeResponseCode::from(nrc).class()
}

impl fmt::UpperHex for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let value: u8 = (*self).into();
        fmt::UpperHex::fmt(&value, f)
    }
}

impl fmt::Display for NegativeResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(value) => write!(f, "Unknown(0x{:02X})", value),
            known => f.write_str(known.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0x11, NrcClass::NotSupported)]
    #[case(0x12, NrcClass::NotSupported)]
    #[case(0x13, NrcClass::MalformedRequest)]
    #[case(0x22, NrcClass::RetryableConditional)]
    #[case(0x24, NrcClass::NeedsPriorStep)]
    #[case(0x31, NrcClass::NotSupported)]
    #[case(0x33, NrcClass::SecurityLocked)]
    #[case(0x78, NrcClass::ExtendTimeoutAndRetryWait)]
    #[case(0x21, NrcClass::RetryableConditional)]
    #[case(0x88, NrcClass::RetryableConditional)]
    #[case(0x35, NrcClass::SecurityLocked)]
    #[case(0x37, NrcClass::SecurityLocked)]
    #[case(0x7E, NrcClass::WrongSession)]
    #[case(0x7F, NrcClass::WrongSession)]
    #[case(0x10, NrcClass::Rejected)]
    #[case(0x72, NrcClass::Rejected)]
    #[case(0x00, NrcClass::Unknown(0x00))]
    #[case(0xF0, NrcClass::Unknown(0xF0))]
    fn test_classification_table(#[case] nrc: u8, #[case] expected: NrcClass) {
        assert_eq!(classify(nrc), expected);
    }

    #[test]
    fn test_classification_is_total_and_lossless() {
        for value in 0..=u8::MAX {
            let nrc = NegativeResponseCode::from(value);
            assert_eq!(u8::from(nrc), value);
            // every byte maps to exactly one class, unknown codes keep their value
            if let NrcClass::Unknown(code) = nrc.class() {
                assert_eq!(code, value);
                assert!(matches!(nrc, NegativeResponseCode::Unknown(_)));
            }
        }
    }

    #[test]
    fn test_display() {
        assert_eq!(
            NegativeResponseCode::RequestOutOfRange.to_string(),
            "requestOutOfRange"
        );
        assert_eq!(NegativeResponseCode::from(0xF3).to_string(), "Unknown(0xF3)");
        assert_eq!(format!("{:02X}", NegativeResponseCode::ResponsePending), "78");
    }

    #[test]
    fn test_serde_as_byte() {
        let json = serde_json::to_string(&NegativeResponseCode::SecurityAccessDenied).unwrap();
        assert_eq!(json, "51");
        let back: NegativeResponseCode = serde_json::from_str("49").unwrap();
        assert_eq!(back, NegativeResponseCode::RequestOutOfRange);
    }
}
