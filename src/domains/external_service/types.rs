use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::errors::DomainError;

/// Kinds of external service a cursor can export to.
///
/// Stored by canonical name in `EXT_SERVICE_TYPE`; parsing is an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalServiceType {
    Spreadsheet,
    FusionTable,
    JsonServer,
    OhmageJsonServer,
    RedcapServer,
}

impl ExternalServiceType {
    pub const ALL: [ExternalServiceType; 5] = [
        ExternalServiceType::Spreadsheet,
        ExternalServiceType::FusionTable,
        ExternalServiceType::JsonServer,
        ExternalServiceType::OhmageJsonServer,
        ExternalServiceType::RedcapServer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalServiceType::Spreadsheet => "SPREADSHEET",
            ExternalServiceType::FusionTable => "FUSION_TABLE",
            ExternalServiceType::JsonServer => "JSON_SERVER",
            ExternalServiceType::OhmageJsonServer => "OHMAGE_JSON_SERVER",
            ExternalServiceType::RedcapServer => "REDCAP_SERVER",
        }
    }
}

impl FromStr for ExternalServiceType {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DomainError::invalid_enum_value("EXT_SERVICE_TYPE", s))
    }
}

impl fmt::Display for ExternalServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery sub-mode of a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExternalServiceOption {
    /// Backfill existing submissions once
    UploadOnly,
    /// Forward new submissions as they arrive
    StreamOnly,
    /// Backfill, then keep streaming
    UploadNStream,
}

impl ExternalServiceOption {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExternalServiceOption::UploadOnly => "UPLOAD_ONLY",
            ExternalServiceOption::StreamOnly => "STREAM_ONLY",
            ExternalServiceOption::UploadNStream => "UPLOAD_N_STREAM",
        }
    }

    pub fn includes_upload(&self) -> bool {
        matches!(self, ExternalServiceOption::UploadOnly | ExternalServiceOption::UploadNStream)
    }

    pub fn includes_streaming(&self) -> bool {
        matches!(self, ExternalServiceOption::StreamOnly | ExternalServiceOption::UploadNStream)
    }
}

impl FromStr for ExternalServiceOption {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPLOAD_ONLY" => Ok(ExternalServiceOption::UploadOnly),
            "STREAM_ONLY" => Ok(ExternalServiceOption::StreamOnly),
            "UPLOAD_N_STREAM" => Ok(ExternalServiceOption::UploadNStream),
            _ => Err(DomainError::invalid_enum_value("EXTERNAL_SERVICE_OPTION", s)),
        }
    }
}

impl fmt::Display for ExternalServiceOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_type_names_round_trip() {
        for kind in ExternalServiceType::ALL {
            assert_eq!(kind.as_str().parse::<ExternalServiceType>().unwrap(), kind);
        }
    }

    #[test]
    fn test_parse_is_exact() {
        assert!("spreadsheet".parse::<ExternalServiceType>().is_err());
        assert!(" SPREADSHEET".parse::<ExternalServiceType>().is_err());
        let err = "stream_only".parse::<ExternalServiceOption>().unwrap_err();
        assert!(matches!(err, DomainError::InvalidEnumValue { ref field, .. } if field == "EXTERNAL_SERVICE_OPTION"));
    }

    #[test]
    fn test_option_modes() {
        assert!(ExternalServiceOption::UploadOnly.includes_upload());
        assert!(!ExternalServiceOption::UploadOnly.includes_streaming());
        assert!(!ExternalServiceOption::StreamOnly.includes_upload());
        assert!(ExternalServiceOption::UploadNStream.includes_upload());
        assert!(ExternalServiceOption::UploadNStream.includes_streaming());
    }
}
