#![forbid(unsafe_code)]

use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

pub const UTD_CONTRACT_VERSION: SchemaVersion = SchemaVersion(1);

pub const EVENT_ID_MAX_LEN: usize = 255;
pub const ERROR_DESCRIPTION_MAX_LEN: usize = 1_024;
pub const FAILURE_CONTEXT_MAX_LEN: usize = 1_100;

pub const E2EE_ANALYTICS_DOMAIN: &str = "E2EE";
/// `time_to_decrypt_millis` value sent for failures that never decrypted.
pub const PERMANENT_UTD_TIME_TO_DECRYPT_MILLIS: i64 = -1;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        let v = Self(id);
        v.validate()?;
        Ok(v)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl Validate for EventId {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.0.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "event_id",
                reason: "must not be empty",
            });
        }
        if self.0.len() > EVENT_ID_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "event_id",
                reason: "must be <= 255 bytes",
            });
        }
        if self.0.chars().any(char::is_control) {
            return Err(ContractViolation::InvalidValue {
                field: "event_id",
                reason: "must not contain control characters",
            });
        }
        Ok(())
    }
}

/// Membership of the current user in the room, as seen in the room state at
/// the time of the failing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoomMembership {
    Join,
    Invite,
    Leave,
    Ban,
    Knock,
    Unknown,
}

impl RoomMembership {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "join" => RoomMembership::Join,
            "invite" => RoomMembership::Invite,
            "leave" => RoomMembership::Leave,
            "ban" => RoomMembership::Ban,
            "knock" => RoomMembership::Knock,
            _ => RoomMembership::Unknown,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoomMembership::Join => "join",
            RoomMembership::Invite => "invite",
            RoomMembership::Leave => "leave",
            RoomMembership::Ban => "ban",
            RoomMembership::Knock => "knock",
            RoomMembership::Unknown => "unknown",
        }
    }

    pub fn is_joined(self) -> bool {
        self == RoomMembership::Join
    }
}

/// Decrypting error codes raised by the Matrix SDK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptionErrorCode {
    EncryptionNotEnabled,
    UnableToEncrypt,
    UnableToDecrypt,
    Olm,
    UnknownInboundSessionId,
    InboundSessionMismatchRoomId,
    MissingFields,
    MissingCiphertext,
    NotIncludedInRecipients,
    BadRecipient,
    BadRecipientKey,
    ForwardedMessage,
    BadRoom,
    BadEncryptedMessage,
    DuplicateMessageIndex,
    MissingProperty,
    /// Any code this client does not know about.
    Other,
}

impl DecryptionErrorCode {
    pub fn from_code(code: i64) -> Self {
        match code {
            0 => DecryptionErrorCode::EncryptionNotEnabled,
            1 => DecryptionErrorCode::UnableToEncrypt,
            2 => DecryptionErrorCode::UnableToDecrypt,
            3 => DecryptionErrorCode::Olm,
            4 => DecryptionErrorCode::UnknownInboundSessionId,
            5 => DecryptionErrorCode::InboundSessionMismatchRoomId,
            6 => DecryptionErrorCode::MissingFields,
            7 => DecryptionErrorCode::MissingCiphertext,
            8 => DecryptionErrorCode::NotIncludedInRecipients,
            9 => DecryptionErrorCode::BadRecipient,
            10 => DecryptionErrorCode::BadRecipientKey,
            11 => DecryptionErrorCode::ForwardedMessage,
            12 => DecryptionErrorCode::BadRoom,
            13 => DecryptionErrorCode::BadEncryptedMessage,
            14 => DecryptionErrorCode::DuplicateMessageIndex,
            15 => DecryptionErrorCode::MissingProperty,
            _ => DecryptionErrorCode::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionErrorDetail {
    pub code: i64,
    pub description: String,
}

impl DecryptionErrorDetail {
    pub fn v1(code: i64, description: impl Into<String>) -> Result<Self, ContractViolation> {
        let detail = Self {
            code,
            description: description.into(),
        };
        detail.validate()?;
        Ok(detail)
    }

    pub fn error_code(&self) -> DecryptionErrorCode {
        DecryptionErrorCode::from_code(self.code)
    }

    /// Diagnostic string attached to the analytics report.
    pub fn failure_context(&self) -> String {
        format!("code: {}, description: {}", self.code, self.description)
    }
}

impl Validate for DecryptionErrorDetail {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.description.len() > ERROR_DESCRIPTION_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_error_detail.description",
                reason: "must be <= 1024 bytes",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecryptionFailureReason {
    Unspecified,
    /// No key was ever received for the megolm session.
    OlmKeysNotSent,
    /// Key index or replay check failed.
    OlmIndexError,
}

impl DecryptionFailureReason {
    pub fn from_error_code(code: DecryptionErrorCode) -> Self {
        match code {
            DecryptionErrorCode::UnknownInboundSessionId => DecryptionFailureReason::OlmKeysNotSent,
            DecryptionErrorCode::Olm => DecryptionFailureReason::OlmIndexError,
            _ => DecryptionFailureReason::Unspecified,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DecryptionFailureReason::Unspecified => "UNSPECIFIED",
            DecryptionFailureReason::OlmKeysNotSent => "OLM_KEYS_NOT_SENT",
            DecryptionFailureReason::OlmIndexError => "OLM_INDEX_ERROR",
        }
    }

    pub fn analytics_error_name(self) -> &'static str {
        match self {
            DecryptionFailureReason::Unspecified => "UnknownError",
            DecryptionFailureReason::OlmKeysNotSent => "OlmKeysNotSentError",
            DecryptionFailureReason::OlmIndexError => "OlmIndexError",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClassification {
    LateDecryption { time_to_decrypt_ms: u64 },
    PermanentUtd,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionFailure {
    pub schema_version: SchemaVersion,
    pub failed_event_id: EventId,
    pub reason: DecryptionFailureReason,
    pub context: String,
    pub ts: UnixTimeMs,
    pub time_to_decrypt_ms: Option<u64>,
}

impl DecryptionFailure {
    pub fn v1(
        failed_event_id: EventId,
        reason: DecryptionFailureReason,
        context: String,
        ts: UnixTimeMs,
    ) -> Result<Self, ContractViolation> {
        let failure = Self {
            schema_version: UTD_CONTRACT_VERSION,
            failed_event_id,
            reason,
            context,
            ts,
            time_to_decrypt_ms: None,
        };
        failure.validate()?;
        Ok(failure)
    }

    pub fn classification(&self) -> FailureClassification {
        match self.time_to_decrypt_ms {
            Some(time_to_decrypt_ms) => FailureClassification::LateDecryption { time_to_decrypt_ms },
            None => FailureClassification::PermanentUtd,
        }
    }
}

impl Validate for DecryptionFailure {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != UTD_CONTRACT_VERSION {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure.schema_version",
                reason: "must match UTD_CONTRACT_VERSION",
            });
        }
        self.failed_event_id.validate()?;
        if self.context.len() > FAILURE_CONTEXT_MAX_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure.context",
                reason: "must be <= 1100 bytes",
            });
        }
        if self.ts.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "decryption_failure.ts",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Inbound "decryption failed" signal from the SDK.
///
/// `membership` is `None` when the current user has no member record in the
/// room state; `error` is `None` when the event carries no decryption error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptionFailedSignal {
    pub event_id: EventId,
    pub membership: Option<RoomMembership>,
    pub error: Option<DecryptionErrorDetail>,
}

impl DecryptionFailedSignal {
    pub fn v1(
        event_id: EventId,
        membership: Option<RoomMembership>,
        error: Option<DecryptionErrorDetail>,
    ) -> Result<Self, ContractViolation> {
        let signal = Self {
            event_id,
            membership,
            error,
        };
        signal.validate()?;
        Ok(signal)
    }
}

impl Validate for DecryptionFailedSignal {
    fn validate(&self) -> Result<(), ContractViolation> {
        self.event_id.validate()?;
        if let Some(error) = &self.error {
            error.validate()?;
        }
        Ok(())
    }
}

/// Analytics payload for one tracked decryption failure.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct E2eErrorAnalyticsEvent {
    pub domain: String,
    pub name: String,
    pub context: String,
    pub event_id: String,
    pub time_to_decrypt_millis: i64,
}

impl E2eErrorAnalyticsEvent {
    pub fn from_failure(failure: &DecryptionFailure) -> Self {
        let time_to_decrypt_millis = match failure.time_to_decrypt_ms {
            Some(ms) => i64::try_from(ms).unwrap_or(i64::MAX),
            None => PERMANENT_UTD_TIME_TO_DECRYPT_MILLIS,
        };
        Self {
            domain: E2EE_ANALYTICS_DOMAIN.to_string(),
            name: failure.reason.analytics_error_name().to_string(),
            context: failure.context.clone(),
            event_id: failure.failed_event_id.as_str().to_string(),
            time_to_decrypt_millis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(reason: DecryptionFailureReason) -> DecryptionFailure {
        DecryptionFailure::v1(
            EventId::new("$evt1").unwrap(),
            reason,
            "code: 4, description: unknown inbound session id".to_string(),
            UnixTimeMs(1_700_000_000_000),
        )
        .unwrap()
    }

    #[test]
    fn at_utd_contract_01_event_id_rejects_empty_and_control_chars() {
        assert!(EventId::new("").is_err());
        assert!(EventId::new("   ").is_err());
        assert!(EventId::new("$evt\n1").is_err());
        assert!(EventId::new("a".repeat(256)).is_err());
        assert_eq!(EventId::new("$evt1").unwrap().as_str(), "$evt1");
    }

    #[test]
    fn at_utd_contract_02_reason_follows_sdk_error_code() {
        assert_eq!(
            DecryptionFailureReason::from_error_code(DecryptionErrorCode::from_code(4)),
            DecryptionFailureReason::OlmKeysNotSent
        );
        assert_eq!(
            DecryptionFailureReason::from_error_code(DecryptionErrorCode::from_code(3)),
            DecryptionFailureReason::OlmIndexError
        );
        assert_eq!(
            DecryptionFailureReason::from_error_code(DecryptionErrorCode::from_code(14)),
            DecryptionFailureReason::Unspecified
        );
        assert_eq!(
            DecryptionFailureReason::from_error_code(DecryptionErrorCode::from_code(999)),
            DecryptionFailureReason::Unspecified
        );
        assert_eq!(DecryptionErrorCode::from_code(999), DecryptionErrorCode::Other);
        assert_eq!(DecryptionErrorCode::from_code(-1), DecryptionErrorCode::Other);
    }

    #[test]
    fn at_utd_contract_03_membership_parse_is_case_insensitive() {
        assert!(RoomMembership::parse("JOIN").is_joined());
        assert_eq!(RoomMembership::parse("invite"), RoomMembership::Invite);
        assert_eq!(RoomMembership::parse("whatever"), RoomMembership::Unknown);
        assert!(!RoomMembership::parse("leave").is_joined());
        assert_eq!(RoomMembership::parse(" Knock ").as_str(), "knock");
        assert_eq!(RoomMembership::parse("whatever").as_str(), "unknown");
    }

    #[test]
    fn at_utd_contract_04_context_embeds_code_and_description() {
        let detail = DecryptionErrorDetail::v1(4, "unknown inbound session id").unwrap();
        assert_eq!(
            detail.failure_context(),
            "code: 4, description: unknown inbound session id"
        );
        assert!(DecryptionErrorDetail::v1(1, "x".repeat(1_025)).is_err());
    }

    #[test]
    fn at_utd_contract_05_classification_tracks_time_to_decrypt() {
        let mut f = failure(DecryptionFailureReason::OlmKeysNotSent);
        assert_eq!(f.classification(), FailureClassification::PermanentUtd);
        f.time_to_decrypt_ms = Some(10_000);
        assert_eq!(
            f.classification(),
            FailureClassification::LateDecryption {
                time_to_decrypt_ms: 10_000
            }
        );
    }

    #[test]
    fn at_utd_contract_06_analytics_event_maps_names_and_sentinel() {
        let permanent = E2eErrorAnalyticsEvent::from_failure(&failure(
            DecryptionFailureReason::OlmKeysNotSent,
        ));
        assert_eq!(permanent.domain, "E2EE");
        assert_eq!(permanent.name, "OlmKeysNotSentError");
        assert_eq!(permanent.time_to_decrypt_millis, -1);

        let mut late = failure(DecryptionFailureReason::Unspecified);
        late.time_to_decrypt_ms = Some(4_500);
        let late = E2eErrorAnalyticsEvent::from_failure(&late);
        assert_eq!(late.name, "UnknownError");
        assert_eq!(late.time_to_decrypt_millis, 4_500);

        let json = serde_json::to_string(&late).unwrap();
        assert!(json.contains("\"time_to_decrypt_millis\":4500"));
    }

    #[test]
    fn at_utd_contract_07_failure_requires_nonzero_timestamp() {
        assert!(DecryptionFailure::v1(
            EventId::new("$evt1").unwrap(),
            DecryptionFailureReason::Unspecified,
            String::new(),
            UnixTimeMs(0),
        )
        .is_err());
    }
}
