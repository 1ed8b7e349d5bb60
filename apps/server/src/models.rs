use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

// ── Status enums ──

/// Booking lifecycle status.
///
/// Stored as an integer column; serialized on the wire as the numeric
/// string codes `"0".."3"` the consuming clients expect. Conversion
/// happens only here — the rest of the engine works with the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[repr(i64)]
pub enum BookingStatus {
    Pending = 0,
    Confirmed = 1,
    Completed = 2,
    Cancelled = 3,
}

impl BookingStatus {
    pub fn code(self) -> &'static str {
        match self {
            BookingStatus::Pending => "0",
            BookingStatus::Confirmed => "1",
            BookingStatus::Completed => "2",
            BookingStatus::Cancelled => "3",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "0" => Some(BookingStatus::Pending),
            "1" => Some(BookingStatus::Confirmed),
            "2" => Some(BookingStatus::Completed),
            "3" => Some(BookingStatus::Cancelled),
            _ => None,
        }
    }
}

impl Serialize for BookingStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.code())
    }
}

impl<'de> Deserialize<'de> for BookingStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = String::deserialize(deserializer)?;
        BookingStatus::from_code(&code)
            .ok_or_else(|| de::Error::custom(format!("unknown booking status code: {code}")))
    }
}

/// External payment session status. `Opened` is the only non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[repr(i64)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Opened = 0,
    Succeeded = 1,
    Failed = 2,
    UserCancelled = 3,
    Expired = 4,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SessionStatus::Opened)
    }
}

// ── Database models ──

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Company {
    pub id: i64,
    pub name: String,
    /// JSON-encoded weekly schedule; parsed fail-open by `hours`.
    pub operating_hours: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Product {
    pub id: i64,
    pub company_id: i64,
    pub name: String,
    pub price: i64,
    pub duration_min: i64,
    pub all_day: bool,
    pub default_capacity: i64,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Pet {
    pub id: i64,
    pub owner_id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Slot {
    pub id: i64,
    pub product_id: i64,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub capacity: i64,
    pub booked: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub company_id: i64,
    pub product_id: i64,
    pub owner_id: i64,
    pub start_dt: chrono::DateTime<chrono::Utc>,
    pub end_dt: chrono::DateTime<chrono::Utc>,
    pub pet_count: i64,
    pub total_price: i64,
    pub special_requests: Option<String>,
    pub status: BookingStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub cancelled_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PaymentSession {
    pub order_id: String,
    pub booking_id: i64,
    pub amount: i64,
    pub method: String,
    pub status: SessionStatus,
    pub transaction_id: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

// ── API request/response types ──

#[derive(Debug, Deserialize)]
pub struct AvailabilityQuery {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct ClosedDatesQuery {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SelectProductRequest {
    pub product_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SelectSlotRequest {
    pub date: String,
    pub start_time: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectPetsRequest {
    pub pet_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
pub struct SpecialRequestsRequest {
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ConfirmWizardRequest {
    pub method: String,
    #[serde(default)]
    pub agree_service_terms: bool,
    #[serde(default)]
    pub agree_cancellation_policy: bool,
}

#[derive(Debug, Serialize)]
pub struct ConfirmWizardResponse {
    pub booking_id: i64,
    pub order_id: String,
    pub checkout_url: String,
    pub total_price: i64,
}

#[derive(Debug, Serialize)]
pub struct StartWizardResponse {
    pub wizard_id: u64,
}

/// Payment provider success redirect: `?orderId=&transactionId=&amount=`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSuccessQuery {
    pub order_id: String,
    pub transaction_id: String,
    pub amount: Option<i64>,
}

/// Payment provider failure redirect: `?orderId=&errorCode=&errorMessage=`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentFailQuery {
    pub order_id: String,
    pub error_code: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BulkSlotsRequest {
    pub company_id: i64,
    pub product_id: i64,
    pub start_date: String,
    pub end_date: String,
    pub time_slots: Vec<SlotTime>,
    pub capacity: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlotTime {
    pub start_time: String,
    pub end_time: String,
}

#[derive(Debug, Deserialize)]
pub struct AdminSlotsQuery {
    pub product_id: i64,
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct CompanyBookingsQuery {
    pub company_id: i64,
}

#[derive(Debug, Serialize)]
pub struct BulkSlotsResponse {
    pub created: u64,
    pub skipped: u64,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_round_trip() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Completed,
            BookingStatus::Cancelled,
        ] {
            assert_eq!(BookingStatus::from_code(status.code()), Some(status));
        }
    }

    #[test]
    fn test_status_unknown_code() {
        assert_eq!(BookingStatus::from_code("4"), None);
        assert_eq!(BookingStatus::from_code("pending"), None);
        assert_eq!(BookingStatus::from_code(""), None);
    }

    #[test]
    fn test_status_serializes_as_numeric_string() {
        let json = serde_json::to_string(&BookingStatus::Pending).unwrap();
        assert_eq!(json, "\"0\"");
        let json = serde_json::to_string(&BookingStatus::Cancelled).unwrap();
        assert_eq!(json, "\"3\"");
    }

    #[test]
    fn test_status_deserializes_from_numeric_string() {
        let status: BookingStatus = serde_json::from_str("\"1\"").unwrap();
        assert_eq!(status, BookingStatus::Confirmed);
        assert!(serde_json::from_str::<BookingStatus>("\"confirmed\"").is_err());
    }

    #[test]
    fn test_session_status_terminal() {
        assert!(!SessionStatus::Opened.is_terminal());
        assert!(SessionStatus::Succeeded.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::UserCancelled.is_terminal());
        assert!(SessionStatus::Expired.is_terminal());
    }
}
