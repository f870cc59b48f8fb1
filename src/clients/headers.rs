/// スケジューラ連携で使うヘッダー。
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

pub(crate) const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";
pub(crate) const CALLBACK_URL_HEADER: &str = "X-Callback-Url";

/// `{session_id}:{purpose}` 形式の Idempotency-Key を追加する。
pub(crate) fn add_idempotency_key(headers: &mut HeaderMap, session_id: Uuid, purpose: &str) {
    insert(headers, IDEMPOTENCY_KEY_HEADER, &format!("{session_id}:{purpose}"));
}

pub(crate) fn add_callback_url(headers: &mut HeaderMap, callback_url: &str) {
    insert(headers, CALLBACK_URL_HEADER, callback_url);
}

fn insert(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}
