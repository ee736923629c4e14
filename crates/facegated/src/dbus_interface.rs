use crate::engine::{EngineError, EngineHandle};
use chrono::{Local, NaiveDate, NaiveDateTime};
use facegate_core::history::{
    filtered_historical_paths, historical_path, latest_locations, track_location,
};
use facegate_core::shift::resolve_shift_window;
use facegate_core::{GeoPoint, ReferenceImage, VerifyRequest};
use facegate_store::SqliteStore;
use serde::Serialize;
use serde_json::{json, Value};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use zbus::interface;

pub const BUS_NAME: &str = "io.facegate.Attendance1";
pub const OBJECT_PATH: &str = "/io/facegate/Attendance1";

/// D-Bus interface for the facegate attendance daemon.
///
/// Every method answers with a JSON document carrying `"ok"`; failures add a
/// stable `"reason"` code and a human-readable `"error"`. Only malformed
/// arguments surface as D-Bus errors.
pub struct AttendanceService {
    engine: EngineHandle,
    store: Arc<SqliteStore>,
    timeout: Duration,
    model_dir: PathBuf,
}

impl AttendanceService {
    pub fn new(
        engine: EngineHandle,
        store: Arc<SqliteStore>,
        timeout: Duration,
        model_dir: PathBuf,
    ) -> Self {
        Self {
            engine,
            store,
            timeout,
            model_dir,
        }
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, EngineError>>,
    ) -> Result<T, EngineError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(op, timeout_secs = self.timeout.as_secs(), "request timed out");
                Err(EngineError::Timeout(self.timeout.as_secs()))
            }
        }
    }

    /// Run a store-only query off the async runtime, under the request timeout.
    async fn query<T, F>(&self, op: &'static str, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&SqliteStore) -> Result<T, EngineError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        self.bounded(op, async move {
            tokio::task::spawn_blocking(move || f(&store))
                .await
                .map_err(|e| EngineError::Join(e.to_string()))?
        })
        .await
    }
}

#[interface(name = "io.facegate.Attendance1")]
impl AttendanceService {
    /// Install the first reference photo of an identity.
    async fn register(&self, identity_id: &str, image: Vec<u8>) -> String {
        tracing::info!(identity = identity_id, bytes = image.len(), "register requested");
        let result = self
            .bounded("register", self.engine.register(identity_id.into(), image, now()))
            .await;
        respond(result.map(|r| reference_json(&r)))
    }

    /// Replace the reference photo of an identity.
    async fn update(&self, identity_id: &str, image: Vec<u8>) -> String {
        tracing::info!(identity = identity_id, bytes = image.len(), "update requested");
        let result = self
            .bounded("update", self.engine.update(identity_id.into(), image, now()))
            .await;
        respond(result.map(|r| reference_json(&r)))
    }

    /// Remove every reference photo of an identity.
    async fn reset(&self, identity_id: &str) -> String {
        tracing::info!(identity = identity_id, "reset requested");
        let result = self
            .bounded("reset", self.engine.reset(identity_id.into()))
            .await;
        respond(result.and_then(to_value))
    }

    /// Compare a captured photo with the stored reference and check in on a match.
    ///
    /// `has_location` false means no location was claimed; an empty
    /// `device_id` means none was supplied.
    async fn verify(
        &self,
        identity_id: &str,
        image: Vec<u8>,
        has_location: bool,
        latitude: f64,
        longitude: f64,
        device_id: &str,
    ) -> String {
        tracing::info!(identity = identity_id, has_location, "verify requested");
        let request = VerifyRequest {
            identity_id: identity_id.to_string(),
            image,
            location: has_location.then(|| GeoPoint::new(latitude, longitude)),
            device_id: (!device_id.is_empty()).then(|| device_id.to_string()),
            captured_at: now(),
        };
        let result = self.bounded("verify", self.engine.verify(request)).await;
        respond(result.and_then(|v| {
            let reason = v
                .result
                .reason
                .is_none()
                .then(|| v.checkin.reason_code())
                .flatten();
            let mut body = to_value(v)?;
            if let (Some(reason), Value::Object(map)) = (reason, &mut body) {
                map.insert("reason".into(), json!(reason));
            }
            Ok(body)
        }))
    }

    /// Shift window that applies to an identity on `date` (YYYY-MM-DD).
    async fn shift_window(&self, identity_id: &str, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let id = identity_id.to_string();
        let result = self
            .query("shift_window", move |store| {
                Ok(resolve_shift_window(store, &id, date)?)
            })
            .await;
        Ok(respond(result.and_then(to_value)))
    }

    /// Append a tracked position, stamped with the daemon's local time.
    async fn track(&self, identity_id: &str, latitude: f64, longitude: f64) -> String {
        let id = identity_id.to_string();
        let at = now();
        let result = self
            .query("track", move |store| {
                Ok(track_location(store, &id, GeoPoint::new(latitude, longitude), at)?)
            })
            .await;
        respond(result.and_then(to_value))
    }

    /// Most recent position of every identity.
    async fn latest_locations(&self) -> String {
        let result = self
            .query("latest_locations", |store| Ok(latest_locations(store)?))
            .await;
        respond(result.and_then(|points| Ok(json!({ "points": points }))))
    }

    /// Positions of one identity inside its shift window on `date`.
    async fn historical_path(&self, identity_id: &str, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let id = identity_id.to_string();
        let result = self
            .query("historical_path", move |store| {
                Ok(historical_path(store, &id, date)?)
            })
            .await;
        Ok(respond(result.and_then(to_value)))
    }

    /// [`historical_path`] for several identities; unknown ones are skipped.
    async fn filtered_historical_paths(
        &self,
        identity_ids: Vec<String>,
        date: &str,
    ) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let result = self
            .query("filtered_historical_paths", move |store| {
                Ok(filtered_historical_paths(store, &identity_ids, date)?)
            })
            .await;
        Ok(respond(result.and_then(|paths| Ok(json!({ "paths": paths })))))
    }

    /// Return daemon status information.
    async fn status(&self) -> String {
        json!({
            "ok": true,
            "version": env!("CARGO_PKG_VERSION"),
            "engine_workers": self.engine.workers(),
            "model_dir": self.model_dir.display().to_string(),
            "request_timeout_secs": self.timeout.as_secs(),
        })
        .to_string()
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}

fn parse_date(raw: &str) -> zbus::fdo::Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("date {raw:?}: {e}")))
}

fn reference_json(reference: &ReferenceImage) -> Value {
    json!({
        "attachment_id": reference.id,
        "digest": reference.digest,
        "created_at": reference.created_at,
        "bytes": reference.content.len(),
    })
}

fn to_value<T: Serialize>(value: T) -> Result<Value, EngineError> {
    serde_json::to_value(value).map_err(|e| EngineError::Join(format!("serialize: {e}")))
}

/// Wrap a result in the response envelope.
fn respond(result: Result<Value, EngineError>) -> String {
    let body = match result {
        Ok(Value::Object(mut map)) => {
            map.insert("ok".into(), json!(true));
            Value::Object(map)
        }
        Ok(other) => json!({ "ok": true, "result": other }),
        Err(err) => {
            tracing::info!(reason = err.reason_code(), error = %err, "request failed");
            json!({
                "ok": false,
                "reason": err.reason_code(),
                "error": err.to_string(),
            })
        }
    };
    body.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use facegate_core::LifecycleError;

    fn parse(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[test]
    fn test_respond_success_object() {
        let body = parse(&respond(Ok(json!({ "status": "cleared", "removed": 1 }))));
        assert_eq!(body["ok"], true);
        assert_eq!(body["removed"], 1);
    }

    #[test]
    fn test_respond_failure_carries_reason() {
        let body = parse(&respond(Err(LifecycleError::AlreadyRegistered.into())));
        assert_eq!(body["ok"], false);
        assert_eq!(body["reason"], "already_registered");
    }

    #[test]
    fn test_timeout_is_transient() {
        let body = parse(&respond(Err(EngineError::Timeout(30))));
        assert_eq!(body["reason"], "transient_io_failure");
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2025-06-17").unwrap(),
            NaiveDate::from_ymd_opt(2025, 6, 17).unwrap()
        );
        assert!(parse_date("17/06/2025").is_err());
    }
}
