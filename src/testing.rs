//! Scriptable collaborators for unit tests.

use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::remote::{RemoteCall, RemoteClient, RemoteError, RemoteErrorKind, RemoteResponse};

struct Failure {
  error: RemoteError,
  /// `None` fails forever
  remaining: Option<usize>,
}

/// In-memory document API.
///
/// Paths answer with their scripted response (or `null`), unless a failure is
/// scripted for them. Every call is logged as `start <path>` / `end <path>`.
#[derive(Default)]
pub(crate) struct FakeRemote {
  responses: Mutex<HashMap<String, Value>>,
  failures: Mutex<HashMap<String, Failure>>,
  calls: Mutex<Vec<RemoteCall>>,
  events: Mutex<Vec<String>>,
  delay: Mutex<Option<Duration>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, path: &str, data: Value) {
    self.responses.lock().unwrap().insert(path.to_string(), data);
  }

  pub fn fail_path(&self, path: &str, kind: RemoteErrorKind) {
    self.fail_path_with(path, RemoteError::new(kind, format!("{:?}", kind)));
  }

  pub fn fail_path_with(&self, path: &str, error: RemoteError) {
    self.failures.lock().unwrap().insert(
      path.to_string(),
      Failure {
        error,
        remaining: None,
      },
    );
  }

  /// Fail the next `times` calls to `path`, then answer normally.
  pub fn fail_times(&self, path: &str, times: usize, kind: RemoteErrorKind) {
    self.failures.lock().unwrap().insert(
      path.to_string(),
      Failure {
        error: RemoteError::new(kind, format!("{:?}", kind)),
        remaining: Some(times),
      },
    );
  }

  pub fn heal_path(&self, path: &str) {
    self.failures.lock().unwrap().remove(path);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  pub fn calls(&self) -> Vec<RemoteCall> {
    self.calls.lock().unwrap().clone()
  }

  pub fn calls_to(&self, path: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|c| c.path == path)
      .count()
  }

  pub fn events(&self) -> Vec<String> {
    self.events.lock().unwrap().clone()
  }

  fn take_failure(&self, path: &str) -> Option<RemoteError> {
    let mut failures = self.failures.lock().unwrap();
    let failure = failures.get_mut(path)?;
    let error = failure.error.clone();
    let exhausted = match failure.remaining {
      None => false,
      Some(0) => true,
      Some(ref mut n) => {
        *n -= 1;
        false
      }
    };
    if exhausted {
      failures.remove(path);
      return None;
    }
    Some(error)
  }
}

impl RemoteClient for FakeRemote {
  async fn request<T>(&self, call: RemoteCall) -> RemoteResponse<T>
  where
    T: DeserializeOwned + Send + 'static,
  {
    let path = call.path.clone();
    self.calls.lock().unwrap().push(call);
    self.events.lock().unwrap().push(format!("start {}", path));

    let delay = *self.delay.lock().unwrap();
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    self.events.lock().unwrap().push(format!("end {}", path));

    if let Some(error) = self.take_failure(&path) {
      return RemoteResponse::err(error);
    }

    let data = self
      .responses
      .lock()
      .unwrap()
      .get(&path)
      .cloned()
      .unwrap_or(Value::Null);
    match serde_json::from_value(data) {
      Ok(data) => RemoteResponse::ok(data),
      Err(e) => RemoteResponse::err(RemoteError::new(RemoteErrorKind::Decode, e.to_string())),
    }
  }
}
