//! Task function adapter
//!
//! A user function `F` is wrapped in a [`TaskFn`] that records what the rest
//! of the system needs to know about it: how to call it, whether it can be
//! marshalled to a worker process, and a stable identity for fingerprinting.
//!
//! Closures built with [`TaskFn::local`] can run serially or on threads but
//! cannot cross a process boundary. Functions built with
//! [`TaskFn::registered`] also install a byte-level adapter in a
//! process-wide registry under a caller-chosen name; worker processes resolve
//! the name to apply the function on marshalled items. Binaries that want
//! process execution must perform the same registrations before dispatching
//! (the `amorsize` binary registers its demo tasks in `main`).

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, OnceLock};
use thiserror::Error;

/// Errors surfaced by task application and marshalling
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    /// The user function returned an error for this item
    #[error("task failed: {0}")]
    Failed(String),
    /// The user function panicked for this item
    #[error("task panicked: {0}")]
    Panicked(String),
    /// An item or output could not be marshalled
    #[error("marshalling failed: {0}")]
    Marshal(String),
    /// A worker process asked for a task name nobody registered
    #[error("no task registered under '{0}'")]
    Unregistered(String),
}

/// Byte-level task as stored in the registry: marshalled item in,
/// marshalled output out.
pub type ByteTask = Arc<dyn Fn(&[u8]) -> Result<Vec<u8>, TaskError> + Send + Sync>;

fn registry() -> &'static Mutex<HashMap<String, ByteTask>> {
    static REGISTRY: OnceLock<Mutex<HashMap<String, ByteTask>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Install a byte-level task under `name`, replacing any previous entry
pub fn register_bytes(name: &str, task: ByteTask) {
    registry()
        .lock()
        .expect("task registry poisoned")
        .insert(name.to_string(), task);
}

/// Resolve a registered task by name (used by worker processes)
pub fn lookup(name: &str) -> Option<ByteTask> {
    registry()
        .lock()
        .expect("task registry poisoned")
        .get(name)
        .cloned()
}

/// Names currently registered, sorted (for diagnostics and `--help` text)
pub fn registered_names() -> Vec<String> {
    let mut names: Vec<String> = registry()
        .lock()
        .expect("task registry poisoned")
        .keys()
        .cloned()
        .collect();
    names.sort();
    names
}

/// Marshalling capability for a task's item and output types
///
/// Only present on registered tasks, where the serde bounds are known.
pub trait Marshaller<I, O>: Send + Sync {
    fn encode_item(&self, item: &I) -> Result<Vec<u8>, TaskError>;
    fn encode_output(&self, output: &O) -> Result<Vec<u8>, TaskError>;
    fn decode_output(&self, bytes: &[u8]) -> Result<O, TaskError>;
}

struct BincodeMarshaller<I, O> {
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> Marshaller<I, O> for BincodeMarshaller<I, O>
where
    I: Serialize,
    O: Serialize + DeserializeOwned,
{
    fn encode_item(&self, item: &I) -> Result<Vec<u8>, TaskError> {
        bincode::serialize(item).map_err(|e| TaskError::Marshal(e.to_string()))
    }

    fn encode_output(&self, output: &O) -> Result<Vec<u8>, TaskError> {
        bincode::serialize(output).map_err(|e| TaskError::Marshal(e.to_string()))
    }

    fn decode_output(&self, bytes: &[u8]) -> Result<O, TaskError> {
        bincode::deserialize(bytes).map_err(|e| TaskError::Marshal(e.to_string()))
    }
}

/// A unary function with its dispatch capabilities
pub struct TaskFn<I, O> {
    call: Arc<dyn Fn(&I) -> Result<O, TaskError> + Send + Sync>,
    identity: String,
    registered_name: Option<String>,
    marshaller: Option<Arc<dyn Marshaller<I, O>>>,
}

impl<I, O> Clone for TaskFn<I, O> {
    fn clone(&self) -> Self {
        Self {
            call: Arc::clone(&self.call),
            identity: self.identity.clone(),
            registered_name: self.registered_name.clone(),
            marshaller: self.marshaller.clone(),
        }
    }
}

impl<I, O> std::fmt::Debug for TaskFn<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskFn")
            .field("identity", &self.identity)
            .field("registered", &self.registered_name.is_some())
            .finish()
    }
}

impl<I, O> TaskFn<I, O> {
    /// Wrap a closure that can only run in this process (serial or threads)
    pub fn local<F>(f: F) -> Self
    where
        F: Fn(&I) -> O + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(move |item| Ok(f(item))),
            identity: format!("local:{}", std::any::type_name::<F>()),
            registered_name: None,
            marshaller: None,
        }
    }

    /// Wrap a fallible closure; errors are reported per item
    pub fn local_fallible<F>(f: F) -> Self
    where
        F: Fn(&I) -> Result<O, TaskError> + Send + Sync + 'static,
    {
        Self {
            call: Arc::new(f),
            identity: format!("local:{}", std::any::type_name::<F>()),
            registered_name: None,
            marshaller: None,
        }
    }

    /// Apply the function to one item, converting panics into errors
    pub fn apply(&self, item: &I) -> Result<O, TaskError> {
        let call = &self.call;
        match catch_unwind(AssertUnwindSafe(|| call(item))) {
            Ok(result) => result,
            Err(payload) => Err(TaskError::Panicked(panic_message(&*payload))),
        }
    }

    /// Whether this function can be shipped to worker processes
    pub fn marshalable(&self) -> bool {
        self.registered_name.is_some()
    }

    /// Registered name, when process-dispatchable
    pub fn name(&self) -> Option<&str> {
        self.registered_name.as_deref()
    }

    /// Stable identity used in workload fingerprints
    ///
    /// Registered tasks use their name, so the fingerprint agrees across
    /// processes; local closures fall back to the closure's type name.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Marshalling capability, when present
    pub fn marshaller(&self) -> Option<&Arc<dyn Marshaller<I, O>>> {
        self.marshaller.as_ref()
    }
}

impl<I, O> TaskFn<I, O>
where
    I: Serialize + DeserializeOwned + 'static,
    O: Serialize + DeserializeOwned + 'static,
{
    /// Wrap a function and register it for process dispatch under `name`
    ///
    /// Registration is idempotent: calling again with the same name replaces
    /// the entry, so startup paths may run more than once.
    pub fn registered<F>(name: &str, f: F) -> Self
    where
        F: Fn(&I) -> O + Send + Sync + 'static,
    {
        let shared = Arc::new(f);
        let for_bytes = Arc::clone(&shared);
        let byte_task: ByteTask = Arc::new(move |bytes| {
            let item: I =
                bincode::deserialize(bytes).map_err(|e| TaskError::Marshal(e.to_string()))?;
            let call = &for_bytes;
            let output = match catch_unwind(AssertUnwindSafe(|| call(&item))) {
                Ok(output) => output,
                Err(payload) => return Err(TaskError::Panicked(panic_message(&*payload))),
            };
            bincode::serialize(&output).map_err(|e| TaskError::Marshal(e.to_string()))
        });
        register_bytes(name, byte_task);

        Self {
            call: Arc::new(move |item| Ok(shared(item))),
            identity: format!("registered:{}", name),
            registered_name: Some(name.to_string()),
            marshaller: Some(Arc::new(BincodeMarshaller { _types: PhantomData })),
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_task_applies() {
        let task = TaskFn::local(|x: &i64| x * 2);
        assert_eq!(task.apply(&21), Ok(42));
        assert!(!task.marshalable());
        assert!(task.identity().starts_with("local:"));
    }

    #[test]
    fn test_panic_becomes_error() {
        let task: TaskFn<i64, i64> = TaskFn::local(|_x| panic!("boom"));
        match task.apply(&1) {
            Err(TaskError::Panicked(message)) => assert!(message.contains("boom")),
            other => panic!("expected Panicked, got {:?}", other),
        }
    }

    #[test]
    fn test_registered_task_round_trips_through_registry() {
        let task = TaskFn::registered("test-square", |x: &i64| x * x);
        assert!(task.marshalable());
        assert_eq!(task.name(), Some("test-square"));
        assert_eq!(task.identity(), "registered:test-square");

        let byte_task = lookup("test-square").expect("registered task must resolve");
        let input = bincode::serialize(&7i64).unwrap();
        let output = byte_task(&input).unwrap();
        let decoded: i64 = bincode::deserialize(&output).unwrap();
        assert_eq!(decoded, 49);
    }

    #[test]
    fn test_registered_identity_is_name_based() {
        let a = TaskFn::registered("test-id", |x: &i64| *x);
        let b = TaskFn::registered("test-id", |x: &i64| *x);
        // Two registrations of the same name agree on identity, so the
        // fingerprint agrees across processes.
        assert_eq!(a.identity(), b.identity());
    }

    #[test]
    fn test_lookup_missing_name() {
        assert!(lookup("test-never-registered").is_none());
    }

    #[test]
    fn test_marshaller_round_trip() {
        let task = TaskFn::registered("test-marshal", |x: &i64| x + 1);
        let marshaller = task.marshaller().expect("registered task has marshaller");
        let bytes = marshaller.encode_output(&5i64).unwrap();
        assert_eq!(marshaller.decode_output(&bytes).unwrap(), 5i64);
        assert!(!marshaller.encode_item(&9i64).unwrap().is_empty());
    }
}
