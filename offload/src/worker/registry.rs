//! Method registry for worker payloads.
//!
//! A registry maps method names to handlers. The built-in set gives a pool
//! a usable worker out of the box: `echo`, `sleep`, and `stream`, plus the
//! `methods` introspection RPC the dispatch loop answers itself.

use crate::error::TaskError;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Emits streamed (`isEvent`) payloads for the task currently executing.
pub struct Emitter<'a> {
    send: &'a (dyn Fn(Value) + Sync),
}

impl<'a> Emitter<'a> {
    /// Creates an emitter around a payload sink.
    pub fn new(send: &'a (dyn Fn(Value) + Sync)) -> Self {
        Self { send }
    }

    /// Emits one event payload. Events are delivered to the caller's event
    /// sink strictly before the task's terminal response.
    pub fn emit(&self, payload: Value) {
        (self.send)(payload);
    }
}

/// A worker method body.
///
/// Implemented for any `Fn(&[Value], &Emitter) -> Result<Value, TaskError>`
/// closure, so registration reads naturally:
///
/// ```ignore
/// registry.register("double", |params, _events| {
///     let n = params.first().and_then(Value::as_i64).unwrap_or(0);
///     Ok(Value::from(n * 2))
/// });
/// ```
pub trait Method: Send + Sync {
    /// Invokes the method with positional parameters.
    fn call(&self, params: &[Value], events: &Emitter<'_>) -> Result<Value, TaskError>;
}

impl<F> Method for F
where
    F: Fn(&[Value], &Emitter<'_>) -> Result<Value, TaskError> + Send + Sync,
{
    fn call(&self, params: &[Value], events: &Emitter<'_>) -> Result<Value, TaskError> {
        self(params, events)
    }
}

/// Named methods a worker exposes over the task protocol.
#[derive(Default, Clone)]
pub struct MethodRegistry {
    methods: HashMap<String, Arc<dyn Method>>,
}

impl MethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in diagnostic set shipped with the default worker.
    pub fn builtin() -> Self {
        let mut registry = Self::new();

        // Returns its first parameter unchanged.
        registry.register("echo", |params: &[Value], _: &Emitter<'_>| {
            Ok(params.first().cloned().unwrap_or(Value::Null))
        });

        // Blocks the worker for `params[0]` milliseconds, then returns it.
        registry.register("sleep", |params: &[Value], _: &Emitter<'_>| {
            let ms = params
                .first()
                .and_then(Value::as_u64)
                .ok_or_else(|| TaskError::new("sleep requires a millisecond count"))?;
            std::thread::sleep(Duration::from_millis(ms));
            Ok(Value::from(ms))
        });

        // Emits each parameter as an event, then resolves with the count.
        registry.register("stream", |params: &[Value], events: &Emitter<'_>| {
            for param in params {
                events.emit(param.clone());
            }
            Ok(Value::from(params.len() as u64))
        });

        registry
    }

    /// Registers a method, replacing any previous registration of the name.
    pub fn register(&mut self, name: impl Into<String>, method: impl Method + 'static) {
        self.methods.insert(name.into(), Arc::new(method));
    }

    /// Looks up a method by name.
    pub fn get(&self, name: &str) -> Option<&Arc<dyn Method>> {
        self.methods.get(name)
    }

    /// All method names, sorted, including the implicit `methods` RPC.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.methods.keys().cloned().collect();
        names.push("methods".to_string());
        names.sort();
        names
    }
}

impl std::fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodRegistry")
            .field("methods", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn collect_events() -> (Arc<Mutex<Vec<Value>>>, impl Fn(Value) + Sync) {
        let events: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        (events, move |payload| sink.lock().unwrap().push(payload))
    }

    #[test]
    fn test_builtin_echo_returns_first_param() {
        let registry = MethodRegistry::builtin();
        let (_, sink) = collect_events();
        let emitter = Emitter::new(&sink);

        let result = registry
            .get("echo")
            .unwrap()
            .call(&[json!(42), json!("ignored")], &emitter)
            .unwrap();
        assert_eq!(result, json!(42));
    }

    #[test]
    fn test_builtin_echo_without_params_returns_null() {
        let registry = MethodRegistry::builtin();
        let (_, sink) = collect_events();
        let emitter = Emitter::new(&sink);

        let result = registry.get("echo").unwrap().call(&[], &emitter).unwrap();
        assert_eq!(result, Value::Null);
    }

    #[test]
    fn test_builtin_stream_emits_each_param() {
        let registry = MethodRegistry::builtin();
        let (events, sink) = collect_events();
        let emitter = Emitter::new(&sink);

        let result = registry
            .get("stream")
            .unwrap()
            .call(&[json!("a"), json!("b"), json!("c")], &emitter)
            .unwrap();

        assert_eq!(result, json!(3));
        assert_eq!(*events.lock().unwrap(), vec![json!("a"), json!("b"), json!("c")]);
    }

    #[test]
    fn test_builtin_sleep_rejects_missing_param() {
        let registry = MethodRegistry::builtin();
        let (_, sink) = collect_events();
        let emitter = Emitter::new(&sink);

        let err = registry.get("sleep").unwrap().call(&[], &emitter).unwrap_err();
        assert!(err.message.contains("millisecond"));
    }

    #[test]
    fn test_names_include_implicit_methods_rpc() {
        let registry = MethodRegistry::builtin();
        let names = registry.names();
        assert!(names.contains(&"methods".to_string()));
        assert!(names.contains(&"echo".to_string()));
        assert!(names.windows(2).all(|w| w[0] <= w[1]), "names are sorted");
    }

    #[test]
    fn test_register_replaces_existing_method() {
        let mut registry = MethodRegistry::new();
        registry.register("answer", |_: &[Value], _: &Emitter<'_>| Ok(json!(1)));
        registry.register("answer", |_: &[Value], _: &Emitter<'_>| Ok(json!(2)));

        let (_, sink) = collect_events();
        let emitter = Emitter::new(&sink);
        let result = registry.get("answer").unwrap().call(&[], &emitter).unwrap();
        assert_eq!(result, json!(2));
    }
}
