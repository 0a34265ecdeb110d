//! Operation registry.
//!
//! Every cacheable operation is registered explicitly at startup with its
//! producer, keep-alive policy and session scoping. The registry is immutable
//! once built and is the only place calls are normalized into
//! [`ComputationKey`]s.

use async_trait::async_trait;
use kinetic_core::{ComputationKey, ComputeError, ComputeResult, ConfigError, KeepAlive, Session};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::config::ComputeConfig;
use crate::constants::RESERVED_NAME_CHARS;
use crate::context::ComputeContext;

/// Produces the value of an operation for one argument list.
///
/// Nested calls must go through `ctx` so they are recorded as dependencies.
#[async_trait]
pub trait Producer: Send + Sync + 'static {
    async fn produce(&self, ctx: ComputeContext, args: Vec<Value>) -> ComputeResult<Value>;
}

/// Adapter turning an async closure into a [`Producer`].
pub struct FnProducer<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Producer for FnProducer<F>
where
    F: Fn(ComputeContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ComputeResult<Value>> + Send + 'static,
{
    async fn produce(&self, ctx: ComputeContext, args: Vec<Value>) -> ComputeResult<Value> {
        (self.f)(ctx, args).await
    }
}

/// Wrap an async closure as a shared producer.
///
/// ```ignore
/// let double = producer_fn(|_ctx, args| async move {
///     let n = args.first().and_then(Value::as_i64).unwrap_or(0);
///     Ok(json!(n * 2))
/// });
/// ```
pub fn producer_fn<F, Fut>(f: F) -> Arc<dyn Producer>
where
    F: Fn(ComputeContext, Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ComputeResult<Value>> + Send + 'static,
{
    Arc::new(FnProducer { f })
}

/// One registered operation.
#[derive(Clone)]
pub struct OperationDescriptor {
    name: String,
    keep_alive: Option<KeepAlive>,
    session_scoped: bool,
    producer: Arc<dyn Producer>,
}

impl OperationDescriptor {
    pub fn new(name: impl Into<String>, producer: Arc<dyn Producer>) -> Self {
        Self {
            name: name.into(),
            keep_alive: None,
            session_scoped: false,
            producer,
        }
    }

    /// Retain results for `keep_alive` after their last use.
    pub fn with_keep_alive(mut self, keep_alive: KeepAlive) -> Self {
        self.keep_alive = Some(keep_alive);
        self
    }

    /// Partition results by the caller's session.
    pub fn session_scoped(mut self) -> Self {
        self.session_scoped = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keep-alive policy. Operations registered without one get the
    /// registry default when the registry is built.
    pub fn keep_alive(&self) -> KeepAlive {
        self.keep_alive.unwrap_or(KeepAlive::NONE)
    }

    pub fn is_session_scoped(&self) -> bool {
        self.session_scoped
    }

    pub(crate) fn producer(&self) -> Arc<dyn Producer> {
        Arc::clone(&self.producer)
    }
}

impl fmt::Debug for OperationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationDescriptor")
            .field("name", &self.name)
            .field("keep_alive", &self.keep_alive)
            .field("session_scoped", &self.session_scoped)
            .finish_non_exhaustive()
    }
}

/// Immutable table of registered operations.
#[derive(Debug)]
pub struct OperationRegistry {
    operations: HashMap<String, OperationDescriptor>,
    max_args: usize,
}

impl OperationRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::new(ComputeConfig::default())
    }

    /// Builder applying the defaults from `config`.
    pub fn builder_with(config: ComputeConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn get(&self, operation: &str) -> ComputeResult<&OperationDescriptor> {
        self.operations
            .get(operation)
            .ok_or_else(|| ComputeError::UnknownOperation {
                operation: operation.to_string(),
            })
    }

    pub fn contains(&self, operation: &str) -> bool {
        self.operations.contains_key(operation)
    }

    /// Normalize a call into its canonical key.
    ///
    /// The session is kept only for session-scoped operations.
    pub fn key_for(
        &self,
        operation: &str,
        args: Vec<Value>,
        session: Option<Session>,
    ) -> ComputeResult<ComputationKey> {
        let descriptor = self.get(operation)?;
        if args.len() > self.max_args {
            return Err(ComputeError::InvalidArguments {
                operation: operation.to_string(),
                reason: format!(
                    "{} arguments given, at most {} allowed",
                    args.len(),
                    self.max_args
                ),
            });
        }

        match session {
            Some(session) if descriptor.session_scoped => {
                Ok(ComputationKey::with_session(operation, args, session))
            }
            _ => Ok(ComputationKey::new(operation, args)),
        }
    }

    /// Registered operation names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.operations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Collects operations and validates them on `build`.
pub struct RegistryBuilder {
    config: ComputeConfig,
    operations: Vec<OperationDescriptor>,
}

impl RegistryBuilder {
    fn new(config: ComputeConfig) -> Self {
        Self {
            config,
            operations: Vec::new(),
        }
    }

    pub fn register(mut self, descriptor: OperationDescriptor) -> Self {
        self.operations.push(descriptor);
        self
    }

    /// Shorthand for registering a non-session-scoped operation.
    pub fn operation(
        self,
        name: impl Into<String>,
        keep_alive: KeepAlive,
        producer: Arc<dyn Producer>,
    ) -> Self {
        self.register(OperationDescriptor::new(name, producer).with_keep_alive(keep_alive))
    }

    pub fn build(self) -> Result<OperationRegistry, ConfigError> {
        let mut operations = HashMap::with_capacity(self.operations.len());

        for mut descriptor in self.operations {
            validate_name(&descriptor.name)?;
            if descriptor.keep_alive.is_none() {
                descriptor.keep_alive = Some(self.config.default_keep_alive);
            }
            if operations.contains_key(&descriptor.name) {
                return Err(ConfigError::DuplicateOperation {
                    operation: descriptor.name,
                });
            }
            operations.insert(descriptor.name.clone(), descriptor);
        }

        Ok(OperationRegistry {
            operations,
            max_args: self.config.max_args,
        })
    }
}

fn validate_name(name: &str) -> Result<(), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidOperationName {
        operation: name.to_string(),
        reason: reason.to_string(),
    };

    if name.is_empty() {
        return Err(invalid("name is empty"));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(invalid("name contains whitespace"));
    }
    if let Some(c) = name.chars().find(|c| RESERVED_NAME_CHARS.contains(c)) {
        return Err(invalid(&format!("name contains reserved character {c:?}")));
    }
    Ok(())
}
