//! Service registry and dynamic dispatch.
//!
//! Services are assembled with [`ServiceBuilder`], which captures for every
//! method a handler plus static factories for zero-valued argument and reply
//! instances. The [`Registry`] resolves dotted `Service.Method` names to
//! those descriptors and counts successful calls.
//!
//! # Thread Safety
//!
//! The service table sits behind an `RwLock`; services are immutable once
//! registered and handed out as `Arc`s. Call counters are `AtomicU64`s, so
//! overlapping calls never lose an increment.

use crate::codec::Payload;
use crate::{Result, RpcError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, info, warn};

type Handler =
    Box<dyn Fn(&dyn Payload, &mut dyn Payload) -> std::result::Result<(), String> + Send + Sync>;

fn new_boxed<T: Payload + Default>() -> Box<dyn Payload> {
    Box::new(T::default())
}

/// Static description of a registered method plus its live call counter.
pub struct MethodDescriptor {
    name: String,
    full_name: String,
    arg_shape: &'static str,
    reply_shape: &'static str,
    new_arg: fn() -> Box<dyn Payload>,
    new_reply: fn() -> Box<dyn Payload>,
    handler: Handler,
    num_calls: AtomicU64,
}

impl MethodDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Dotted `Service.Method` name.
    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// Rust type name of the argument, as listed on the debug page. The wire
    /// check uses the structural [`Payload::shape`] instead.
    pub fn arg_shape(&self) -> &'static str {
        self.arg_shape
    }

    pub fn reply_shape(&self) -> &'static str {
        self.reply_shape
    }

    /// Number of successful calls so far.
    pub fn num_calls(&self) -> u64 {
        self.num_calls.load(Ordering::SeqCst)
    }

    pub fn new_arg_value(&self) -> Box<dyn Payload> {
        (self.new_arg)()
    }

    pub fn new_reply_value(&self) -> Box<dyn Payload> {
        (self.new_reply)()
    }

    /// Invoke the bound method, writing its result into `reply`.
    ///
    /// Increments the call counter only when the handler succeeds.
    pub fn call(&self, arg: &dyn Payload, reply: &mut dyn Payload) -> Result<()> {
        match (self.handler)(arg, reply) {
            Ok(()) => {
                let calls = self.num_calls.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("{} succeeded (call #{})", self.full_name, calls);
                Ok(())
            }
            Err(message) => {
                debug!("{} failed: {}", self.full_name, message);
                Err(RpcError::Invocation {
                    method: self.full_name.clone(),
                    message,
                })
            }
        }
    }
}

impl std::fmt::Debug for MethodDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodDescriptor")
            .field("full_name", &self.full_name)
            .field("arg_shape", &self.arg_shape)
            .field("reply_shape", &self.reply_shape)
            .field("num_calls", &self.num_calls())
            .finish()
    }
}

/// A named group of methods.
#[derive(Debug)]
pub struct Service {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
}

impl Service {
    pub fn builder(name: impl Into<String>) -> ServiceBuilder {
        ServiceBuilder {
            name: name.into(),
            methods: HashMap::new(),
            error: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn method(&self, name: &str) -> Option<&Arc<MethodDescriptor>> {
        self.methods.get(name)
    }

    pub fn methods(&self) -> impl Iterator<Item = &Arc<MethodDescriptor>> {
        self.methods.values()
    }
}

/// Builder for [`Service`].
///
/// ```rust,ignore
/// let calc = Service::builder("Calc")
///     .method("Add", |args: &AddArgs, reply: &mut i64| {
///         *reply = args.a + args.b;
///         Ok::<_, String>(())
///     })
///     .build()?;
/// ```
pub struct ServiceBuilder {
    name: String,
    methods: HashMap<String, Arc<MethodDescriptor>>,
    error: Option<String>,
}

fn check_name(kind: &str, name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err(format!("{} name is empty", kind));
    }
    if name.contains('.') {
        return Err(format!("{} name {:?} contains '.'", kind, name));
    }
    Ok(())
}

impl ServiceBuilder {
    /// Register a method taking `A` and filling in `R`.
    pub fn method<A, R, E, F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        A: Payload + Default,
        R: Payload + Default,
        E: Display + 'static,
        F: Fn(&A, &mut R) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.error.is_some() {
            return self;
        }
        if let Err(message) = check_name("method", &name) {
            self.error = Some(message);
            return self;
        }
        if self.methods.contains_key(&name) {
            self.error = Some(format!("method {} registered twice", name));
            return self;
        }

        let arg_shape = std::any::type_name::<A>();
        let reply_shape = std::any::type_name::<R>();
        let handler: Handler = Box::new(
            move |arg: &dyn Payload, reply: &mut dyn Payload| -> std::result::Result<(), String> {
                let arg = arg.as_any().downcast_ref::<A>().ok_or_else(|| {
                    format!("argument has shape {}, expected {}", arg.shape(), arg_shape)
                })?;
                let actual = reply.shape();
                let reply = reply.as_any_mut().downcast_mut::<R>().ok_or_else(|| {
                    format!("reply has shape {}, expected {}", actual, reply_shape)
                })?;
                func(arg, reply).map_err(|e| e.to_string())
            },
        );

        let descriptor = MethodDescriptor {
            full_name: format!("{}.{}", self.name, name),
            name: name.clone(),
            arg_shape,
            reply_shape,
            new_arg: new_boxed::<A>,
            new_reply: new_boxed::<R>,
            handler,
            num_calls: AtomicU64::new(0),
        };
        self.methods.insert(name, Arc::new(descriptor));
        self
    }

    pub fn build(self) -> Result<Service> {
        let invalid = |message: String| RpcError::InvalidService {
            name: self.name.clone(),
            message,
        };
        check_name("service", &self.name).map_err(invalid)?;
        if let Some(message) = self.error.clone() {
            return Err(invalid(message));
        }
        if self.methods.is_empty() {
            return Err(invalid("no methods registered".to_string()));
        }
        Ok(Service {
            name: self.name,
            methods: self.methods,
        })
    }
}

/// Point-in-time view of one method, used by introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MethodSnapshot {
    pub name: String,
    pub arg_shape: String,
    pub reply_shape: String,
    pub num_calls: u64,
}

/// Point-in-time view of one service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub methods: Vec<MethodSnapshot>,
}

/// Table of services keyed by name.
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<Service>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a service. Names must be unique.
    pub fn register(&self, service: Service) -> Result<Arc<Service>> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.contains_key(&service.name) {
            warn!("Service {} already registered", service.name);
            return Err(RpcError::DuplicateService {
                name: service.name,
            });
        }

        info!(
            "Registered service {} ({} methods)",
            service.name,
            service.methods.len()
        );
        let service = Arc::new(service);
        services.insert(service.name.clone(), service.clone());
        Ok(service)
    }

    /// Resolve a dotted `Service.Method` name.
    pub fn lookup(&self, service_method: &str) -> Result<(Arc<Service>, Arc<MethodDescriptor>)> {
        let not_found = || RpcError::NotFound {
            method: service_method.to_string(),
        };
        let (service_name, method_name) = service_method.rsplit_once('.').ok_or_else(not_found)?;

        let service = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service_name)
            .cloned()
            .ok_or_else(not_found)?;
        let method = service.method(method_name).cloned().ok_or_else(not_found)?;
        Ok((service, method))
    }

    /// Fresh zero-valued argument for `method`.
    pub fn new_arg_value(&self, method: &MethodDescriptor) -> Box<dyn Payload> {
        method.new_arg_value()
    }

    /// Fresh zero-valued reply for `method`.
    pub fn new_reply_value(&self, method: &MethodDescriptor) -> Box<dyn Payload> {
        method.new_reply_value()
    }

    pub fn call(&self, method: &MethodDescriptor, arg: &dyn Payload, reply: &mut dyn Payload) -> Result<()> {
        method.call(arg, reply)
    }

    pub fn len(&self) -> usize {
        self.services.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy every service and method with its current call count, sorted by name.
    pub fn snapshot(&self) -> Vec<ServiceSnapshot> {
        let services: Vec<Arc<Service>> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut snapshot: Vec<ServiceSnapshot> = services
            .iter()
            .map(|service| {
                let mut methods: Vec<MethodSnapshot> = service
                    .methods()
                    .map(|m| MethodSnapshot {
                        name: m.name.clone(),
                        arg_shape: m.arg_shape.to_string(),
                        reply_shape: m.reply_shape.to_string(),
                        num_calls: m.num_calls(),
                    })
                    .collect();
                methods.sort_by(|a, b| a.name.cmp(&b.name));
                ServiceSnapshot {
                    name: service.name.clone(),
                    methods,
                }
            })
            .collect();
        snapshot.sort_by(|a, b| a.name.cmp(&b.name));
        snapshot
    }
}
