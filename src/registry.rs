//! Service registry: named services, each a table of dispatchable methods.
//!
//! A service is any `Send + Sync` type implementing [`Service`]. At
//! registration the registry asks the type for its methods and stores each
//! one as a type-erased thunk that decodes the input, calls the method with a
//! fresh default output, and encodes the result. Dispatch is then a plain
//! table lookup.
//!
//! ```ignore
//! #[derive(Default, Deserialize)]
//! struct Args { x: i64 }
//! #[derive(Default, Serialize)]
//! struct Reply { y: i64 }
//!
//! struct Calc;
//!
//! impl Calc {
//!     fn square(&self, args: Args, reply: &mut Reply) -> Result<(), String> {
//!         reply.y = args.x * args.x;
//!         Ok(())
//!     }
//! }
//!
//! muxrpc::service_methods!(Calc { "Square" => square });
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::value::RawValue;

use crate::protocol::{decode_payload, split_method, Request, Response};
use crate::types::{Error, Result};

/// A type whose methods can be called by name over the wire.
pub trait Service: Send + Sync + Sized + 'static {
    /// Name the service is registered under. Defaults to the type's own name
    /// without module path or generic arguments.
    fn service_name() -> String {
        short_type_name::<Self>().to_string()
    }

    /// Declare the callable methods.
    fn methods(methods: &mut MethodSet<Self>);
}

/// Implement [`Service`] for a type from a list of `"WireName" => method`
/// pairs. Each method must have the shape
/// `fn(&self, Input, &mut Output) -> Result<(), E>`.
#[macro_export]
macro_rules! service_methods {
    ($ty:ty { $($name:literal => $method:ident),* $(,)? }) => {
        impl $crate::Service for $ty {
            fn methods(methods: &mut $crate::MethodSet<Self>) {
                $(methods.add($name, <$ty>::$method);)*
            }
        }
    };
    ($ty:ty as $service:literal { $($name:literal => $method:ident),* $(,)? }) => {
        impl $crate::Service for $ty {
            fn service_name() -> String {
                $service.to_string()
            }

            fn methods(methods: &mut $crate::MethodSet<Self>) {
                $(methods.add($name, <$ty>::$method);)*
            }
        }
    };
}

/// Last path segment of a type name, generics stripped.
/// `my_crate::api::Calc<u8>` → `Calc`.
pub(crate) fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

fn is_addressable(name: &str) -> bool {
    !name.is_empty() && !name.contains('.')
}

type Receiver = dyn Any + Send + Sync;
type Thunk = dyn Fn(&Receiver, Option<&RawValue>) -> Result<Box<RawValue>> + Send + Sync;

/// One dispatchable method.
pub struct ServiceMethod {
    invoke: Box<Thunk>,
    input_type: &'static str,
    output_type: &'static str,
}

impl ServiceMethod {
    /// Type name of the decoded input.
    pub fn input_type(&self) -> &'static str {
        self.input_type
    }

    /// Type name of the encoded output.
    pub fn output_type(&self) -> &'static str {
        self.output_type
    }
}

impl fmt::Debug for ServiceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceMethod")
            .field("input_type", &self.input_type)
            .field("output_type", &self.output_type)
            .finish_non_exhaustive()
    }
}

/// Method table under construction for service type `T`.
pub struct MethodSet<T> {
    service: String,
    methods: HashMap<String, ServiceMethod>,
    _receiver: std::marker::PhantomData<fn(&T)>,
}

impl<T> fmt::Debug for MethodSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodSet")
            .field("service", &self.service)
            .field("methods", &self.methods.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<T: Service> MethodSet<T> {
    fn new(service: String) -> Self {
        Self {
            service,
            methods: HashMap::new(),
            _receiver: std::marker::PhantomData,
        }
    }

    /// Add a method under `name`. Names that cannot appear in a
    /// `Service.Method` string are skipped.
    pub fn add<I, O, E, F>(&mut self, name: &str, method: F) -> &mut Self
    where
        I: DeserializeOwned + 'static,
        O: Serialize + Default + 'static,
        E: fmt::Display,
        F: Fn(&T, I, &mut O) -> std::result::Result<(), E> + Send + Sync + 'static,
    {
        if !is_addressable(name) {
            tracing::debug!("Skipping method {:?} on {}: not addressable", name, self.service);
            return self;
        }

        let full_name = format!("{}.{}", self.service, name);
        let invoke = move |receiver: &Receiver, param: Option<&RawValue>| -> Result<Box<RawValue>> {
            let receiver = receiver
                .downcast_ref::<T>()
                .ok_or_else(|| Error::internal(format!("receiver type mismatch for {}", full_name)))?;
            let input: I =
                decode_payload(param).map_err(|e| Error::invalid_param(full_name.as_str(), e))?;
            let mut output = O::default();
            method(receiver, input, &mut output).map_err(|e| Error::remote(e.to_string()))?;
            Ok(serde_json::value::to_raw_value(&output)?)
        };

        self.methods.insert(
            name.to_string(),
            ServiceMethod {
                invoke: Box::new(invoke),
                input_type: std::any::type_name::<I>(),
                output_type: std::any::type_name::<O>(),
            },
        );
        self
    }
}

/// A registered service: receiver plus its method table.
pub struct RegisteredService {
    name: String,
    receiver: Arc<Receiver>,
    methods: HashMap<String, ServiceMethod>,
}

impl RegisteredService {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get_method(&self, method: &str) -> Result<&ServiceMethod> {
        self.methods
            .get(method)
            .ok_or_else(|| Error::method_not_found(self.name.as_str(), method))
    }

    /// Method names, sorted.
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn invoke(&self, method: &ServiceMethod, param: Option<&RawValue>) -> Result<Box<RawValue>> {
        (method.invoke)(self.receiver.as_ref(), param)
    }
}

impl fmt::Debug for RegisteredService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredService")
            .field("name", &self.name)
            .field("methods", &self.method_names())
            .finish_non_exhaustive()
    }
}

/// All services known to a server.
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<HashMap<String, Arc<RegisteredService>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `receiver` under `T::service_name()`.
    ///
    /// Fails without touching the registry if the name is unusable or the
    /// type declares no addressable method. An existing service of the same
    /// name is replaced.
    pub fn register<T: Service>(&self, receiver: T) -> Result<()> {
        let name = T::service_name();
        if !is_addressable(&name) {
            return Err(Error::InvalidServiceName(name));
        }

        let mut set = MethodSet::<T>::new(name.clone());
        T::methods(&mut set);
        if set.methods.is_empty() {
            return Err(Error::NoExportedMethod);
        }

        let service = RegisteredService {
            name: name.clone(),
            receiver: Arc::new(receiver),
            methods: set.methods,
        };
        tracing::debug!("Registered service {} ({:?})", name, service.method_names());

        let mut services = self
            .services
            .write()
            .map_err(|_| Error::internal("service registry lock poisoned"))?;
        services.insert(name, Arc::new(service));
        Ok(())
    }

    pub fn get_service(&self, service: &str) -> Result<Arc<RegisteredService>> {
        let services = self
            .services
            .read()
            .map_err(|_| Error::internal("service registry lock poisoned"))?;
        services
            .get(service)
            .cloned()
            .ok_or_else(|| Error::service_not_found(service))
    }

    /// Registered service names, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.services.read() {
            Ok(services) => services.keys().cloned().collect(),
            Err(_) => Vec::new(),
        };
        names.sort_unstable();
        names
    }

    /// Run one request to completion and build its response.
    ///
    /// Every failure becomes an error response carrying the request id.
    pub fn dispatch(&self, request: &Request) -> Response {
        match self.call(request) {
            Ok(result) => Response::success(request.id, result),
            Err(e) => {
                tracing::debug!("Request {} ({}) failed: {}", request.id, request.method, e);
                Response::failure(request.id, e)
            }
        }
    }

    fn call(&self, request: &Request) -> Result<Box<RawValue>> {
        let (service_name, method_name) = split_method(&request.method)?;
        let service = self.get_service(service_name)?;
        let method = service.get_method(method_name)?;
        service.invoke(method, request.param.as_deref())
    }
}
