//! Object registry: publishing local objects and their method tables.

use crate::config::BusConfig;
use crate::connection::Connection;
use crate::dispatch::{HandlerResult, MethodHandler, ResponseHandle};
use crate::error::{BusError, Result};
use crate::policy::Signature;
use crate::reactor::{MethodInfo, ObjectDescriptor, ObjectId};
use crate::value::Value;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;
use tracing::{info, warn};

/// A method exposed by a registered object.
#[derive(Clone)]
pub struct Method {
    pub(crate) name: String,
    pub(crate) signature: Signature,
    pub(crate) handler: Rc<dyn MethodHandler>,
}

impl Method {
    /// Create a method backed by a closure.
    ///
    /// ```
    /// use ubus_core::{Method, Signature, Value, ValueKind};
    ///
    /// let add = Method::new(
    ///     "add",
    ///     Signature::new().arg("a", ValueKind::Int32).arg("b", ValueKind::Int32),
    ///     |conn, response, args| {
    ///         let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
    ///         let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
    ///         response.reply(conn, &Value::table([("sum", Value::Int64(a + b))]))?;
    ///         Ok(())
    ///     },
    /// );
    /// assert_eq!(add.name(), "add");
    /// ```
    pub fn new<F>(name: impl Into<String>, signature: Signature, handler: F) -> Self
    where
        F: Fn(&mut Connection, &ResponseHandle, Value) -> HandlerResult + 'static,
    {
        Self::with_handler(name, signature, Rc::new(handler))
    }

    /// Create a method backed by a shared handler object.
    pub fn with_handler(
        name: impl Into<String>,
        signature: Signature,
        handler: Rc<dyn MethodHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            signature,
            handler,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish_non_exhaustive()
    }
}

/// A locally owned object and its method table.
pub(crate) struct RegisteredObject {
    pub(crate) name: String,
    pub(crate) methods: Vec<Method>,
}

impl RegisteredObject {
    pub(crate) fn method(&self, name: &str) -> Option<&Method> {
        self.methods.iter().find(|m| m.name == name)
    }
}

/// Handle to an object registered on a connection.
///
/// Only valid for the connection session it was created in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHandle {
    id: ObjectId,
    epoch: u64,
    name: String,
}

impl ObjectHandle {
    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

fn check_name(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BusError::usage(format!("{} name must not be empty", kind)));
    }
    if name.len() > BusConfig::MAX_NAME_LEN {
        return Err(BusError::usage(format!(
            "{} name '{}' exceeds {} bytes",
            kind,
            name,
            BusConfig::MAX_NAME_LEN
        )));
    }
    if !name.chars().all(|c| c.is_ascii_graphic()) {
        return Err(BusError::usage(format!(
            "{} name '{}' contains invalid characters",
            kind, name
        )));
    }
    Ok(())
}

fn check_methods(methods: &[Method]) -> Result<()> {
    let mut seen = HashSet::new();
    for method in methods {
        check_name("Method", &method.name)?;
        if !seen.insert(method.name.as_str()) {
            return Err(BusError::usage(format!(
                "Method '{}' is declared more than once",
                method.name
            )));
        }
        if let Some(arg) = method.signature.duplicate_name() {
            return Err(BusError::usage(format!(
                "Argument '{}' of method '{}' is declared more than once",
                arg, method.name
            )));
        }
        if method.signature.policies().iter().any(|p| p.name.is_empty()) {
            return Err(BusError::usage(format!(
                "Method '{}' declares an argument without a name",
                method.name
            )));
        }
    }
    Ok(())
}

impl Connection {
    /// Publish an object on the bus.
    ///
    /// Registration is all-or-nothing: on any failure nothing is retained
    /// locally and nothing is visible to peers.
    pub fn register(&mut self, name: &str, methods: Vec<Method>) -> Result<ObjectHandle> {
        let session = self.session_mut()?;
        check_name("Object", name)?;
        check_methods(&methods)?;

        let descriptor = ObjectDescriptor {
            name: name.to_string(),
            methods: methods
                .iter()
                .map(|m| MethodInfo {
                    name: m.name.clone(),
                    signature: m.signature.clone(),
                })
                .collect(),
        };
        let object = RegisteredObject {
            name: name.to_string(),
            methods,
        };

        let id = session
            .reactor
            .add_object(&descriptor)
            .map_err(|status| BusError::RegistrationFailed {
                object: name.to_string(),
                reason: status.to_string(),
            })?;

        session.objects.insert(id, object);
        info!("Registered object '{}' as {}", name, id);
        Ok(ObjectHandle {
            id,
            epoch: session.epoch,
            name: name.to_string(),
        })
    }

    /// Remove a registered object.
    ///
    /// The local method table is released even when the bus fails to
    /// acknowledge the removal.
    pub fn remove(&mut self, handle: &ObjectHandle) -> Result<()> {
        let session = self.session_mut()?;
        let not_found = || BusError::ObjectNotFound {
            object: handle.name.clone(),
        };
        if session.epoch != handle.epoch {
            return Err(not_found());
        }
        session.objects.remove(&handle.id).ok_or_else(not_found)?;

        if let Err(status) = session.reactor.remove_object(handle.id) {
            warn!("Bus failed to remove object '{}': {}", handle.name, status);
            return Err(BusError::transport("remove_object", status));
        }
        info!("Removed object '{}'", handle.name);
        Ok(())
    }

    /// Names of the objects this connection currently exposes.
    pub fn registered_objects(&self) -> Vec<&str> {
        self.session
            .as_ref()
            .map(|s| s.objects.values().map(|o| o.name.as_str()).collect())
            .unwrap_or_default()
    }
}
