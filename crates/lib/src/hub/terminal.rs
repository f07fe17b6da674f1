//! Hub built from an explicit method table over an application-owned terminal.
//!
//! Each method is declared once with its id, name and a typed handler; the parameter type
//! drives MessagePack decoding of the payload. The hub only keeps a weak reference, so the
//! application decides when the terminal goes away.

use super::{Hub, HubError, Invocation, Params};
use crate::transport::payload;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

type Decoder = Box<dyn Fn(&[u8], usize) -> Result<Params, HubError> + Send + Sync>;
type Handler<T> = Box<dyn Fn(&mut T, Params) -> Result<Invocation, HubError> + Send + Sync>;

struct Method<T> {
    decode: Decoder,
    handle: Handler<T>,
}

/// Method id -> typed handler, plus a name -> id index.
pub struct MethodTable<T> {
    methods: HashMap<i16, Method<T>>,
    names: HashMap<String, i16>,
}

impl<T: 'static> Default for MethodTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> MethodTable<T> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
            names: HashMap::new(),
        }
    }

    /// Declare method `id` called `name`. `A` is the parameter type carried in the payload;
    /// use `()` for methods without parameters.
    pub fn method<A, F>(mut self, id: i16, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        F: Fn(&mut T, A) -> Invocation + Send + Sync + 'static,
    {
        let decode: Decoder = Box::new(|frame: &[u8], offset: usize| {
            let args: A = payload::decode(frame, offset)?;
            Ok(Box::new(args) as Params)
        });
        let handle: Handler<T> = Box::new(move |terminal: &mut T, params: Params| {
            let args = params
                .downcast::<A>()
                .map_err(|_| HubError::ParamsType { method_id: id })?;
            Ok(handler(terminal, *args))
        });
        self.names.insert(name.into(), id);
        self.methods.insert(id, Method { decode, handle });
        self
    }

    pub fn id_of(&self, name: &str) -> Option<i16> {
        self.names.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// [`Hub`] that forwards invocations to a terminal through its [`MethodTable`].
pub struct TerminalHub<T> {
    id: u8,
    terminal_id: u8,
    terminal: Weak<Mutex<T>>,
    methods: MethodTable<T>,
}

impl<T: Send + 'static> TerminalHub<T> {
    pub fn new(id: u8, terminal_id: u8, terminal: &Arc<Mutex<T>>, methods: MethodTable<T>) -> Self {
        Self {
            id,
            terminal_id,
            terminal: Arc::downgrade(terminal),
            methods,
        }
    }

    fn method(&self, method_id: i16) -> Result<&Method<T>, HubError> {
        self.methods.methods.get(&method_id).ok_or(HubError::UnknownMethod {
            hub_id: self.id,
            method_id,
        })
    }
}

impl<T: Send + 'static> Hub for TerminalHub<T> {
    fn id(&self) -> u8 {
        self.id
    }

    fn terminal_id(&self) -> u8 {
        self.terminal_id
    }

    fn decode_params(&self, method_id: i16, frame: &[u8], offset: usize) -> Result<Params, HubError> {
        (self.method(method_id)?.decode)(frame, offset)
    }

    fn invoke(&self, method_id: i16, params: Params) -> Result<Invocation, HubError> {
        let method = self.method(method_id)?;
        let terminal = self
            .terminal
            .upgrade()
            .ok_or_else(|| HubError::Terminal("terminal was dropped".to_string()))?;
        let mut guard = terminal
            .lock()
            .map_err(|_| HubError::Terminal("terminal lock poisoned".to_string()))?;
        (method.handle)(&mut *guard, params)
    }

    fn method_id(&self, name: &str) -> Option<i16> {
        self.methods.id_of(name)
    }
}
