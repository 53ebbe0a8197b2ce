//! Per-request context: the request plus type-keyed extensions.
//!
//! Middleware uses [`Extensions`] to hand resolved per-request state to
//! downstream handlers; the idempotency middleware stores the
//! [`IdempotencyToken`](crate::idempotency::IdempotencyToken) it extracted.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

use crate::Request;

/// Type-erased request extensions map.
#[derive(Default)]
pub struct Extensions {
    map: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Extensions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a value, returning the previous value of the same type.
    pub fn insert<T>(&mut self, value: T) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|old| *old)
    }

    pub fn get<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    pub fn remove<T>(&mut self) -> Option<T>
    where
        T: Send + Sync + 'static,
    {
        self.map
            .remove(&TypeId::of::<T>())
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| *value)
    }
}

/// Per-request state threaded through the middleware stack.
pub struct Context {
    request: Request,
    extensions: Extensions,
}

impl Context {
    pub fn new(request: Request) -> Self {
        Self {
            request,
            extensions: Extensions::new(),
        }
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    /// Deserialize the request body as JSON.
    pub fn json<T>(&self) -> Result<T, serde_json::Error>
    where
        T: serde::de::DeserializeOwned,
    {
        serde_json::from_slice(self.request.body())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Method;

    #[derive(Debug, PartialEq)]
    struct Marker(u32);

    #[test]
    fn extensions_round_trip_by_type() {
        let mut ext = Extensions::new();
        assert!(ext.insert(Marker(1)).is_none());
        assert_eq!(ext.insert(Marker(2)), Some(Marker(1)));
        assert_eq!(ext.get::<Marker>(), Some(&Marker(2)));
        assert_eq!(ext.remove::<Marker>(), Some(Marker(2)));
        assert!(ext.get::<Marker>().is_none());
    }

    #[test]
    fn json_body() {
        #[derive(serde::Deserialize)]
        struct Order {
            amount: u64,
        }

        let ctx = Context::new(Request::new(Method::Post, "/orders").with_body(r#"{"amount":5}"#));
        let order: Order = ctx.json().unwrap();
        assert_eq!(order.amount, 5);
    }
}
