//! Name-keyed registries for orchestrations and activities.
//!
//! A registry is an immutable, cheaply clonable map built once and injected
//! into `Runtime::start*`. Duplicate names are collected as builder errors.

use super::{ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::{codec, ActivityError, OrchestrationContext};
use std::collections::HashMap;
use std::sync::Arc;

/// Generic name -> handler registry.
pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// Manual Clone impl since H: ?Sized doesn't auto-derive Clone
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "duraflow::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        found
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build the registry, returning all registration errors joined by `; `.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn merge_registry(mut self, other: Registry<H>, error_prefix: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            if self.map.contains_key(name) {
                self.errors.push(format!("duplicate {error_prefix} in merge: {name}"));
            } else {
                self.map.insert(name.clone(), handler.clone());
            }
        }
        self
    }

    fn insert(&mut self, name: String, handler: Arc<H>, error_prefix: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {error_prefix} registration: {name}"));
        } else {
            self.map.insert(name, handler);
        }
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Register an orchestration whose input and output are JSON-encoded.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = codec::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                codec::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

impl ActivityRegistryBuilder {
    /// Register an activity. A `String` error is a permanent failure.
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input: String| {
            let fut = f(input);
            async move { fut.await.map_err(ActivityError::Permanent) }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    /// Register an activity that can signal transient failures.
    pub fn register_fallible<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, ActivityError>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    /// Register an activity whose input and output are JSON-encoded.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(In) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = codec::decode(&input_s).map_err(ActivityError::Permanent)?;
                let out: Out = f_inner(input).await.map_err(ActivityError::Permanent)?;
                codec::encode(&out).map_err(ActivityError::Permanent)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_reported() {
        let err = ActivityRegistry::builder()
            .register("A", |s: String| async move { Ok(s) })
            .register("A", |s: String| async move { Ok(s) })
            .build_result()
            .err()
            .unwrap();
        assert_eq!(err, "duplicate activity registration: A");
    }

    #[test]
    fn merge_combines_and_flags_overlap() {
        let a = OrchestrationRegistry::builder()
            .register("O1", |_ctx, s| async move { Ok(s) })
            .build();
        let b = OrchestrationRegistry::builder()
            .register("O2", |_ctx, s| async move { Ok(s) })
            .merge(a.clone())
            .build();
        assert_eq!(b.list_names(), vec!["O1".to_string(), "O2".to_string()]);

        let err = OrchestrationRegistry::builder_from(&b).merge(a).build_result().err().unwrap();
        assert!(err.contains("duplicate orchestration in merge: O1"));
    }

    #[tokio::test]
    async fn typed_activity_roundtrips_json() {
        #[derive(serde::Deserialize)]
        struct Req {
            n: u32,
        }
        let reg = ActivityRegistry::builder()
            .register_typed("Double", |r: Req| async move { Ok::<_, String>(r.n * 2) })
            .register("Fails", |_s: String| async move { Err("nope".to_string()) })
            .build();
        let h = reg.get("Double").unwrap();
        assert_eq!(h.invoke("{\"n\":21}".into()).await.unwrap(), "42");
        assert!(matches!(
            h.invoke("garbage".into()).await,
            Err(ActivityError::Permanent(_))
        ));
        assert_eq!(
            reg.get("Fails").unwrap().invoke(String::new()).await,
            Err(ActivityError::Permanent("nope".into()))
        );
        assert!(reg.get("Missing").is_none());
    }
}
