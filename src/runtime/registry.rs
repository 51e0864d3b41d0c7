use super::{FnOrchestration, OrchestrationHandler};
use crate::OrchestrationContext;
use crate::_typed_codec::Codec;
use async_trait::async_trait;
use semver::Version;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

type VersionMap = BTreeMap<Version, Arc<dyn OrchestrationHandler>>;

const DEFAULT_VERSION: Version = Version::new(1, 0, 0);

/// Orchestration handlers by name and semver version.
#[derive(Clone, Default)]
pub struct OrchestrationRegistry {
    pub(crate) inner: Arc<HashMap<String, VersionMap>>,
    pub(crate) policy: Arc<tokio::sync::Mutex<HashMap<String, VersionPolicy>>>,
}

/// Which version new instances of a name start on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VersionPolicy {
    Latest,
    Exact(Version),
}

impl OrchestrationRegistry {
    pub fn builder() -> OrchestrationRegistryBuilder {
        OrchestrationRegistryBuilder {
            map: HashMap::new(),
            policy: HashMap::new(),
            errors: Vec::new(),
        }
    }

    /// Version and handler a new instance of `name` starts on, per policy.
    pub async fn resolve_for_start(&self, name: &str) -> Option<(Version, Arc<dyn OrchestrationHandler>)> {
        let pol = self
            .policy
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or(VersionPolicy::Latest);
        match pol {
            VersionPolicy::Latest => {
                let m = self.inner.get(name)?;
                let (v, h) = m.iter().next_back()?;
                Some((v.clone(), h.clone()))
            }
            VersionPolicy::Exact(v) => {
                let h = self.inner.get(name)?.get(&v)?.clone();
                Some((v, h))
            }
        }
    }

    /// Latest registered handler for `name`.
    pub fn get(&self, name: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name)?.iter().next_back().map(|(_v, h)| h.clone())
    }

    pub fn resolve_exact(&self, name: &str, v: &Version) -> Option<Arc<dyn OrchestrationHandler>> {
        self.inner.get(name)?.get(v).cloned()
    }

    /// Handler recorded for an execution: `version` is the string from `OrchestratorStarted`.
    pub fn resolve_recorded(&self, name: &str, version: &str) -> Option<Arc<dyn OrchestrationHandler>> {
        let v = Version::parse(version).ok()?;
        self.resolve_exact(name, &v)
    }

    pub async fn set_version_policy(&self, name: &str, policy: VersionPolicy) {
        self.policy.lock().await.insert(name.to_string(), policy);
    }

    pub async fn unpin(&self, name: &str) {
        self.set_version_policy(name, VersionPolicy::Latest).await;
    }

    pub fn list_orchestration_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn list_orchestration_versions(&self, name: &str) -> Vec<Version> {
        self.inner
            .get(name)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct OrchestrationRegistryBuilder {
    map: HashMap<String, VersionMap>,
    policy: HashMap<String, VersionPolicy>,
    errors: Vec<String>,
}

impl OrchestrationRegistryBuilder {
    fn insert(mut self, name: String, v: Version, handler: Arc<dyn OrchestrationHandler>) -> Self {
        let entry = self.map.entry(name.clone()).or_default();
        if entry.contains_key(&v) {
            self.errors
                .push(format!("duplicate orchestration registration: {name}@{v}"));
            return self;
        }
        entry.insert(v, handler);
        self
    }

    /// Register `f` as version 1.0.0 of `name`.
    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(f)))
    }

    /// Register with serde-decoded input and serde-encoded output.
    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + Clone + 'static,
        Fut: std::future::Future<Output = Result<Out, String>> + Send + 'static,
    {
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f_inner = f.clone();
            async move {
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = f_inner(ctx, input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert(name.into(), DEFAULT_VERSION, Arc::new(FnOrchestration(wrapper)))
    }

    /// Register a specific version. Versions of one name must be registered in
    /// increasing order.
    pub fn register_versioned<F, Fut>(mut self, name: impl Into<String>, version: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        let name = name.into();
        let v = match Version::parse(version.as_ref()) {
            Ok(v) => v,
            Err(e) => {
                self.errors
                    .push(format!("invalid version '{}' for {name}: {e}", version.as_ref()));
                return self;
            }
        };
        if let Some(latest) = self.map.get(&name).and_then(|m| m.keys().next_back())
            && &v < latest
        {
            self.errors.push(format!(
                "non-monotonic orchestration version for {name}: {v} is not later than existing latest {latest}"
            ));
            return self;
        }
        self.insert(name, v, Arc::new(FnOrchestration(f)))
    }

    pub fn set_policy(mut self, name: impl Into<String>, policy: VersionPolicy) -> Self {
        self.policy.insert(name.into(), policy);
        self
    }

    /// Build, ignoring registration errors.
    pub fn build(self) -> OrchestrationRegistry {
        OrchestrationRegistry {
            inner: Arc::new(self.map),
            policy: Arc::new(tokio::sync::Mutex::new(self.policy)),
        }
    }

    pub fn build_result(self) -> Result<OrchestrationRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

// ---------------- Activity registry

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, input: String) -> Result<String, String> {
        (self.0)(input).await
    }
}

#[derive(Clone, Default)]
pub struct ActivityRegistry {
    pub(crate) inner: Arc<HashMap<String, Arc<dyn ActivityHandler>>>,
}

pub struct ActivityRegistryBuilder {
    map: HashMap<String, Arc<dyn ActivityHandler>>,
    errors: Vec<String>,
}

impl ActivityRegistry {
    pub fn builder() -> ActivityRegistryBuilder {
        ActivityRegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActivityHandler>> {
        self.inner.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }
}

impl ActivityRegistryBuilder {
    /// Start from an existing registry's handlers.
    pub fn from_registry(reg: &ActivityRegistry) -> Self {
        ActivityRegistryBuilder {
            map: reg.inner.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            errors: Vec::new(),
        }
    }

    fn insert(mut self, name: String, handler: Arc<dyn ActivityHandler>) -> Self {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate activity registration: {name}"));
            return self;
        }
        self.map.insert(name, handler);
        self
    }

    pub fn register<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)))
    }

    pub fn register_typed<In, Out, F, Fut>(self, name: impl Into<String>, f: F) -> Self
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
                let input: In = crate::_typed_codec::Json::decode(&input_s)?;
                let out: Out = (f_inner)(input).await?;
                crate::_typed_codec::Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)))
    }

    pub fn build(self) -> ActivityRegistry {
        ActivityRegistry {
            inner: Arc::new(self.map),
        }
    }

    pub fn build_result(self) -> Result<ActivityRegistry, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn echo(_ctx: OrchestrationContext, input: String) -> Result<String, String> {
        Ok(input)
    }

    #[tokio::test]
    async fn latest_policy_picks_highest_version() {
        let reg = OrchestrationRegistry::builder()
            .register("Order", echo)
            .register_versioned("Order", "2.1.0", echo)
            .build();
        let (v, _) = reg.resolve_for_start("Order").await.unwrap();
        assert_eq!(v, Version::new(2, 1, 0));

        reg.set_version_policy("Order", VersionPolicy::Exact(Version::new(1, 0, 0)))
            .await;
        let (v, _) = reg.resolve_for_start("Order").await.unwrap();
        assert_eq!(v, Version::new(1, 0, 0));
        assert!(reg.resolve_recorded("Order", "2.1.0").is_some());
        assert!(reg.resolve_recorded("Order", "3.0.0").is_none());
        assert!(reg.resolve_recorded("Order", "not-a-version").is_none());
    }

    #[test]
    fn duplicate_and_invalid_registrations_are_reported() {
        let err = OrchestrationRegistry::builder()
            .register("A", echo)
            .register("A", echo)
            .register_versioned("B", "x.y", echo)
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate orchestration registration: A@1.0.0"));
        assert!(err.contains("invalid version 'x.y'"));

        let err = ActivityRegistry::builder()
            .register("Charge", |s: String| async move { Ok(s) })
            .register("Charge", |s: String| async move { Ok(s) })
            .build_result()
            .err()
            .unwrap();
        assert!(err.contains("duplicate activity registration: Charge"));
    }
}
