//! # Capability Registry
//!
//! Replaceable server capabilities keyed by their trait object type. Each
//! capability has one default and at most one override; the override wins.
//!
//! ```text
//! provide_default::<dyn UsageSink>(LogUsageSink)     // server startup
//! provide::<dyn UsageSink>(MySink, "stats-plugin")   // optional override
//! get::<dyn UsageSink>() -> (MySink, is_default = false)
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ApiError;

struct Entry {
    default: Option<Box<dyn Any + Send + Sync>>,
    overridden: Option<(String, Box<dyn Any + Send + Sync>)>,
}

/// Defaults and overrides for capability types.
#[derive(Default)]
pub struct ApiRegistry {
    entries: HashMap<TypeId, Entry>,
}

impl ApiRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the default implementation of `T`.
    pub fn provide_default<T>(&mut self, api: Arc<T>) -> Result<(), ApiError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = self.entries.entry(TypeId::of::<T>()).or_insert(Entry {
            default: None,
            overridden: None,
        });
        if entry.default.is_some() {
            return Err(ApiError::DefaultAlreadyProvided {
                api: type_name::<T>(),
            });
        }
        entry.default = Some(Box::new(api));
        Ok(())
    }

    /// Overrides `T` on behalf of `owner`.
    pub fn provide<T>(&mut self, api: Arc<T>, owner: impl Into<String>) -> Result<(), ApiError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let Some(entry) = self.entries.get_mut(&TypeId::of::<T>()) else {
            return Err(ApiError::NoDefault {
                api: type_name::<T>(),
            });
        };
        if let Some((owner, _)) = &entry.overridden {
            return Err(ApiError::AlreadyOverridden {
                api: type_name::<T>(),
                owner: owner.clone(),
            });
        }
        let owner = owner.into();
        tracing::info!(api = type_name::<T>(), %owner, "API overridden");
        entry.overridden = Some((owner, Box::new(api)));
        Ok(())
    }

    /// Returns the active implementation of `T` and whether it is the default.
    #[must_use]
    pub fn get<T>(&self) -> Option<(Arc<T>, bool)>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = self.entries.get(&TypeId::of::<T>())?;
        if let Some((_, api)) = &entry.overridden {
            return api.downcast_ref::<Arc<T>>().map(|api| (Arc::clone(api), false));
        }
        entry
            .default
            .as_ref()?
            .downcast_ref::<Arc<T>>()
            .map(|api| (Arc::clone(api), true))
    }

    /// Owner of the override for `T`, if any.
    #[must_use]
    pub fn owner<T>(&self) -> Option<&str>
    where
        T: ?Sized + 'static,
    {
        self.entries
            .get(&TypeId::of::<T>())?
            .overridden
            .as_ref()
            .map(|(owner, _)| owner.as_str())
    }
}

impl std::fmt::Debug for ApiRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiRegistry")
            .field("apis", &self.entries.len())
            .finish()
    }
}
