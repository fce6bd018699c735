//! Owner references between a BackupJob and the Jobs it creates
//!
//! Kinds that take part in ownership are registered up front in a
//! [`TypeRegistry`] handed to the reconciler, so binding never depends on
//! process-wide state.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::ApiResource;
use kube::Resource;

use crate::crd::BackupJob;
use crate::error::{Error, Result};

/// Registered kinds usable as owners or owned children
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    resources: Vec<ApiResource>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding BackupJob and Job, the pair the operator binds
    pub fn with_defaults() -> Self {
        Self::new().register::<BackupJob>().register::<Job>()
    }

    pub fn register<K>(mut self) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        let resource = ApiResource::erase::<K>(&());
        if self.lookup::<K>().is_none() {
            self.resources.push(resource);
        }
        self
    }

    pub fn lookup<K>(&self) -> Option<&ApiResource>
    where
        K: Resource<DynamicType = ()>,
    {
        let group = K::group(&());
        let kind = K::kind(&());
        self.resources
            .iter()
            .find(|r| r.group == group && r.kind == kind)
    }

    /// Attach a controller owner reference from `owner` to `child`
    ///
    /// Binding the same owner twice is a no-op; a child already controlled by
    /// a different object is rejected.
    pub fn bind_owner<P, C>(&self, owner: &P, child: &mut C) -> Result<()>
    where
        P: Resource<DynamicType = ()>,
        C: Resource<DynamicType = ()>,
    {
        let owner_type = self.lookup::<P>().ok_or_else(|| {
            Error::schema_mismatch(format!("owner kind {} is not registered", P::kind(&())))
        })?;
        if self.lookup::<C>().is_none() {
            return Err(Error::schema_mismatch(format!(
                "child kind {} is not registered",
                C::kind(&())
            )));
        }

        let meta = owner.meta();
        let uid = meta
            .uid
            .clone()
            .ok_or_else(|| Error::owner_reference("owner has no uid yet"))?;
        let name = meta
            .name
            .clone()
            .ok_or_else(|| Error::owner_reference("owner has no name"))?;

        let refs = child.meta_mut().owner_references.get_or_insert_with(Vec::new);
        if let Some(existing) = refs.iter().find(|r| r.controller == Some(true)) {
            if existing.uid == uid {
                return Ok(());
            }
            return Err(Error::owner_reference(format!(
                "child is already controlled by {} {}",
                existing.kind, existing.name
            )));
        }

        refs.push(OwnerReference {
            api_version: owner_type.api_version.clone(),
            kind: owner_type.kind.clone(),
            name,
            uid,
            controller: Some(true),
            block_owner_deletion: Some(true),
        });
        Ok(())
    }
}

/// Whether `child` is controlled by `owner`; a lookup only, never the reverse
pub fn is_owned_by<P, C>(child: &C, owner: &P) -> bool
where
    P: Resource,
    C: Resource,
{
    let Some(uid) = owner.meta().uid.as_deref() else {
        return false;
    };
    child
        .meta()
        .owner_references
        .as_deref()
        .unwrap_or_default()
        .iter()
        .any(|r| r.controller == Some(true) && r.uid == uid)
}
