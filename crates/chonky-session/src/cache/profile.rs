use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::models::{Principal, PrincipalId};

/// Last-fetched principal. A plain value holder; the session manager
/// decides when it is filled and cleared.
#[derive(Debug, Default)]
pub struct ProfileCache {
    principal: RwLock<Option<Principal>>,
}

impl ProfileCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Option<Principal>> {
        self.principal.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Option<Principal>> {
        self.principal.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set(&self, principal: Principal) {
        *self.write() = Some(principal);
    }

    pub fn get(&self) -> Option<Principal> {
        self.read().clone()
    }

    pub fn principal_id(&self) -> Option<PrincipalId> {
        self.read().as_ref().map(Principal::principal_id)
    }

    pub fn clear(&self) {
        *self.write() = None;
    }
}
