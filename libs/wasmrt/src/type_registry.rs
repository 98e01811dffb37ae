// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;

use hashbrown::HashSet;

use crate::types::FuncType;

/// Hash-consing registry of function types.
///
/// Structurally equal types are interned to the same allocation, so two
/// interned types can be compared with [`Arc::ptr_eq`]. Types are never
/// removed; they live as long as the owning environment (or the last module
/// referencing them).
#[derive(Debug, Default)]
pub(crate) struct TypeRegistry {
    types: HashSet<Arc<FuncType>>,
}

impl TypeRegistry {
    pub fn intern(&mut self, ty: FuncType) -> Arc<FuncType> {
        if let Some(existing) = self.types.get(&ty) {
            return existing.clone();
        }

        tracing::trace!("interning new function type {ty}");
        let ty = Arc::new(ty);
        self.types.insert(ty.clone());
        ty
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_dedups() {
        let mut registry = TypeRegistry::default();

        let a = registry.intern(FuncType::from_signature("f(IiF)").unwrap());
        let b = registry.intern(FuncType::from_signature("f(I i F)").unwrap());
        let c = registry.intern(FuncType::from_signature("v(i)").unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.len(), 2);
    }
}
