use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{HcollError, Result};
use crate::template::{
    AlgTemplate, AllGatherHd, AllGatherMesh, AllGatherNhr, AllGatherRing, AllGatherStriped,
    AllToAllSliced, BroadcastChain, BroadcastTree, ReduceScatterMesh, ReduceScatterRing, TemplateKind,
};

/// Constructor for a fresh, unconfigured template instance.
pub type TemplateFactory = Arc<dyn Fn() -> Box<dyn AlgTemplate> + Send + Sync>;

/// Factory building `T` through its `Default` impl.
pub fn factory<T>() -> TemplateFactory
where
    T: AlgTemplate + Default + 'static,
{
    Arc::new(|| Box::new(T::default()) as Box<dyn AlgTemplate>)
}

/// Registry mapping template kinds to constructors.
///
/// Iteration follows registration order.
#[derive(Clone)]
pub struct TemplateRegistry {
    factories: IndexMap<TemplateKind, TemplateFactory>,
}

impl TemplateRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: IndexMap::new(),
        }
    }

    /// A registry holding every built-in template.
    pub fn with_defaults() -> Self {
        let mut reg = Self::new();
        reg.register(TemplateKind::AllGatherRing, factory::<AllGatherRing>());
        reg.register(TemplateKind::AllGatherNhr, factory::<AllGatherNhr>());
        reg.register(TemplateKind::AllGatherHd, factory::<AllGatherHd>());
        reg.register(TemplateKind::AllGatherMesh, factory::<AllGatherMesh>());
        reg.register(TemplateKind::AllGatherStriped, factory::<AllGatherStriped>());
        reg.register(TemplateKind::ReduceScatterRing, factory::<ReduceScatterRing>());
        reg.register(TemplateKind::ReduceScatterMesh, factory::<ReduceScatterMesh>());
        reg.register(TemplateKind::BroadcastChain, factory::<BroadcastChain>());
        reg.register(TemplateKind::BroadcastTree, factory::<BroadcastTree>());
        reg.register(TemplateKind::AllToAllSliced, factory::<AllToAllSliced>());
        reg
    }

    /// Register a constructor for `kind`, replacing any previous one.
    pub fn register(&mut self, kind: TemplateKind, factory: TemplateFactory) {
        self.factories.insert(kind, factory);
    }

    /// A new instance of `kind`.
    pub fn create(&self, kind: TemplateKind) -> Result<Box<dyn AlgTemplate>> {
        let factory = self
            .factories
            .get(&kind)
            .ok_or(HcollError::UnregisteredTemplate(kind))?;
        Ok(factory())
    }

    /// Check if a constructor is registered.
    pub fn contains(&self, kind: TemplateKind) -> bool {
        self.factories.contains_key(&kind)
    }

    /// Registered kinds in registration order.
    pub fn kinds(&self) -> impl Iterator<Item = TemplateKind> + '_ {
        self.factories.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::TemplateState;

    #[test]
    fn test_defaults_cover_every_kind() {
        let reg = TemplateRegistry::with_defaults();
        assert_eq!(reg.len(), TemplateKind::ALL.len());
        for kind in TemplateKind::ALL {
            let t = reg.create(kind).unwrap();
            assert_eq!(t.kind(), kind);
            assert_eq!(t.state(), TemplateState::Unconfigured);
        }
        assert_eq!(reg.kinds().collect::<Vec<_>>(), TemplateKind::ALL.to_vec());
    }

    #[test]
    fn test_unregistered_kind() {
        let reg = TemplateRegistry::new();
        assert!(reg.is_empty());
        assert!(!reg.contains(TemplateKind::AllGatherRing));
        let err = reg.create(TemplateKind::AllGatherRing).err().unwrap();
        assert!(matches!(err, HcollError::UnregisteredTemplate(TemplateKind::AllGatherRing)));
        assert!(err.is_parameter_error());
    }

    #[test]
    fn test_overwrite_factory() {
        let mut reg = TemplateRegistry::new();
        reg.register(TemplateKind::AllGatherRing, factory::<AllGatherRing>());
        // Later registrations win.
        reg.register(
            TemplateKind::AllGatherRing,
            Arc::new(|| Box::new(AllGatherHd::new()) as Box<dyn AlgTemplate>),
        );
        assert_eq!(reg.len(), 1);
        let t = reg.create(TemplateKind::AllGatherRing).unwrap();
        assert_eq!(t.kind(), TemplateKind::AllGatherHd);
    }

    #[test]
    fn test_instances_are_independent() {
        let reg = TemplateRegistry::with_defaults();
        let a = reg.create(TemplateKind::BroadcastTree).unwrap();
        let b = reg.create(TemplateKind::BroadcastTree).unwrap();
        assert!(!std::ptr::eq(
            a.as_ref() as *const dyn AlgTemplate as *const u8,
            b.as_ref() as *const dyn AlgTemplate as *const u8
        ));
    }
}
