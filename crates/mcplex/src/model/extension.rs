use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
};

type AnyMap = HashMap<TypeId, Box<dyn AnyClone + Send + Sync>>;

/// A type-keyed map of out-of-band state attached to a message.
///
/// Carries values that travel with a request or notification without
/// appearing on the wire, with the exception of [`Meta`](super::Meta),
/// which the serde layer folds into the `_meta` field of `params`.
#[derive(Clone, Default)]
pub struct Extensions {
    map: Option<Box<AnyMap>>,
}

impl Extensions {
    #[inline]
    pub fn new() -> Extensions {
        Extensions { map: None }
    }

    /// Insert a value, replacing and returning any previous value of the
    /// same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, val: T) -> Option<T> {
        self.map
            .get_or_insert_with(Box::default)
            .insert(TypeId::of::<T>(), Box::new(val))
            .and_then(|boxed| boxed.into_any().downcast().ok().map(|boxed| *boxed))
    }

    pub fn get<T: Send + Sync + 'static>(&self) -> Option<&T> {
        self.map
            .as_ref()
            .and_then(|map| map.get(&TypeId::of::<T>()))
            .and_then(|boxed| (**boxed).as_any().downcast_ref())
    }

    pub fn get_mut<T: Send + Sync + 'static>(&mut self) -> Option<&mut T> {
        self.map
            .as_mut()
            .and_then(|map| map.get_mut(&TypeId::of::<T>()))
            .and_then(|boxed| (**boxed).as_any_mut().downcast_mut())
    }

    pub fn remove<T: Send + Sync + 'static>(&mut self) -> Option<T> {
        self.map
            .as_mut()
            .and_then(|map| map.remove(&TypeId::of::<T>()))
            .and_then(|boxed| boxed.into_any().downcast().ok().map(|boxed| *boxed))
    }

    #[inline]
    pub fn clear(&mut self) {
        if let Some(ref mut map) = self.map {
            map.clear();
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.as_ref().is_none_or(|map| map.is_empty())
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.map.as_ref().map_or(0, |map| map.len())
    }

    /// Merge another set of extensions into this one, the other side
    /// winning on type collisions.
    pub fn extend(&mut self, other: Self) {
        if let Some(other) = other.map {
            if let Some(map) = &mut self.map {
                map.extend(*other);
            } else {
                self.map = Some(other);
            }
        }
    }
}

impl fmt::Debug for Extensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extensions").finish()
    }
}

impl PartialEq for Extensions {
    // message equality ignores out-of-band state
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

trait AnyClone: Any {
    fn clone_box(&self) -> Box<dyn AnyClone + Send + Sync>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

impl<T: Clone + Send + Sync + 'static> AnyClone for T {
    fn clone_box(&self) -> Box<dyn AnyClone + Send + Sync> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

impl Clone for Box<dyn AnyClone + Send + Sync> {
    fn clone(&self) -> Self {
        (**self).clone_box()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut extensions = Extensions::new();
        assert!(extensions.insert(5i32).is_none());
        assert_eq!(extensions.insert(7i32), Some(5));
        extensions.insert("hello");

        assert_eq!(extensions.get::<i32>(), Some(&7));
        assert_eq!(extensions.get::<&'static str>(), Some(&"hello"));
        assert_eq!(extensions.remove::<i32>(), Some(7));
        assert!(extensions.get::<i32>().is_none());
    }

    #[test]
    fn test_clone_keeps_values() {
        let mut extensions = Extensions::new();
        extensions.insert(42u64);
        let cloned = extensions.clone();
        assert_eq!(cloned.get::<u64>(), Some(&42));
    }
}
