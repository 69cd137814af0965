//! Scope stack for automatic tensor reclamation, and the containers a scope
//! result may be made of.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorId, Variable};

const UNNAMED_SCOPE: &str = "unnamed scope";

/// Tensors created while this scope was innermost.
#[derive(Debug, Clone)]
pub struct Scope {
    pub name: String,
    pub id: usize,
    pub track: Vec<TensorId>,
}

#[derive(Debug, Default)]
pub struct ScopeStack {
    scopes: Vec<Scope>,
    next_id: usize,
}

impl ScopeStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a scope and return its id.
    pub fn start(&mut self, name: Option<&str>) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        self.scopes.push(Scope {
            name: name.unwrap_or(UNNAMED_SCOPE).to_string(),
            id,
            track: Vec::new(),
        });
        id
    }

    pub fn end(&mut self) -> Result<Scope> {
        self.scopes.pop().ok_or(Error::ScopeUnderflow)
    }

    /// Record `id` in the innermost scope, returning that scope's id.
    pub fn track(&mut self, id: TensorId) -> Option<usize> {
        let scope = self.scopes.last_mut()?;
        scope.track.push(id);
        Some(scope.id)
    }

    pub fn active(&self) -> Option<&Scope> {
        self.scopes.last()
    }

    pub fn active_name(&self) -> &str {
        self.scopes.last().map(|s| s.name.as_str()).unwrap_or("")
    }

    pub fn depth(&self) -> usize {
        self.scopes.len()
    }

    pub fn clear(&mut self) {
        self.scopes.clear();
    }
}

/// A value whose tensors survive the scope that returns it.
///
/// Plain values (numbers, strings, `()`) contain no tensors, so a tidy body
/// may return them freely.
pub trait TensorContainer {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor));

    fn tensors(&self) -> Vec<Tensor> {
        let mut out = Vec::new();
        self.visit_tensors(&mut |t| out.push(t.clone()));
        out
    }
}

impl TensorContainer for Tensor {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self)
    }
}

impl TensorContainer for Variable {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        f(self.tensor())
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for &T {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        (**self).visit_tensors(f)
    }
}

impl<T: TensorContainer + ?Sized> TensorContainer for Box<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        (**self).visit_tensors(f)
    }
}

impl<T: TensorContainer> TensorContainer for Option<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        if let Some(inner) = self {
            inner.visit_tensors(f)
        }
    }
}

impl<T: TensorContainer> TensorContainer for [T] {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for item in self {
            item.visit_tensors(f)
        }
    }
}

impl<T: TensorContainer> TensorContainer for Vec<T> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        self.as_slice().visit_tensors(f)
    }
}

impl<T: TensorContainer, const N: usize> TensorContainer for [T; N] {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        self.as_slice().visit_tensors(f)
    }
}

impl<K, V: TensorContainer> TensorContainer for BTreeMap<K, V> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for value in self.values() {
            value.visit_tensors(f)
        }
    }
}

impl<K, V: TensorContainer, S> TensorContainer for HashMap<K, V, S> {
    fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
        for value in self.values() {
            value.visit_tensors(f)
        }
    }
}

macro_rules! impl_tuple_container {
    ($($name:ident $idx:tt),+) => {
        impl<$($name: TensorContainer),+> TensorContainer for ($($name,)+) {
            fn visit_tensors(&self, f: &mut dyn FnMut(&Tensor)) {
                $(self.$idx.visit_tensors(f);)+
            }
        }
    };
}

impl_tuple_container!(A 0);
impl_tuple_container!(A 0, B 1);
impl_tuple_container!(A 0, B 1, C 2);
impl_tuple_container!(A 0, B 1, C 2, D 3);

macro_rules! impl_empty_container {
    ($($ty:ty),+) => {
        $(impl TensorContainer for $ty {
            fn visit_tensors(&self, _f: &mut dyn FnMut(&Tensor)) {}
        })+
    };
}

impl_empty_container!((), bool, i32, i64, u32, u64, usize, f32, f64, String);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::DType;
    use crate::shape::Shape;
    use crate::tensor::DataId;

    fn tensor() -> Tensor {
        Tensor::new(TensorId::next(), DataId::next(), Shape::new(vec![1]), DType::Float32)
    }

    #[test]
    fn test_scope_ids_and_tracking() {
        let mut stack = ScopeStack::new();
        assert!(stack.track(TensorId::next()).is_none());

        let outer = stack.start(None);
        let inner = stack.start(Some("inner"));
        assert_ne!(outer, inner);
        assert_eq!(stack.active_name(), "inner");

        let t = TensorId::next();
        assert_eq!(stack.track(t), Some(inner));
        let ended = stack.end().unwrap();
        assert_eq!(ended.track, vec![t]);
        assert_eq!(stack.active_name(), UNNAMED_SCOPE);

        stack.end().unwrap();
        assert!(matches!(stack.end(), Err(Error::ScopeUnderflow)));
    }

    #[test]
    fn test_nested_containers_are_flattened() {
        let (a, b, c) = (tensor(), tensor(), tensor());
        let mut map = BTreeMap::new();
        map.insert("c", c.clone());
        let value = (a.clone(), vec![Some(b.clone()), None], map, 3.5f32);

        let ids: Vec<TensorId> = value.tensors().iter().map(|t| t.id()).collect();
        assert_eq!(ids, vec![a.id(), b.id(), c.id()]);
        assert!(().tensors().is_empty());
    }
}
