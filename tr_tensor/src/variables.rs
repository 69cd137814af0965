//! Named variables: mutable bindings that outlive scopes.

use std::collections::BTreeMap;

use crate::dtype::DType;
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::kernel_names;
use crate::kernel_registry::{attrs, AttrValue};
use crate::tensor::{named, Tensor, TensorId, TensorInfo, Variable};

impl Engine {
    /// Create a variable sharing `initial`'s data (cast first when `dtype`
    /// differs). Unnamed variables are numbered `"0"`, `"1"`, ...
    pub fn make_variable(
        &mut self,
        initial: &Tensor,
        trainable: bool,
        name: Option<&str>,
        dtype: Option<DType>,
    ) -> Result<Variable> {
        let name = match name {
            Some(name) => name.to_string(),
            None => {
                let name = self.next_variable_id.to_string();
                self.next_variable_id += 1;
                name
            }
        };
        if self.variables.contains_key(&name) {
            return Err(Error::DuplicateVariable(name));
        }

        let source = self.refresh(initial)?;
        let tensor = match dtype.filter(|d| *d != source.dtype()) {
            Some(dtype) => {
                let cast = self.run_kernel(
                    kernel_names::CAST,
                    &named([("x", &source)]),
                    &attrs([("dtype", AttrValue::DType(dtype))]),
                )?;
                let tensor = self.inc_ref(TensorId::next(), &cast)?;
                self.dispose_tensor(&cast)?;
                tensor
            }
            None => self.inc_ref(TensorId::next(), &source)?,
        };
        let variable = Variable::new(name.clone(), trainable, tensor);
        self.variables.insert(name, variable.clone());
        Ok(variable)
    }

    /// Bind `id` to another reference of `source`'s data, outside any scope.
    fn inc_ref(&mut self, id: TensorId, source: &Tensor) -> Result<Tensor> {
        let data_id = source.data_id();
        let owner = self.data.get(data_id)?.backend.clone();
        self.backend_mut(&owner)?.inc_ref(data_id)?;
        let info = TensorInfo::new(data_id, source.shape().clone(), source.dtype());
        Ok(self.track_tensor(id, info, &owner, 0, false))
    }

    /// Rebind `variable` to `value`'s data. Shape and dtype must match.
    pub fn assign(&mut self, variable: &mut Variable, value: &Tensor) -> Result<()> {
        if value.dtype() != variable.dtype() || value.shape() != variable.shape() {
            return Err(Error::AssignMismatch {
                name: variable.name().to_string(),
                dtype: variable.dtype(),
                shape: variable.shape().clone(),
                found_dtype: value.dtype(),
                found_shape: value.shape().clone(),
            });
        }
        let id = variable.tensor().id();
        self.refresh(variable.tensor())?;
        let value = self.refresh(value)?;

        // Take the new reference before dropping the old one; they may share data.
        let owner = self.data.get(value.data_id())?.backend.clone();
        self.backend_mut(&owner)?.inc_ref(value.data_id())?;
        self.dispose_by_id(id)?;
        let info = TensorInfo::new(value.data_id(), value.shape().clone(), value.dtype());
        self.track_tensor(id, info, &owner, 0, false);

        variable.tensor.rebind(value.data_id());
        if let Some(registered) = self.variables.get_mut(variable.name()) {
            registered.tensor.rebind(value.data_id());
        }
        Ok(())
    }

    pub fn dispose_variable(&mut self, name: &str) -> Result<()> {
        match self.variables.remove(name) {
            Some(variable) => self.dispose_by_id(variable.tensor().id()),
            None => Ok(()),
        }
    }

    /// Dispose every registered variable.
    pub fn dispose_variables(&mut self) -> Result<()> {
        let names: Vec<String> = self.variables.keys().cloned().collect();
        for name in names {
            self.dispose_variable(&name)?;
        }
        Ok(())
    }

    pub fn registered_variables(&self) -> &BTreeMap<String, Variable> {
        &self.variables
    }

    pub fn get_variable(&self, name: &str) -> Option<&Variable> {
        self.variables.get(name)
    }
}
