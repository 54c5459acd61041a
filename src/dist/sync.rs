//! Gradient synchronization across replicas.
//!
//! Each worker computes gradients on its own shard; before the optimizer step
//! the gradients are all-reduce-averaged parameter by parameter, so every
//! replica applies the identical update. Parameters themselves stay local
//! (replicated copies of one logical model).

use std::marker::PhantomData;
use std::sync::Arc;

use burn::module::{AutodiffModule, Module, ModuleMapper, ModuleVisitor, ParamId};
use burn::optim::GradientsParams;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Bool, Int, Tensor, TensorData};

use crate::dist::group::ProcessGroup;
use crate::error::{Error, Result};

/// Gradient-averaging wrapper around a joined process group.
#[derive(Clone)]
pub struct ReplicaSync {
    group: Arc<ProcessGroup>,
}

impl ReplicaSync {
    pub fn new(group: Arc<ProcessGroup>) -> Self {
        Self { group }
    }

    pub fn group(&self) -> &Arc<ProcessGroup> {
        &self.group
    }

    /// Average the gradients of every float parameter of `module` across the
    /// group. Returns a new gradient container for the optimizer step.
    pub fn all_reduce_grads<B, M>(&self, module: &M, grads: GradientsParams) -> Result<GradientsParams>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut reducer = GradReducer::<B> {
            group: &self.group,
            input: grads,
            output: GradientsParams::new(),
            error: None,
            _backend: PhantomData,
        };
        module.visit(&mut reducer);
        match reducer.error {
            Some(err) => Err(err),
            None => Ok(reducer.output),
        }
    }

    /// Overwrite every float parameter with rank 0's values, so all replicas
    /// start from one logical model regardless of local initialization.
    pub fn broadcast_parameters<B, M>(&self, module: M) -> Result<M>
    where
        B: AutodiffBackend,
        M: AutodiffModule<B>,
    {
        let mut mapper = ParamBroadcast::<B> {
            group: &self.group,
            error: None,
            _backend: PhantomData,
        };
        let module = module.map(&mut mapper);
        match mapper.error {
            Some(err) => Err(err),
            None => Ok(module),
        }
    }
}

struct ParamBroadcast<'a, B: AutodiffBackend> {
    group: &'a ProcessGroup,
    error: Option<Error>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> ModuleMapper<B> for ParamBroadcast<'_, B> {
    fn map_float<const D: usize>(&mut self, _id: ParamId, tensor: Tensor<B, D>) -> Tensor<B, D> {
        if self.error.is_some() {
            return tensor;
        }
        let device = tensor.device();
        let dims = tensor.dims();
        let mut values = match tensor.clone().into_data().to_vec::<f32>() {
            Ok(values) => values,
            Err(err) => {
                self.error = Some(Error::Distributed(format!(
                    "parameter readback failed: {err:?}"
                )));
                return tensor;
            }
        };
        if let Err(err) = self.group.broadcast(&mut values, 0) {
            self.error = Some(err);
            return tensor;
        }
        Tensor::from_data(TensorData::new(values, dims), &device).require_grad()
    }

    fn map_int<const D: usize>(
        &mut self,
        _id: ParamId,
        tensor: Tensor<B, D, Int>,
    ) -> Tensor<B, D, Int> {
        tensor
    }

    fn map_bool<const D: usize>(
        &mut self,
        _id: ParamId,
        tensor: Tensor<B, D, Bool>,
    ) -> Tensor<B, D, Bool> {
        tensor
    }
}

struct GradReducer<'a, B: AutodiffBackend> {
    group: &'a ProcessGroup,
    input: GradientsParams,
    output: GradientsParams,
    error: Option<Error>,
    _backend: PhantomData<B>,
}

impl<B: AutodiffBackend> GradReducer<'_, B> {
    fn reduce<const D: usize>(&mut self, id: ParamId) -> Result<()> {
        let Some(grad) = self.input.remove::<B::InnerBackend, D>(id) else {
            return Ok(());
        };
        let device = grad.device();
        let dims = grad.dims();
        let mut values = grad
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Distributed(format!("gradient readback failed: {e:?}")))?;
        self.group.all_reduce_mean(&mut values)?;
        let reduced =
            Tensor::<B::InnerBackend, D>::from_data(TensorData::new(values, dims), &device);
        self.output.register::<B::InnerBackend, D>(id, reduced);
        Ok(())
    }
}

impl<B: AutodiffBackend> ModuleVisitor<B> for GradReducer<'_, B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, _tensor: &Tensor<B, D>) {
        if self.error.is_some() {
            return;
        }
        if let Err(err) = self.reduce::<D>(id) {
            self.error = Some(err);
        }
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {}

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {}
}

/// Flatten every float parameter of a module into one vector, in visit order.
/// Used for replica-consistency checks and tests.
pub fn parameter_vector<B, M>(module: &M) -> Vec<f32>
where
    B: Backend,
    M: burn::module::Module<B>,
{
    let mut collector = ParamCollector::<B> {
        values: Vec::new(),
        _backend: PhantomData,
    };
    module.visit(&mut collector);
    collector.values
}

struct ParamCollector<B: Backend> {
    values: Vec<f32>,
    _backend: PhantomData<B>,
}

impl<B: Backend> ModuleVisitor<B> for ParamCollector<B> {
    fn visit_float<const D: usize>(&mut self, _id: ParamId, tensor: &Tensor<B, D>) {
        if let Ok(mut values) = tensor.clone().into_data().to_vec::<f32>() {
            self.values.append(&mut values);
        }
    }

    fn visit_int<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Int>) {}

    fn visit_bool<const D: usize>(&mut self, _id: ParamId, _tensor: &Tensor<B, D, Bool>) {}
}
