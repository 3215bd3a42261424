/// Adam optimizer with explicit parameter groups
///
/// Parameters are organised in ordered groups, each carrying its own learning
/// rate. The per-parameter moment estimates are exposed so they can be written
/// to and restored from a checkpoint.
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};

use candle_core::backprop::GradStore;
use candle_core::{DType, Result, Tensor, Var};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

/// Adam optimizer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdamConfig {
    /// Initial learning rate for every group
    pub lr: f64,
    /// Coefficient for computing running averages of gradient (beta1)
    pub beta1: f64,
    /// Coefficient for computing running averages of squared gradient (beta2)
    pub beta2: f64,
    /// Term added to denominator for numerical stability
    pub eps: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            lr: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
        }
    }
}

/// An ordered set of named parameters sharing one learning rate
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub lr: f64,
    params: Vec<(String, Var)>,
}

impl ParamGroup {
    pub fn new(lr: f64, params: Vec<(String, Var)>) -> Self {
        Self { lr, params }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.params.iter().map(|(name, _)| name.as_str())
    }

    pub fn vars(&self) -> impl Iterator<Item = &Var> {
        self.params.iter().map(|(_, var)| var)
    }
}

/// Parameter state for Adam
#[derive(Debug, Clone)]
struct ParamState {
    /// First moment estimate (exponential moving average of gradients)
    m: Tensor,
    /// Second moment estimate (exponential moving average of squared gradients)
    v: Tensor,
    /// Step counter
    step: usize,
}

/// Serializable description of the optimizer state besides the moment tensors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdamStateMeta {
    pub beta1: f64,
    pub beta2: f64,
    pub eps: f64,
    pub groups: Vec<GroupMeta>,
    /// Update count per parameter that has state
    pub steps: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMeta {
    pub lr: f64,
    pub params: Vec<String>,
}

/// Adam optimizer
///
/// Implements Adam (Kingma & Ba, 2015) with bias correction and no weight decay.
pub struct Adam {
    config: AdamConfig,
    groups: Vec<ParamGroup>,
    states: HashMap<String, ParamState>,
}

impl Adam {
    /// Create an optimizer with a single group holding every variable of `varmap`
    pub fn new(varmap: &VarMap, config: AdamConfig) -> crate::Result<Self> {
        let data = varmap
            .data()
            .lock()
            .map_err(|_| crate::TrainError::Training("parameter map lock poisoned".to_string()))?;
        let mut params: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        params.sort_by(|a, b| a.0.cmp(&b.0));

        let group = ParamGroup::new(config.lr, params);
        Ok(Self::from_groups(vec![group], config))
    }

    /// Create an optimizer from explicit groups
    pub fn from_groups(groups: Vec<ParamGroup>, config: AdamConfig) -> Self {
        Self {
            config,
            groups,
            states: HashMap::new(),
        }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// Current learning rate of every group, in group order
    pub fn group_rates(&self) -> Vec<f64> {
        self.groups.iter().map(|g| g.lr).collect()
    }

    /// Set learning rate of one group
    pub fn set_group_rate(&mut self, group: usize, lr: f64) {
        if let Some(g) = self.groups.get_mut(group) {
            g.lr = lr;
        }
    }

    /// All optimized variables, in group order
    pub fn vars(&self) -> Vec<Var> {
        self.groups.iter().flat_map(|g| g.vars().cloned()).collect()
    }

    /// Perform a single optimization step
    ///
    /// Parameters without a gradient in `grads` are left untouched.
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        let AdamConfig { beta1, beta2, eps, .. } = self.config;

        for group in &self.groups {
            for (name, var) in &group.params {
                let Some(grad) = grads.get(var) else {
                    continue;
                };

                let state = match self.states.entry(name.clone()) {
                    Entry::Occupied(entry) => entry.into_mut(),
                    Entry::Vacant(entry) => {
                        let zeros = var.as_tensor().zeros_like()?;
                        entry.insert(ParamState {
                            m: zeros.clone(),
                            v: zeros,
                            step: 0,
                        })
                    }
                };

                state.step += 1;

                // m = beta1 * m + (1 - beta1) * grad
                state.m = ((&state.m * beta1)? + (grad * (1.0 - beta1))?)?.detach();

                // v = beta2 * v + (1 - beta2) * grad^2
                state.v = ((&state.v * beta2)? + (grad.sqr()? * (1.0 - beta2))?)?.detach();

                let m_hat = (&state.m / (1.0 - beta1.powi(state.step as i32)))?;
                let v_hat = (&state.v / (1.0 - beta2.powi(state.step as i32)))?;

                // theta = theta - lr * m_hat / (sqrt(v_hat) + eps)
                let update = ((m_hat / (v_hat.sqrt()? + eps)?)? * group.lr)?;
                var.set(&(var.as_tensor() - update)?)?;
            }
        }

        Ok(())
    }

    /// Moment tensors keyed `m.<param>` and `v.<param>`
    pub fn state_tensors(&self) -> HashMap<String, Tensor> {
        let mut tensors = HashMap::with_capacity(self.states.len() * 2);
        for (name, state) in &self.states {
            tensors.insert(format!("m.{}", name), state.m.clone());
            tensors.insert(format!("v.{}", name), state.v.clone());
        }
        tensors
    }

    pub fn state_meta(&self) -> AdamStateMeta {
        AdamStateMeta {
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            eps: self.config.eps,
            groups: self
                .groups
                .iter()
                .map(|g| GroupMeta {
                    lr: g.lr,
                    params: g.names().map(str::to_string).collect(),
                })
                .collect(),
            steps: self
                .states
                .iter()
                .map(|(name, state)| (name.clone(), state.step))
                .collect(),
        }
    }

    /// Restore rates, hyperparameters and moments written by `state_meta`/`state_tensors`
    pub fn load_state(
        &mut self,
        meta: &AdamStateMeta,
        tensors: &HashMap<String, Tensor>,
    ) -> crate::Result<()> {
        if meta.groups.len() != self.groups.len() {
            return Err(crate::TrainError::CheckpointIo(format!(
                "optimizer has {} parameter groups, checkpoint has {}",
                self.groups.len(),
                meta.groups.len()
            )));
        }
        for (group, saved) in self.groups.iter().zip(&meta.groups) {
            if !group.names().eq(saved.params.iter().map(String::as_str)) {
                return Err(crate::TrainError::CheckpointIo(
                    "optimizer parameter groups do not match the checkpoint".to_string(),
                ));
            }
        }

        let shapes: HashMap<&str, &Var> = self
            .groups
            .iter()
            .flat_map(|g| g.params.iter().map(|(n, v)| (n.as_str(), v)))
            .collect();

        let mut states = HashMap::with_capacity(meta.steps.len());
        for (name, &step) in &meta.steps {
            let var = shapes.get(name.as_str()).ok_or_else(|| {
                crate::TrainError::CheckpointIo(format!("optimizer state for unknown parameter {}", name))
            })?;
            let fetch = |key: String| -> crate::Result<Tensor> {
                let t = tensors.get(&key).ok_or_else(|| {
                    crate::TrainError::CheckpointIo(format!("missing optimizer tensor {}", key))
                })?;
                if t.dims() != var.dims() {
                    return Err(crate::TrainError::CheckpointIo(format!(
                        "optimizer tensor {} has shape {:?}, parameter has {:?}",
                        key,
                        t.dims(),
                        var.dims()
                    )));
                }
                Ok(t.to_dtype(var.dtype())?)
            };
            let m = fetch(format!("m.{}", name))?;
            let v = fetch(format!("v.{}", name))?;
            states.insert(name.clone(), ParamState { m, v, step });
        }

        self.config.beta1 = meta.beta1;
        self.config.beta2 = meta.beta2;
        self.config.eps = meta.eps;
        for (group, saved) in self.groups.iter_mut().zip(&meta.groups) {
            group.lr = saved.lr;
        }
        self.states = states;

        Ok(())
    }
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`
///
/// Returns the norm before clipping.
pub fn clip_grad_norm(grads: &mut GradStore, vars: &[Var], max_norm: f64) -> Result<f64> {
    let mut total_sq = 0.0f64;
    for var in vars {
        if let Some(grad) = grads.get(var) {
            total_sq += grad
                .sqr()?
                .sum_all()?
                .to_dtype(DType::F64)?
                .to_scalar::<f64>()?;
        }
    }
    let total_norm = total_sq.sqrt();

    let clip_coef = max_norm / (total_norm + 1e-6);
    if clip_coef < 1.0 {
        for var in vars {
            if let Some(grad) = grads.remove(var) {
                grads.insert(var, (grad * clip_coef)?);
            }
        }
    }

    Ok(total_norm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn single(lr: f64, var: &Var) -> Adam {
        Adam::from_groups(
            vec![ParamGroup::new(lr, vec![("x".to_string(), var.clone())])],
            AdamConfig { lr, ..Default::default() },
        )
    }

    #[test]
    fn test_adam_first_step_moves_by_lr() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32, -2.0], &device)?;
        let mut optimizer = single(0.1, &x);

        let loss = x.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        optimizer.step(&grads)?;

        // First bias-corrected Adam step is lr * sign(grad)
        let values = x.as_tensor().to_vec1::<f32>()?;
        assert!((values[0] - 0.9).abs() < 1e-5);
        assert!((values[1] + 1.9).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_group_rates() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32], &device)?;
        let mut optimizer = single(1e-3, &x);

        assert_eq!(optimizer.group_rates(), vec![1e-3]);
        optimizer.set_group_rate(0, 5e-4);
        assert_eq!(optimizer.group_rates(), vec![5e-4]);

        // Out of range is ignored
        optimizer.set_group_rate(3, 1.0);
        assert_eq!(optimizer.group_rates(), vec![5e-4]);

        Ok(())
    }

    #[test]
    fn test_clip_grad_norm() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32, 1.0], &device)?;
        let w = Tensor::new(&[3.0f32, 4.0], &device)?;

        let loss = (x.as_tensor() * &w)?.sum_all()?;
        let mut grads = loss.backward()?;

        let norm = clip_grad_norm(&mut grads, &[x.clone()], 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);

        let clipped = grads.get(&x).unwrap().to_vec1::<f32>()?;
        assert!((clipped[0] - 0.6).abs() < 1e-5);
        assert!((clipped[1] - 0.8).abs() < 1e-5);

        Ok(())
    }

    #[test]
    fn test_clip_below_ceiling_is_noop() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32, 1.0], &device)?;
        let w = Tensor::new(&[3.0f32, 4.0], &device)?;

        let loss = (x.as_tensor() * &w)?.sum_all()?;
        let mut grads = loss.backward()?;

        clip_grad_norm(&mut grads, &[x.clone()], 8.0)?;
        assert_eq!(grads.get(&x).unwrap().to_vec1::<f32>()?, vec![3.0, 4.0]);

        Ok(())
    }

    #[test]
    fn test_state_round_trip() -> crate::Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[0.5f32, -1.5, 2.0], &device)?;
        let mut optimizer = single(0.01, &x);

        for _ in 0..3 {
            let loss = x.as_tensor().sqr()?.sum_all()?;
            optimizer.step(&loss.backward()?)?;
        }
        optimizer.set_group_rate(0, 0.005);

        let meta = optimizer.state_meta();
        let tensors = optimizer.state_tensors();
        assert_eq!(meta.steps.get("x"), Some(&3));

        let y = Var::new(&[0.0f32, 0.0, 0.0], &device)?;
        let mut restored = single(0.01, &y);
        restored.load_state(&meta, &tensors)?;

        assert_eq!(restored.state_meta(), meta);
        let restored_tensors = restored.state_tensors();
        for (key, t) in &tensors {
            assert_eq!(
                restored_tensors[key].to_vec1::<f32>()?,
                t.to_vec1::<f32>()?
            );
        }

        Ok(())
    }

    #[test]
    fn test_load_state_rejects_missing_tensor() -> Result<()> {
        let device = Device::Cpu;
        let x = Var::new(&[1.0f32], &device)?;
        let mut optimizer = single(0.01, &x);

        let mut meta = optimizer.state_meta();
        meta.steps.insert("x".to_string(), 1);

        let result = optimizer.load_state(&meta, &HashMap::new());
        assert!(matches!(result, Err(crate::TrainError::CheckpointIo(_))));

        Ok(())
    }
}
