//! AdamW optimizer over a `VarMap`, plus the warmup/decay learning-rate
//! schedule.
//!
//! The optimizer applies one update from a reduced gradient map (parameter
//! name -> summed gradient across replicas). Moment tensors are keyed by
//! parameter name so they serialize into checkpoints and survive restarts.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Tensor};
use candle_nn::VarMap;

use crate::error::{SngpError, SngpResult};

/// Linear warmup to the base rate, then linear decay to zero over the
/// remaining steps.
#[derive(Debug, Clone)]
pub struct LinearDecaySchedule {
    base_lr: f64,
    warmup_steps: usize,
    total_steps: usize,
}

impl LinearDecaySchedule {
    pub fn new(base_lr: f64, warmup_proportion: f64, total_steps: usize) -> Self {
        let warmup_steps = ((total_steps as f64) * warmup_proportion) as usize;
        Self {
            base_lr,
            warmup_steps,
            total_steps: total_steps.max(1),
        }
    }

    pub fn learning_rate(&self, step: usize) -> f64 {
        if self.warmup_steps > 0 && step < self.warmup_steps {
            return self.base_lr * (step + 1) as f64 / self.warmup_steps as f64;
        }
        let decay_steps = (self.total_steps - self.warmup_steps).max(1);
        let progressed = (step - self.warmup_steps).min(decay_steps);
        self.base_lr * (1.0 - progressed as f64 / decay_steps as f64)
    }

    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

/// AdamW over the variables registered in a `VarMap`.
pub struct AdamW {
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,
    /// First moment estimates, keyed by parameter name
    m: HashMap<String, Tensor>,
    /// Second moment estimates, keyed by parameter name
    v: HashMap<String, Tensor>,
    /// Step counter for bias correction
    t: usize,
}

impl AdamW {
    pub fn new() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.01,
            m: HashMap::new(),
            v: HashMap::new(),
            t: 0,
        }
    }

    /// Apply one update from a gradient map at the given learning rate.
    pub fn step(
        &mut self,
        varmap: &VarMap,
        gradients: &HashMap<String, Tensor>,
        learning_rate: f64,
    ) -> SngpResult<()> {
        self.t += 1;
        let bc1 = 1.0 - self.beta1.powi(self.t as i32);
        let bc2 = 1.0 - self.beta2.powi(self.t as i32);

        let data = varmap.data().lock().unwrap();
        for (name, var) in data.iter() {
            let Some(grad) = gradients.get(name) else {
                continue;
            };

            if !self.m.contains_key(name) {
                let zeros = Tensor::zeros(var.dims(), DType::F32, var.device())?;
                self.m.insert(name.clone(), zeros.clone());
                self.v.insert(name.clone(), zeros);
            }
            let m = &self.m[name];
            let v = &self.v[name];

            // m = b1*m + (1-b1)*g ; v = b2*v + (1-b2)*g^2
            let m_new = ((m * self.beta1)? + (grad * (1.0 - self.beta1))?)?;
            let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

            let m_hat = (&m_new / bc1)?;
            let v_hat = (&v_new / bc2)?;

            let denom = (v_hat.sqrt()? + self.eps)?;
            let update = ((m_hat / denom)? * learning_rate)?;

            // Decoupled weight decay: w = w - lr*wd*w - update
            let var_tensor = var.as_tensor();
            let decay = (var_tensor * (learning_rate * self.weight_decay))?;
            let new_w = ((var_tensor - &update)? - &decay)?;
            var.set(&new_w)?;

            self.m.insert(name.clone(), m_new);
            self.v.insert(name.clone(), v_new);
        }
        Ok(())
    }

    /// Steps applied so far.
    pub fn steps(&self) -> usize {
        self.t
    }

    /// Persist moment tensors and the step counter.
    pub fn save(&self, path: &Path) -> SngpResult<()> {
        let mut tensors = HashMap::new();
        for (name, tensor) in &self.m {
            tensors.insert(format!("adam_m.{name}"), tensor.clone());
        }
        for (name, tensor) in &self.v {
            tensors.insert(format!("adam_v.{name}"), tensor.clone());
        }
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Restore state written by [`Self::save`]. The step counter is stored
    /// in the checkpoint's `state.json` and set separately.
    pub fn load(&mut self, path: &Path, device: &candle_core::Device) -> SngpResult<()> {
        let tensors = candle_core::safetensors::load(path, device)?;
        self.m.clear();
        self.v.clear();
        for (key, tensor) in tensors {
            if let Some(name) = key.strip_prefix("adam_m.") {
                self.m.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_prefix("adam_v.") {
                self.v.insert(name.to_string(), tensor);
            } else {
                return Err(SngpError::checkpoint(format!(
                    "unexpected tensor '{key}' in optimizer state"
                )));
            }
        }
        Ok(())
    }

    pub fn set_steps(&mut self, t: usize) {
        self.t = t;
    }
}

impl Default for AdamW {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};

    #[test]
    fn test_schedule_warmup_and_decay() {
        let schedule = LinearDecaySchedule::new(1e-3, 0.1, 100);
        assert_eq!(schedule.warmup_steps(), 10);

        // Ramps up during warmup.
        assert!(schedule.learning_rate(0) < schedule.learning_rate(5));
        assert!((schedule.learning_rate(9) - 1e-3).abs() < 1e-9);

        // Decays afterwards, hitting zero at the end.
        assert!(schedule.learning_rate(50) < 1e-3);
        assert!(schedule.learning_rate(99) < schedule.learning_rate(50));
        assert!(schedule.learning_rate(100) == 0.0);
    }

    #[test]
    fn test_schedule_no_warmup() {
        let schedule = LinearDecaySchedule::new(1e-3, 0.0, 10);
        assert!((schedule.learning_rate(0) - 1e-3).abs() < 1e-9);
    }

    #[test]
    fn test_adamw_moves_against_gradient() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let var = Var::from_tensor(&Tensor::from_vec(vec![1.0f32, -1.0], (2,), &device).unwrap())
            .unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .insert("w".to_string(), var.clone());

        let mut optimizer = AdamW::new();
        let mut grads = HashMap::new();
        grads.insert(
            "w".to_string(),
            Tensor::from_vec(vec![1.0f32, -1.0], (2,), &device).unwrap(),
        );

        optimizer.step(&varmap, &grads, 0.1).unwrap();
        let w = var.as_tensor().to_vec1::<f32>().unwrap();
        assert!(w[0] < 1.0, "positive gradient must decrease the weight");
        assert!(w[1] > -1.0, "negative gradient must increase the weight");
        assert_eq!(optimizer.steps(), 1);
    }

    #[test]
    fn test_adamw_state_roundtrip() {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let var = Var::from_tensor(&Tensor::from_vec(vec![0.5f32], (1,), &device).unwrap()).unwrap();
        varmap
            .data()
            .lock()
            .unwrap()
            .insert("w".to_string(), var.clone());

        let mut optimizer = AdamW::new();
        let mut grads = HashMap::new();
        grads.insert(
            "w".to_string(),
            Tensor::from_vec(vec![0.3f32], (1,), &device).unwrap(),
        );
        optimizer.step(&varmap, &grads, 0.01).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("optimizer.safetensors");
        optimizer.save(&path).unwrap();

        let mut restored = AdamW::new();
        restored.load(&path, &device).unwrap();
        restored.set_steps(optimizer.steps());

        assert_eq!(
            optimizer.m["w"].to_vec1::<f32>().unwrap(),
            restored.m["w"].to_vec1::<f32>().unwrap()
        );
        assert_eq!(
            optimizer.v["w"].to_vec1::<f32>().unwrap(),
            restored.v["w"].to_vec1::<f32>().unwrap()
        );
    }
}
