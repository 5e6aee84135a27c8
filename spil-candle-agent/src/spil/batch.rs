//! Transition batch of candle tensors.
use anyhow::Result;
use candle_core::Tensor;
use spil_core::{error::SpilError, TransitionBatch};
use std::{collections::HashMap, convert::TryFrom};

/// Keys of the entries of a transition batch.
pub const BATCH_KEYS: [&str; 6] = ["obs", "act", "rew", "con", "obs2", "done"];

/// Batch of transitions, every tensor has the batch size as its first dimension.
#[derive(Debug, Clone)]
pub struct TensorBatch {
    /// Observations, `(batch_size, obs_dim)`.
    pub obs: Tensor,

    /// Actions, `(batch_size, act_dim)`.
    pub act: Tensor,

    /// Rewards, `(batch_size,)`.
    pub rew: Tensor,

    /// Constraint values, `(batch_size, constraint_dim)`.
    pub con: Tensor,

    /// Next observations, `(batch_size, obs_dim)`.
    pub obs2: Tensor,

    /// Done flags, `(batch_size,)`.
    pub done: Tensor,
}

impl TensorBatch {
    /// Checks ranks and the shared leading dimension of the entries.
    ///
    /// An empty batch is rejected, it has no safety probability to estimate.
    pub fn validate(&self) -> Result<()> {
        let n = self.obs.dims().first().copied().unwrap_or(0);
        if n == 0 {
            return Err(SpilError::BatchShapeMismatch {
                key: "obs".to_string(),
                expected: "[N, _] with N > 0".to_string(),
                actual: self.obs.dims().to_vec(),
            }
            .into());
        }

        let entries = [
            ("obs", &self.obs, 2),
            ("act", &self.act, 2),
            ("rew", &self.rew, 1),
            ("con", &self.con, 2),
            ("obs2", &self.obs2, 2),
            ("done", &self.done, 1),
        ];

        for (key, t, rank) in entries.iter() {
            let dims = t.dims();
            if dims.len() != *rank || dims[0] != n {
                let expected = match rank {
                    1 => format!("[{}]", n),
                    _ => format!("[{}, _]", n),
                };
                return Err(SpilError::BatchShapeMismatch {
                    key: key.to_string(),
                    expected,
                    actual: dims.to_vec(),
                }
                .into());
            }
        }

        if self.obs2.dims() != self.obs.dims() {
            return Err(SpilError::BatchShapeMismatch {
                key: "obs2".to_string(),
                expected: format!("{:?}", self.obs.dims()),
                actual: self.obs2.dims().to_vec(),
            }
            .into());
        }

        Ok(())
    }
}

impl TryFrom<HashMap<String, Tensor>> for TensorBatch {
    type Error = anyhow::Error;

    fn try_from(mut map: HashMap<String, Tensor>) -> Result<Self> {
        let mut take = |key: &str| {
            map.remove(key)
                .ok_or_else(|| SpilError::MissingBatchKey(key.to_string()))
        };

        Ok(Self {
            obs: take("obs")?,
            act: take("act")?,
            rew: take("rew")?,
            con: take("con")?,
            obs2: take("obs2")?,
            done: take("done")?,
        })
    }
}

impl TransitionBatch for TensorBatch {
    type ObsBatch = Tensor;
    type ActBatch = Tensor;
    type ValueBatch = Tensor;

    fn unpack(self) -> (Tensor, Tensor, Tensor, Tensor, Tensor, Tensor) {
        (self.obs, self.act, self.rew, self.con, self.obs2, self.done)
    }

    fn len(&self) -> usize {
        self.obs.dims().first().copied().unwrap_or(0)
    }

    fn obs(&self) -> &Tensor {
        &self.obs
    }

    fn act(&self) -> &Tensor {
        &self.act
    }

    fn reward(&self) -> &Tensor {
        &self.rew
    }

    fn constraint(&self) -> &Tensor {
        &self.con
    }

    fn next_obs(&self) -> &Tensor {
        &self.obs2
    }

    fn is_done(&self) -> &Tensor {
        &self.done
    }
}
